//! Detects dead worker pools and recovers jobs stranded on their workers'
//! inprogress lists.
//!
//! Grounded on `other_examples/...harborgrid-justin-caddy...scheduler.rs`'s
//! `DistributedLock` (`SET key val NX EX ttl`, Lua compare-and-delete
//! release) for the advisory-lock shape, and `apalis-redis::storage`'s
//! `reenqueue_orphaned`/`reenqueue_active` scripts for the
//! inprogress-to-live requeue shape.

use chrono::Utc;
use log::{debug, info, warn};
use redis::aio::ConnectionManager;
use redis::Script;

use crate::error::Result;
use crate::keyspace::KeySpace;

/// Sweeps `pools` for stale heartbeats and requeues the dead pools' work.
#[derive(Clone)]
pub(crate) struct Reaper {
    conn: ConnectionManager,
    keys: KeySpace,
    dead_threshold: std::time::Duration,
    reap_script: Script,
}

impl Reaper {
    pub(crate) fn new(
        conn: ConnectionManager,
        keys: KeySpace,
        dead_threshold: std::time::Duration,
    ) -> Self {
        Self {
            conn,
            keys,
            dead_threshold,
            reap_script: Script::new(include_str!("../lua/reap_worker.lua")),
        }
    }

    /// Run one sweep, returning the ids of pools found dead and reaped.
    pub async fn sweep_once(&self) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let pool_ids: Vec<String> = redis::cmd("SMEMBERS")
            .arg(self.keys.pools())
            .query_async(&mut conn)
            .await
            .map_err(crate::error::Error::from)?;

        let now = Utc::now().timestamp();
        let mut reaped = Vec::new();
        for pool_id in pool_ids {
            if self.is_dead(&pool_id, now).await? {
                if self.acquire_lock(&pool_id).await? {
                    self.reap_pool(&pool_id).await?;
                    reaped.push(pool_id);
                } else {
                    debug!("reaper: lost race to reap pool {pool_id}, skipping");
                }
            }
        }
        Ok(reaped)
    }

    async fn is_dead(&self, pool_id: &str, now: i64) -> Result<bool> {
        let mut conn = self.conn.clone();
        let heartbeat_at: Option<i64> = redis::cmd("HGET")
            .arg(self.keys.pool_heartbeat(pool_id))
            .arg("heartbeat_at")
            .query_async(&mut conn)
            .await
            .map_err(crate::error::Error::from)?;
        match heartbeat_at {
            None => Ok(true),
            Some(at) => Ok(now - at >= self.dead_threshold.as_secs() as i64),
        }
    }

    async fn acquire_lock(&self, pool_id: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let acquired: Option<String> = redis::cmd("SET")
            .arg(self.keys.reap_lock(pool_id))
            .arg("1")
            .arg("NX")
            .arg("PX")
            .arg(30_000)
            .query_async(&mut conn)
            .await
            .map_err(crate::error::Error::from)?;
        Ok(acquired.is_some())
    }

    async fn reap_pool(&self, pool_id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let worker_ids: Option<String> = redis::cmd("HGET")
            .arg(self.keys.pool_heartbeat(pool_id))
            .arg("worker_ids")
            .query_async(&mut conn)
            .await
            .map_err(crate::error::Error::from)?;

        let mut total_requeued = 0i64;
        if let Some(ids) = worker_ids {
            for worker_id in ids.split(',').filter(|s| !s.is_empty()) {
                let moved: i64 = self
                    .reap_script
                    .key(self.keys.inprogress(worker_id))
                    .arg(self.keys.namespace())
                    .invoke_async(&mut conn)
                    .await
                    .map_err(crate::error::Error::from)?;
                total_requeued += moved;
            }
        }

        redis::pipe()
            .srem(self.keys.pools(), pool_id)
            .del(self.keys.pool_heartbeat(pool_id))
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(crate::error::Error::from)?;

        info!("reaper recovered dead pool {pool_id}, requeued {total_requeued} job(s)");
        Ok(())
    }

    /// Run the sweep loop until `stop` is signalled.
    pub(crate) async fn run(self, interval: std::time::Duration, mut stop: tokio::sync::watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.sweep_once().await {
                        warn!("reaper sweep failed: {e}");
                    }
                }
                _ = stop.changed() => {
                    if *stop.borrow() {
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup() -> (Reaper, ConnectionManager) {
        let redis_url = std::env::var("REDIS_URL").expect("No REDIS_URL is specified");
        let client = redis::Client::open(redis_url).unwrap();
        let conn = client.get_connection_manager().await.unwrap();
        let reaper = Reaper::new(
            conn.clone(),
            KeySpace::new("wh_test_reaper"),
            std::time::Duration::from_secs(1),
        );
        (reaper, conn)
    }

    async fn cleanup(mut conn: ConnectionManager) {
        let _: String = redis::cmd("FLUSHDB").query_async(&mut conn).await.unwrap();
    }

    #[tokio::test]
    async fn sweep_requeues_work_from_a_dead_pool() {
        let (reaper, mut conn) = setup().await;
        let keys = KeySpace::new("wh_test_reaper");

        // Simulate pool A: claimed a job, then its heartbeat went stale.
        let job = crate::job::Job::new("send_email", serde_json::json!({}), 0);
        let bytes = job.to_bytes().unwrap();
        let _: () = redis::cmd("LPUSH")
            .arg(keys.inprogress("worker-a"))
            .arg(&bytes)
            .query_async(&mut conn)
            .await
            .unwrap();
        let _: () = redis::cmd("SADD")
            .arg(keys.pools())
            .arg("pool-a")
            .query_async(&mut conn)
            .await
            .unwrap();
        let stale_at = chrono::Utc::now().timestamp() - 1000;
        let _: () = redis::cmd("HSET")
            .arg(keys.pool_heartbeat("pool-a"))
            .arg("heartbeat_at")
            .arg(stale_at)
            .arg("worker_ids")
            .arg("worker-a")
            .query_async(&mut conn)
            .await
            .unwrap();

        let reaped = reaper.sweep_once().await.unwrap();
        assert_eq!(reaped, vec!["pool-a".to_string()]);

        let queue_len: i64 = redis::cmd("LLEN")
            .arg(keys.queue("send_email"))
            .query_async(&mut conn)
            .await
            .unwrap();
        assert_eq!(queue_len, 1);

        let members: Vec<String> = redis::cmd("SMEMBERS")
            .arg(keys.pools())
            .query_async(&mut conn)
            .await
            .unwrap();
        assert!(members.is_empty());

        cleanup(conn).await;
    }

    #[tokio::test]
    async fn sweep_leaves_live_pools_alone() {
        let (reaper, mut conn) = setup().await;
        let keys = KeySpace::new("wh_test_reaper");
        let _: () = redis::cmd("SADD")
            .arg(keys.pools())
            .arg("pool-b")
            .query_async(&mut conn)
            .await
            .unwrap();
        let now = chrono::Utc::now().timestamp();
        let _: () = redis::cmd("HSET")
            .arg(keys.pool_heartbeat("pool-b"))
            .arg("heartbeat_at")
            .arg(now)
            .query_async(&mut conn)
            .await
            .unwrap();

        let reaped = reaper.sweep_once().await.unwrap();
        assert!(reaped.is_empty());
        cleanup(conn).await;
    }
}

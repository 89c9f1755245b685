//! Pool liveness and per-worker observation.
//!
//! Grounded on `apalis-redis::storage`'s `keep_alive`/`register_consumer`
//! idiom (periodic `HSET`-equivalent liveness write plus membership in a
//! consumers-style set) and
//! `other_examples/...harborgrid...scheduler.rs`'s clean-shutdown key
//! deletion.

use chrono::Utc;
use log::{debug, warn};
use redis::aio::ConnectionManager;

use crate::error::Result;
use crate::keyspace::KeySpace;

/// Periodically publishes a pool's liveness hash and membership in `pools`.
#[derive(Clone)]
pub(crate) struct Heartbeater {
    conn: ConnectionManager,
    keys: KeySpace,
    pool_id: String,
    job_names: Vec<String>,
    worker_ids: Vec<String>,
    concurrency: usize,
    host: String,
    pid: u32,
    started_at: i64,
}

impl Heartbeater {
    pub(crate) fn new(
        conn: ConnectionManager,
        keys: KeySpace,
        pool_id: String,
        job_names: Vec<String>,
        worker_ids: Vec<String>,
        concurrency: usize,
    ) -> Self {
        Self {
            conn,
            keys,
            pool_id,
            job_names,
            worker_ids,
            concurrency,
            host: hostname(),
            pid: std::process::id(),
            started_at: Utc::now().timestamp(),
        }
    }

    /// Write one heartbeat pulse.
    pub async fn beat_once(&self) -> Result<()> {
        let key = self.keys.pool_heartbeat(&self.pool_id);
        let now = Utc::now().timestamp();
        let mut conn = self.conn.clone();
        redis::pipe()
            .sadd(self.keys.pools(), &self.pool_id)
            .hset(&key, "started_at", self.started_at)
            .hset(&key, "heartbeat_at", now)
            .hset(&key, "job_names", self.job_names.join(","))
            .hset(&key, "concurrency", self.concurrency as i64)
            .hset(&key, "host", &self.host)
            .hset(&key, "pid", self.pid)
            .hset(&key, "worker_ids", self.worker_ids.join(","))
            .query_async(&mut conn)
            .await
            .map_err(crate::error::Error::from)?;
        debug!("pool {} heartbeat at {now}", self.pool_id);
        Ok(())
    }

    /// Delete this pool's heartbeat hash and membership, on clean shutdown.
    pub async fn clear(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::pipe()
            .srem(self.keys.pools(), &self.pool_id)
            .del(self.keys.pool_heartbeat(&self.pool_id))
            .query_async(&mut conn)
            .await
            .map_err(crate::error::Error::from)?;
        Ok(())
    }

    /// Run the heartbeat loop until `stop` is signalled, clearing state on
    /// exit.
    pub(crate) async fn run(
        self,
        interval: std::time::Duration,
        mut stop: tokio::sync::watch::Receiver<bool>,
    ) {
        loop {
            if let Err(e) = self.beat_once().await {
                warn!("pool {} failed to heartbeat: {e}", self.pool_id);
            }
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = stop.changed() => {
                    if *stop.borrow() {
                        break;
                    }
                }
            }
        }
        if let Err(e) = self.clear().await {
            warn!("pool {} failed to clear heartbeat on shutdown: {e}", self.pool_id);
        }
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown-host".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup() -> Heartbeater {
        let redis_url = std::env::var("REDIS_URL").expect("No REDIS_URL is specified");
        let client = redis::Client::open(redis_url).unwrap();
        let conn = client.get_connection_manager().await.unwrap();
        Heartbeater::new(
            conn,
            KeySpace::new("wh_test_heartbeat"),
            "pool-1".into(),
            vec!["send_email".into()],
            vec!["worker-1".into()],
            4,
        )
    }

    async fn cleanup(hb: &Heartbeater) {
        let mut conn = hb.conn.clone();
        let _: String = redis::cmd("FLUSHDB").query_async(&mut conn).await.unwrap();
    }

    #[tokio::test]
    async fn beat_registers_pool_and_writes_fields() {
        let hb = setup().await;
        hb.beat_once().await.unwrap();

        let mut conn = hb.conn.clone();
        let members: Vec<String> = redis::cmd("SMEMBERS")
            .arg(hb.keys.pools())
            .query_async(&mut conn)
            .await
            .unwrap();
        assert!(members.contains(&"pool-1".to_string()));

        let concurrency: Option<String> = redis::cmd("HGET")
            .arg(hb.keys.pool_heartbeat("pool-1"))
            .arg("concurrency")
            .query_async(&mut conn)
            .await
            .unwrap();
        assert_eq!(concurrency.as_deref(), Some("4"));
        cleanup(&hb).await;
    }

    #[tokio::test]
    async fn clear_removes_pool_membership_and_hash() {
        let hb = setup().await;
        hb.beat_once().await.unwrap();
        hb.clear().await.unwrap();

        let mut conn = hb.conn.clone();
        let members: Vec<String> = redis::cmd("SMEMBERS")
            .arg(hb.keys.pools())
            .query_async(&mut conn)
            .await
            .unwrap();
        assert!(!members.contains(&"pool-1".to_string()));
        cleanup(&hb).await;
    }
}

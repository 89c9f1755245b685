//! Promotes due `scheduled`/`retry` entries onto their live queues.
//!
//! Grounded on `apalis-redis::storage`'s `enqueue_scheduled` (script-backed
//! `ZRANGEBYSCORE`-then-move pattern), generalized to two source zsets and
//! per-job-name destination queues. Multiple pools running this loop
//! simultaneously are disambiguated by `ZREM`'s return value inside
//! `lua/requeue_due.lua`: only the pool whose `ZREM` actually removed the
//! member moves it.

use chrono::Utc;
use log::{debug, warn};
use redis::aio::ConnectionManager;
use redis::Script;

use crate::error::Result;
use crate::keyspace::KeySpace;

/// Sweeps `scheduled` and `retry` for due entries and promotes them.
#[derive(Clone)]
pub(crate) struct Requeuer {
    conn: ConnectionManager,
    keys: KeySpace,
    script: Script,
    batch_size: usize,
}

impl Requeuer {
    pub(crate) fn new(conn: ConnectionManager, keys: KeySpace, batch_size: usize) -> Self {
        Self {
            conn,
            keys,
            script: Script::new(include_str!("../lua/requeue_due.lua")),
            batch_size,
        }
    }

    /// Run one sweep, returning the total number of entries promoted.
    pub async fn sweep_once(&self) -> Result<usize> {
        let scheduled = self.sweep(self.keys.scheduled()).await?;
        let retry = self.sweep(self.keys.retry()).await?;
        if scheduled + retry > 0 {
            debug!(
                "requeuer promoted {scheduled} scheduled and {retry} retry job(s)"
            );
        }
        Ok(scheduled + retry)
    }

    async fn sweep(&self, source: String) -> Result<usize> {
        let now = Utc::now().timestamp();
        let mut conn = self.conn.clone();
        let moved: i64 = self
            .script
            .key(source)
            .arg(now)
            .arg(self.batch_size)
            .arg(self.keys.namespace())
            .invoke_async(&mut conn)
            .await
            .map_err(crate::error::Error::from)?;
        Ok(moved.max(0) as usize)
    }

    /// Run the sweep loop until `stop` is signalled.
    pub(crate) async fn run(self, interval: std::time::Duration, mut stop: tokio::sync::watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.sweep_once().await {
                        warn!("requeuer sweep failed: {e}");
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
    use crate::enqueue::Enqueuer;

    async fn setup() -> (Requeuer, Enqueuer) {
        let redis_url = std::env::var("REDIS_URL").expect("No REDIS_URL is specified");
        let client = redis::Client::open(redis_url).unwrap();
        let conn = client.get_connection_manager().await.unwrap();
        let keys = KeySpace::new("wh_test_requeue");
        let requeuer = Requeuer::new(conn.clone(), keys, 100);
        let enqueuer = Enqueuer::new("wh_test_requeue", conn);
        (requeuer, enqueuer)
    }

    async fn cleanup(requeuer: &Requeuer) {
        let mut conn = requeuer.conn.clone();
        let _: String = redis::cmd("FLUSHDB").query_async(&mut conn).await.unwrap();
    }

    #[tokio::test]
    async fn sweep_promotes_due_scheduled_job() {
        let (requeuer, enqueuer) = setup().await;
        enqueuer
            .enqueue_in("ping", -5, serde_json::json!({}))
            .await
            .unwrap();
        let moved = requeuer.sweep_once().await.unwrap();
        assert_eq!(moved, 1);
        assert_eq!(enqueuer.len("ping").await.unwrap(), 1);
        cleanup(&requeuer).await;
    }

    #[tokio::test]
    async fn sweep_leaves_future_scheduled_job_alone() {
        let (requeuer, enqueuer) = setup().await;
        enqueuer
            .enqueue_in("ping", 3600, serde_json::json!({}))
            .await
            .unwrap();
        let moved = requeuer.sweep_once().await.unwrap();
        assert_eq!(moved, 0);
        assert!(enqueuer.is_empty("ping").await.unwrap());
        cleanup(&requeuer).await;
    }
}

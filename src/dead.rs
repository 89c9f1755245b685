//! Maintenance operations on the dead-letter set.
//!
//! §6 names "requeue a dead job", "delete a dead job", and "retry-all-dead"
//! as operations a management UI drives but that the core must not break;
//! this module is those operations exposed as plain library calls so a UI
//! (out of scope here) has something to wrap. Grounded on
//! `apalis-redis::RedisStorage::vacuum` for the retention-trim shape and the
//! same `ZREM`-then-`LPUSH` script idiom `requeue.rs` uses for promotion.

use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::Script;

use crate::error::Result;
use crate::job::Job;
use crate::keyspace::KeySpace;

#[derive(Clone)]
struct DeadScripts {
    requeue: Script,
    delete: Script,
}

impl DeadScripts {
    fn new() -> Self {
        Self {
            requeue: Script::new(include_str!("../lua/requeue_dead.lua")),
            delete: Script::new(include_str!("../lua/delete_dead.lua")),
        }
    }
}

/// Read and mutate the `dead` z-set independently of the `Enqueuer`'s
/// admission-side operations.
#[derive(Clone)]
pub struct DeadQueue {
    conn: ConnectionManager,
    keys: KeySpace,
    scripts: DeadScripts,
}

impl std::fmt::Debug for DeadQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeadQueue")
            .field("namespace", &self.keys.namespace())
            .finish()
    }
}

impl DeadQueue {
    /// Build a dead-queue handle for `namespace` over an existing
    /// connection.
    pub fn new(namespace: impl Into<String>, conn: ConnectionManager) -> Self {
        Self {
            conn,
            keys: KeySpace::new(namespace),
            scripts: DeadScripts::new(),
        }
    }

    /// Number of jobs currently dead-lettered.
    pub async fn len(&self) -> Result<i64> {
        let mut conn = self.conn.clone();
        let len: i64 = redis::cmd("ZCARD")
            .arg(self.keys.dead())
            .query_async(&mut conn)
            .await
            .map_err(crate::error::Error::from)?;
        Ok(len)
    }

    /// All jobs currently in `dead`, most-recently-failed last (ascending
    /// by failure time, matching the z-set's score order).
    pub async fn list(&self) -> Result<Vec<Job>> {
        let mut conn = self.conn.clone();
        let entries: Vec<Vec<u8>> = redis::cmd("ZRANGE")
            .arg(self.keys.dead())
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await
            .map_err(crate::error::Error::from)?;
        entries
            .iter()
            .map(|bytes| Job::from_bytes(bytes).map_err(crate::error::Error::from))
            .collect()
    }

    /// Move `job` from `dead` back onto its name's live queue. Returns
    /// `false` if `job` was no longer present (already requeued, deleted,
    /// or vacuumed by a racing caller) rather than erroring — the same
    /// graceful double-ack tolerance the worker's retirement scripts give
    /// in-flight jobs.
    pub async fn requeue(&self, job: &Job) -> Result<bool> {
        let bytes = job.to_bytes()?;
        let mut conn = self.conn.clone();
        let moved: i64 = self
            .scripts
            .requeue
            .key(self.keys.dead())
            .arg(bytes)
            .arg(self.keys.namespace())
            .invoke_async(&mut conn)
            .await
            .map_err(crate::error::Error::from)?;
        Ok(moved == 1)
    }

    /// Requeue every job currently in `dead`, returning how many were
    /// actually moved (a racing caller may have already claimed some).
    pub async fn requeue_all(&self) -> Result<usize> {
        let mut moved = 0usize;
        for job in self.list().await? {
            if self.requeue(&job).await? {
                moved += 1;
            }
        }
        Ok(moved)
    }

    /// Permanently discard `job` from `dead`. Returns `false` if it was no
    /// longer present.
    pub async fn delete(&self, job: &Job) -> Result<bool> {
        let bytes = job.to_bytes()?;
        let mut conn = self.conn.clone();
        let removed: i64 = self
            .scripts
            .delete
            .key(self.keys.dead())
            .arg(bytes)
            .invoke_async(&mut conn)
            .await
            .map_err(crate::error::Error::from)?;
        Ok(removed == 1)
    }

    /// Trim `dead` entries that failed more than `older_than` seconds ago.
    /// Returns the number of entries removed. Not part of spec.md; a
    /// standard retention op in comparable queue libraries
    /// (`RedisStorage::vacuum`) that doesn't conflict with any Non-goal.
    pub async fn vacuum(&self, older_than_secs: i64) -> Result<usize> {
        let cutoff = Utc::now().timestamp() - older_than_secs.max(0);
        let mut conn = self.conn.clone();
        let removed: i64 = redis::cmd("ZREMRANGEBYSCORE")
            .arg(self.keys.dead())
            .arg("-inf")
            .arg(cutoff)
            .query_async(&mut conn)
            .await
            .map_err(crate::error::Error::from)?;
        Ok(removed.max(0) as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enqueue::Enqueuer;

    async fn setup() -> (DeadQueue, Enqueuer, ConnectionManager) {
        let redis_url = std::env::var("REDIS_URL").expect("No REDIS_URL is specified");
        let client = redis::Client::open(redis_url).unwrap();
        let conn = client.get_connection_manager().await.unwrap();
        (
            DeadQueue::new("wh_test_dead", conn.clone()),
            Enqueuer::new("wh_test_dead", conn.clone()),
            conn,
        )
    }

    async fn cleanup(mut conn: ConnectionManager) {
        let _: String = redis::cmd("FLUSHDB").query_async(&mut conn).await.unwrap();
    }

    async fn bury(dead: &DeadQueue, conn: &ConnectionManager, job: &Job) {
        let mut conn = conn.clone();
        let _: () = redis::cmd("ZADD")
            .arg(dead.keys.dead())
            .arg(job.failed_at.unwrap_or(0))
            .arg(job.to_bytes().unwrap())
            .query_async(&mut conn)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn requeue_moves_job_back_to_its_live_queue() {
        let (dead, enqueuer, conn) = setup().await;
        let mut job = Job::new("send_email", serde_json::json!({}), 0);
        job.record_failure("boom", 5, 3);
        bury(&dead, &conn, &job).await;

        assert_eq!(dead.len().await.unwrap(), 1);
        assert!(dead.requeue(&job).await.unwrap());
        assert_eq!(dead.len().await.unwrap(), 0);
        assert_eq!(enqueuer.len("send_email").await.unwrap(), 1);

        // Already requeued: a second attempt is a no-op, not an error.
        assert!(!dead.requeue(&job).await.unwrap());
        cleanup(conn).await;
    }

    #[tokio::test]
    async fn delete_discards_without_requeuing() {
        let (dead, enqueuer, conn) = setup().await;
        let mut job = Job::new("send_email", serde_json::json!({}), 0);
        job.record_failure("boom", 5, 3);
        bury(&dead, &conn, &job).await;

        assert!(dead.delete(&job).await.unwrap());
        assert_eq!(dead.len().await.unwrap(), 0);
        assert_eq!(enqueuer.len("send_email").await.unwrap(), 0);
        cleanup(conn).await;
    }

    #[tokio::test]
    async fn vacuum_trims_only_entries_older_than_cutoff() {
        let (dead, _enqueuer, conn) = setup().await;
        let now = Utc::now().timestamp();

        let mut old = Job::new("ping", serde_json::json!({}), 0);
        old.record_failure("boom", now - 1000, 3);
        bury(&dead, &conn, &old).await;

        let mut recent = Job::new("ping", serde_json::json!({}), 0);
        recent.record_failure("boom", now, 3);
        bury(&dead, &conn, &recent).await;

        let removed = dead.vacuum(500).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(dead.len().await.unwrap(), 1);
        cleanup(conn).await;
    }

    #[tokio::test]
    async fn requeue_all_moves_every_dead_job() {
        let (dead, enqueuer, conn) = setup().await;
        for i in 0..3 {
            let mut job = Job::new("ping", serde_json::json!({"i": i}), 0);
            job.record_failure("boom", 5, 3);
            bury(&dead, &conn, &job).await;
        }
        let moved = dead.requeue_all().await.unwrap();
        assert_eq!(moved, 3);
        assert_eq!(enqueuer.len("ping").await.unwrap(), 3);
        cleanup(conn).await;
    }
}

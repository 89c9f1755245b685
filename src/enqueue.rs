//! Admission of jobs: immediate, scheduled, and unique variants.
//!
//! Grounded on `apalis-redis::Storage::push`/`schedule`: a script-backed
//! multi-key write per admission, generalized to per-job-name queues and
//! gated by `SETNX` for the unique variants.

use chrono::Utc;
use log::debug;
use redis::aio::ConnectionManager;
use redis::Script;
use serde_json::Value;

use crate::error::Result;
use crate::job::{fingerprint, Job};
use crate::keyspace::KeySpace;

#[derive(Clone)]
struct EnqueueScripts {
    push_job: Script,
    schedule_job: Script,
    enqueue_unique: Script,
    enqueue_unique_scheduled: Script,
}

impl EnqueueScripts {
    fn new() -> Self {
        Self {
            push_job: Script::new(include_str!("../lua/push_job.lua")),
            schedule_job: Script::new(include_str!("../lua/schedule_job.lua")),
            enqueue_unique: Script::new(include_str!("../lua/enqueue_unique.lua")),
            enqueue_unique_scheduled: Script::new(include_str!(
                "../lua/enqueue_unique_scheduled.lua"
            )),
        }
    }
}

/// Admits jobs into a namespace. Cheap to clone; shares one
/// `ConnectionManager` connection.
#[derive(Clone)]
pub struct Enqueuer {
    conn: ConnectionManager,
    keys: KeySpace,
    scripts: EnqueueScripts,
}

impl std::fmt::Debug for Enqueuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Enqueuer")
            .field("namespace", &self.keys.namespace())
            .finish()
    }
}

impl Enqueuer {
    /// Build an enqueuer for `namespace` over an existing connection.
    pub fn new(namespace: impl Into<String>, conn: ConnectionManager) -> Self {
        Self {
            conn,
            keys: KeySpace::new(namespace),
            scripts: EnqueueScripts::new(),
        }
    }

    /// The key-space this enqueuer writes into.
    pub fn keyspace(&self) -> &KeySpace {
        &self.keys
    }

    /// Admit `name` with `args` onto its live queue immediately.
    pub async fn enqueue(&self, name: &str, args: Value) -> Result<Job> {
        let now = Utc::now().timestamp();
        let job = Job::new(name, args, now);
        let bytes = job.to_bytes()?;
        let mut conn = self.conn.clone();
        self.scripts
            .push_job
            .key(self.keys.known_jobs())
            .key(self.keys.queue(name))
            .arg(name)
            .arg(bytes)
            .invoke_async::<_, ()>(&mut conn)
            .await
            .map_err(crate::error::Error::from)?;
        debug!("enqueued job {} ({name})", job.id);
        Ok(job)
    }

    /// Admit `name` with `args` onto `scheduled`, to run `delay_seconds`
    /// from now.
    pub async fn enqueue_in(&self, name: &str, delay_seconds: i64, args: Value) -> Result<Job> {
        let now = Utc::now().timestamp();
        let run_at = now + delay_seconds.max(0);
        let job = Job::new(name, args, now);
        let bytes = job.to_bytes()?;
        let mut conn = self.conn.clone();
        self.scripts
            .schedule_job
            .key(self.keys.known_jobs())
            .key(self.keys.scheduled())
            .arg(name)
            .arg(run_at)
            .arg(bytes)
            .invoke_async::<_, ()>(&mut conn)
            .await
            .map_err(crate::error::Error::from)?;
        debug!("scheduled job {} ({name}) for {run_at}", job.id);
        Ok(job)
    }

    /// Admit `name` with `args` onto its live queue, unless a job with the
    /// same `(name, canonical_args)` fingerprint is already live. Contention
    /// is not an error: returns `Ok(None)`.
    pub async fn enqueue_unique(&self, name: &str, args: Value) -> Result<Option<Job>> {
        let fp = fingerprint(name, &args);
        let now = Utc::now().timestamp();
        let job = Job::new_unique(name, args, now, fp.clone());
        let bytes = job.to_bytes()?;
        let mut conn = self.conn.clone();
        let admitted: i64 = self
            .scripts
            .enqueue_unique
            .key(self.keys.unique(&fp))
            .key(self.keys.known_jobs())
            .key(self.keys.queue(name))
            .arg(name)
            .arg(bytes)
            .invoke_async(&mut conn)
            .await
            .map_err(crate::error::Error::from)?;
        if admitted == 1 {
            debug!("enqueued unique job {} ({name}, fp={fp})", job.id);
            Ok(Some(job))
        } else {
            debug!("unique job ({name}, fp={fp}) already queued, skipping");
            Ok(None)
        }
    }

    /// As [`Enqueuer::enqueue_unique`] but targets `scheduled`, to run
    /// `delay_seconds` from now.
    pub async fn enqueue_unique_in(
        &self,
        name: &str,
        delay_seconds: i64,
        args: Value,
    ) -> Result<Option<Job>> {
        let fp = fingerprint(name, &args);
        let now = Utc::now().timestamp();
        let run_at = now + delay_seconds.max(0);
        let job = Job::new_unique(name, args, now, fp.clone());
        let bytes = job.to_bytes()?;
        let mut conn = self.conn.clone();
        let admitted: i64 = self
            .scripts
            .enqueue_unique_scheduled
            .key(self.keys.unique(&fp))
            .key(self.keys.known_jobs())
            .key(self.keys.scheduled())
            .arg(name)
            .arg(run_at)
            .arg(bytes)
            .invoke_async(&mut conn)
            .await
            .map_err(crate::error::Error::from)?;
        if admitted == 1 {
            debug!("scheduled unique job {} ({name}, fp={fp}) for {run_at}", job.id);
            Ok(Some(job))
        } else {
            debug!("unique job ({name}, fp={fp}) already queued, skipping schedule");
            Ok(None)
        }
    }

    /// Number of jobs currently on `name`'s live queue.
    pub async fn len(&self, name: &str) -> Result<i64> {
        let mut conn = self.conn.clone();
        let len: i64 = redis::cmd("LLEN")
            .arg(self.keys.queue(name))
            .query_async(&mut conn)
            .await
            .map_err(crate::error::Error::from)?;
        Ok(len)
    }

    /// Whether `name`'s live queue is currently empty.
    pub async fn is_empty(&self, name: &str) -> Result<bool> {
        Ok(self.len(name).await? == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup() -> Enqueuer {
        let redis_url = std::env::var("REDIS_URL").expect("No REDIS_URL is specified");
        let client = redis::Client::open(redis_url).unwrap();
        let conn = client.get_connection_manager().await.unwrap();
        Enqueuer::new("wh_test_enqueue", conn)
    }

    async fn cleanup(enqueuer: &Enqueuer) {
        let mut conn = enqueuer.conn.clone();
        let _: String = redis::cmd("FLUSHDB").query_async(&mut conn).await.unwrap();
    }

    #[tokio::test]
    async fn enqueue_pushes_onto_named_queue() {
        let enqueuer = setup().await;
        let job = enqueuer
            .enqueue("send_email", serde_json::json!({"to": "a@b"}))
            .await
            .expect("enqueue failed");
        assert_eq!(enqueuer.len("send_email").await.unwrap(), 1);
        assert_eq!(job.name, "send_email");
        cleanup(&enqueuer).await;
    }

    #[tokio::test]
    async fn enqueue_in_lands_on_scheduled_not_live() {
        let enqueuer = setup().await;
        enqueuer
            .enqueue_in("ping", 60, serde_json::json!({}))
            .await
            .expect("enqueue_in failed");
        assert!(enqueuer.is_empty("ping").await.unwrap());
        let mut conn = enqueuer.conn.clone();
        let scheduled: i64 = redis::cmd("ZCARD")
            .arg(enqueuer.keyspace().scheduled())
            .query_async(&mut conn)
            .await
            .unwrap();
        assert_eq!(scheduled, 1);
        cleanup(&enqueuer).await;
    }

    #[tokio::test]
    async fn enqueue_unique_is_idempotent_until_lock_released() {
        let enqueuer = setup().await;
        let first = enqueuer
            .enqueue_unique("clear_cache", serde_json::json!({"id": "123"}))
            .await
            .unwrap();
        assert!(first.is_some());
        let second = enqueuer
            .enqueue_unique("clear_cache", serde_json::json!({"id": "123"}))
            .await
            .unwrap();
        assert!(second.is_none());
        cleanup(&enqueuer).await;
    }
}

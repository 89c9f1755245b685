//! The atomic claim script: one server-side weighted draw + move per fetch
//! attempt.
//!
//! Grounded on `apalis-redis::storage`'s script-invocation idiom
//! (`Script::new(include_str!(...))`, `.key(..).arg(..).invoke_async`); the
//! weighted-draw-and-redraw algorithm is implemented directly in
//! `lua/claim.lua` since the whole draw-and-move step must be one atomic
//! script invocation.

use redis::aio::ConnectionManager;
use redis::{Script, Value};

use crate::error::Result;
use crate::job::Job;
use crate::keyspace::KeySpace;

/// A job name and its effective selection weight (priority, >= 1).
#[derive(Clone, Debug)]
pub(crate) struct WeightedQueue {
    pub name: String,
    pub weight: u32,
}

/// Invokes the claim script against a worker's inprogress key.
#[derive(Clone)]
pub(crate) struct Claimer {
    conn: ConnectionManager,
    keys: KeySpace,
    script: Script,
}

impl Claimer {
    /// Build a claimer for `namespace` over an existing connection.
    pub(crate) fn new(namespace: impl Into<String>, conn: ConnectionManager) -> Self {
        Self {
            conn,
            keys: KeySpace::new(namespace),
            script: Script::new(include_str!("../lua/claim.lua")),
        }
    }

    /// Attempt one weighted draw-and-claim across `queues` into
    /// `worker_id`'s inprogress list. `queues` is sorted lexically by name
    /// before the draw so weight ties resolve in a stable, reproducible
    /// order.
    ///
    /// Returns `None` if every candidate queue was empty at draw time.
    pub(crate) async fn claim(
        &self,
        worker_id: &str,
        queues: &[WeightedQueue],
    ) -> Result<Option<Job>> {
        if queues.is_empty() {
            return Ok(None);
        }
        let mut ordered = queues.to_vec();
        ordered.sort_by(|a, b| a.name.cmp(&b.name));

        let mut invocation = self.script.prepare_invoke();
        for q in &ordered {
            invocation.key(self.keys.queue(&q.name));
        }
        invocation.key(self.keys.inprogress(worker_id));
        for q in &ordered {
            invocation.arg(q.weight.max(1));
        }

        let mut conn = self.conn.clone();
        let result: Value = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(crate::error::Error::from)?;
        match result {
            Value::Nil | Value::Boolean(false) => Ok(None),
            Value::BulkString(bytes) => Ok(Some(Job::from_bytes(&bytes)?)),
            other => {
                log::warn!("unexpected claim script reply shape: {other:?}");
                Ok(None)
            }
        }
    }
}

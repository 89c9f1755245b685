//! The job record and its deduplication fingerprint.

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

const ID_LEN: usize = 20;

/// A single unit of work as it is serialized into the store.
///
/// This byte string (via `serde_json`) is the unit moved between the live
/// queue, `scheduled`, `retry`, `dead`, and a worker's in-progress list.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Job {
    /// Opaque unique identifier, ~20 random characters.
    pub id: String,
    /// Queue selector / handler lookup key.
    pub name: String,
    /// Arbitrary JSON-serializable arguments.
    pub args: Value,
    /// Unix timestamp (seconds) the job was admitted.
    pub enqueued_at: i64,
    /// Number of failed attempts so far.
    #[serde(default)]
    pub fails: u32,
    /// Message from the most recent failure, if any.
    #[serde(default)]
    pub last_err: Option<String>,
    /// Unix timestamp (seconds) of the most recent failure, if any.
    #[serde(default)]
    pub failed_at: Option<i64>,
    /// Fingerprint this job was admitted under, for unique jobs.
    #[serde(default)]
    pub unique_key: Option<String>,
}

impl Job {
    /// Build a freshly-admitted job record with a random id.
    pub fn new(name: impl Into<String>, args: Value, enqueued_at: i64) -> Self {
        Self {
            id: random_id(),
            name: name.into(),
            args,
            enqueued_at,
            fails: 0,
            last_err: None,
            failed_at: None,
            unique_key: None,
        }
    }

    /// Same as [`Job::new`] but stamps a unique-job fingerprint onto the
    /// record, so it can be released on success.
    pub fn new_unique(
        name: impl Into<String>,
        args: Value,
        enqueued_at: i64,
        fingerprint: String,
    ) -> Self {
        let mut job = Self::new(name, args, enqueued_at);
        job.unique_key = Some(fingerprint);
        job
    }

    /// Serialize to the JSON bytes stored in Redis.
    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    /// Deserialize from the JSON bytes read out of Redis.
    pub fn from_bytes(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }

    /// Record a failed attempt, returning whether the job has now exhausted
    /// `max_fails` and should move to `dead` rather than `retry`.
    pub fn record_failure(&mut self, err: impl Into<String>, now: i64, max_fails: u32) -> bool {
        self.fails += 1;
        self.last_err = Some(err.into());
        self.failed_at = Some(now);
        self.fails >= max_fails
    }
}

/// ~20 character alphanumeric random id.
pub(crate) fn random_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(ID_LEN)
        .map(char::from)
        .collect()
}

/// Canonicalize a JSON value by recursively sorting object keys
/// lexicographically. Arrays and scalars are left as-is; only object key
/// order is unstable in `serde_json` by default, so only that needs fixing
/// to make two logically-equal payloads serialize identically.
pub(crate) fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<&String, Value> =
                map.iter().map(|(k, v)| (k, canonicalize(v))).collect();
            let mut out = Map::with_capacity(sorted.len());
            for (k, v) in sorted {
                out.insert(k.clone(), v);
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// Fingerprint for a unique job: lowercase hex SHA-256 over `(name,
/// canonical_args)`, truncated to 32 hex characters (128 bits). Two calls
/// with logically equal payloads always yield identical fingerprints
/// because the args are canonicalized (object keys sorted) before hashing.
pub(crate) fn fingerprint(name: &str, args: &Value) -> String {
    let canonical = canonicalize(args);
    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    hasher.update(b"\0");
    hasher.update(canonical.to_string().as_bytes());
    let digest = hasher.finalize();
    hex::encode(digest)[..32].to_string()
}

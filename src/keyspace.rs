//! Deterministic naming of every key the engine touches.
//!
//! All runtime keys derive from `(namespace, kind, identifier)` via a fixed
//! concatenation so independent processes sharing a namespace always agree
//! on where things live. Mirrors `apalis-redis::Config`'s `{queue}`-replace
//! getters, generalized from a single queue to per-job-name queues plus the
//! fleet-wide coordination keys.

const SEP: &str = ":";

/// Key-space builder for a single namespace.
///
/// Cheap to construct and clone; holds only the namespace string.
#[derive(Clone, Debug)]
pub struct KeySpace {
    namespace: String,
}

impl KeySpace {
    /// Create a key-space for `namespace`. The namespace is opaque; the only
    /// validation performed is non-emptiness.
    pub fn new(namespace: impl Into<String>) -> Self {
        let namespace = namespace.into();
        assert!(!namespace.is_empty(), "namespace must not be empty");
        Self { namespace }
    }

    /// The raw namespace string.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn key(&self, suffix: &str) -> String {
        format!("{}{SEP}{suffix}", self.namespace)
    }

    /// Live queue (list) for job name `name`.
    pub fn queue(&self, name: &str) -> String {
        self.key(name)
    }

    /// Per-worker in-progress list.
    pub fn inprogress(&self, worker_id: &str) -> String {
        format!("{}{SEP}inprogress", self.key(worker_id))
    }

    /// Set of all job names ever observed.
    pub fn known_jobs(&self) -> String {
        self.key("known_jobs")
    }

    /// Z-set of jobs scheduled for future admission.
    pub fn scheduled(&self) -> String {
        self.key("scheduled")
    }

    /// Z-set of jobs awaiting a retry attempt.
    pub fn retry(&self) -> String {
        self.key("retry")
    }

    /// Z-set of terminally failed jobs.
    pub fn dead(&self) -> String {
        self.key("dead")
    }

    /// Single-key admission lock for a unique job fingerprint.
    pub fn unique(&self, fingerprint: &str) -> String {
        format!("{}{SEP}unique{SEP}{fingerprint}", self.namespace)
    }

    /// Set of pool ids currently heartbeating.
    pub fn pools(&self) -> String {
        self.key("pools")
    }

    /// Liveness hash for pool `pool_id`.
    pub fn pool_heartbeat(&self, pool_id: &str) -> String {
        format!("{}{SEP}heartbeat", self.key(pool_id))
    }

    /// Current-observation hash for worker `worker_id`.
    pub fn observation(&self, worker_id: &str) -> String {
        format!("{}{SEP}observation", self.key(worker_id))
    }

    /// Tracking key for the last horizon scheduled per periodic spec.
    pub fn periodic_last_enqueued(&self) -> String {
        self.key("periodic:last_enqueued")
    }

    /// Short-lived advisory lock used by the reaper to avoid double requeue
    /// of the same dead pool.
    pub fn reap_lock(&self, pool_id: &str) -> String {
        format!("{}{SEP}reap_lock{SEP}{pool_id}", self.namespace)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_namespaced_and_stable() {
        let ks = KeySpace::new("ns");
        assert_eq!(ks.queue("send_email"), "ns:send_email");
        assert_eq!(ks.inprogress("worker-1"), "ns:worker-1:inprogress");
        assert_eq!(ks.known_jobs(), "ns:known_jobs");
        assert_eq!(ks.scheduled(), "ns:scheduled");
        assert_eq!(ks.retry(), "ns:retry");
        assert_eq!(ks.dead(), "ns:dead");
        assert_eq!(ks.unique("abcd1234"), "ns:unique:abcd1234");
        assert_eq!(ks.pools(), "ns:pools");
        assert_eq!(ks.pool_heartbeat("pool-1"), "ns:pool-1:heartbeat");
        assert_eq!(ks.observation("worker-1"), "ns:worker-1:observation");
    }

    #[test]
    #[should_panic]
    fn empty_namespace_panics() {
        KeySpace::new("");
    }
}

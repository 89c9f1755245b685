//! Tunables for a worker pool and its sidecar loops.
//!
//! Mirrors `apalis-redis::Config`'s builder-setter pattern
//! (`set_fetch_interval`/`get_fetch_interval`, ...) generalized to the
//! fleet-coordination intervals each sidecar needs.

use std::time::Duration;

/// A function from attempt count to backoff duration. Implementers may
/// override the default via [`Config::set_default_backoff`] or per-job via
/// `JobOptions::backoff`.
pub type BackoffFn = std::sync::Arc<dyn Fn(u32) -> Duration + Send + Sync>;

/// Pool-wide and sidecar-loop configuration.
#[derive(Clone)]
pub struct Config {
    namespace: String,
    concurrency: usize,
    claim_poll_interval: Duration,
    claim_poll_jitter: Duration,
    default_max_fails: u32,
    default_backoff: BackoffFn,
    backoff_ceiling: Duration,
    heartbeat_interval: Duration,
    dead_threshold: Duration,
    requeuer_interval: Duration,
    reaper_interval: Duration,
    periodic_wake_interval: Duration,
    periodic_horizon: Duration,
    drain_deadline: Duration,
}

fn default_backoff_fn() -> BackoffFn {
    std::sync::Arc::new(|fails: u32| {
        let base = Duration::from_secs(1);
        let ceiling = Duration::from_secs(300);
        let exp = 2u64.saturating_pow(fails.min(32));
        let secs = base.as_secs().saturating_mul(exp).min(ceiling.as_secs());
        Duration::from_secs(secs.max(1))
    })
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("namespace", &self.namespace)
            .field("concurrency", &self.concurrency)
            .field("claim_poll_interval", &self.claim_poll_interval)
            .field("default_max_fails", &self.default_max_fails)
            .field("backoff_ceiling", &self.backoff_ceiling)
            .field("heartbeat_interval", &self.heartbeat_interval)
            .field("dead_threshold", &self.dead_threshold)
            .field("requeuer_interval", &self.requeuer_interval)
            .field("reaper_interval", &self.reaper_interval)
            .field("periodic_wake_interval", &self.periodic_wake_interval)
            .field("periodic_horizon", &self.periodic_horizon)
            .field("drain_deadline", &self.drain_deadline)
            .finish()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            namespace: String::from("workhorse"),
            concurrency: 10,
            claim_poll_interval: Duration::from_millis(300),
            claim_poll_jitter: Duration::from_millis(200),
            default_max_fails: 4,
            default_backoff: default_backoff_fn(),
            backoff_ceiling: Duration::from_secs(300),
            heartbeat_interval: Duration::from_secs(5),
            dead_threshold: Duration::from_secs(25),
            requeuer_interval: Duration::from_secs(1),
            reaper_interval: Duration::from_secs(5 * 60),
            periodic_wake_interval: Duration::from_secs(2 * 60),
            periodic_horizon: Duration::from_secs(5 * 60),
            drain_deadline: Duration::from_secs(5),
        }
    }
}

impl Config {
    /// Start from defaults with an explicit namespace.
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            ..Default::default()
        }
    }

    /// The namespace all keys are prefixed with.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Number of worker tasks a pool built from this config spawns.
    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Base interval a worker sleeps between empty-queue claim attempts.
    pub fn claim_poll_interval(&self) -> Duration {
        self.claim_poll_interval
    }

    /// Maximum additional jitter added on top of `claim_poll_interval`.
    pub fn claim_poll_jitter(&self) -> Duration {
        self.claim_poll_jitter
    }

    /// Default `max_fails` for job names registered without an explicit
    /// override.
    pub fn default_max_fails(&self) -> u32 {
        self.default_max_fails
    }

    /// Default backoff policy for job names registered without an explicit
    /// override.
    pub fn default_backoff(&self) -> &BackoffFn {
        &self.default_backoff
    }

    /// Interval between pool heartbeat writes.
    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }

    /// How stale a heartbeat may get before the reaper treats the pool as
    /// dead. Defaults to 5x the heartbeat interval.
    pub fn dead_threshold(&self) -> Duration {
        self.dead_threshold
    }

    /// Interval between requeuer sweeps of `scheduled`/`retry`.
    pub fn requeuer_interval(&self) -> Duration {
        self.requeuer_interval
    }

    /// Interval between reaper sweeps of `pools`.
    pub fn reaper_interval(&self) -> Duration {
        self.reaper_interval
    }

    /// How often the periodic enqueuer wakes to extend its horizon.
    pub fn periodic_wake_interval(&self) -> Duration {
        self.periodic_wake_interval
    }

    /// How far into the future the periodic enqueuer schedules on each wake.
    pub fn periodic_horizon(&self) -> Duration {
        self.periodic_horizon
    }

    /// How long `stop()` waits for in-flight jobs to reach a terminal state.
    pub fn drain_deadline(&self) -> Duration {
        self.drain_deadline
    }

    /// Override worker concurrency.
    pub fn set_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Override the empty-queue claim poll interval.
    pub fn set_claim_poll_interval(mut self, interval: Duration) -> Self {
        self.claim_poll_interval = interval;
        self
    }

    /// Override the default `max_fails`.
    pub fn set_default_max_fails(mut self, max_fails: u32) -> Self {
        self.default_max_fails = max_fails;
        self
    }

    /// Override the default backoff policy.
    pub fn set_default_backoff(mut self, backoff: BackoffFn) -> Self {
        self.default_backoff = backoff;
        self
    }

    /// Override the heartbeat interval. Also scales `dead_threshold` to 5x
    /// unless it has already been set explicitly via
    /// [`Config::set_dead_threshold`].
    pub fn set_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self.dead_threshold = interval * 5;
        self
    }

    /// Override the dead-pool threshold directly.
    pub fn set_dead_threshold(mut self, threshold: Duration) -> Self {
        self.dead_threshold = threshold;
        self
    }

    /// Override the requeuer poll interval.
    pub fn set_requeuer_interval(mut self, interval: Duration) -> Self {
        self.requeuer_interval = interval;
        self
    }

    /// Override the reaper sweep interval.
    pub fn set_reaper_interval(mut self, interval: Duration) -> Self {
        self.reaper_interval = interval;
        self
    }

    /// Override the periodic enqueuer's wake interval.
    pub fn set_periodic_wake_interval(mut self, interval: Duration) -> Self {
        self.periodic_wake_interval = interval;
        self
    }

    /// Override the periodic enqueuer's scheduling horizon.
    pub fn set_periodic_horizon(mut self, horizon: Duration) -> Self {
        self.periodic_horizon = horizon;
        self
    }

    /// Override the `stop()` drain deadline.
    pub fn set_drain_deadline(mut self, deadline: Duration) -> Self {
        self.drain_deadline = deadline;
        self
    }
}

/// Per-job-name registration options.
#[derive(Clone)]
pub struct JobOptions {
    pub(crate) priority: u32,
    pub(crate) max_fails: Option<u32>,
    pub(crate) backoff: Option<BackoffFn>,
    pub(crate) skip_dead_queue: bool,
}

impl std::fmt::Debug for JobOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobOptions")
            .field("priority", &self.priority)
            .field("max_fails", &self.max_fails)
            .field("skip_dead_queue", &self.skip_dead_queue)
            .finish()
    }
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            priority: 1,
            max_fails: None,
            backoff: None,
            skip_dead_queue: false,
        }
    }
}

impl JobOptions {
    /// Statistical selection weight; must be >= 1. Defaults to 1.
    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority.max(1);
        self
    }

    /// Override the pool-wide default `max_fails` for this job name.
    pub fn with_max_fails(mut self, max_fails: u32) -> Self {
        self.max_fails = Some(max_fails);
        self
    }

    /// Override the pool-wide default backoff policy for this job name.
    pub fn with_backoff(mut self, backoff: BackoffFn) -> Self {
        self.backoff = Some(backoff);
        self
    }

    /// If true, an exhausted job is dropped rather than moved to `dead`.
    pub fn skip_dead_queue(mut self, skip: bool) -> Self {
        self.skip_dead_queue = skip;
        self
    }

    pub(crate) fn priority(&self) -> u32 {
        self.priority
    }

    pub(crate) fn max_fails(&self, config: &Config) -> u32 {
        self.max_fails.unwrap_or_else(|| config.default_max_fails())
    }

    pub(crate) fn backoff(&self, config: &Config) -> BackoffFn {
        self.backoff.clone().unwrap_or_else(|| config.default_backoff().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_backoff_grows_and_caps() {
        let f = default_backoff_fn();
        assert_eq!(f(1), Duration::from_secs(2));
        assert_eq!(f(2), Duration::from_secs(4));
        assert_eq!(f(20), Duration::from_secs(300));
    }

    #[test]
    fn job_options_priority_is_floored_at_one() {
        let opts = JobOptions::default().with_priority(0);
        assert_eq!(opts.priority(), 1);
    }

    #[test]
    fn heartbeat_interval_scales_dead_threshold() {
        let config = Config::default().set_heartbeat_interval(Duration::from_secs(2));
        assert_eq!(config.dead_threshold(), Duration::from_secs(10));
    }
}

use thiserror::Error;

/// Errors surfaced synchronously by the crate's public API.
///
/// Handler errors, panics, and missing-handler/malformed-payload failures
/// are *not* represented here — per the error taxonomy, those are absorbed
/// into job state (`last_err`, `retry`/`dead`) rather than returned to the
/// caller.
#[derive(Debug, Error)]
pub enum Error {
    /// The store was unreachable or returned an error.
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// A job payload failed to serialize or deserialize.
    #[error("encode/decode error: {0}")]
    Encode(#[from] serde_json::Error),

    /// A cron expression supplied to `PeriodicallyEnqueue` did not parse.
    #[error("invalid cron expression {0:?}: {1}")]
    InvalidCron(String, String),

    /// A claimed job's name has no registered handler.
    #[error("no handler registered for job {0:?}")]
    MissingHandler(String),

    /// An operation was attempted on a pool that has already been told to stop.
    #[error("worker pool is shutting down")]
    PoolShuttingDown,
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

//! The fetch-execute-retire loop, middleware chain, and job context.
//!
//! Grounded on `examples/basics/src/main.rs`'s layered handler invocation
//! (`CatchPanicLayer`, `LogLayer` wrapping `build_fn(send_email)`) for the
//! catch-panic-at-the-boundary shape, and
//! `other_examples/...harborgrid...scheduler.rs`'s `JobExecutor` async trait
//! for the handler-trait shape.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use log::{debug, error, warn};
use redis::aio::ConnectionManager;
use redis::Script;
use serde_json::Value;

use crate::config::{Config, JobOptions};
use crate::error::Result;
use crate::job::Job;
use crate::keyspace::KeySpace;

/// A job handle passed to handlers and middleware: the job's name/args plus
/// an advisory check-in.
#[derive(Clone)]
pub struct JobContext {
    job: Job,
    conn: ConnectionManager,
    observation_key: String,
}

impl JobContext {
    fn new(job: Job, conn: ConnectionManager, observation_key: String) -> Self {
        Self {
            job,
            conn,
            observation_key,
        }
    }

    /// The job's name (queue selector).
    pub fn name(&self) -> &str {
        &self.job.name
    }

    /// The job's raw JSON arguments.
    pub fn args(&self) -> &Value {
        &self.job.args
    }

    /// The job's opaque id.
    pub fn id(&self) -> &str {
        &self.job.id
    }

    /// Number of prior failed attempts.
    pub fn fails(&self) -> u32 {
        self.job.fails
    }

    /// Deserialize `args` into `T`.
    pub fn unmarshal_payload<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.job.args.clone())?)
    }

    /// Write an advisory status message into this worker's observation
    /// hash. Does not extend any deadline; purely informational.
    pub async fn checkin(&self, message: impl Into<String>) {
        let mut conn = self.conn.clone();
        let now = Utc::now().timestamp();
        let res: std::result::Result<(), redis::RedisError> = redis::pipe()
            .hset(&self.observation_key, "checkin", message.into())
            .hset(&self.observation_key, "checkin_at", now)
            .query_async(&mut conn)
            .await;
        if let Err(e) = res {
            warn!("checkin for job {} failed: {e}", self.job.id);
        }
    }
}

/// The outcome of running a handler (and its middleware chain) to
/// completion.
pub enum Outcome {
    /// The handler completed without error.
    Success,
    /// The handler returned or panicked with an error.
    Failure(String),
}

/// A continuation passed to each middleware layer. Calling it enters the
/// next interceptor, or the handler itself at the end of the chain.
pub struct Next<'a> {
    chain: &'a [Arc<dyn Middleware>],
    handler: &'a (dyn Handler),
}

impl<'a> Next<'a> {
    /// Invoke the next link in the chain.
    pub async fn run(&self, ctx: JobContext) -> Outcome {
        match self.chain.split_first() {
            Some((first, rest)) => {
                first
                    .call(
                        ctx,
                        Next {
                            chain: rest,
                            handler: self.handler,
                        },
                    )
                    .await
            }
            None => self.handler.call(ctx).await,
        }
    }
}

/// An ordered interceptor sharing the job's context. An interceptor that
/// never invokes `next.run(..)` short-circuits the chain; its own error
/// becomes the job's error.
#[async_trait]
pub trait Middleware: Send + Sync + 'static {
    /// Run this interceptor, optionally delegating to `next`.
    async fn call(&self, ctx: JobContext, next: Next<'_>) -> Outcome;
}

/// A registered job handler. The engine does not interpret the handler;
/// it only invokes it at the end of the middleware chain.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// Run the handler body for one job.
    async fn call(&self, ctx: JobContext) -> Outcome;
}

#[async_trait]
impl<F, Fut> Handler for F
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = std::result::Result<(), String>> + Send + 'static,
{
    async fn call(&self, ctx: JobContext) -> Outcome {
        let fut = AssertUnwindSafe((self)(ctx));
        match fut.catch_unwind().await {
            Ok(Ok(())) => Outcome::Success,
            Ok(Err(e)) => Outcome::Failure(e),
            Err(panic) => Outcome::Failure(panic_message(panic)),
        }
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "job handler panicked".to_string()
    }
}

/// A registered job name's handler plus its options.
pub(crate) struct Registration {
    pub handler: Arc<dyn Handler>,
    pub options: JobOptions,
}

#[derive(Clone)]
struct RetireScripts {
    success: Script,
    fail: Script,
}

impl RetireScripts {
    fn new() -> Self {
        Self {
            success: Script::new(include_str!("../lua/retire_success.lua")),
            fail: Script::new(include_str!("../lua/retire_fail.lua")),
        }
    }
}

/// Executes claimed jobs: looks up the registered handler, runs the
/// middleware chain, and retires the job to its terminal or retry state.
#[derive(Clone)]
pub(crate) struct Executor {
    conn: ConnectionManager,
    keys: KeySpace,
    config: Config,
    middleware: Arc<Vec<Arc<dyn Middleware>>>,
    scripts: RetireScripts,
}

impl Executor {
    pub(crate) fn new(
        conn: ConnectionManager,
        keys: KeySpace,
        config: Config,
        middleware: Arc<Vec<Arc<dyn Middleware>>>,
    ) -> Self {
        Self {
            conn,
            keys,
            config,
            middleware,
            scripts: RetireScripts::new(),
        }
    }

    /// Run one claimed job to completion against its registration (or, if
    /// `registration` is `None`, straight to `dead` as an unregistered-name
    /// failure).
    pub(crate) async fn run(
        &self,
        worker_id: &str,
        mut job: Job,
        registration: Option<&Registration>,
    ) {
        let observation_key = self.keys.observation(worker_id);
        self.write_observation(&observation_key, &job).await;

        let (outcome, fatal) = match registration {
            Some(reg) => {
                let ctx = JobContext::new(job.clone(), self.conn.clone(), observation_key.clone());
                let next = Next {
                    chain: &self.middleware,
                    handler: reg.handler.as_ref(),
                };
                // Middleware runs outside the blanket Handler impl's own
                // catch_unwind, so a panic anywhere in the chain (before or
                // after an interceptor delegates to `next`) is caught here
                // instead of unwinding out of the worker task.
                let outcome = match AssertUnwindSafe(next.run(ctx)).catch_unwind().await {
                    Ok(outcome) => outcome,
                    Err(panic) => Outcome::Failure(panic_message(panic)),
                };
                (outcome, false)
            }
            None => (
                Outcome::Failure(format!("no handler registered for job {:?}", job.name)),
                true,
            ),
        };

        let max_fails = registration
            .map(|r| r.options.max_fails(&self.config))
            .unwrap_or(self.config.default_max_fails());
        let skip_dead_queue = registration.map(|r| r.options.skip_dead_queue).unwrap_or(false);
        let backoff = registration
            .map(|r| r.options.backoff(&self.config))
            .unwrap_or_else(|| self.config.default_backoff().clone());

        let old_bytes = match job.to_bytes() {
            Ok(b) => b,
            Err(e) => {
                error!("failed to serialize job {} before retire: {e}", job.id);
                return;
            }
        };

        match outcome {
            Outcome::Success => self.retire_success(worker_id, &old_bytes, &job).await,
            Outcome::Failure(err) => {
                let now = Utc::now().timestamp();
                let exhausted = job.record_failure(err, now, max_fails);
                if fatal {
                    // No handler registered for this name: terminally fatal
                    // on the first claim, regardless of max_fails.
                    self.retire_to_dead(worker_id, &old_bytes, &job, now).await;
                } else if exhausted && skip_dead_queue {
                    // Dropped rather than moved to `dead`: same inprogress
                    // removal and unique-lock release as a success, just
                    // discarding the job instead of storing it anywhere.
                    self.retire_success(worker_id, &old_bytes, &job).await;
                } else if exhausted {
                    self.retire_to_dead(worker_id, &old_bytes, &job, now).await;
                } else {
                    let delay = backoff(job.fails).as_secs() as i64;
                    self.retire_to_retry(worker_id, &old_bytes, &job, now + delay)
                        .await;
                }
            }
        }

        let _ = redis::cmd("DEL")
            .arg(&observation_key)
            .query_async::<_, ()>(&mut self.conn.clone())
            .await;
    }

    async fn write_observation(&self, observation_key: &str, job: &Job) {
        let now = Utc::now().timestamp();
        let res: std::result::Result<(), redis::RedisError> = redis::pipe()
            .hset(observation_key, "job_id", &job.id)
            .hset(observation_key, "name", &job.name)
            .hset(observation_key, "args", job.args.to_string())
            .hset(observation_key, "started_at", now)
            .query_async(&mut self.conn.clone())
            .await;
        if let Err(e) = res {
            warn!("failed to write observation for job {}: {e}", job.id);
        }
    }

    async fn retire_success(&self, worker_id: &str, remove_bytes: &[u8], job: &Job) {
        let has_unique = job.unique_key.is_some();
        let unique_key = job
            .unique_key
            .as_deref()
            .map(|fp| self.keys.unique(fp))
            .unwrap_or_else(|| self.keys.unique("_"));
        let mut conn = self.conn.clone();
        if let Err(e) = self
            .scripts
            .success
            .key(self.keys.inprogress(worker_id))
            .key(unique_key)
            .arg(remove_bytes)
            .arg(if has_unique { "1" } else { "0" })
            .invoke_async::<_, ()>(&mut conn)
            .await
        {
            error!("failed to retire successful job {}: {e}", job.id);
        } else {
            debug!("job {} completed", job.id);
        }
    }

    async fn retire_to_retry(&self, worker_id: &str, old_bytes: &[u8], job: &Job, score: i64) {
        self.retire_fail(worker_id, old_bytes, job, self.keys.retry(), score, false)
            .await;
    }

    async fn retire_to_dead(&self, worker_id: &str, old_bytes: &[u8], job: &Job, score: i64) {
        self.retire_fail(worker_id, old_bytes, job, self.keys.dead(), score, true)
            .await;
    }

    async fn retire_fail(
        &self,
        worker_id: &str,
        old_bytes: &[u8],
        job: &Job,
        dest: String,
        score: i64,
        release_unique: bool,
    ) {
        let Ok(new_bytes) = job.to_bytes() else { return };
        let has_unique = job.unique_key.is_some();
        let unique_key = job
            .unique_key
            .as_deref()
            .map(|fp| self.keys.unique(fp))
            .unwrap_or_else(|| self.keys.unique("_"));
        let mut conn = self.conn.clone();
        if let Err(e) = self
            .scripts
            .fail
            .key(self.keys.inprogress(worker_id))
            .key(dest)
            .key(unique_key)
            .arg(old_bytes)
            .arg(new_bytes)
            .arg(score)
            .arg(if release_unique && has_unique { "1" } else { "0" })
            .invoke_async::<_, ()>(&mut conn)
            .await
        {
            error!("failed to retire failed job {}: {e}", job.id);
        } else {
            debug!(
                "job {} failed ({} attempts), moved with score {score}",
                job.id, job.fails
            );
        }
    }
}

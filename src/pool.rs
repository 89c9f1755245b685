//! The worker pool: registers job handlers and periodic specs, then spawns
//! the worker tasks and fleet-coordination sidecars that carry them out.
//!
//! Grounded on `other_examples/...harborgrid...scheduler.rs`'s
//! `JobScheduler` (`Arc`-shared registries, one `tokio::spawn` loop per
//! background concern) for the spawn-and-own-handles shape, and
//! `examples/basics/src/main.rs`'s `WorkerBuilder`/`Monitor` registration
//! style for the fluent builder-method naming.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use rand::Rng;
use redis::aio::ConnectionManager;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::claim::{Claimer, WeightedQueue};
use crate::config::{Config, JobOptions};
use crate::error::Result;
use crate::heartbeat::Heartbeater;
use crate::job::random_id;
use crate::keyspace::KeySpace;
use crate::periodic::{PeriodicEnqueuer, PeriodicSpec};
use crate::reaper::Reaper;
use crate::requeue::Requeuer;
use crate::worker::{Executor, Middleware, Registration};

const REQUEUER_BATCH_SIZE: usize = 100;

/// Consumer side of the engine: owns the worker tasks and sidecar loops for
/// one process. Register handlers and periodic specs, then [`start`], and
/// [`stop`] on shutdown.
///
/// [`start`]: WorkerPool::start
/// [`stop`]: WorkerPool::stop
pub struct WorkerPool {
    id: String,
    config: Config,
    conn: ConnectionManager,
    keys: KeySpace,
    registrations: HashMap<String, Registration>,
    middleware: Vec<Arc<dyn Middleware>>,
    periodic_specs: Vec<PeriodicSpec>,
    stop_tx: Option<watch::Sender<bool>>,
    handles: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("id", &self.id)
            .field("config", &self.config)
            .field("registered_jobs", &self.registrations.keys().collect::<Vec<_>>())
            .field("periodic_specs", &self.periodic_specs)
            .field("running", &self.stop_tx.is_some())
            .finish()
    }
}

impl WorkerPool {
    /// Build a pool of `concurrency` workers under `namespace`, sharing
    /// `conn` with every sidecar.
    pub fn new(concurrency: usize, namespace: impl Into<String>, conn: ConnectionManager) -> Self {
        Self::with_config(Config::new(namespace).set_concurrency(concurrency), conn)
    }

    /// Build a pool from an explicit [`Config`].
    pub fn with_config(config: Config, conn: ConnectionManager) -> Self {
        let keys = KeySpace::new(config.namespace().to_string());
        Self {
            id: random_id(),
            config,
            conn,
            keys,
            registrations: HashMap::new(),
            middleware: Vec::new(),
            periodic_specs: Vec::new(),
            stop_tx: None,
            handles: Vec::new(),
        }
    }

    /// This pool's id: random, stable for the pool's lifetime.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Register a handler for `name` with default [`JobOptions`].
    pub fn job<H, Fut>(self, name: impl Into<String>, handler: H) -> Self
    where
        H: Fn(crate::worker::JobContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = std::result::Result<(), String>> + Send + 'static,
    {
        self.job_with_options(name, JobOptions::default(), handler)
    }

    /// Register a handler for `name` with explicit [`JobOptions`].
    pub fn job_with_options<H, Fut>(mut self, name: impl Into<String>, options: JobOptions, handler: H) -> Self
    where
        H: Fn(crate::worker::JobContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = std::result::Result<(), String>> + Send + 'static,
    {
        self.registrations.insert(
            name.into(),
            Registration {
                handler: Arc::new(handler),
                options,
            },
        );
        self
    }

    /// Append an interceptor to the middleware chain. Order is preserve:
    /// the first interceptor added is the outermost, nearest the claim.
    pub fn middleware(mut self, mw: impl Middleware + 'static) -> Self {
        self.middleware.push(Arc::new(mw));
        self
    }

    /// Register a cron-driven periodic spec: enqueue `name` at every
    /// instant matching `cron_expr`, deduplicated across the fleet.
    pub fn periodically_enqueue(mut self, cron_expr: impl Into<String>, name: impl Into<String>) -> Self {
        self.periodic_specs.push(PeriodicSpec {
            expr: cron_expr.into(),
            name: name.into(),
        });
        self
    }

    /// Spawn `concurrency` worker tasks plus the heartbeater, requeuer,
    /// reaper, and periodic enqueuer sidecars.
    pub async fn start(&mut self) -> Result<()> {
        if self.stop_tx.is_some() {
            return Ok(());
        }
        let (stop_tx, stop_rx) = watch::channel(false);

        let queues: Vec<WeightedQueue> = self
            .registrations
            .iter()
            .map(|(name, reg)| WeightedQueue {
                name: name.clone(),
                weight: reg.options.priority(),
            })
            .collect();
        let job_names: Vec<String> = self.registrations.keys().cloned().collect();
        let worker_ids: Vec<String> = (0..self.config.concurrency())
            .map(|n| format!("{}:w{n}", self.id))
            .collect();

        let registrations = Arc::new(std::mem::take(&mut self.registrations));
        let middleware = Arc::new(std::mem::take(&mut self.middleware));
        let claimer = Claimer::new(self.config.namespace().to_string(), self.conn.clone());
        let executor = Executor::new(
            self.conn.clone(),
            self.keys.clone(),
            self.config.clone(),
            middleware,
        );

        for worker_id in &worker_ids {
            let handle = tokio::spawn(worker_loop(
                worker_id.clone(),
                claimer.clone(),
                executor.clone(),
                registrations.clone(),
                queues.clone(),
                self.config.claim_poll_interval(),
                self.config.claim_poll_jitter(),
                stop_rx.clone(),
            ));
            self.handles.push(handle);
        }

        let heartbeater = Heartbeater::new(
            self.conn.clone(),
            self.keys.clone(),
            self.id.clone(),
            job_names,
            worker_ids,
            self.config.concurrency(),
        );
        self.handles.push(tokio::spawn(
            heartbeater.run(self.config.heartbeat_interval(), stop_rx.clone()),
        ));

        let requeuer = Requeuer::new(self.conn.clone(), self.keys.clone(), REQUEUER_BATCH_SIZE);
        self.handles
            .push(tokio::spawn(requeuer.run(self.config.requeuer_interval(), stop_rx.clone())));

        let reaper = Reaper::new(self.conn.clone(), self.keys.clone(), self.config.dead_threshold());
        self.handles
            .push(tokio::spawn(reaper.run(self.config.reaper_interval(), stop_rx.clone())));

        if !self.periodic_specs.is_empty() {
            let periodic = PeriodicEnqueuer::new(
                self.conn.clone(),
                self.keys.clone(),
                self.periodic_specs.clone(),
                self.config.periodic_horizon(),
            )?;
            self.handles
                .push(tokio::spawn(periodic.run(self.config.periodic_wake_interval(), stop_rx)));
        }

        info!("pool {} started with {} worker(s)", self.id, self.config.concurrency());
        self.stop_tx = Some(stop_tx);
        Ok(())
    }

    /// Signal every task to quit and wait up to [`Config::drain_deadline`]
    /// for in-flight jobs to reach a terminal state. Past the deadline,
    /// unfinished jobs remain in inprogress and will be reaped by another
    /// pool.
    pub async fn stop(&mut self) {
        let Some(tx) = self.stop_tx.take() else {
            return;
        };
        let _ = tx.send(true);

        let handles = std::mem::take(&mut self.handles);
        let drain = futures::future::join_all(handles);
        if tokio::time::timeout(self.config.drain_deadline(), drain).await.is_err() {
            warn!(
                "pool {} drain deadline elapsed; unfinished jobs remain in inprogress",
                self.id
            );
        } else {
            info!("pool {} stopped cleanly", self.id);
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn worker_loop(
    worker_id: String,
    claimer: Claimer,
    executor: Executor,
    registrations: Arc<HashMap<String, Registration>>,
    queues: Vec<WeightedQueue>,
    poll_interval: Duration,
    poll_jitter: Duration,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        if *stop.borrow() {
            break;
        }
        match claimer.claim(&worker_id, &queues).await {
            Ok(Some(job)) => {
                let registration = registrations.get(&job.name);
                executor.run(&worker_id, job, registration).await;
            }
            Ok(None) => {
                let jitter_ms = if poll_jitter.is_zero() {
                    0
                } else {
                    rand::thread_rng().gen_range(0..=poll_jitter.as_millis() as u64)
                };
                let sleep = poll_interval + Duration::from_millis(jitter_ms);
                tokio::select! {
                    _ = tokio::time::sleep(sleep) => {}
                    _ = stop.changed() => {
                        if *stop.borrow() {
                            break;
                        }
                    }
                }
            }
            Err(e) => {
                warn!("worker {worker_id} claim failed: {e}");
                tokio::select! {
                    _ = tokio::time::sleep(poll_interval) => {}
                    _ = stop.changed() => {
                        if *stop.borrow() {
                            break;
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn conn() -> Option<ConnectionManager> {
        let redis_url = std::env::var("REDIS_URL").ok()?;
        let client = redis::Client::open(redis_url).ok()?;
        client.get_connection_manager().await.ok()
    }

    #[tokio::test]
    async fn processes_an_enqueued_job_end_to_end() {
        let Some(conn) = conn().await else { return };
        let namespace = "wh_test_pool";
        let _: String = redis::cmd("FLUSHDB").query_async(&mut conn.clone()).await.unwrap();

        let enqueuer = crate::enqueue::Enqueuer::new(namespace, conn.clone());
        enqueuer.enqueue("ping", serde_json::json!({"n": 1})).await.unwrap();

        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = seen.clone();
        let mut pool = WorkerPool::new(1, namespace, conn.clone()).job("ping", move |ctx: crate::worker::JobContext| {
            let seen = seen_clone.clone();
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
                let _ = ctx.id();
                Ok::<(), String>(())
            }
        });
        pool.start().await.unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while seen.load(Ordering::SeqCst) == 0 && std::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        pool.stop().await;

        assert_eq!(seen.load(Ordering::SeqCst), 1);
        let _: String = redis::cmd("FLUSHDB").query_async(&mut conn.clone()).await.unwrap();
    }

    struct Noop;

    #[async_trait]
    impl Middleware for Noop {
        async fn call(&self, ctx: crate::worker::JobContext, next: crate::worker::Next<'_>) -> crate::worker::Outcome {
            next.run(ctx).await
        }
    }

    #[tokio::test]
    async fn stop_before_start_is_a_no_op() {
        let Some(conn) = conn().await else { return };
        let mut pool = WorkerPool::new(1, "wh_test_pool_noop", conn).middleware(Noop);
        pool.stop().await;
    }
}

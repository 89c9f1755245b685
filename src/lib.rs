#![warn(
    missing_debug_implementations,
    missing_docs,
    rust_2018_idioms,
    unreachable_pub
)]
//! # workhorse
//!
//! A durable, Redis-backed background job library. Producers enqueue named
//! jobs with JSON payloads; worker pools claim and execute them against
//! user-registered handlers, with retries, dead-lettering, delayed and
//! deduplicated jobs, cron-driven periodic scheduling, and fleet-wide
//! heartbeat/reaper coordination.
//!
//! ## Example
//!
//! ```rust,no_run
//! use workhorse::{Enqueuer, JobContext, WorkerPool};
//!
//! async fn send_email(ctx: JobContext) -> Result<(), String> {
//!     let to: String = ctx.unmarshal_payload::<serde_json::Value>()
//!         .map_err(|e| e.to_string())?
//!         .get("to")
//!         .and_then(|v| v.as_str())
//!         .map(str::to_string)
//!         .unwrap_or_default();
//!     println!("sending to {to}");
//!     Ok(())
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = redis::Client::open("redis://127.0.0.1/")?;
//!     let conn = client.get_connection_manager().await?;
//!
//!     let enqueuer = Enqueuer::new("myapp", conn.clone());
//!     enqueuer.enqueue("send_email", serde_json::json!({"to": "a@b.com"})).await?;
//!
//!     let mut pool = WorkerPool::new(4, "myapp", conn).job("send_email", send_email);
//!     pool.start().await?;
//!     tokio::signal::ctrl_c().await?;
//!     pool.stop().await;
//!     Ok(())
//! }
//! ```

mod claim;
mod config;
mod dead;
mod enqueue;
mod error;
mod heartbeat;
mod job;
mod keyspace;
mod periodic;
mod pool;
mod reaper;
mod requeue;
mod worker;

pub use config::{BackoffFn, Config, JobOptions};
pub use dead::DeadQueue;
pub use enqueue::Enqueuer;
pub use error::{Error, Result};
pub use job::Job;
pub use keyspace::KeySpace;
pub use pool::WorkerPool;
pub use worker::{Handler, JobContext, Middleware, Next, Outcome};

/// Re-exports for the common `use workhorse::prelude::*;` glob import.
pub mod prelude {
    pub use crate::{
        Config, DeadQueue, Enqueuer, Error, Handler, Job, JobContext, JobOptions, Middleware,
        Next, Outcome, Result, WorkerPool,
    };
}

//! Cron-driven horizon scheduling: every registered `(cron_expr, name)` spec
//! gets its upcoming instants within a rolling horizon pushed onto
//! `scheduled`, with a deterministic per-instant job id so independent pools
//! converge without coordination.
//!
//! Grounded on
//! `other_examples/...harborgrid-justin-caddy...scheduler.rs`'s
//! `cron::Schedule::from_str(expr)?.upcoming(Utc)` usage for the parser and
//! enumeration call shape.

use chrono::{DateTime, Utc};
use log::{debug, warn};
use redis::aio::ConnectionManager;
use redis::Script;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::job::Job;
use crate::keyspace::KeySpace;

/// A registered cron spec: "run `name` at every instant matching `expr`".
#[derive(Clone, Debug)]
pub(crate) struct PeriodicSpec {
    pub expr: String,
    pub name: String,
}

/// Schedules the upcoming instants of each registered spec onto `scheduled`.
#[derive(Clone)]
pub(crate) struct PeriodicEnqueuer {
    conn: ConnectionManager,
    keys: KeySpace,
    script: Script,
    specs: Vec<(PeriodicSpec, cron::Schedule)>,
    horizon: std::time::Duration,
}

impl PeriodicEnqueuer {
    /// Parse and validate every spec up front so a bad cron expression fails
    /// at registration time rather than deep inside the wake loop.
    pub(crate) fn new(
        conn: ConnectionManager,
        keys: KeySpace,
        specs: Vec<PeriodicSpec>,
        horizon: std::time::Duration,
    ) -> Result<Self> {
        let parsed = specs
            .into_iter()
            .map(|spec| {
                let schedule = parse_six_field(&spec.expr)?;
                Ok((spec, schedule))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            conn,
            keys,
            script: Script::new(include_str!("../lua/periodic_schedule.lua")),
            specs: parsed,
            horizon,
        })
    }

    /// Enumerate each spec's instants in `[now, now + horizon]` and ZADD
    /// them onto `scheduled`. Already-scheduled `(name, t)` pairs are a
    /// no-op via the script's `ZADD NX`.
    pub async fn wake_once(&self) -> Result<usize> {
        if self.specs.is_empty() {
            return Ok(0);
        }
        let now = Utc::now();
        let until = now + chrono::Duration::from_std(self.horizon).unwrap_or(chrono::Duration::seconds(300));

        let mut total = 0usize;
        for (spec, schedule) in &self.specs {
            for instant in schedule.after(&now).take_while(|t| *t <= until) {
                if self.schedule_instant(spec, instant).await? {
                    total += 1;
                }
            }
        }
        if total > 0 {
            debug!("periodic enqueuer scheduled {total} new instant(s)");
        }
        Ok(total)
    }

    async fn schedule_instant(&self, spec: &PeriodicSpec, instant: DateTime<Utc>) -> Result<bool> {
        let t = instant.timestamp();
        let job = Job::new(spec.name.clone(), serde_json::Value::Null, t);
        let job = deterministic(job, &spec.name, t);
        let bytes = job.to_bytes()?;

        let mut conn = self.conn.clone();
        let added: i64 = self
            .script
            .key(self.keys.known_jobs())
            .key(self.keys.scheduled())
            .arg(&spec.name)
            .arg(t)
            .arg(&bytes)
            .invoke_async(&mut conn)
            .await
            .map_err(Error::from)?;
        Ok(added == 1)
    }

    /// Run the wake loop until `stop` is signalled.
    pub(crate) async fn run(self, interval: std::time::Duration, mut stop: tokio::sync::watch::Receiver<bool>) {
        loop {
            if let Err(e) = self.wake_once().await {
                warn!("periodic enqueuer wake failed: {e}");
            }
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = stop.changed() => {
                    if *stop.borrow() {
                        break;
                    }
                }
            }
        }
    }
}

/// Stamp a deterministic id derived from `(name, instant)` so the same
/// instant produces byte-identical JSON no matter which pool computes it.
fn deterministic(mut job: Job, name: &str, instant: i64) -> Job {
    job.id = crate::job::fingerprint(name, &serde_json::json!({ "t": instant }));
    job
}

/// Parse a six-field cron expression (sec min hour dom month dow), UTC.
/// The `cron` crate accepts six- or seven-field expressions; a trailing
/// year field is rejected here to keep the contract to exactly six fields.
fn parse_six_field(expr: &str) -> Result<cron::Schedule> {
    if expr.split_whitespace().count() != 6 {
        return Err(Error::InvalidCron(
            expr.to_string(),
            "expected exactly six fields: sec min hour dom month dow".to_string(),
        ));
    }
    cron::Schedule::from_str(expr)
        .map_err(|e| Error::InvalidCron(expr.to_string(), e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup() -> ConnectionManager {
        let redis_url = std::env::var("REDIS_URL").expect("No REDIS_URL is specified");
        let client = redis::Client::open(redis_url).unwrap();
        client.get_connection_manager().await.unwrap()
    }

    async fn cleanup(mut conn: ConnectionManager) {
        let _: String = redis::cmd("FLUSHDB").query_async(&mut conn).await.unwrap();
    }

    #[test]
    fn rejects_expressions_with_the_wrong_field_count() {
        assert!(parse_six_field("* * * * *").is_err());
        assert!(parse_six_field("0 * * * * * *").is_err());
        assert!(parse_six_field("0 * * * * *").is_ok());
    }

    #[test]
    fn same_instant_yields_identical_job_bytes() {
        let now = Utc::now().timestamp();
        let a = deterministic(Job::new("tick", serde_json::Value::Null, now), "tick", now);
        let b = deterministic(Job::new("tick", serde_json::Value::Null, now), "tick", now);
        assert_eq!(a.to_bytes().unwrap(), b.to_bytes().unwrap());
    }

    #[test]
    fn different_instants_yield_different_ids() {
        let a = deterministic(Job::new("tick", serde_json::Value::Null, 0), "tick", 0);
        let b = deterministic(Job::new("tick", serde_json::Value::Null, 1), "tick", 1);
        assert_ne!(a.id, b.id);
    }

    #[tokio::test]
    async fn wake_is_idempotent_across_pools() {
        let conn = setup().await;
        let keys = KeySpace::new("wh_test_periodic");
        let specs = vec![PeriodicSpec {
            expr: "0 * * * * *".to_string(),
            name: "tick".to_string(),
        }];

        let a = PeriodicEnqueuer::new(conn.clone(), keys.clone(), specs.clone(), std::time::Duration::from_secs(120)).unwrap();
        let b = PeriodicEnqueuer::new(conn.clone(), keys.clone(), specs, std::time::Duration::from_secs(120)).unwrap();

        let first = a.wake_once().await.unwrap();
        let second = b.wake_once().await.unwrap();
        assert!(first > 0);
        assert_eq!(second, 0, "second pool's wake should find every instant already scheduled");

        cleanup(conn).await;
    }
}

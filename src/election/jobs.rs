//! Leader-only scheduled jobs
//!
//! Jobs start when this instance is elected and are aborted when it is
//! deposed. Every tick re-checks leadership. With job idempotency wired in,
//! a tick runs under a fingerprint bucketed by its scheduled time, so a
//! failover in the middle of a tick never runs the same tick twice.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use super::leader::{ElectionListener, LeaderInfo, LeadershipHandle};
use crate::idempotency::{JobHandler, JobIdempotencyService, JobRun, JobSpec};

#[derive(Clone)]
pub struct ScheduledJob {
    pub name: String,
    pub interval: Duration,
    pub handler: Arc<dyn JobHandler>,
    pub params: Value,
}

impl ScheduledJob {
    pub fn new(name: impl Into<String>, interval: Duration, handler: Arc<dyn JobHandler>) -> Self {
        Self {
            name: name.into(),
            interval,
            handler,
            params: Value::Null,
        }
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }
}

/// Start of the interval bucket containing `now`
fn tick_bucket(now: DateTime<Utc>, interval: Duration) -> DateTime<Utc> {
    let step = interval.as_millis().max(1) as i64;
    let ms = now.timestamp_millis();
    Utc.timestamp_millis_opt(ms - ms.rem_euclid(step))
        .single()
        .unwrap_or(now)
}

pub struct LeaderJobCoordinator {
    leadership: LeadershipHandle,
    jobs: DashMap<String, ScheduledJob>,
    running: DashMap<String, JoinHandle<()>>,
    job_idempotency: Option<Arc<JobIdempotencyService>>,
}

impl LeaderJobCoordinator {
    pub fn new(
        leadership: LeadershipHandle,
        job_idempotency: Option<Arc<JobIdempotencyService>>,
    ) -> Self {
        Self {
            leadership,
            jobs: DashMap::new(),
            running: DashMap::new(),
            job_idempotency,
        }
    }

    /// Register a job; starts right away if we already lead
    pub fn register(&self, job: ScheduledJob) {
        let name = job.name.clone();
        debug!(job = %name, interval_ms = job.interval.as_millis() as u64, "Scheduled job registered");
        self.jobs.insert(name.clone(), job);
        if self.leadership.is_leader() {
            self.spawn(&name);
        }
    }

    pub fn job_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.jobs.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn running_count(&self) -> usize {
        self.running.iter().filter(|h| !h.value().is_finished()).count()
    }

    fn spawn(&self, name: &str) {
        let Some(job) = self.jobs.get(name).map(|j| j.value().clone()) else {
            return;
        };
        if let Some(old) = self.running.remove(name) {
            old.1.abort();
        }
        let leadership = self.leadership.clone();
        let job_idempotency = self.job_idempotency.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(job.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if !leadership.is_leader() {
                    debug!(job = %job.name, "No longer leader, job loop exits");
                    break;
                }
                run_tick(&job, job_idempotency.as_deref()).await;
            }
        });
        self.running.insert(name.to_string(), handle);
    }

    pub fn start_all(&self) {
        let names = self.job_names();
        info!(jobs = names.len(), "Starting leader jobs");
        for name in names {
            self.spawn(&name);
        }
    }

    pub fn stop_all(&self) {
        let mut stopped = 0;
        for entry in self.running.iter() {
            entry.value().abort();
            stopped += 1;
        }
        self.running.clear();
        if stopped > 0 {
            info!(stopped, "Leader jobs stopped");
        }
    }
}

async fn run_tick(job: &ScheduledJob, job_idempotency: Option<&JobIdempotencyService>) {
    let Some(jobs) = job_idempotency else {
        if let Err(e) = job.handler.run(&job.params).await {
            error!(job = %job.name, error = %e, "Leader job failed");
        }
        return;
    };

    let bucket = tick_bucket(Utc::now(), job.interval);
    let spec = JobSpec::new("leader_job", &job.name, job.params.clone())
        .scheduled_at(bucket)
        .with_timeout(job.interval);
    match jobs.run_job(&spec, job.handler.as_ref()).await {
        Ok(JobRun::Executed { execution_id, .. }) => {
            debug!(job = %job.name, execution_id = %execution_id, tick = %bucket, "Leader job tick done");
        }
        Ok(JobRun::Cached(_)) => {
            debug!(job = %job.name, tick = %bucket, "Tick already ran");
        }
        Ok(JobRun::Skipped(reason)) => {
            debug!(job = %job.name, tick = %bucket, reason = %reason, "Tick skipped");
        }
        Err(e) => error!(job = %job.name, tick = %bucket, error = %e, "Leader job failed"),
    }
}

#[async_trait]
impl ElectionListener for LeaderJobCoordinator {
    async fn on_elected(&self, info: &LeaderInfo) {
        debug!(term = info.term, "Elected, starting jobs");
        self.start_all();
    }

    async fn on_deposed(&self, info: &LeaderInfo) {
        debug!(term = info.term, "Deposed, stopping jobs");
        self.stop_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ElectionConfig, IdempotencyConfig, JobConfig};
    use crate::coordination::{CoordinationStore, MemoryCoordinationStore};
    use crate::election::LeaderElection;
    use crate::error::Result;
    use crate::idempotency::{CoordinationIdempotencyStore, IdempotencyService};
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Default)]
    struct Ticks(AtomicU32);

    #[async_trait]
    impl JobHandler for Ticks {
        async fn run(&self, _params: &Value) -> Result<Value> {
            Ok(Value::from(self.0.fetch_add(1, Ordering::SeqCst) + 1))
        }
    }

    #[test]
    fn test_tick_bucket() {
        let t = Utc.timestamp_millis_opt(125_500).unwrap();
        let b = tick_bucket(t, Duration::from_secs(60));
        assert_eq!(b.timestamp_millis(), 120_000);
    }

    #[tokio::test]
    async fn test_jobs_follow_leadership() {
        let store = Arc::new(MemoryCoordinationStore::new());
        let election = Arc::new(LeaderElection::new(
            store.clone(),
            ElectionConfig {
                service_name: "svc".into(),
                heartbeat_interval_ms: 20,
                leader_ttl_ms: 1_000,
                election_timeout_ms: 60,
                election_window_ms: 5,
                check_interval_ms: 20,
            },
            "node-0",
        ));
        let jobs = Arc::new(LeaderJobCoordinator::new(election.leadership(), None));
        let ticks = Arc::new(Ticks::default());
        jobs.register(ScheduledJob::new("gc", Duration::from_millis(10), ticks.clone()));
        election.add_listener(jobs.clone()).await;

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(ticks.0.load(Ordering::SeqCst), 0);

        election.check_leadership().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(ticks.0.load(Ordering::SeqCst) >= 2);
        assert_eq!(jobs.running_count(), 1);

        election.resign().await;
        let after = ticks.0.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(ticks.0.load(Ordering::SeqCst), after);
        assert_eq!(jobs.running_count(), 0);
    }

    #[tokio::test]
    async fn test_bucketed_tick_runs_once() {
        let store = Arc::new(MemoryCoordinationStore::new());
        let idem = Arc::new(IdempotencyService::new(
            Arc::new(CoordinationIdempotencyStore::new(store.clone())),
            None,
            IdempotencyConfig::default(),
            "node-0",
        ));
        let store_dyn: Arc<dyn CoordinationStore> = store.clone();
        let jobs = JobIdempotencyService::new(idem, store_dyn, JobConfig::default());
        let ticks = Arc::new(Ticks::default());
        let job = ScheduledJob::new("sweep", Duration::from_secs(3600), ticks.clone());

        // Old and new leader both firing the same hourly tick
        run_tick(&job, Some(&jobs)).await;
        run_tick(&job, Some(&jobs)).await;

        let spec = JobSpec::new("leader_job", "sweep", Value::Null)
            .scheduled_at(tick_bucket(Utc::now(), job.interval));
        let result = jobs.get_job_result(&spec.fingerprint()).await.unwrap().unwrap();
        assert_eq!(result.result, Some(Value::from(1)));
        assert_eq!(ticks.0.load(Ordering::SeqCst), 1);
    }
}

//! Job idempotency
//!
//! A job run is identified by its fingerprint
//! `sha256(job_type | job_key | parameter_hash | scheduled_time)`. The claim
//! goes through the idempotency service under `job_claim:<fingerprint>`, so at
//! most one execution per fingerprint is ever non-terminal.
//!
//! ```text
//! idempotency:job_claim:<fp>   claim record (processing/completed/failed)
//! job_claim:<fp>               execution id of the current holder
//! job_execution:<exec_id>      JobExecutionContext
//! job_result:<fp>              JobResult of the last terminal execution
//! ```
//!
//! Execution status flow:
//!
//! ```text
//! pending -> claimed -> running -> completed
//!                  \          \-> failed | timeout | cancelled
//!                   \-> failed | timeout | cancelled
//! ```

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::key::request_hash;
use super::service::IdempotencyService;
use super::types::{ClaimOutcome, ClaimRequest, to_chrono};
use crate::config::JobConfig;
use crate::coordination::CoordinationStore;
use crate::error::{CoreError, Result};

const CAS_ATTEMPTS: usize = 3;
const SWEEP_SCAN_LIMIT: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Claimed,
    Running,
    Completed,
    Failed,
    Timeout,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Claimed => "claimed",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Timeout => "timeout",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Timeout | JobStatus::Cancelled
        )
    }

    /// Valid successor states
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        match self {
            Pending => matches!(next, Claimed | Cancelled),
            Claimed => matches!(next, Running | Failed | Timeout | Cancelled),
            Running => matches!(next, Completed | Failed | Timeout | Cancelled),
            _ => false,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What to run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    pub job_type: String,
    pub job_key: String,
    #[serde(default)]
    pub params: Value,
    pub scheduled_time: Option<DateTime<Utc>>,
    /// Defaults to `jobs.default_timeout_secs`
    pub timeout: Option<Duration>,
}

impl JobSpec {
    pub fn new(job_type: impl Into<String>, job_key: impl Into<String>, params: Value) -> Self {
        Self {
            job_type: job_type.into(),
            job_key: job_key.into(),
            params,
            scheduled_time: None,
            timeout: None,
        }
    }

    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_time = Some(at);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn parameter_hash(&self) -> String {
        request_hash(&self.params)
    }

    pub fn fingerprint(&self) -> String {
        let scheduled = self
            .scheduled_time
            .map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true))
            .unwrap_or_default();
        let material = format!(
            "{}|{}|{}|{}",
            self.job_type,
            self.job_key,
            self.parameter_hash(),
            scheduled
        );
        hex::encode(Sha256::digest(material.as_bytes()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobExecutionContext {
    pub execution_id: String,
    pub fingerprint: String,
    pub job_type: String,
    pub job_key: String,
    pub parameter_hash: String,
    pub scheduled_time: Option<DateTime<Utc>>,
    pub instance_id: String,
    pub status: JobStatus,
    pub claimed_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub timeout_at: DateTime<Utc>,
    pub result: Option<Value>,
    pub error: Option<String>,
}

/// Terminal summary kept under `job_result:<fp>`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub execution_id: String,
    pub fingerprint: String,
    pub job_type: String,
    pub job_key: String,
    pub status: JobStatus,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobClaim {
    Claimed(JobExecutionContext),
    AlreadyRunning { execution_id: Option<String> },
    AlreadyCompleted { result: Option<Value> },
    /// Retries for this fingerprint are used up
    Exhausted { error: Option<String> },
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobRun {
    Executed {
        execution_id: String,
        result: Value,
    },
    Cached(Option<Value>),
    Skipped(String),
}

#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Must be safe to invoke again for the same fingerprint
    async fn run(&self, params: &Value) -> Result<Value>;
}

pub struct JobIdempotencyService {
    idempotency: Arc<IdempotencyService>,
    store: Arc<dyn CoordinationStore>,
    config: JobConfig,
}

fn claim_key(fingerprint: &str) -> String {
    format!("job_claim:{}", fingerprint)
}

fn execution_key(execution_id: &str) -> String {
    format!("job_execution:{}", execution_id)
}

fn result_key(fingerprint: &str) -> String {
    format!("job_result:{}", fingerprint)
}

impl JobIdempotencyService {
    pub fn new(
        idempotency: Arc<IdempotencyService>,
        store: Arc<dyn CoordinationStore>,
        config: JobConfig,
    ) -> Self {
        Self {
            idempotency,
            store,
            config,
        }
    }

    fn execution_ttl(&self) -> Duration {
        Duration::from_secs(self.config.execution_ttl_secs)
    }

    fn result_ttl(&self) -> Duration {
        Duration::from_secs(self.config.result_ttl_secs)
    }

    /// Claim the fingerprint and create a `claimed` execution context
    pub async fn claim_job(&self, spec: &JobSpec) -> Result<JobClaim> {
        let fingerprint = spec.fingerprint();
        let timeout = spec
            .timeout
            .unwrap_or(Duration::from_secs(self.config.default_timeout_secs));
        let ikey = claim_key(&fingerprint);

        let request = ClaimRequest::new(
            &ikey,
            format!("job:{}", spec.job_type),
            spec.parameter_hash(),
        )
        .with_ttl(self.execution_ttl())
        .with_processing_timeout(timeout);

        match self.idempotency.claim(request).await? {
            ClaimOutcome::Claimed { reclaimed, .. } => {
                if reclaimed {
                    self.retire_previous_holder(&ikey).await?;
                }
            }
            ClaimOutcome::Completed { result } => {
                return Ok(JobClaim::AlreadyCompleted { result });
            }
            ClaimOutcome::AlreadyProcessing { .. } => {
                let execution_id = self.store.get(&ikey).await?;
                return Ok(JobClaim::AlreadyRunning { execution_id });
            }
            ClaimOutcome::HashMismatch { .. } => {
                return Err(CoreError::IdempotencyHashMismatch { key: ikey });
            }
            ClaimOutcome::Failed { error, .. } => return Ok(JobClaim::Exhausted { error }),
        }

        let now = Utc::now();
        let ctx = JobExecutionContext {
            execution_id: ulid::Ulid::new().to_string(),
            fingerprint: fingerprint.clone(),
            job_type: spec.job_type.clone(),
            job_key: spec.job_key.clone(),
            parameter_hash: spec.parameter_hash(),
            scheduled_time: spec.scheduled_time,
            instance_id: self.idempotency.instance_id().to_string(),
            status: JobStatus::Claimed,
            claimed_at: Some(now),
            started_at: None,
            completed_at: None,
            timeout_at: now + to_chrono(timeout),
            result: None,
            error: None,
        };

        self.store
            .set(
                &execution_key(&ctx.execution_id),
                &serde_json::to_string(&ctx)?,
                Some(self.execution_ttl()),
            )
            .await?;
        // Holder pointer; we own the claim so a stale pointer may be overwritten
        self.store
            .set(&ikey, &ctx.execution_id, Some(self.execution_ttl()))
            .await?;

        tracing::info!(
            job_type = %ctx.job_type,
            job_key = %ctx.job_key,
            execution_id = %ctx.execution_id,
            fingerprint = %fingerprint,
            "Job claimed"
        );
        Ok(JobClaim::Claimed(ctx))
    }

    /// Time out the execution a reclaimed fingerprint last pointed at
    async fn retire_previous_holder(&self, ikey: &str) -> Result<()> {
        let Some(previous) = self.store.get(ikey).await? else {
            return Ok(());
        };
        let now = Utc::now();
        match self
            .transition(&previous, JobStatus::Timeout, |c| {
                c.completed_at = Some(now);
                c.error = Some("claim expired and was taken over".to_string());
            })
            .await
        {
            Ok(_) => {
                tracing::warn!(
                    execution_id = %previous,
                    claim = %ikey,
                    "Stuck job execution superseded"
                );
                Ok(())
            }
            // Already terminal or gone
            Err(CoreError::NotProcessing { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// False once a newer execution has taken over the fingerprint
    async fn holds_claim(&self, ctx: &JobExecutionContext) -> Result<bool> {
        Ok(self
            .store
            .get(&claim_key(&ctx.fingerprint))
            .await?
            .is_none_or(|holder| holder == ctx.execution_id))
    }

    pub async fn get_execution(&self, execution_id: &str) -> Result<Option<JobExecutionContext>> {
        self.store
            .get(&execution_key(execution_id))
            .await?
            .map(|raw| serde_json::from_str(&raw).map_err(CoreError::from))
            .transpose()
    }

    /// CAS a context to `next`, applying `mutate` on top
    async fn transition(
        &self,
        execution_id: &str,
        next: JobStatus,
        mutate: impl Fn(&mut JobExecutionContext),
    ) -> Result<JobExecutionContext> {
        let key = execution_key(execution_id);
        for _ in 0..CAS_ATTEMPTS {
            let raw = self.store.get(&key).await?.ok_or_else(|| CoreError::NotProcessing {
                key: key.clone(),
                status: "missing".to_string(),
            })?;
            let current: JobExecutionContext = serde_json::from_str(&raw)?;
            if !current.status.can_transition_to(next) {
                return Err(CoreError::NotProcessing {
                    key: key.clone(),
                    status: current.status.to_string(),
                });
            }
            let mut updated = current.clone();
            updated.status = next;
            mutate(&mut updated);
            let encoded = serde_json::to_string(&updated)?;
            if self
                .store
                .compare_and_set(&key, &raw, &encoded, Some(self.execution_ttl()))
                .await?
            {
                return Ok(updated);
            }
        }
        Err(CoreError::StoreUnavailable(format!(
            "job execution {} is contended",
            execution_id
        )))
    }

    pub async fn start_job(&self, execution_id: &str) -> Result<JobExecutionContext> {
        let now = Utc::now();
        self.transition(execution_id, JobStatus::Running, |c| c.started_at = Some(now))
            .await
    }

    pub async fn complete_job(
        &self,
        execution_id: &str,
        result: Value,
    ) -> Result<JobExecutionContext> {
        let now = Utc::now();
        let ctx = self
            .transition(execution_id, JobStatus::Completed, |c| {
                c.completed_at = Some(now);
                c.result = Some(result.clone());
            })
            .await?;
        self.idempotency
            .complete(&claim_key(&ctx.fingerprint), Some(result))
            .await?;
        self.finalize(&ctx).await?;
        tracing::info!(execution_id = %execution_id, job_type = %ctx.job_type, "Job completed");
        Ok(ctx)
    }

    pub async fn fail_job(&self, execution_id: &str, error: &str) -> Result<JobExecutionContext> {
        self.end_unsuccessfully(execution_id, JobStatus::Failed, error)
            .await
    }

    pub async fn cancel_job(&self, execution_id: &str) -> Result<JobExecutionContext> {
        self.end_unsuccessfully(execution_id, JobStatus::Cancelled, "cancelled")
            .await
    }

    async fn end_unsuccessfully(
        &self,
        execution_id: &str,
        status: JobStatus,
        error: &str,
    ) -> Result<JobExecutionContext> {
        let now = Utc::now();
        let ctx = self
            .transition(execution_id, status, |c| {
                c.completed_at = Some(now);
                c.error = Some(error.to_string());
            })
            .await?;
        if !self.holds_claim(&ctx).await? {
            tracing::warn!(
                execution_id = %execution_id,
                job_type = %ctx.job_type,
                status = %status,
                "Superseded job execution ended; claim left to its successor"
            );
            return Ok(ctx);
        }
        match self
            .idempotency
            .fail(&claim_key(&ctx.fingerprint), error)
            .await
        {
            Ok(_) | Err(CoreError::NotProcessing { .. }) => {}
            Err(e) => return Err(e),
        }
        self.finalize(&ctx).await?;
        tracing::warn!(
            execution_id = %execution_id,
            job_type = %ctx.job_type,
            status = %status,
            error = %error,
            "Job ended without success"
        );
        Ok(ctx)
    }

    /// Store the terminal summary and release the holder pointer
    async fn finalize(&self, ctx: &JobExecutionContext) -> Result<()> {
        let summary = JobResult {
            execution_id: ctx.execution_id.clone(),
            fingerprint: ctx.fingerprint.clone(),
            job_type: ctx.job_type.clone(),
            job_key: ctx.job_key.clone(),
            status: ctx.status,
            result: ctx.result.clone(),
            error: ctx.error.clone(),
            completed_at: ctx.completed_at.unwrap_or_else(Utc::now),
        };
        self.store
            .set(
                &result_key(&ctx.fingerprint),
                &serde_json::to_string(&summary)?,
                Some(self.result_ttl()),
            )
            .await?;
        self.store
            .compare_and_delete(&claim_key(&ctx.fingerprint), &ctx.execution_id)
            .await?;
        Ok(())
    }

    /// Result lookup by execution id or fingerprint
    pub async fn get_job_result(&self, id: &str) -> Result<Option<JobResult>> {
        if let Some(raw) = self.store.get(&result_key(id)).await? {
            return Ok(Some(serde_json::from_str(&raw)?));
        }
        let Some(ctx) = self.get_execution(id).await? else {
            return Ok(None);
        };
        match self.store.get(&result_key(&ctx.fingerprint)).await? {
            Some(raw) => {
                let result: JobResult = serde_json::from_str(&raw)?;
                // A later execution of the same fingerprint may own the slot
                Ok((result.execution_id == ctx.execution_id).then_some(result))
            }
            None => Ok(None),
        }
    }

    /// Claim, run under the job timeout, and record the outcome
    pub async fn run_job(&self, spec: &JobSpec, handler: &dyn JobHandler) -> Result<JobRun> {
        let ctx = match self.claim_job(spec).await? {
            JobClaim::Claimed(ctx) => ctx,
            JobClaim::AlreadyCompleted { result } => return Ok(JobRun::Cached(result)),
            JobClaim::AlreadyRunning { execution_id } => {
                return Ok(JobRun::Skipped(format!(
                    "already running as {}",
                    execution_id.unwrap_or_else(|| "unknown".to_string())
                )));
            }
            JobClaim::Exhausted { error } => {
                return Ok(JobRun::Skipped(format!(
                    "retries exhausted: {}",
                    error.unwrap_or_default()
                )));
            }
        };

        let ctx = self.start_job(&ctx.execution_id).await?;
        let remaining = (ctx.timeout_at - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO);

        match tokio::time::timeout(remaining, handler.run(&spec.params)).await {
            Ok(Ok(result)) => {
                self.complete_job(&ctx.execution_id, result.clone()).await?;
                Ok(JobRun::Executed {
                    execution_id: ctx.execution_id,
                    result,
                })
            }
            Ok(Err(e)) => {
                self.fail_job(&ctx.execution_id, &e.to_string()).await?;
                Err(e)
            }
            Err(_) => {
                self.end_unsuccessfully(&ctx.execution_id, JobStatus::Timeout, "timed out")
                    .await?;
                Err(CoreError::StepTimeout {
                    step_id: format!("job:{}:{}", spec.job_type, spec.job_key),
                    timeout_ms: remaining.as_millis() as u64,
                })
            }
        }
    }

    /// Mark non-terminal executions past their deadline as `timeout`
    pub async fn sweep_timeouts(&self) -> Result<usize> {
        let now = Utc::now();
        let keys = self.store.scan("job_execution:*", SWEEP_SCAN_LIMIT).await?;
        let mut swept = 0;
        for key in keys {
            let Some(raw) = self.store.get(&key).await? else {
                continue;
            };
            let ctx: JobExecutionContext = match serde_json::from_str(&raw) {
                Ok(ctx) => ctx,
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "Skipping unreadable job execution");
                    continue;
                }
            };
            if ctx.status.is_terminal() || ctx.timeout_at > now {
                continue;
            }
            match self
                .end_unsuccessfully(&ctx.execution_id, JobStatus::Timeout, "timed out")
                .await
            {
                Ok(_) => swept += 1,
                // Finished concurrently
                Err(CoreError::NotProcessing { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        if swept > 0 {
            tracing::info!(swept, "Timed-out job executions swept");
        }
        Ok(swept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IdempotencyConfig;
    use crate::coordination::MemoryCoordinationStore;
    use crate::idempotency::store::CoordinationIdempotencyStore;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn service() -> (Arc<MemoryCoordinationStore>, JobIdempotencyService) {
        let mem = Arc::new(MemoryCoordinationStore::new());
        let idem = Arc::new(IdempotencyService::new(
            Arc::new(CoordinationIdempotencyStore::new(mem.clone())),
            None,
            IdempotencyConfig::default(),
            "node-a",
        ));
        let jobs = JobIdempotencyService::new(idem, mem.clone(), JobConfig::default());
        (mem, jobs)
    }

    struct CountingHandler {
        calls: AtomicU32,
    }

    #[async_trait]
    impl JobHandler for CountingHandler {
        async fn run(&self, params: &Value) -> Result<Value> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(json!({"echo": params}))
        }
    }

    struct SlowHandler;

    #[async_trait]
    impl JobHandler for SlowHandler {
        async fn run(&self, _params: &Value) -> Result<Value> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(Value::Null)
        }
    }

    #[test]
    fn test_fingerprint_inputs() {
        let at = DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let base = JobSpec::new("settle", "daily", json!({"b": 1, "a": 2})).scheduled_at(at);
        let reordered = JobSpec::new("settle", "daily", json!({"a": 2, "b": 1})).scheduled_at(at);
        assert_eq!(base.fingerprint(), reordered.fingerprint());

        let later = base.clone().scheduled_at(at + chrono::Duration::hours(1));
        assert_ne!(base.fingerprint(), later.fingerprint());
        let other_key = JobSpec::new("settle", "weekly", json!({"b": 1, "a": 2})).scheduled_at(at);
        assert_ne!(base.fingerprint(), other_key.fingerprint());
    }

    #[test]
    fn test_status_flow() {
        assert!(JobStatus::Pending.can_transition_to(JobStatus::Claimed));
        assert!(JobStatus::Claimed.can_transition_to(JobStatus::Running));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Timeout));
        assert!(!JobStatus::Completed.can_transition_to(JobStatus::Running));
        assert!(!JobStatus::Pending.can_transition_to(JobStatus::Completed));
    }

    #[tokio::test]
    async fn test_run_job_executes_once_and_caches() {
        let (_mem, jobs) = service();
        let handler = CountingHandler {
            calls: AtomicU32::new(0),
        };
        let spec = JobSpec::new("report", "r1", json!({"day": 3}));

        let first = jobs.run_job(&spec, &handler).await.unwrap();
        let JobRun::Executed { execution_id, result } = first else {
            panic!("expected execution");
        };
        assert_eq!(result, json!({"echo": {"day": 3}}));

        let second = jobs.run_job(&spec, &handler).await.unwrap();
        assert_eq!(second, JobRun::Cached(Some(json!({"echo": {"day": 3}}))));
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);

        let by_exec = jobs.get_job_result(&execution_id).await.unwrap().unwrap();
        let by_fp = jobs
            .get_job_result(&spec.fingerprint())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(by_exec, by_fp);
        assert_eq!(by_exec.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_second_claim_sees_running_execution() {
        let (_mem, jobs) = service();
        let spec = JobSpec::new("report", "r2", json!({}));
        let JobClaim::Claimed(ctx) = jobs.claim_job(&spec).await.unwrap() else {
            panic!("expected claim");
        };
        let again = jobs.claim_job(&spec).await.unwrap();
        assert_eq!(
            again,
            JobClaim::AlreadyRunning {
                execution_id: Some(ctx.execution_id.clone())
            }
        );
    }

    #[tokio::test]
    async fn test_run_job_timeout() {
        let (_mem, jobs) = service();
        let spec = JobSpec::new("slow", "s1", json!({})).with_timeout(Duration::from_millis(30));
        let err = jobs.run_job(&spec, &SlowHandler).await.unwrap_err();
        assert_eq!(err.code(), "STEP_TIMEOUT");

        let result = jobs
            .get_job_result(&spec.fingerprint())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.status, JobStatus::Timeout);
    }

    #[tokio::test]
    async fn test_sweep_marks_overdue_running_jobs() {
        let (_mem, jobs) = service();
        let spec = JobSpec::new("stuck", "x", json!({})).with_timeout(Duration::from_millis(10));
        let JobClaim::Claimed(ctx) = jobs.claim_job(&spec).await.unwrap() else {
            panic!("expected claim");
        };
        jobs.start_job(&ctx.execution_id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(jobs.sweep_timeouts().await.unwrap(), 1);
        let ctx = jobs.get_execution(&ctx.execution_id).await.unwrap().unwrap();
        assert_eq!(ctx.status, JobStatus::Timeout);
        assert_eq!(jobs.sweep_timeouts().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_reclaimed_job_supersedes_stuck_execution() {
        let (_mem, jobs) = service();
        let spec =
            JobSpec::new("settle", "s1", json!({})).with_timeout(Duration::from_millis(150));
        let JobClaim::Claimed(stuck) = jobs.claim_job(&spec).await.unwrap() else {
            panic!("expected claim");
        };
        jobs.start_job(&stuck.execution_id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let JobClaim::Claimed(next) = jobs.claim_job(&spec).await.unwrap() else {
            panic!("expected reclaim");
        };
        assert_ne!(next.execution_id, stuck.execution_id);
        let stuck = jobs.get_execution(&stuck.execution_id).await.unwrap().unwrap();
        assert_eq!(stuck.status, JobStatus::Timeout);

        jobs.start_job(&next.execution_id).await.unwrap();
        assert_eq!(jobs.sweep_timeouts().await.unwrap(), 0);
        jobs.complete_job(&next.execution_id, json!({"rows": 4}))
            .await
            .unwrap();

        let result = jobs
            .get_job_result(&spec.fingerprint())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.execution_id, next.execution_id);
        assert_eq!(result.status, JobStatus::Completed);
        assert_eq!(
            jobs.claim_job(&spec).await.unwrap(),
            JobClaim::AlreadyCompleted {
                result: Some(json!({"rows": 4}))
            }
        );
    }

    #[tokio::test]
    async fn test_superseded_execution_leaves_claim_alone() {
        let (mem, jobs) = service();
        let spec = JobSpec::new("settle", "s2", json!({}));
        let JobClaim::Claimed(old) = jobs.claim_job(&spec).await.unwrap() else {
            panic!("expected claim");
        };
        // Another execution has taken over the holder pointer
        mem.set(&claim_key(&spec.fingerprint()), "01NEWHOLDER", None)
            .await
            .unwrap();

        let ended = jobs.fail_job(&old.execution_id, "late failure").await.unwrap();
        assert_eq!(ended.status, JobStatus::Failed);
        let record = jobs
            .idempotency
            .get(&claim_key(&spec.fingerprint()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.status, crate::idempotency::IdempotencyStatus::Processing);
        assert!(jobs.get_job_result(&spec.fingerprint()).await.unwrap().is_none());
    }
}

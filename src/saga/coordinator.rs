//! Saga Coordinator
//!
//! Runs multi-step operations in declaration order. Each step executes under
//! its own idempotency key, so a resumed saga reuses completed steps instead
//! of running them again. When a step fails for good, or the deadline passes,
//! the completed steps are compensated in reverse order.
//!
//! ```text
//! start_saga ──► spawn ──► step 1 ──► step 2 ──► ... ──► completed
//!                             │          │
//!                             └── fail ──┴──► compensating ──► compensated
//! ```

use chrono::Utc;
use dashmap::DashMap;
use rand::Rng;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::handler::{HandlerRegistry, StepHandler};
use super::types::{
    CompensationFailure, SagaContext, SagaStatus, SagaStep, SagaStepState, SagaSummary,
    SagaTransaction, StepStatus,
};
use crate::config::SagaConfig;
use crate::coordination::{CoordinationStore, DistributedMutex};
use crate::error::{CoreError, Result};
use crate::idempotency::types::to_chrono;
use crate::idempotency::{ClaimOutcome, ClaimRequest, IdempotencyService, request_hash};

const SCAN_LIMIT: usize = 10_000;
const WAIT_POLL: Duration = Duration::from_millis(20);
const RECOVERY_LOCK: &str = "saga_recovery";

fn saga_key(saga_id: &str) -> String {
    format!("saga:{}", saga_id)
}

fn result_key(saga_id: &str) -> String {
    format!("saga_result:{}", saga_id)
}

fn step_key(saga_id: &str, step_id: &str) -> String {
    format!("saga:{}:{}", saga_id, step_id)
}

fn compensation_key(saga_id: &str, step_id: &str) -> String {
    format!("saga_compensation:{}:{}", saga_id, step_id)
}

/// Capped exponential backoff with up to 25% jitter subtracted
fn backoff(config: &SagaConfig, attempt: u32) -> Duration {
    let exp = config
        .backoff_base_ms
        .saturating_mul(1u64 << attempt.min(16));
    let capped = exp.min(config.backoff_max_ms);
    let jitter = if capped >= 4 {
        rand::thread_rng().gen_range(0..=capped / 4)
    } else {
        0
    };
    Duration::from_millis(capped - jitter)
}

pub struct SagaCoordinator {
    store: Arc<dyn CoordinationStore>,
    idempotency: Arc<IdempotencyService>,
    handlers: Arc<HandlerRegistry>,
    config: SagaConfig,
    instance_id: String,
    running: DashMap<String, JoinHandle<()>>,
}

impl SagaCoordinator {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        idempotency: Arc<IdempotencyService>,
        handlers: Arc<HandlerRegistry>,
        config: SagaConfig,
    ) -> Self {
        let instance_id = idempotency.instance_id().to_string();
        Self {
            store,
            idempotency,
            handlers,
            config,
            instance_id,
            running: DashMap::new(),
        }
    }

    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    pub fn register_handler(&self, name: impl Into<String>, handler: Arc<dyn StepHandler>) {
        self.handlers.register(name, handler);
    }

    /// Validate, persist and launch a saga. Returns its id immediately.
    pub async fn start_saga(
        self: &Arc<Self>,
        name: &str,
        steps: Vec<SagaStep>,
        context: SagaContext,
        timeout: Option<Duration>,
    ) -> Result<String> {
        let mut saga = self.prepare(name, steps, context, timeout)?;
        if !self.idempotency.coordination_is_safe().await {
            error!(saga = %name, "Refusing to start saga: coordination unavailable");
            return Err(CoreError::CoordinationUnsafe(format!(
                "cannot start saga {}: no idempotency backend",
                name
            )));
        }
        self.persist(&mut saga).await?;
        info!(
            saga_id = %saga.saga_id,
            saga = %name,
            steps = saga.steps.len(),
            deadline = %saga.deadline,
            "Saga created"
        );
        self.spawn_execution(saga.saga_id.clone());
        Ok(saga.saga_id)
    }

    fn prepare(
        &self,
        name: &str,
        steps: Vec<SagaStep>,
        context: SagaContext,
        timeout: Option<Duration>,
    ) -> Result<SagaTransaction> {
        if steps.is_empty() {
            return Err(CoreError::Config(format!("saga {} has no steps", name)));
        }
        {
            let mut seen = HashSet::new();
            for step in &steps {
                if !seen.insert(step.step_id.as_str()) {
                    return Err(CoreError::Config(format!(
                        "saga {} declares step {} twice",
                        name, step.step_id
                    )));
                }
                self.handlers.get(&step.handler)?;
                if let Some(comp) = &step.compensation {
                    self.handlers.get(comp)?;
                }
            }
        }

        let saga_id = ulid::Ulid::new().to_string();
        let now = Utc::now();
        let timeout = timeout.unwrap_or(Duration::from_secs(self.config.default_timeout_secs));
        let step_timeout = Duration::from_secs(self.config.step_timeout_secs);

        let steps = steps
            .into_iter()
            .map(|s| SagaStepState {
                idempotency_key: step_key(&saga_id, &s.step_id),
                step_id: s.step_id,
                handler: s.handler,
                compensation: s.compensation,
                params: s.params,
                max_retries: s.max_retries.unwrap_or(self.config.default_max_retries),
                timeout_ms: s.timeout.unwrap_or(step_timeout).as_millis() as u64,
                status: StepStatus::Pending,
                attempts: 0,
                result: None,
                error: None,
                started_at: None,
                completed_at: None,
            })
            .collect();

        Ok(SagaTransaction {
            saga_id,
            name: name.to_string(),
            status: SagaStatus::Pending,
            steps,
            context,
            created_at: now,
            updated_at: now,
            deadline: now + to_chrono(timeout),
            failure_reason: None,
            compensation_failures: Vec::new(),
            requires_reconciliation: false,
            instance_id: self.instance_id.clone(),
            finished_at: None,
        })
    }

    fn spawn_execution(self: &Arc<Self>, saga_id: String) {
        let coordinator = Arc::clone(self);
        let id = saga_id.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = coordinator.execute(&id).await {
                error!(saga_id = %id, error = %e, "Saga execution interrupted");
            }
            coordinator.running.remove(&id);
        });
        self.running.insert(saga_id, handle);
    }

    fn is_running_locally(&self, saga_id: &str) -> bool {
        self.running
            .get(saga_id)
            .is_some_and(|h| !h.value().is_finished())
    }

    /// Drive a saga from wherever its record says it is
    async fn execute(&self, saga_id: &str) -> Result<()> {
        let mut saga = self.load(saga_id).await?;
        if saga.is_finished() {
            return Ok(());
        }
        saga.instance_id = self.instance_id.clone();

        if saga.status == SagaStatus::Pending {
            saga.status = SagaStatus::Running;
            self.persist(&mut saga).await?;
        }
        if saga.status == SagaStatus::Running {
            self.run_forward(&mut saga).await?;
        }

        match saga.status {
            SagaStatus::Completed => {
                info!(saga_id = %saga_id, saga = %saga.name, "Saga completed");
                return self.finish(&mut saga).await;
            }
            SagaStatus::Failed | SagaStatus::Timeout if saga.completed_steps() == 0 => {
                warn!(
                    saga_id = %saga_id,
                    status = %saga.status,
                    reason = saga.failure_reason.as_deref().unwrap_or(""),
                    "Saga failed with nothing to compensate"
                );
                return self.finish(&mut saga).await;
            }
            SagaStatus::Failed | SagaStatus::Timeout => {
                warn!(
                    saga_id = %saga_id,
                    status = %saga.status,
                    completed_steps = saga.completed_steps(),
                    reason = saga.failure_reason.as_deref().unwrap_or(""),
                    "Saga failed, compensating"
                );
                saga.status = SagaStatus::Compensating;
                self.persist(&mut saga).await?;
            }
            _ => {}
        }

        if saga.status == SagaStatus::Compensating {
            self.run_compensation(&mut saga).await?;
            saga.status = SagaStatus::Compensated;
            info!(
                saga_id = %saga_id,
                requires_reconciliation = saga.requires_reconciliation,
                "Saga compensated"
            );
            self.finish(&mut saga).await?;
        }
        Ok(())
    }

    /// Leaves the saga `completed`, `failed` or `timeout`
    async fn run_forward(&self, saga: &mut SagaTransaction) -> Result<()> {
        for idx in 0..saga.steps.len() {
            if saga.steps[idx].status == StepStatus::Completed {
                continue;
            }
            let step_id = saga.steps[idx].step_id.clone();

            if Utc::now() >= saga.deadline {
                saga.status = SagaStatus::Timeout;
                saga.failure_reason = Some(format!("deadline passed before step {}", step_id));
                self.persist(saga).await?;
                return Ok(());
            }

            saga.steps[idx].status = StepStatus::Running;
            saga.steps[idx].started_at = Some(Utc::now());
            self.persist(saga).await?;

            match self.run_step(saga, idx).await {
                Ok(result) => {
                    let step = &mut saga.steps[idx];
                    step.status = StepStatus::Completed;
                    step.result = Some(result.clone());
                    step.completed_at = Some(Utc::now());
                    saga.context.insert(step_id.clone(), result);
                    debug!(saga_id = %saga.saga_id, step_id = %step_id, "Saga step completed");
                    self.persist(saga).await?;
                }
                // Coordination loss: leave the saga for recovery
                Err(e @ CoreError::CoordinationUnsafe(_)) => return Err(e),
                Err(e) => {
                    let step = &mut saga.steps[idx];
                    step.status = StepStatus::Failed;
                    step.error = Some(e.to_string());
                    saga.status = if Utc::now() >= saga.deadline {
                        SagaStatus::Timeout
                    } else {
                        SagaStatus::Failed
                    };
                    saga.failure_reason = Some(format!("step {} failed: {}", step_id, e));
                    self.persist(saga).await?;
                    return Ok(());
                }
            }
        }
        saga.status = SagaStatus::Completed;
        Ok(())
    }

    async fn run_step(&self, saga: &mut SagaTransaction, idx: usize) -> Result<Value> {
        let step = saga.steps[idx].clone();
        let key = step.idempotency_key.clone();
        let handler = self.handlers.get(&step.handler)?;

        let retry_budget = step.timeout() * (step.max_retries + 1)
            + Duration::from_millis(self.config.backoff_max_ms) * step.max_retries;
        let request = ClaimRequest::new(
            &key,
            format!("saga_step:{}", step.handler),
            request_hash(&step.params),
        )
        .with_ttl(Duration::from_secs(self.config.record_ttl_secs))
        .with_processing_timeout(retry_budget)
        .with_max_retries(0);

        loop {
            match self.idempotency.claim(request.clone()).await? {
                ClaimOutcome::Claimed { .. } => break,
                ClaimOutcome::Completed { result } => {
                    debug!(
                        saga_id = %saga.saga_id,
                        step_id = %step.step_id,
                        "Reusing completed step result"
                    );
                    return Ok(result.unwrap_or(Value::Null));
                }
                ClaimOutcome::AlreadyProcessing { .. } => {
                    if Utc::now() >= saga.deadline {
                        return Err(CoreError::StepTimeout {
                            step_id: step.step_id.clone(),
                            timeout_ms: step.timeout_ms,
                        });
                    }
                    tokio::time::sleep(backoff(&self.config, 0)).await;
                }
                ClaimOutcome::HashMismatch { .. } => {
                    return Err(CoreError::IdempotencyHashMismatch { key });
                }
                ClaimOutcome::Failed { error, .. } => {
                    return Err(CoreError::StepExecutionFailed {
                        step_id: step.step_id.clone(),
                        reason: error.unwrap_or_else(|| "earlier attempt failed".to_string()),
                    });
                }
            }
        }

        let context = saga.context.clone();
        let mut last_error = None;
        for attempt in 0..=step.max_retries {
            saga.steps[idx].attempts += 1;
            let outcome =
                tokio::time::timeout(step.timeout(), handler.execute(&step.params, &context)).await;
            let err = match outcome {
                Ok(Ok(value)) => {
                    self.idempotency.complete(&key, Some(value.clone())).await?;
                    return Ok(value);
                }
                Ok(Err(e)) => CoreError::StepExecutionFailed {
                    step_id: step.step_id.clone(),
                    reason: e.to_string(),
                },
                Err(_) => CoreError::StepTimeout {
                    step_id: step.step_id.clone(),
                    timeout_ms: step.timeout_ms,
                },
            };
            warn!(
                saga_id = %saga.saga_id,
                step_id = %step.step_id,
                attempt = attempt + 1,
                max_attempts = step.max_retries + 1,
                error = %err,
                "Saga step attempt failed"
            );
            last_error = Some(err);

            if attempt == step.max_retries || Utc::now() >= saga.deadline {
                break;
            }
            tokio::time::sleep(backoff(&self.config, attempt)).await;
        }

        let err = last_error.unwrap_or_else(|| CoreError::StepExecutionFailed {
            step_id: step.step_id.clone(),
            reason: "no attempt made".to_string(),
        });
        if let Err(mark) = self.idempotency.fail(&key, &err.to_string()).await {
            warn!(key = %key, error = %mark, "Could not record step failure");
        }
        Err(err)
    }

    /// Reverse walk over completed steps. Never stops early.
    async fn run_compensation(&self, saga: &mut SagaTransaction) -> Result<()> {
        for idx in (0..saga.steps.len()).rev() {
            if !matches!(
                saga.steps[idx].status,
                StepStatus::Completed | StepStatus::Compensating
            ) {
                continue;
            }
            let step = saga.steps[idx].clone();
            let Some(compensation) = step.compensation.clone() else {
                debug!(
                    saga_id = %saga.saga_id,
                    step_id = %step.step_id,
                    "Step has no compensation"
                );
                continue;
            };

            saga.steps[idx].status = StepStatus::Compensating;
            self.persist(saga).await?;

            match self.compensate_step(saga, &step, &compensation).await {
                Ok(()) => {
                    saga.steps[idx].status = StepStatus::Compensated;
                    info!(
                        saga_id = %saga.saga_id,
                        step_id = %step.step_id,
                        "Saga step compensated"
                    );
                }
                Err(e) => {
                    error!(
                        saga_id = %saga.saga_id,
                        step_id = %step.step_id,
                        error = %e,
                        "Compensation failed, manual reconciliation required"
                    );
                    saga.steps[idx].error = Some(e.to_string());
                    saga.compensation_failures.push(CompensationFailure {
                        step_id: step.step_id.clone(),
                        error: e.to_string(),
                        at: Utc::now(),
                    });
                    saga.requires_reconciliation = true;
                }
            }
            self.persist(saga).await?;
        }
        Ok(())
    }

    async fn compensate_step(
        &self,
        saga: &SagaTransaction,
        step: &SagaStepState,
        compensation: &str,
    ) -> Result<()> {
        let key = compensation_key(&saga.saga_id, &step.step_id);
        let handler = self.handlers.get(compensation)?;
        let request = ClaimRequest::new(
            &key,
            format!("saga_compensation:{}", compensation),
            request_hash(&step.params),
        )
        .with_ttl(Duration::from_secs(self.config.record_ttl_secs))
        .with_processing_timeout(step.timeout() * 2)
        .with_max_retries(0);

        match self.idempotency.claim(request).await? {
            ClaimOutcome::Claimed { .. } => {}
            ClaimOutcome::Completed { .. } => {
                debug!(saga_id = %saga.saga_id, step_id = %step.step_id, "Already compensated");
                return Ok(());
            }
            ClaimOutcome::AlreadyProcessing { .. } => {
                return Err(CoreError::CompensationFailed {
                    step_id: step.step_id.clone(),
                    reason: "compensation in progress elsewhere".to_string(),
                });
            }
            ClaimOutcome::HashMismatch { .. } => {
                return Err(CoreError::IdempotencyHashMismatch { key });
            }
            ClaimOutcome::Failed { error, .. } => {
                return Err(CoreError::CompensationFailed {
                    step_id: step.step_id.clone(),
                    reason: error.unwrap_or_else(|| "earlier compensation failed".to_string()),
                });
            }
        }

        let outcome = tokio::time::timeout(
            step.timeout(),
            handler.compensate(&step.params, &saga.context, step.result.as_ref()),
        )
        .await;
        let reason = match outcome {
            Ok(Ok(())) => {
                self.idempotency.complete(&key, None).await?;
                return Ok(());
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("timed out after {}ms", step.timeout_ms),
        };
        if let Err(mark) = self.idempotency.fail(&key, &reason).await {
            warn!(key = %key, error = %mark, "Could not record compensation failure");
        }
        Err(CoreError::CompensationFailed {
            step_id: step.step_id.clone(),
            reason,
        })
    }

    async fn finish(&self, saga: &mut SagaTransaction) -> Result<()> {
        for step in saga.steps.iter_mut() {
            if step.status == StepStatus::Pending {
                step.status = StepStatus::Skipped;
            }
        }
        saga.finished_at = Some(Utc::now());
        self.persist(saga).await?;
        self.store
            .set(
                &result_key(&saga.saga_id),
                &serde_json::to_string(&saga.summary())?,
                Some(Duration::from_secs(self.config.result_ttl_secs)),
            )
            .await
    }

    async fn persist(&self, saga: &mut SagaTransaction) -> Result<()> {
        saga.updated_at = Utc::now();
        self.store
            .set(
                &saga_key(&saga.saga_id),
                &serde_json::to_string(saga)?,
                Some(Duration::from_secs(self.config.record_ttl_secs)),
            )
            .await
    }

    async fn load(&self, saga_id: &str) -> Result<SagaTransaction> {
        let raw = self
            .store
            .get(&saga_key(saga_id))
            .await?
            .ok_or_else(|| CoreError::SagaNotFound(saga_id.to_string()))?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub async fn get_saga_status(&self, saga_id: &str) -> Result<SagaTransaction> {
        self.load(saga_id).await
    }

    /// Terminal summary; outlives the full record
    pub async fn get_saga_result(&self, saga_id: &str) -> Result<Option<SagaSummary>> {
        self.store
            .get(&result_key(saga_id))
            .await?
            .map(|raw| serde_json::from_str(&raw).map_err(CoreError::from))
            .transpose()
    }

    /// Poll until the saga finishes or `timeout` passes; returns the latest
    /// snapshot either way.
    pub async fn wait(&self, saga_id: &str, timeout: Duration) -> Result<SagaTransaction> {
        let deadline = Instant::now() + timeout;
        loop {
            let saga = self.load(saga_id).await?;
            if saga.is_finished() || Instant::now() >= deadline {
                return Ok(saga);
            }
            tokio::time::sleep(WAIT_POLL).await;
        }
    }

    /// Resume sagas left unfinished by a dead executor. Leader-only.
    pub async fn recover_stalled(self: &Arc<Self>) -> Result<usize> {
        let stale = Duration::from_secs(self.config.stale_threshold_secs);
        let mutex = DistributedMutex::new(
            Arc::clone(&self.store),
            RECOVERY_LOCK,
            stale.max(Duration::from_secs(1)),
        );
        let Some(guard) = mutex.try_acquire().await? else {
            debug!("Saga recovery already running elsewhere");
            return Ok(0);
        };

        let result = self.resume_stalled(stale).await;
        if let Err(e) = mutex.release(guard).await {
            warn!(error = %e, "Failed to release saga recovery lock");
        }
        result
    }

    async fn resume_stalled(self: &Arc<Self>, stale: Duration) -> Result<usize> {
        let cutoff = Utc::now() - to_chrono(stale);
        let keys = self.store.scan("saga:*", SCAN_LIMIT).await?;
        let mut resumed = 0;

        for key in keys {
            let Some(raw) = self.store.get(&key).await? else {
                continue;
            };
            let saga: SagaTransaction = match serde_json::from_str(&raw) {
                Ok(saga) => saga,
                Err(e) => {
                    warn!(key = %key, error = %e, "Skipping unreadable saga record");
                    continue;
                }
            };
            if saga.is_finished()
                || saga.updated_at > cutoff
                || self.is_running_locally(&saga.saga_id)
            {
                continue;
            }
            info!(
                saga_id = %saga.saga_id,
                status = %saga.status,
                previous_instance = %saga.instance_id,
                "Resuming stalled saga"
            );
            self.spawn_execution(saga.saga_id);
            resumed += 1;
        }
        Ok(resumed)
    }

    /// Sagas executing in this process
    pub fn active_count(&self) -> usize {
        self.running.iter().filter(|h| !h.value().is_finished()).count()
    }

    /// Abort local executions; their records stay for recovery
    pub fn stop(&self) {
        let mut aborted = 0;
        for entry in self.running.iter() {
            if !entry.value().is_finished() {
                entry.value().abort();
                aborted += 1;
            }
        }
        self.running.clear();
        if aborted > 0 {
            info!(aborted, "Saga executions aborted");
        }
    }
}

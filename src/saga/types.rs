//! Saga records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::time::Duration;

/// Shared data handed to every step; each completed step adds its result
/// under its step id.
pub type SagaContext = Map<String, Value>;

/// Saga lifecycle
///
/// ```text
/// pending -> running -> completed
///                   \-> failed | timeout -> compensating -> compensated
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SagaStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Timeout,
    Compensating,
    Compensated,
}

impl SagaStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SagaStatus::Pending => "pending",
            SagaStatus::Running => "running",
            SagaStatus::Completed => "completed",
            SagaStatus::Failed => "failed",
            SagaStatus::Timeout => "timeout",
            SagaStatus::Compensating => "compensating",
            SagaStatus::Compensated => "compensated",
        }
    }

    /// Work still owed: an executor should be driving this saga
    #[inline]
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SagaStatus::Pending | SagaStatus::Running | SagaStatus::Compensating
        )
    }
}

impl fmt::Display for SagaStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Compensating,
    Compensated,
    /// Never executed because an earlier step failed
    Skipped,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
            StepStatus::Compensating => "compensating",
            StepStatus::Compensated => "compensated",
            StepStatus::Skipped => "skipped",
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Step declaration passed to `start_saga`
#[derive(Debug, Clone, PartialEq)]
pub struct SagaStep {
    pub step_id: String,
    pub handler: String,
    /// Handler whose `compensate` undoes this step; none means nothing to undo
    pub compensation: Option<String>,
    pub params: Value,
    pub max_retries: Option<u32>,
    pub timeout: Option<Duration>,
}

impl SagaStep {
    pub fn new(step_id: impl Into<String>, handler: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            handler: handler.into(),
            compensation: None,
            params: Value::Null,
            max_retries: None,
            timeout: None,
        }
    }

    pub fn compensated_by(mut self, handler: impl Into<String>) -> Self {
        self.compensation = Some(handler.into());
        self
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Persisted step state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaStepState {
    pub step_id: String,
    pub handler: String,
    pub compensation: Option<String>,
    pub params: Value,
    pub max_retries: u32,
    pub timeout_ms: u64,
    pub status: StepStatus,
    pub attempts: u32,
    pub idempotency_key: String,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl SagaStepState {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompensationFailure {
    pub step_id: String,
    pub error: String,
    pub at: DateTime<Utc>,
}

/// One saga, as stored under `saga:<id>`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaTransaction {
    pub saga_id: String,
    pub name: String,
    pub status: SagaStatus,
    pub steps: Vec<SagaStepState>,
    pub context: SagaContext,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    pub failure_reason: Option<String>,
    pub compensation_failures: Vec<CompensationFailure>,
    pub requires_reconciliation: bool,
    pub instance_id: String,
    /// Set once no more work is owed
    pub finished_at: Option<DateTime<Utc>>,
}

impl SagaTransaction {
    pub fn is_finished(&self) -> bool {
        self.finished_at.is_some()
    }

    pub fn completed_steps(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Completed)
            .count()
    }

    pub fn step(&self, step_id: &str) -> Option<&SagaStepState> {
        self.steps.iter().find(|s| s.step_id == step_id)
    }

    pub fn summary(&self) -> SagaSummary {
        SagaSummary {
            saga_id: self.saga_id.clone(),
            name: self.name.clone(),
            status: self.status,
            failure_reason: self.failure_reason.clone(),
            steps: self
                .steps
                .iter()
                .map(|s| (s.step_id.clone(), s.status))
                .collect(),
            requires_reconciliation: self.requires_reconciliation,
            finished_at: self.finished_at,
        }
    }
}

/// Terminal summary kept under `saga_result:<id>`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaSummary {
    pub saga_id: String,
    pub name: String,
    pub status: SagaStatus,
    pub failure_reason: Option<String>,
    pub steps: Vec<(String, StepStatus)>,
    pub requires_reconciliation: bool,
    pub finished_at: Option<DateTime<Utc>>,
}

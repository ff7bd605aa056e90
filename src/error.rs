//! Core Error Types
//!
//! One taxonomy for every coordination subsystem. Codes are stable strings so
//! that support tooling and caller retry logic can match on them.

use thiserror::Error;

/// Crate-wide result alias
pub type Result<T, E = CoreError> = std::result::Result<T, E>;

/// Coordination core errors
#[derive(Error, Debug, Clone)]
pub enum CoreError {
    // === State Machine ===
    #[error("Invalid transition for {entity_type} {entity_id}: {from} -> {to}")]
    InvalidTransition {
        entity_type: String,
        entity_id: String,
        from: String,
        to: String,
    },

    #[error("Entity {entity_id} is in terminal state {state}")]
    TerminalStateViolation { entity_id: String, state: String },

    #[error("Row lock not acquired for {entity_id} within {timeout_ms}ms")]
    LockTimeout { entity_id: String, timeout_ms: u64 },

    #[error("Version conflict on {entity_id}: expected {expected}, found {actual}")]
    VersionConflict {
        entity_id: String,
        expected: i64,
        actual: i64,
    },

    #[error("Financial transition requires non-zero amount and currency: {0}")]
    MissingFinancialFields(String),

    #[error("Business rule violated: {0}")]
    BusinessRuleViolation(String),

    #[error("Side effect '{name}' failed: {reason}")]
    SideEffectFailed { name: String, reason: String },

    #[error("Entity not found: {entity_type}/{entity_id}")]
    EntityNotFound {
        entity_type: String,
        entity_id: String,
    },

    #[error("Unknown entity type: {0}")]
    UnknownEntityType(String),

    // === Idempotency ===
    #[error("Idempotency key {key} reused with a different request payload")]
    IdempotencyHashMismatch { key: String },

    #[error("Operation {key} is already being processed")]
    AlreadyProcessing { key: String },

    #[error("Idempotency record {key} is {status}, not processing")]
    NotProcessing { key: String, status: String },

    #[error("Coordination is unsafe: {0}")]
    CoordinationUnsafe(String),

    // === Saga ===
    #[error("Step {step_id} failed: {reason}")]
    StepExecutionFailed { step_id: String, reason: String },

    #[error("Step {step_id} timed out after {timeout_ms}ms")]
    StepTimeout { step_id: String, timeout_ms: u64 },

    #[error("Compensation of step {step_id} failed: {reason}")]
    CompensationFailed { step_id: String, reason: String },

    #[error("Unknown handler: {0}")]
    UnknownHandler(String),

    #[error("Saga not found: {0}")]
    SagaNotFound(String),

    // === Election ===
    #[error("Leader election failed: {0}")]
    ElectionFailed(String),

    // === Infrastructure ===
    #[error("Coordination store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl CoreError {
    /// Stable error code for callers and support tooling
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::InvalidTransition { .. } => "INVALID_TRANSITION",
            CoreError::TerminalStateViolation { .. } => "TERMINAL_STATE_VIOLATION",
            CoreError::LockTimeout { .. } => "LOCK_TIMEOUT",
            CoreError::VersionConflict { .. } => "VERSION_CONFLICT",
            CoreError::MissingFinancialFields(_) => "MISSING_FINANCIAL_FIELDS",
            CoreError::BusinessRuleViolation(_) => "BUSINESS_RULE_VIOLATION",
            CoreError::SideEffectFailed { .. } => "SIDE_EFFECT_FAILED",
            CoreError::EntityNotFound { .. } => "ENTITY_NOT_FOUND",
            CoreError::UnknownEntityType(_) => "UNKNOWN_ENTITY_TYPE",
            CoreError::IdempotencyHashMismatch { .. } => "IDEMPOTENCY_HASH_MISMATCH",
            CoreError::AlreadyProcessing { .. } => "ALREADY_PROCESSING",
            CoreError::NotProcessing { .. } => "NOT_PROCESSING",
            CoreError::CoordinationUnsafe(_) => "COORDINATION_UNSAFE",
            CoreError::StepExecutionFailed { .. } => "STEP_EXECUTION_FAILED",
            CoreError::StepTimeout { .. } => "STEP_TIMEOUT",
            CoreError::CompensationFailed { .. } => "COMPENSATION_FAILED",
            CoreError::UnknownHandler(_) => "UNKNOWN_HANDLER",
            CoreError::SagaNotFound(_) => "SAGA_NOT_FOUND",
            CoreError::ElectionFailed(_) => "ELECTION_FAILED",
            CoreError::StoreUnavailable(_) => "STORE_UNAVAILABLE",
            CoreError::Database(_) => "DATABASE_ERROR",
            CoreError::Serialization(_) => "SERIALIZATION_ERROR",
            CoreError::Config(_) => "CONFIG_ERROR",
        }
    }

    /// Transient infrastructure errors the caller may retry.
    ///
    /// Validation and business errors are never retryable, and neither is
    /// `CoordinationUnsafe`: it is a deliberate fail-closed stop.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoreError::LockTimeout { .. }
                | CoreError::VersionConflict { .. }
                | CoreError::AlreadyProcessing { .. }
                | CoreError::StepTimeout { .. }
                | CoreError::StoreUnavailable(_)
                | CoreError::Database(_)
        )
    }

    /// Idempotency key attached to the error, if any
    pub fn idempotency_key(&self) -> Option<&str> {
        match self {
            CoreError::IdempotencyHashMismatch { key }
            | CoreError::AlreadyProcessing { key }
            | CoreError::NotProcessing { key, .. } => Some(key),
            _ => None,
        }
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(e: sqlx::Error) -> Self {
        CoreError::Database(e.to_string())
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        CoreError::Serialization(e.to_string())
    }
}

//! Saga Coordination
//!
//! Multi-step money movements with per-step idempotency and reverse-order
//! compensation.
//!
//! # Guarantees
//!
//! 1. **At most once per step**: each step runs under `saga:<id>:<step>`; a
//!    resumed saga reuses the cached result
//! 2. **Compensate what completed**: only completed steps are undone, newest first
//! 3. **Loud failures**: a failed compensation marks the saga for reconciliation

pub mod coordinator;
pub mod handler;
pub mod types;

pub use coordinator::SagaCoordinator;
pub use handler::{HandlerRegistry, StepHandler};
pub use types::{
    CompensationFailure, SagaContext, SagaStatus, SagaStep, SagaStepState, SagaSummary,
    SagaTransaction, StepStatus,
};

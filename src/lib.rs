//! Transaction Coordination Core
//!
//! Coordination primitives for money-moving operations running on several
//! peer instances.
//!
//! # Modules
//!
//! - [`state_machine`] - Entity lifecycle transitions under row locks
//! - [`saga`] - Multi-step operations with reverse-order compensation
//! - [`idempotency`] - Operation and job deduplication, fail-closed
//! - [`election`] - Leader election and leader-only scheduled jobs
//! - [`cleanup`] - TTL cleanup and cache invalidation
//! - [`locking`] - Row locks and versioned entity records
//! - [`coordination`] - Key/value store with TTL and conditional writes
//! - [`ops`] - Operational surface
//! - [`runtime`] - Composition root

// Infrastructure
pub mod config;
pub mod db;
pub mod error;
pub mod logging;

// Substrate
pub mod coordination;
pub mod locking;

// Coordination services
pub mod cleanup;
pub mod election;
pub mod idempotency;
pub mod saga;
pub mod state_machine;

pub mod ops;
pub mod runtime;

// Convenient re-exports at crate root
pub use config::AppConfig;
pub use error::{CoreError, Result};
pub use runtime::CoreServices;

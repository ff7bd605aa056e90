//! Idempotency Service
//!
//! At-most-once execution of financial operations, saga steps and scheduled
//! jobs. A claim atomically creates a `processing` record; its owner later
//! marks it `completed` (result cached) or `failed` (retryable up to a bound).
//!
//! # Safety Invariants
//!
//! 1. **Single winner**: concurrent claims of one key yield exactly one `Claimed`
//! 2. **Stable payload**: a key reused with a different request hash is reported, never merged
//! 3. **Guarded finish**: only `processing` records can complete or fail
//! 4. **Fail closed**: with no reachable backend nothing is claimed or written

pub mod job;
pub mod key;
pub mod postgres;
pub mod service;
pub mod store;
pub mod types;

pub use job::{
    JobClaim, JobExecutionContext, JobHandler, JobIdempotencyService, JobResult, JobRun, JobSpec,
    JobStatus,
};
pub use key::{derive_key, request_hash};
pub use postgres::PgIdempotencyStore;
pub use service::{IdempotencyService, IdempotentOutcome};
pub use store::{CoordinationIdempotencyStore, IdempotencyStore};
pub use types::{
    ClaimOutcome, ClaimPolicy, ClaimRequest, Finish, IdempotencyRecord, IdempotencyStatus,
};

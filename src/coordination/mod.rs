//! Coordination Store Client
//!
//! Key/value store with per-key TTL and conditional writes. Every key that
//! must be written exactly once goes through `set_if_absent`,
//! `compare_and_set` or `compare_and_delete`; plain `set` is only used for
//! TTL-scoped records owned by a single writer.
//!
//! # Key namespaces
//!
//! ```text
//! idempotency:*            claim records (operations, saga steps, job claims)
//! job_execution:*          job execution contexts
//! job_result:*             cached job results
//! saga:* / saga_result:*   saga records and terminal summaries
//! leader_election:<svc>:*  leader, candidates, term, heartbeat keys
//! lock:*                   distributed mutexes
//! session:* / cache:*      generic ephemeral data
//! ```

pub mod memory;
pub mod mutex;
pub mod pattern;
pub mod postgres;

pub use memory::MemoryCoordinationStore;
pub use mutex::{DistributedMutex, MutexGuard};
pub use pattern::KeyPattern;
pub use postgres::PgCoordinationStore;

use async_trait::async_trait;
use std::time::Duration;

use crate::error::Result;

/// Remaining lifetime of a key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTtl {
    /// Key does not exist (or already expired)
    Missing,
    /// Key exists without expiry
    Persistent,
    /// Key expires after the given duration
    Expires(Duration),
}

/// Coordination store primitives
///
/// All methods return `CoreError::StoreUnavailable` when the backend cannot
/// be reached, so callers can tell outages apart from logical outcomes.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Backend name for logging
    fn name(&self) -> &'static str;

    /// Reachability probe
    async fn ping(&self) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Unconditional write, optionally TTL-scoped
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    /// Write only if the key is absent. Returns true if written.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<bool>;

    /// Replace the value only if it currently equals `expected`
    async fn compare_and_set(
        &self,
        key: &str,
        expected: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool>;

    /// Returns true if a live key was removed
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Delete only if the value currently equals `expected`
    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool>;

    /// Set a new TTL on an existing key
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;

    async fn ttl(&self, key: &str) -> Result<KeyTtl>;

    /// Live keys matching a glob pattern, sorted, at most `limit`
    async fn scan(&self, pattern: &str, limit: usize) -> Result<Vec<String>>;

    /// Physically drop keys whose TTL elapsed. Returns the number removed.
    async fn purge_expired(&self) -> Result<u64>;
}

/// Store key for an idempotency record
pub fn idempotency_key(key: &str) -> String {
    format!("idempotency:{}", key)
}

/// Store key for a distributed mutex
pub fn lock_key(name: &str) -> String {
    format!("lock:{}", name)
}

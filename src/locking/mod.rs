//! Locking Substrate
//!
//! Row-level exclusive locks plus a version column per entity. The row is the
//! single source of truth for entity state and is only mutated while its lock
//! is held.
//!
//! # Safety Invariants
//!
//! 1. **Lock-then-read**: state and version are read after the lock is held
//! 2. **Versioned write**: every write is `WHERE version = expected`, bumping it by one
//! 3. **Staged until commit**: nothing is visible to other readers before `commit()`
//! 4. **Bounded wait**: lock acquisition never blocks past its timeout

pub mod memory;
pub mod postgres;

pub use memory::MemoryEntityStore;
pub use postgres::PgEntityStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::error::{CoreError, Result};

/// A money-bearing record under state-machine control
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub entity_type: String,
    pub id: String,
    pub state: String,
    pub version: i64,
    pub updated_at: DateTime<Utc>,
    /// Remaining row columns (counterparty, amounts, ...) as JSON
    #[serde(default)]
    pub attributes: serde_json::Value,
}

impl EntityRecord {
    /// A fresh record at version 1
    pub fn new(
        entity_type: impl Into<String>,
        id: impl Into<String>,
        state: impl Into<String>,
        attributes: serde_json::Value,
    ) -> Self {
        Self {
            entity_type: entity_type.into(),
            id: id.into(),
            state: state.into(),
            version: 1,
            updated_at: Utc::now(),
            attributes,
        }
    }

    /// String attribute lookup, treating empty strings as absent
    pub fn attribute_str(&self, name: &str) -> Option<&str> {
        self.attributes
            .get(name)
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
    }

    /// Present, not null and not an empty string
    pub fn has_attribute(&self, name: &str) -> bool {
        self.attributes
            .get(name)
            .is_some_and(|v| !v.is_null() && v.as_str().is_none_or(|s| !s.is_empty()))
    }
}

/// Relational store holding versioned entities
#[async_trait]
pub trait EntityStore: Send + Sync {
    fn name(&self) -> &'static str;

    /// Insert a new row. Fails if the id already exists.
    async fn insert(&self, record: &EntityRecord) -> Result<()>;

    /// Read the last committed row without locking
    async fn load(&self, entity_type: &str, id: &str) -> Result<Option<EntityRecord>>;

    /// Take the row lock, waiting at most `timeout`.
    ///
    /// Fails with `LockTimeout` on contention and `EntityNotFound` if the row
    /// does not exist.
    async fn lock(
        &self,
        entity_type: &str,
        id: &str,
        timeout: Duration,
    ) -> Result<Box<dyn EntityLock>>;

    fn metrics(&self) -> LockMetricsSnapshot;
}

/// An open, locked transaction on one row
#[async_trait]
pub trait EntityLock: Send {
    /// Row as seen under the lock, including any staged write
    fn record(&self) -> &EntityRecord;

    /// Time spent waiting for the lock
    fn waited(&self) -> Duration;

    fn metrics(&self) -> &LockMetrics;

    /// Reject a caller-supplied version that differs from the locked row
    fn check_version(&self, expected: i64) -> Result<()> {
        let actual = self.record().version;
        if expected == actual {
            return Ok(());
        }
        self.metrics().version_conflict();
        Err(CoreError::VersionConflict {
            entity_id: self.record().id.clone(),
            expected,
            actual,
        })
    }

    /// Versioned write of a new state, staged until commit
    async fn write_state(&mut self, new_state: &str, expected_version: i64) -> Result<EntityRecord>;

    async fn commit(self: Box<Self>) -> Result<EntityRecord>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// Lock counters shared by a store and the locks it hands out
#[derive(Debug, Default)]
pub struct LockMetrics {
    acquisitions: AtomicU64,
    timeouts: AtomicU64,
    version_conflicts: AtomicU64,
    commits: AtomicU64,
    rollbacks: AtomicU64,
    held: AtomicU64,
    total_wait_us: AtomicU64,
    max_wait_us: AtomicU64,
}

/// Point-in-time copy of [`LockMetrics`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockMetricsSnapshot {
    pub acquisitions: u64,
    pub timeouts: u64,
    pub version_conflicts: u64,
    pub commits: u64,
    pub rollbacks: u64,
    pub currently_held: u64,
    pub total_wait_us: u64,
    pub max_wait_us: u64,
}

impl LockMetricsSnapshot {
    pub fn avg_wait_us(&self) -> u64 {
        self.total_wait_us
            .checked_div(self.acquisitions)
            .unwrap_or(0)
    }
}

impl LockMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Record an acquisition and return the hold token
    pub fn acquired(self: &Arc<Self>, waited: Duration) -> LockHold {
        let us = waited.as_micros().min(u64::MAX as u128) as u64;
        self.acquisitions.fetch_add(1, Ordering::Relaxed);
        self.total_wait_us.fetch_add(us, Ordering::Relaxed);
        self.max_wait_us.fetch_max(us, Ordering::Relaxed);
        self.held.fetch_add(1, Ordering::Relaxed);
        LockHold {
            metrics: Arc::clone(self),
        }
    }

    pub fn timed_out(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn version_conflict(&self) {
        self.version_conflicts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn committed(&self) {
        self.commits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn rolled_back(&self) {
        self.rollbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> LockMetricsSnapshot {
        LockMetricsSnapshot {
            acquisitions: self.acquisitions.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            version_conflicts: self.version_conflicts.load(Ordering::Relaxed),
            commits: self.commits.load(Ordering::Relaxed),
            rollbacks: self.rollbacks.load(Ordering::Relaxed),
            currently_held: self.held.load(Ordering::Relaxed),
            total_wait_us: self.total_wait_us.load(Ordering::Relaxed),
            max_wait_us: self.max_wait_us.load(Ordering::Relaxed),
        }
    }
}

/// Decrements the held gauge when the lock goes away, however it goes away
#[derive(Debug)]
pub struct LockHold {
    metrics: Arc<LockMetrics>,
}

impl LockHold {
    pub fn metrics(&self) -> &LockMetrics {
        &self.metrics
    }
}

impl Drop for LockHold {
    fn drop(&mut self) {
        self.metrics.held.fetch_sub(1, Ordering::Relaxed);
    }
}

//! In-process entity store
//!
//! Committed rows live in a `DashMap`; each row has its own async mutex that
//! plays the role of `SELECT ... FOR UPDATE`. Writes are staged on the lock
//! and only copied into the committed map on `commit()`.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::{EntityLock, EntityRecord, EntityStore, LockHold, LockMetrics, LockMetricsSnapshot};
use crate::error::{CoreError, Result};

type RowKey = (String, String);

pub struct MemoryEntityStore {
    rows: Arc<DashMap<RowKey, EntityRecord>>,
    row_locks: DashMap<RowKey, Arc<Mutex<()>>>,
    metrics: Arc<LockMetrics>,
}

impl MemoryEntityStore {
    pub fn new() -> Self {
        Self {
            rows: Arc::new(DashMap::new()),
            row_locks: DashMap::new(),
            metrics: LockMetrics::new(),
        }
    }

    fn key(entity_type: &str, id: &str) -> RowKey {
        (entity_type.to_string(), id.to_string())
    }
}

impl Default for MemoryEntityStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EntityStore for MemoryEntityStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn insert(&self, record: &EntityRecord) -> Result<()> {
        let key = Self::key(&record.entity_type, &record.id);
        match self.rows.entry(key.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(CoreError::Database(format!(
                "duplicate key: {}/{}",
                record.entity_type, record.id
            ))),
            dashmap::mapref::entry::Entry::Vacant(v) => {
                v.insert(record.clone());
                self.row_locks
                    .entry(key)
                    .or_insert_with(|| Arc::new(Mutex::new(())));
                Ok(())
            }
        }
    }

    async fn load(&self, entity_type: &str, id: &str) -> Result<Option<EntityRecord>> {
        Ok(self
            .rows
            .get(&Self::key(entity_type, id))
            .map(|r| r.clone()))
    }

    async fn lock(
        &self,
        entity_type: &str,
        id: &str,
        timeout: Duration,
    ) -> Result<Box<dyn EntityLock>> {
        let key = Self::key(entity_type, id);
        // Clone the mutex out so no map shard is held across the await
        let row_lock = self
            .row_locks
            .get(&key)
            .map(|m| Arc::clone(m.value()))
            .ok_or_else(|| CoreError::EntityNotFound {
                entity_type: entity_type.to_string(),
                entity_id: id.to_string(),
            })?;

        let started = Instant::now();
        let guard = match tokio::time::timeout(timeout, row_lock.lock_owned()).await {
            Ok(guard) => guard,
            Err(_) => {
                self.metrics.timed_out();
                return Err(CoreError::LockTimeout {
                    entity_id: id.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
        };
        let waited = started.elapsed();

        let record = self
            .rows
            .get(&key)
            .map(|r| r.clone())
            .ok_or_else(|| CoreError::EntityNotFound {
                entity_type: entity_type.to_string(),
                entity_id: id.to_string(),
            })?;

        let hold = self.metrics.acquired(waited);
        Ok(Box::new(MemoryEntityLock {
            rows: Arc::clone(&self.rows),
            key,
            record,
            dirty: false,
            waited,
            hold,
            _guard: guard,
        }))
    }

    fn metrics(&self) -> LockMetricsSnapshot {
        self.metrics.snapshot()
    }
}

pub struct MemoryEntityLock {
    rows: Arc<DashMap<RowKey, EntityRecord>>,
    key: RowKey,
    record: EntityRecord,
    dirty: bool,
    waited: Duration,
    hold: LockHold,
    _guard: OwnedMutexGuard<()>,
}

#[async_trait]
impl EntityLock for MemoryEntityLock {
    fn record(&self) -> &EntityRecord {
        &self.record
    }

    fn waited(&self) -> Duration {
        self.waited
    }

    fn metrics(&self) -> &LockMetrics {
        self.hold.metrics()
    }

    async fn write_state(&mut self, new_state: &str, expected_version: i64) -> Result<EntityRecord> {
        if self.record.version != expected_version {
            self.hold.metrics().version_conflict();
            return Err(CoreError::VersionConflict {
                entity_id: self.record.id.clone(),
                expected: expected_version,
                actual: self.record.version,
            });
        }
        self.record.state = new_state.to_string();
        self.record.version += 1;
        self.record.updated_at = Utc::now();
        self.dirty = true;
        Ok(self.record.clone())
    }

    async fn commit(self: Box<Self>) -> Result<EntityRecord> {
        let this = *self;
        if this.dirty {
            this.rows.insert(this.key.clone(), this.record.clone());
        }
        this.hold.metrics().committed();
        Ok(this.record)
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.hold.metrics().rolled_back();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn store_with_row() -> MemoryEntityStore {
        let store = MemoryEntityStore::new();
        store
            .insert(&EntityRecord::new("escrow", "e1", "CREATED", json!({})))
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn test_commit_makes_write_visible() {
        let store = store_with_row().await;
        let mut lock = store
            .lock("escrow", "e1", Duration::from_secs(1))
            .await
            .unwrap();
        lock.write_state("PAYMENT_PENDING", 1).await.unwrap();

        // Not visible before commit
        let seen = store.load("escrow", "e1").await.unwrap().unwrap();
        assert_eq!(seen.state, "CREATED");

        let committed = lock.commit().await.unwrap();
        assert_eq!(committed.version, 2);
        let seen = store.load("escrow", "e1").await.unwrap().unwrap();
        assert_eq!(seen.state, "PAYMENT_PENDING");
        assert_eq!(seen.version, 2);
    }

    #[tokio::test]
    async fn test_rollback_discards_write() {
        let store = store_with_row().await;
        let mut lock = store
            .lock("escrow", "e1", Duration::from_secs(1))
            .await
            .unwrap();
        lock.write_state("CANCELLED", 1).await.unwrap();
        lock.rollback().await.unwrap();

        let seen = store.load("escrow", "e1").await.unwrap().unwrap();
        assert_eq!(seen.state, "CREATED");
        assert_eq!(seen.version, 1);
        assert_eq!(store.metrics().rollbacks, 1);
        assert_eq!(store.metrics().currently_held, 0);
    }

    #[tokio::test]
    async fn test_lock_timeout_under_contention() {
        let store = store_with_row().await;
        let _held = store
            .lock("escrow", "e1", Duration::from_secs(1))
            .await
            .unwrap();

        let err = store
            .lock("escrow", "e1", Duration::from_millis(20))
            .await
            .err()
            .unwrap();
        assert_eq!(err.code(), "LOCK_TIMEOUT");
        assert_eq!(store.metrics().timeouts, 1);
    }

    #[tokio::test]
    async fn test_version_mismatch_rejected() {
        let store = store_with_row().await;
        let mut lock = store
            .lock("escrow", "e1", Duration::from_secs(1))
            .await
            .unwrap();
        let err = lock.write_state("PAYMENT_PENDING", 7).await.unwrap_err();
        assert!(matches!(
            err,
            CoreError::VersionConflict {
                expected: 7,
                actual: 1,
                ..
            }
        ));
        assert_eq!(store.metrics().version_conflicts, 1);
    }

    #[tokio::test]
    async fn test_missing_entity_and_duplicate_insert() {
        let store = store_with_row().await;
        let err = store
            .lock("escrow", "nope", Duration::from_millis(10))
            .await
            .err()
            .unwrap();
        assert_eq!(err.code(), "ENTITY_NOT_FOUND");

        let dup = store
            .insert(&EntityRecord::new("escrow", "e1", "CREATED", json!({})))
            .await;
        assert!(dup.is_err());
    }
}

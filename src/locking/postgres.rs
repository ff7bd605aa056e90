//! PostgreSQL entity store
//!
//! `SELECT ... FOR UPDATE` inside a transaction with `SET LOCAL lock_timeout`;
//! lock contention past the timeout surfaces as SQLSTATE 55P03 and is mapped to
//! `LockTimeout`. State writes are atomic CAS updates on the version column.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::{EntityLock, EntityRecord, EntityStore, LockHold, LockMetrics, LockMetricsSnapshot};
use crate::config::EntityTableConfig;
use crate::db::{SafeRow, is_safe_identifier, sqlstate};
use crate::error::{CoreError, Result};

/// lock_not_available
const SQLSTATE_LOCK_NOT_AVAILABLE: &str = "55P03";

pub struct PgEntityStore {
    pool: PgPool,
    tables: HashMap<String, EntityTableConfig>,
    metrics: Arc<LockMetrics>,
}

impl PgEntityStore {
    /// Validates every configured identifier before it can reach SQL
    pub fn new(pool: PgPool, tables: HashMap<String, EntityTableConfig>) -> Result<Self> {
        for (entity_type, t) in &tables {
            for ident in [&t.table, &t.id_column, &t.state_column] {
                if !is_safe_identifier(ident) {
                    return Err(CoreError::Config(format!(
                        "unsafe SQL identifier '{}' for entity type {}",
                        ident, entity_type
                    )));
                }
            }
        }
        Ok(Self {
            pool,
            tables,
            metrics: LockMetrics::new(),
        })
    }

    fn table(&self, entity_type: &str) -> Result<&EntityTableConfig> {
        self.tables
            .get(entity_type)
            .ok_or_else(|| CoreError::UnknownEntityType(entity_type.to_string()))
    }

    /// Stored `attributes` win over same-named row columns, which are
    /// folded in for tables that keep business fields as real columns.
    fn select_sql(t: &EntityTableConfig, for_update: bool) -> String {
        format!(
            "SELECT {id}::text AS entity_id, {state}::text AS entity_state, \
                    version::bigint AS version, updated_at, \
                    (to_jsonb(t) - 'attributes') || COALESCE(t.attributes, '{{}}'::jsonb) AS attributes \
               FROM {table} t WHERE {id} = $1{lock}",
            id = t.id_column,
            state = t.state_column,
            table = t.table,
            lock = if for_update { " FOR UPDATE" } else { "" },
        )
    }

    fn row_to_record(entity_type: &str, row: &PgRow) -> Result<EntityRecord> {
        let id: String = row.try_get("entity_id")?;
        let state: String = row.try_get("entity_state")?;
        let version: i64 = row.try_get("version")?;
        let updated_at: DateTime<Utc> = row
            .try_get_log("updated_at")
            .unwrap_or_else(Utc::now);
        let attributes: serde_json::Value = row
            .try_get_log("attributes")
            .unwrap_or(serde_json::Value::Null);
        Ok(EntityRecord {
            entity_type: entity_type.to_string(),
            id,
            state,
            version,
            updated_at,
            attributes,
        })
    }
}

#[async_trait]
impl EntityStore for PgEntityStore {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn insert(&self, record: &EntityRecord) -> Result<()> {
        let t = self.table(&record.entity_type)?;
        let sql = format!(
            "INSERT INTO {table} ({id}, {state}, version, attributes, updated_at) \
             VALUES ($1, $2, $3, $4, NOW())",
            table = t.table,
            id = t.id_column,
            state = t.state_column,
        );
        sqlx::query(&sql)
            .bind(&record.id)
            .bind(&record.state)
            .bind(record.version as i32)
            .bind(&record.attributes)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn load(&self, entity_type: &str, id: &str) -> Result<Option<EntityRecord>> {
        let t = self.table(entity_type)?;
        let row = sqlx::query(&Self::select_sql(t, false))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| Self::row_to_record(entity_type, &r))
            .transpose()
    }

    async fn lock(
        &self,
        entity_type: &str,
        id: &str,
        timeout: Duration,
    ) -> Result<Box<dyn EntityLock>> {
        let t = self.table(entity_type)?.clone();
        let started = Instant::now();
        let mut tx = self.pool.begin().await?;

        // SET does not accept bind parameters; the value is a plain integer
        sqlx::query(&format!(
            "SET LOCAL lock_timeout = '{}ms'",
            timeout.as_millis().max(1)
        ))
        .execute(&mut *tx)
        .await?;

        let row = match sqlx::query(&Self::select_sql(&t, true))
            .bind(id)
            .fetch_optional(&mut *tx)
            .await
        {
            Ok(row) => row,
            Err(e) if sqlstate(&e).as_deref() == Some(SQLSTATE_LOCK_NOT_AVAILABLE) => {
                self.metrics.timed_out();
                // Transaction is aborted; dropping it rolls back
                return Err(CoreError::LockTimeout {
                    entity_id: id.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
            Err(e) => return Err(e.into()),
        };

        let Some(row) = row else {
            return Err(CoreError::EntityNotFound {
                entity_type: entity_type.to_string(),
                entity_id: id.to_string(),
            });
        };
        let record = Self::row_to_record(entity_type, &row)?;
        let waited = started.elapsed();
        let hold = self.metrics.acquired(waited);

        Ok(Box::new(PgEntityLock {
            tx,
            table: t,
            record,
            waited,
            hold,
        }))
    }

    fn metrics(&self) -> LockMetricsSnapshot {
        self.metrics.snapshot()
    }
}

pub struct PgEntityLock {
    tx: Transaction<'static, Postgres>,
    table: EntityTableConfig,
    record: EntityRecord,
    waited: Duration,
    hold: LockHold,
}

#[async_trait]
impl EntityLock for PgEntityLock {
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
        let sql = format!(
            "UPDATE {table} SET {state} = $1, version = version + 1, updated_at = NOW() \
             WHERE {id} = $2 AND version = $3 \
             RETURNING version::bigint AS version, updated_at",
            table = self.table.table,
            state = self.table.state_column,
            id = self.table.id_column,
        );
        let row = sqlx::query(&sql)
            .bind(new_state)
            .bind(&self.record.id)
            .bind(expected_version as i32)
            .fetch_optional(&mut *self.tx)
            .await?;

        let Some(row) = row else {
            self.hold.metrics().version_conflict();
            return Err(CoreError::VersionConflict {
                entity_id: self.record.id.clone(),
                expected: expected_version,
                actual: self.record.version,
            });
        };

        self.record.state = new_state.to_string();
        self.record.version = row.try_get("version")?;
        self.record.updated_at = row.try_get("updated_at")?;
        Ok(self.record.clone())
    }

    async fn commit(self: Box<Self>) -> Result<EntityRecord> {
        let this = *self;
        this.tx.commit().await?;
        this.hold.metrics().committed();
        Ok(this.record)
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        let this = *self;
        this.tx.rollback().await?;
        this.hold.metrics().rolled_back();
        Ok(())
    }
}

//! Relational idempotency fallback
//!
//! Every claim/finish runs in one transaction serialized per key by
//! `pg_advisory_xact_lock(hashtext(key))`; the advisory lock is released on
//! commit or rollback. The unique constraint on `operation_key` backs it up.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::time::Duration;

use super::store::IdempotencyStore;
use super::types::{
    ClaimDecision, ClaimOutcome, ClaimPolicy, ClaimRequest, Finish, IdempotencyRecord,
    IdempotencyStatus, evaluate_existing,
};
use crate::db::SafeRow;
use crate::error::{CoreError, Result};

const SELECT_RECORD: &str = r#"
SELECT operation_key, operation_type, user_id, request_hash, status, result,
       error_message, retry_count, instance_id, processing_started_at,
       created_at, updated_at, expires_at
  FROM idempotency_keys_tb
 WHERE operation_key = $1
"#;

pub struct PgIdempotencyStore {
    pool: PgPool,
}

impl PgIdempotencyStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn lock_key(tx: &mut Transaction<'static, Postgres>, key: &str) -> Result<()> {
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(key)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    async fn fetch(
        tx: &mut Transaction<'static, Postgres>,
        key: &str,
    ) -> Result<Option<IdempotencyRecord>> {
        let row = sqlx::query(&format!("{} FOR UPDATE", SELECT_RECORD))
            .bind(key)
            .fetch_optional(&mut **tx)
            .await?;
        row.map(|r| Self::row_to_record(&r)).transpose()
    }

    fn row_to_record(row: &PgRow) -> Result<IdempotencyRecord> {
        let status: String = row.try_get("status")?;
        let status = IdempotencyStatus::from_str_opt(&status).ok_or_else(|| {
            CoreError::Serialization(format!("unknown idempotency status '{}'", status))
        })?;
        let retry_count: i32 = row.try_get("retry_count")?;
        let expires_at: DateTime<Utc> = row.try_get("expires_at")?;
        Ok(IdempotencyRecord {
            key: row.try_get("operation_key")?,
            operation_type: row.try_get("operation_type")?,
            user_id: row.try_get_log("user_id").flatten(),
            request_hash: row.try_get("request_hash")?,
            status,
            result: row.try_get_log("result").flatten(),
            error: row.try_get_log("error_message").flatten(),
            retry_count: retry_count.max(0) as u32,
            instance_id: row.try_get_log("instance_id").flatten(),
            processing_started_at: row.try_get_log("processing_started_at").flatten(),
            created_at: row.try_get_log("created_at").unwrap_or(expires_at),
            updated_at: row.try_get_log("updated_at").unwrap_or(expires_at),
            expires_at,
        })
    }

    async fn upsert(tx: &mut Transaction<'static, Postgres>, r: &IdempotencyRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO idempotency_keys_tb
                (operation_key, operation_type, user_id, request_hash, status, success,
                 result, error_message, retry_count, instance_id, processing_started_at,
                 created_at, updated_at, expires_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT (operation_key) DO UPDATE
               SET operation_type = EXCLUDED.operation_type,
                   user_id = EXCLUDED.user_id,
                   request_hash = EXCLUDED.request_hash,
                   status = EXCLUDED.status,
                   success = EXCLUDED.success,
                   result = EXCLUDED.result,
                   error_message = EXCLUDED.error_message,
                   retry_count = EXCLUDED.retry_count,
                   instance_id = EXCLUDED.instance_id,
                   processing_started_at = EXCLUDED.processing_started_at,
                   created_at = EXCLUDED.created_at,
                   updated_at = EXCLUDED.updated_at,
                   expires_at = EXCLUDED.expires_at
            "#,
        )
        .bind(&r.key)
        .bind(&r.operation_type)
        .bind(&r.user_id)
        .bind(&r.request_hash)
        .bind(r.status.as_str())
        .bind(r.status.success_flag())
        .bind(&r.result)
        .bind(&r.error)
        .bind(r.retry_count as i32)
        .bind(&r.instance_id)
        .bind(r.processing_started_at)
        .bind(r.created_at)
        .bind(r.updated_at)
        .bind(r.expires_at)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl IdempotencyStore for PgIdempotencyStore {
    fn backend(&self) -> &'static str {
        "postgres"
    }

    async fn is_available(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }

    async fn try_claim(
        &self,
        req: &ClaimRequest,
        policy: &ClaimPolicy,
        instance_id: &str,
    ) -> Result<ClaimOutcome> {
        let mut tx = self.pool.begin().await?;
        Self::lock_key(&mut tx, &req.key).await?;
        let now = Utc::now();

        let outcome = match Self::fetch(&mut tx, &req.key).await? {
            None => {
                let record = IdempotencyRecord::processing(req, policy, instance_id, now);
                Self::upsert(&mut tx, &record).await?;
                ClaimOutcome::Claimed {
                    record,
                    reclaimed: false,
                }
            }
            Some(existing) => match evaluate_existing(&existing, req, policy, instance_id, now) {
                ClaimDecision::Outcome(outcome) => outcome,
                ClaimDecision::Reclaim(record) => {
                    Self::upsert(&mut tx, &record).await?;
                    ClaimOutcome::Claimed {
                        record,
                        reclaimed: true,
                    }
                }
            },
        };

        tx.commit().await?;
        Ok(outcome)
    }

    async fn finish(&self, key: &str, finish: Finish, ttl: Duration) -> Result<IdempotencyRecord> {
        let mut tx = self.pool.begin().await?;
        Self::lock_key(&mut tx, key).await?;

        let Some(record) = Self::fetch(&mut tx, key).await? else {
            return Err(CoreError::NotProcessing {
                key: key.to_string(),
                status: "missing".to_string(),
            });
        };
        let now = Utc::now();
        let status = record.effective_status(now);
        if status != IdempotencyStatus::Processing {
            return Err(CoreError::NotProcessing {
                key: key.to_string(),
                status: status.to_string(),
            });
        }

        let updated = record.finished(&finish, ttl, now);
        Self::upsert(&mut tx, &updated).await?;
        tx.commit().await?;
        Ok(updated)
    }

    async fn get(&self, key: &str) -> Result<Option<IdempotencyRecord>> {
        let row = sqlx::query(SELECT_RECORD)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        let now = Utc::now();
        Ok(row
            .map(|r| Self::row_to_record(&r))
            .transpose()?
            .filter(|r| !r.is_expired(now)))
    }

    async fn purge_expired(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM idempotency_keys_tb WHERE expires_at <= NOW()")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

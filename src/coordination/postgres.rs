//! PostgreSQL-backed coordination store
//!
//! Uses `coordination_kv_tb` (see `db::schema`). Expiry is evaluated against
//! the database clock so all instances agree on it. Conditional writes are
//! single statements, so each is atomic without an explicit transaction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use std::time::Duration;

use super::pattern::KeyPattern;
use super::{CoordinationStore, KeyTtl};
use crate::error::{CoreError, Result};

pub struct PgCoordinationStore {
    pool: PgPool,
}

fn ttl_ms(ttl: Option<Duration>) -> Option<i64> {
    ttl.map(|t| t.as_millis().min(i64::MAX as u128) as i64)
}

/// Connection-level failures are outages; everything else is a database error
fn map_err(e: sqlx::Error) -> CoreError {
    match e {
        sqlx::Error::Io(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::Tls(_) => CoreError::StoreUnavailable(e.to_string()),
        other => CoreError::from(other),
    }
}

impl PgCoordinationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CoordinationStore for PgCoordinationStore {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(map_err)?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let value = sqlx::query_scalar::<_, String>(
            r#"
            SELECT value FROM coordination_kv_tb
            WHERE key = $1 AND (expires_at IS NULL OR expires_at > NOW())
            "#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_err)?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO coordination_kv_tb (key, value, expires_at, updated_at)
            VALUES ($1, $2, NOW() + make_interval(secs => $3::float8 / 1000.0), NOW())
            ON CONFLICT (key) DO UPDATE
               SET value = EXCLUDED.value,
                   expires_at = EXCLUDED.expires_at,
                   updated_at = NOW()
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(ttl_ms(ttl))
        .execute(&self.pool)
        .await
        .map_err(map_err)?;
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<bool> {
        // An expired row counts as absent and is overwritten in place
        let result = sqlx::query(
            r#"
            INSERT INTO coordination_kv_tb (key, value, expires_at, updated_at)
            VALUES ($1, $2, NOW() + make_interval(secs => $3::float8 / 1000.0), NOW())
            ON CONFLICT (key) DO UPDATE
               SET value = EXCLUDED.value,
                   expires_at = EXCLUDED.expires_at,
                   updated_at = NOW()
             WHERE coordination_kv_tb.expires_at IS NOT NULL
               AND coordination_kv_tb.expires_at <= NOW()
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(ttl_ms(ttl))
        .execute(&self.pool)
        .await
        .map_err(map_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE coordination_kv_tb
               SET value = $3,
                   expires_at = NOW() + make_interval(secs => $4::float8 / 1000.0),
                   updated_at = NOW()
             WHERE key = $1 AND value = $2
               AND (expires_at IS NULL OR expires_at > NOW())
            "#,
        )
        .bind(key)
        .bind(expected)
        .bind(value)
        .bind(ttl_ms(ttl))
        .execute(&self.pool)
        .await
        .map_err(map_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            DELETE FROM coordination_kv_tb
             WHERE key = $1 AND (expires_at IS NULL OR expires_at > NOW())
            "#,
        )
        .bind(key)
        .execute(&self.pool)
        .await
        .map_err(map_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            DELETE FROM coordination_kv_tb
             WHERE key = $1 AND value = $2
               AND (expires_at IS NULL OR expires_at > NOW())
            "#,
        )
        .bind(key)
        .bind(expected)
        .execute(&self.pool)
        .await
        .map_err(map_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE coordination_kv_tb
               SET expires_at = NOW() + make_interval(secs => $2::float8 / 1000.0),
                   updated_at = NOW()
             WHERE key = $1 AND (expires_at IS NULL OR expires_at > NOW())
            "#,
        )
        .bind(key)
        .bind(ttl_ms(Some(ttl)))
        .execute(&self.pool)
        .await
        .map_err(map_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn ttl(&self, key: &str) -> Result<KeyTtl> {
        let row = sqlx::query(
            r#"
            SELECT expires_at, NOW() AS now FROM coordination_kv_tb
             WHERE key = $1 AND (expires_at IS NULL OR expires_at > NOW())
            "#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_err)?;

        let Some(row) = row else {
            return Ok(KeyTtl::Missing);
        };
        let expires_at: Option<DateTime<Utc>> = row.get("expires_at");
        let now: DateTime<Utc> = row.get("now");
        Ok(match expires_at {
            None => KeyTtl::Persistent,
            Some(at) => KeyTtl::Expires((at - now).to_std().unwrap_or(Duration::ZERO)),
        })
    }

    async fn scan(&self, pattern: &str, limit: usize) -> Result<Vec<String>> {
        let like = KeyPattern::new(pattern)?.to_sql_like();
        let keys = sqlx::query_scalar::<_, String>(
            r#"
            SELECT key FROM coordination_kv_tb
             WHERE key LIKE $1 ESCAPE '\'
               AND (expires_at IS NULL OR expires_at > NOW())
             ORDER BY key
             LIMIT $2
            "#,
        )
        .bind(like)
        .bind(limit.min(i64::MAX as usize) as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(map_err)?;
        Ok(keys)
    }

    async fn purge_expired(&self) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM coordination_kv_tb WHERE expires_at IS NOT NULL AND expires_at <= NOW()",
        )
        .execute(&self.pool)
        .await
        .map_err(map_err)?;
        Ok(result.rows_affected())
    }
}

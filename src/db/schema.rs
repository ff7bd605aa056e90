//! PostgreSQL schema for the coordination core
//!
//! Coordinated entity tables are owned by the business handlers; the core only
//! requires `version` and `updated_at` on them. The tables below are owned by
//! the core itself.

use sqlx::PgPool;

use crate::error::Result;

/// Relational fallback for idempotency records
pub const CREATE_IDEMPOTENCY_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS idempotency_keys_tb (
    id               BIGSERIAL PRIMARY KEY,
    operation_key    TEXT NOT NULL,
    operation_type   TEXT NOT NULL,
    user_id          TEXT,
    request_hash     TEXT NOT NULL,
    status           TEXT NOT NULL,
    success          BOOLEAN,
    result           JSONB,
    error_message    TEXT,
    retry_count      INTEGER NOT NULL DEFAULT 0,
    instance_id      TEXT,
    processing_started_at TIMESTAMPTZ,
    created_at       TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at       TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    expires_at       TIMESTAMPTZ NOT NULL,
    CONSTRAINT idempotency_keys_operation_key_uq UNIQUE (operation_key)
)
"#;

pub const CREATE_IDEMPOTENCY_EXPIRY_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idempotency_keys_expires_at_idx
    ON idempotency_keys_tb (expires_at)
"#;

/// Key/value table backing the PostgreSQL coordination store
pub const CREATE_COORDINATION_KV_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS coordination_kv_tb (
    key         TEXT PRIMARY KEY,
    value       TEXT NOT NULL,
    expires_at  TIMESTAMPTZ,
    updated_at  TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

pub const CREATE_COORDINATION_EXPIRY_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS coordination_kv_expires_at_idx
    ON coordination_kv_tb (expires_at)
    WHERE expires_at IS NOT NULL
"#;

/// Reference layout for a coordinated entity table
pub fn entity_table_ddl(table: &str, id_column: &str, state_column: &str) -> String {
    format!(
        r#"
CREATE TABLE IF NOT EXISTS {table} (
    {id_column}     TEXT PRIMARY KEY,
    {state_column}  TEXT NOT NULL,
    version         INTEGER NOT NULL DEFAULT 1,
    attributes      JSONB NOT NULL DEFAULT '{{}}'::jsonb,
    created_at      TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at      TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#
    )
}

/// Apply the core-owned DDL (idempotent)
pub async fn ensure_schema(pool: &PgPool) -> Result<()> {
    tracing::info!("Ensuring coordination schema...");

    for ddl in [
        CREATE_IDEMPOTENCY_TABLE,
        CREATE_IDEMPOTENCY_EXPIRY_INDEX,
        CREATE_COORDINATION_KV_TABLE,
        CREATE_COORDINATION_EXPIRY_INDEX,
    ] {
        sqlx::query(ddl).execute(pool).await?;
    }

    tracing::info!("Coordination schema ready");
    Ok(())
}

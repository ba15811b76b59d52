//! PostgreSQL [`PolicyStore`] built on an `sqlx` pool.
//!
//! Expected schema (provisioned outside the gateway):
//!
//! ```sql
//! CREATE TABLE blocked_ips (
//!     ip_address    TEXT PRIMARY KEY,
//!     reason        TEXT NOT NULL,
//!     blocked_at    TIMESTAMPTZ NOT NULL DEFAULT NOW(),
//!     blocked_until TIMESTAMPTZ,
//!     is_permanent  BOOLEAN NOT NULL DEFAULT FALSE,
//!     created_by    TEXT NOT NULL
//! );
//! CREATE INDEX idx_blocked_ips_blocked_at ON blocked_ips (blocked_at DESC);
//!
//! CREATE TABLE system_config (
//!     config_key   TEXT PRIMARY KEY,
//!     config_value TEXT NOT NULL
//! );
//! ```
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Pool, Postgres, postgres::PgPoolOptions};

use crate::ports::{
    counter_store::{StoreError, StoreResult},
    policy_store::{BlockRecord, NewBlock, PolicyStore},
};

#[derive(Debug, Clone, sqlx::FromRow)]
struct BlockRow {
    ip_address: String,
    reason: String,
    blocked_at: DateTime<Utc>,
    blocked_until: Option<DateTime<Utc>>,
    is_permanent: bool,
    created_by: String,
}

impl From<BlockRow> for BlockRecord {
    fn from(row: BlockRow) -> Self {
        Self {
            ip: row.ip_address,
            reason: row.reason,
            blocked_at: row.blocked_at,
            blocked_until: row.blocked_until,
            is_permanent: row.is_permanent,
            created_by: row.created_by,
        }
    }
}

fn database_error(e: sqlx::Error) -> StoreError {
    StoreError::Backend(format!("postgres: {e}"))
}

pub struct PgPolicyStore {
    pool: Pool<Postgres>,
}

impl PgPolicyStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .idle_timeout(Some(Duration::from_secs(300)))
            .connect(database_url)
            .await
            .map_err(database_error)?;
        tracing::info!("Connected to PostgreSQL policy store");
        Ok(Self { pool })
    }

    /// Wrap an existing pool, e.g. one shared with other components.
    pub fn from_pool(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PolicyStore for PgPolicyStore {
    async fn get_block(&self, ip: &str) -> StoreResult<Option<BlockRecord>> {
        let row = sqlx::query_as::<_, BlockRow>(
            r#"
            SELECT ip_address, reason, blocked_at, blocked_until, is_permanent, created_by
            FROM blocked_ips
            WHERE ip_address = $1
            "#,
        )
        .bind(ip)
        .fetch_optional(&self.pool)
        .await
        .map_err(database_error)?;

        Ok(row.map(BlockRecord::from))
    }

    async fn upsert_block(&self, block: NewBlock) -> StoreResult<BlockRecord> {
        let row = sqlx::query_as::<_, BlockRow>(
            r#"
            INSERT INTO blocked_ips (ip_address, reason, blocked_until, is_permanent, created_by, blocked_at)
            VALUES ($1, $2, $3, $4, $5, NOW())
            ON CONFLICT (ip_address) DO UPDATE SET
                reason = EXCLUDED.reason,
                blocked_until = EXCLUDED.blocked_until,
                is_permanent = EXCLUDED.is_permanent,
                created_by = EXCLUDED.created_by,
                blocked_at = NOW()
            RETURNING ip_address, reason, blocked_at, blocked_until, is_permanent, created_by
            "#,
        )
        .bind(&block.ip)
        .bind(&block.reason)
        .bind(block.blocked_until)
        .bind(block.is_permanent)
        .bind(&block.created_by)
        .fetch_one(&self.pool)
        .await
        .map_err(database_error)?;

        Ok(row.into())
    }

    async fn list_blocks(&self, limit: usize) -> StoreResult<Vec<BlockRecord>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = sqlx::query_as::<_, BlockRow>(
            r#"
            SELECT ip_address, reason, blocked_at, blocked_until, is_permanent, created_by
            FROM blocked_ips
            ORDER BY blocked_at DESC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(database_error)?;

        Ok(rows.into_iter().map(BlockRecord::from).collect())
    }

    async fn delete_block(&self, ip: &str) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM blocked_ips WHERE ip_address = $1")
            .bind(ip)
            .execute(&self.pool)
            .await
            .map_err(database_error)?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_config_value(&self, key: &str) -> StoreResult<Option<String>> {
        sqlx::query_scalar::<_, String>(
            "SELECT config_value FROM system_config WHERE config_key = $1",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(database_error)
    }

    async fn close(&self) {
        tracing::info!("Closing PostgreSQL policy store pool");
        self.pool.close().await;
    }
}

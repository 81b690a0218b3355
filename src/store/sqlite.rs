//! SQLite-backed ledger store.
//!
//! One table holds every chain; rows are keyed by `(chain_id, sort_key)` so
//! that a most-recent-first read is an index range scan.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tracing::{debug, info};

use super::{LedgerStore, SortKey, StoreError};
use crate::audit::SignedEntry;

#[derive(Clone)]
pub struct SqliteLedgerStore {
    pool: SqlitePool,
    chain_id: String,
}

impl SqliteLedgerStore {
    /// Connect to `database_url`, creating the database file if needed
    pub async fn connect(database_url: &str, chain_id: impl Into<String>) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self::with_pool(pool, chain_id);
        store.run_migrations().await?;
        info!(database_url = %database_url, chain_id = %store.chain_id, "ledger store connected");
        Ok(store)
    }

    /// Private in-memory database; a single connection keeps it alive
    pub async fn in_memory(chain_id: impl Into<String>) -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;

        let store = Self::with_pool(pool, chain_id);
        store.run_migrations().await?;
        Ok(store)
    }

    /// Share an existing pool; each chain only sees its own rows
    pub fn with_pool(pool: SqlitePool, chain_id: impl Into<String>) -> Self {
        Self {
            pool,
            chain_id: chain_id.into(),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn chain_id(&self) -> &str {
        &self.chain_id
    }

    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        sqlx::query(include_str!("migrations/001_ledger_entries.sql"))
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for SqliteLedgerStore {
    async fn append_entry(&self, entry: &SignedEntry) -> Result<(), StoreError> {
        let key = SortKey::for_entry(entry);
        let body = serde_json::to_string(entry)
            .map_err(|e| StoreError::Corrupt(format!("failed to encode entry: {}", e)))?;

        sqlx::query(
            r#"
            INSERT INTO ledger_entries (chain_id, sort_key, entry_hash, recorded_at, body)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT (chain_id, sort_key) DO UPDATE SET
                entry_hash = excluded.entry_hash,
                recorded_at = excluded.recorded_at,
                body = excluded.body
            "#,
        )
        .bind(&self.chain_id)
        .bind(key.as_str())
        .bind(entry.entry_hash())
        .bind(entry.timestamp().to_rfc3339())
        .bind(body)
        .execute(&self.pool)
        .await?;

        debug!(chain_id = %self.chain_id, sort_key = %key.as_str(), "entry row written");
        Ok(())
    }

    async fn read_range(
        &self,
        limit: usize,
        start_time: Option<DateTime<Utc>>,
    ) -> Result<Vec<SignedEntry>, StoreError> {
        let start = start_time
            .map(|ts| SortKey::scan_start(ts).as_str().to_string())
            .unwrap_or_default();
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        let rows = sqlx::query(
            r#"
            SELECT body FROM ledger_entries
            WHERE chain_id = ?1 AND sort_key >= ?2
            ORDER BY sort_key ASC
            LIMIT ?3
            "#,
        )
        .bind(&self.chain_id)
        .bind(start)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let body: String = row.try_get("body")?;
                serde_json::from_str(&body)
                    .map_err(|e| StoreError::Corrupt(format!("failed to decode entry: {}", e)))
            })
            .collect()
    }
}

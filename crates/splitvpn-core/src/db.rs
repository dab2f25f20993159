//! Stats/key-value database (SPEC_FULL.md §4.9).
//!
//! Grounded in `wirewarden-api::db::{create_pool, migrate}`; same shape,
//! `PgPool`→`SqlitePool` because spec §6 names a single-file `stats.db`.

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use thiserror::Error;

use splitvpn_types::{Categorized, ErrorCategory};

#[derive(Debug, Error)]
pub enum DbError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Categorized for DbError {
    fn category(&self) -> ErrorCategory {
        ErrorCategory::Internal
    }
}

pub async fn create_pool(db_path: &std::path::Path) -> Result<SqlitePool, DbError> {
    if let Some(parent) = db_path.parent() {
        let _ = tokio::fs::create_dir_all(parent).await;
    }
    let url = format!("sqlite://{}?mode=rwc", db_path.display());
    let pool = SqlitePoolOptions::new().max_connections(4).connect(&url).await?;
    Ok(pool)
}

pub async fn migrate(pool: &SqlitePool) -> Result<(), DbError> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS stats_history (
            interface TEXT NOT NULL,
            timestamp INTEGER NOT NULL,
            rx_bytes INTEGER NOT NULL,
            tx_bytes INTEGER NOT NULL
        )",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_stats_history_iface_ts
            ON stats_history(interface, timestamp)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS kv_store (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )",
    )
    .execute(pool)
    .await?;
    Ok(())
}

/// One persisted stats sample row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StatsHistoryRow {
    pub interface: String,
    pub timestamp: i64,
    pub rx_bytes: i64,
    pub tx_bytes: i64,
}

pub async fn insert_stats_sample(
    pool: &SqlitePool,
    interface: &str,
    at: DateTime<Utc>,
    rx_bytes: u64,
    tx_bytes: u64,
) -> Result<(), DbError> {
    sqlx::query("INSERT INTO stats_history (interface, timestamp, rx_bytes, tx_bytes) VALUES (?, ?, ?, ?)")
        .bind(interface)
        .bind(at.timestamp())
        .bind(rx_bytes as i64)
        .bind(tx_bytes as i64)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn load_recent_stats(
    pool: &SqlitePool,
    interface: &str,
    limit: i64,
) -> Result<Vec<StatsHistoryRow>, DbError> {
    let mut rows: Vec<StatsHistoryRow> = sqlx::query_as(
        "SELECT interface, timestamp, rx_bytes, tx_bytes FROM stats_history
            WHERE interface = ? ORDER BY timestamp DESC LIMIT ?",
    )
    .bind(interface)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    rows.reverse();
    Ok(rows)
}

/// Generic JSON-valued key-value accessor, used to persist the resolver
/// cache and flow-inspector diagnostics across restarts (spec §3: "Cache is
/// persisted and survives restarts").
pub async fn kv_get<T: serde::de::DeserializeOwned>(
    pool: &SqlitePool,
    key: &str,
) -> Result<Option<T>, DbError> {
    let row: Option<(String,)> = sqlx::query_as("SELECT value FROM kv_store WHERE key = ?")
        .bind(key)
        .fetch_optional(pool)
        .await?;
    match row {
        Some((value,)) => Ok(Some(serde_json::from_str(&value)?)),
        None => Ok(None),
    }
}

pub async fn kv_put<T: serde::Serialize>(
    pool: &SqlitePool,
    key: &str,
    value: &T,
) -> Result<(), DbError> {
    let json = serde_json::to_string(value)?;
    sqlx::query(
        "INSERT INTO kv_store (key, value) VALUES (?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value",
    )
    .bind(key)
    .bind(json)
    .execute(pool)
    .await?;
    Ok(())
}

#[cfg(test)]
pub(crate) async fn test_pool() -> SqlitePool {
    // A single connection: sqlite's `:memory:` database is per-connection,
    // so a multi-connection pool would silently scatter state across
    // independent empty databases.
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    migrate(&pool).await.unwrap();
    pool
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn kv_round_trips_and_overwrites() {
        let pool = test_pool().await;
        assert_eq!(kv_get::<Vec<String>>(&pool, "missing").await.unwrap(), None);

        kv_put(&pool, "names", &vec!["a".to_string(), "b".to_string()])
            .await
            .unwrap();
        assert_eq!(
            kv_get::<Vec<String>>(&pool, "names").await.unwrap(),
            Some(vec!["a".to_string(), "b".to_string()])
        );

        kv_put(&pool, "names", &vec!["c".to_string()]).await.unwrap();
        assert_eq!(
            kv_get::<Vec<String>>(&pool, "names").await.unwrap(),
            Some(vec!["c".to_string()])
        );
    }

    #[tokio::test]
    async fn stats_history_insert_and_load_recent() {
        let pool = test_pool().await;
        let now = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        for i in 0..5u64 {
            insert_stats_sample(&pool, "eth0", now + chrono::Duration::seconds(i as i64), 100 + i, 200 + i)
                .await
                .unwrap();
        }

        let rows = load_recent_stats(&pool, "eth0", 3).await.unwrap();
        assert_eq!(rows.len(), 3);
        // oldest-first within the returned window
        assert!(rows[0].timestamp < rows[1].timestamp);
        assert_eq!(rows.last().unwrap().rx_bytes, 104);
    }
}

//! Database module for SQLite persistence
//!
//! Backs the deduplication index, durable session state, and the append-only
//! sync history.

mod files;
mod history;
mod runs;
mod schema;
mod sessions;

pub use files::*;
pub use history::*;
pub use runs::*;
pub use schema::*;
pub use sessions::*;

use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};

use crate::error::{AppError, Result};

/// Create a new database connection pool
pub async fn create_pool(database_url: &str) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(database_url)?;
    connect(options).await
}

/// Create a pool for a database file, creating it if needed
pub async fn create_pool_at(path: &Path) -> Result<SqlitePool> {
    connect(SqliteConnectOptions::new().filename(path)).await
}

async fn connect(options: SqliteConnectOptions) -> Result<SqlitePool> {
    let options = options
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
        .busy_timeout(std::time::Duration::from_secs(10));

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    initialize_schema(&pool).await?;

    Ok(pool)
}

/// Fixed-width RFC 3339 so stored timestamps compare lexicographically
pub(crate) fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| AppError::Internal(format!("Bad timestamp '{}': {}", value, e)))
}

pub(crate) fn parse_opt_ts(value: Option<&str>) -> Result<Option<DateTime<Utc>>> {
    value.map(parse_ts).transpose()
}

#[cfg(test)]
pub(crate) async fn test_pool() -> (SqlitePool, tempfile::TempDir) {
    let dir = tempfile::TempDir::new().unwrap();
    let pool = create_pool_at(&dir.path().join("test.db")).await.unwrap();
    (pool, dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_roundtrip_and_ordering() {
        let earlier = Utc::now();
        let later = earlier + chrono::Duration::milliseconds(1500);

        let a = format_ts(earlier);
        let b = format_ts(later);
        assert!(a < b);
        assert_eq!(a.len(), b.len());
        assert_eq!(parse_ts(&a).unwrap().timestamp_micros(), earlier.timestamp_micros());
    }

    #[tokio::test]
    async fn test_create_pool_initializes_schema() {
        let (pool, _dir) = test_pool().await;
        let tables: Vec<(String,)> = sqlx::query_as(
            "SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name",
        )
        .fetch_all(&pool)
        .await
        .unwrap();
        let names: Vec<&str> = tables.iter().map(|(n,)| n.as_str()).collect();

        for expected in [
            "backup_runs",
            "encrypted_artifacts",
            "file_records",
            "sync_history",
            "upload_sessions",
        ] {
            assert!(names.contains(&expected), "missing table {expected}");
        }
    }
}

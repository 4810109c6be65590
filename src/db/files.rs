//! File record database operations

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

use super::{format_ts, parse_opt_ts, parse_ts};
use crate::error::{AppError, Result};
use crate::hasher::{FastKey, Fingerprint};

/// A stored, deduplicated file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    pub fingerprint: Fingerprint,
    /// Relative to the archive root, `/`-separated
    pub storage_path: String,
    pub original_name: String,
    pub size: u64,
    pub mime_type: String,
    pub captured_at: Option<DateTime<Utc>>,
    pub ingested_at: DateTime<Utc>,
    pub source_device: Option<String>,
    pub fast_key: Option<FastKey>,
}

#[derive(sqlx::FromRow)]
struct FileRecordRow {
    fingerprint: String,
    storage_path: String,
    original_name: String,
    size: i64,
    mime_type: String,
    captured_at: Option<String>,
    ingested_at: String,
    source_device: Option<String>,
    fast_key: Option<String>,
}

impl TryFrom<FileRecordRow> for FileRecord {
    type Error = AppError;

    fn try_from(row: FileRecordRow) -> Result<Self> {
        Ok(FileRecord {
            fingerprint: row
                .fingerprint
                .parse()
                .map_err(|e: crate::hasher::FingerprintParseError| AppError::Internal(e.to_string()))?,
            storage_path: row.storage_path,
            original_name: row.original_name,
            size: row.size as u64,
            mime_type: row.mime_type,
            captured_at: parse_opt_ts(row.captured_at.as_deref())?,
            ingested_at: parse_ts(&row.ingested_at)?,
            source_device: row.source_device,
            fast_key: row.fast_key.map(FastKey::from),
        })
    }
}

/// Result of an atomic insert attempt
#[derive(Debug, Clone)]
pub enum InsertOutcome {
    /// This caller's record won
    Inserted(FileRecord),
    /// Another caller stored the same content first
    AlreadyExists(FileRecord),
    /// The storage path belongs to different content
    PathTaken,
}

const SELECT_COLUMNS: &str = "SELECT fingerprint, storage_path, original_name, size, mime_type, \
     captured_at, ingested_at, source_device, fast_key FROM file_records";

/// File record repository
pub struct FileRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> FileRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Get a record by fingerprint
    pub async fn get(&self, fingerprint: &Fingerprint) -> Result<Option<FileRecord>> {
        let row = sqlx::query_as::<_, FileRecordRow>(&format!(
            "{SELECT_COLUMNS} WHERE fingerprint = ?"
        ))
        .bind(fingerprint.to_hex())
        .fetch_optional(self.pool)
        .await?;

        row.map(FileRecord::try_from).transpose()
    }

    /// Insert unless the fingerprint already exists.
    ///
    /// A single statement against the unique fingerprint column, so concurrent
    /// callers with the same content see exactly one `Inserted`.
    pub async fn insert_if_absent(&self, record: &FileRecord) -> Result<InsertOutcome> {
        let result = sqlx::query(
            r#"
            INSERT INTO file_records (
                fingerprint, storage_path, original_name, size, mime_type,
                captured_at, ingested_at, source_device, fast_key
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(fingerprint) DO NOTHING
            "#,
        )
        .bind(record.fingerprint.to_hex())
        .bind(&record.storage_path)
        .bind(&record.original_name)
        .bind(record.size as i64)
        .bind(&record.mime_type)
        .bind(record.captured_at.map(format_ts))
        .bind(format_ts(record.ingested_at))
        .bind(&record.source_device)
        .bind(record.fast_key.as_ref().map(|k| k.as_str().to_string()))
        .execute(self.pool)
        .await;

        match result {
            Ok(done) if done.rows_affected() == 1 => Ok(InsertOutcome::Inserted(record.clone())),
            Ok(_) => self
                .get(&record.fingerprint)
                .await?
                .map(InsertOutcome::AlreadyExists)
                .ok_or_else(|| {
                    AppError::Internal(format!(
                        "Insert of {} conflicted but no row exists",
                        record.fingerprint
                    ))
                }),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Ok(InsertOutcome::PathTaken)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Whether any record claims the storage path
    pub async fn path_taken(&self, storage_path: &str) -> Result<bool> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT 1 FROM file_records WHERE storage_path = ?")
                .bind(storage_path)
                .fetch_optional(self.pool)
                .await?;
        Ok(row.is_some())
    }

    /// Records whose sampled fast key matches
    pub async fn find_by_fast_key(&self, key: &FastKey) -> Result<Vec<FileRecord>> {
        let rows = sqlx::query_as::<_, FileRecordRow>(&format!(
            "{SELECT_COLUMNS} WHERE fast_key = ?"
        ))
        .bind(key.as_str())
        .fetch_all(self.pool)
        .await?;

        rows.into_iter().map(FileRecord::try_from).collect()
    }

    /// Remove a record; only used to release a claim whose placement failed
    pub async fn delete(&self, fingerprint: &Fingerprint) -> Result<bool> {
        let result = sqlx::query("DELETE FROM file_records WHERE fingerprint = ?")
            .bind(fingerprint.to_hex())
            .execute(self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Most recently ingested records
    pub async fn list_recent(&self, limit: i64) -> Result<Vec<FileRecord>> {
        let rows = sqlx::query_as::<_, FileRecordRow>(&format!(
            "{SELECT_COLUMNS} ORDER BY ingested_at DESC LIMIT ?"
        ))
        .bind(limit)
        .fetch_all(self.pool)
        .await?;

        rows.into_iter().map(FileRecord::try_from).collect()
    }

    pub async fn count(&self) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM file_records")
            .fetch_one(self.pool)
            .await?;
        Ok(count)
    }

    pub async fn total_size(&self) -> Result<i64> {
        let (total,): (i64,) = sqlx::query_as("SELECT COALESCE(SUM(size), 0) FROM file_records")
            .fetch_one(self.pool)
            .await?;
        Ok(total)
    }

    /// Append an encryption post-step output
    pub async fn record_encrypted(&self, fingerprint: &Fingerprint, path: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO encrypted_artifacts (fingerprint, encrypted_path, created_at) VALUES (?, ?, ?)",
        )
        .bind(fingerprint.to_hex())
        .bind(path)
        .bind(format_ts(Utc::now()))
        .execute(self.pool)
        .await?;
        Ok(())
    }

    pub async fn encrypted_paths(&self, fingerprint: &Fingerprint) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT encrypted_path FROM encrypted_artifacts WHERE fingerprint = ? ORDER BY id",
        )
        .bind(fingerprint.to_hex())
        .fetch_all(self.pool)
        .await?;
        Ok(rows.into_iter().map(|(p,)| p).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;
    use crate::hasher::fingerprint_bytes;

    fn record(content: &[u8], path: &str) -> FileRecord {
        FileRecord {
            fingerprint: fingerprint_bytes(content),
            storage_path: path.to_string(),
            original_name: path.rsplit('/').next().unwrap_or(path).to_string(),
            size: content.len() as u64,
            mime_type: "image/jpeg".to_string(),
            captured_at: None,
            ingested_at: Utc::now(),
            source_device: Some("iphone-1".to_string()),
            fast_key: Some(FastKey::from("abc".to_string())),
        }
    }

    #[tokio::test]
    async fn test_insert_then_lookup() {
        let (pool, _dir) = test_pool().await;
        let repo = FileRepository::new(&pool);
        let rec = record(b"photo", "2024/01_January/a.jpg");

        assert!(matches!(
            repo.insert_if_absent(&rec).await.unwrap(),
            InsertOutcome::Inserted(_)
        ));

        let found = repo.get(&rec.fingerprint).await.unwrap().unwrap();
        assert_eq!(found.storage_path, rec.storage_path);
        assert_eq!(found.source_device.as_deref(), Some("iphone-1"));
        assert_eq!(repo.count().await.unwrap(), 1);
        assert_eq!(repo.total_size().await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_second_insert_returns_winner() {
        let (pool, _dir) = test_pool().await;
        let repo = FileRepository::new(&pool);
        let first = record(b"same", "2024/01_January/a.jpg");
        let second = record(b"same", "2024/01_January/b.jpg");

        repo.insert_if_absent(&first).await.unwrap();
        match repo.insert_if_absent(&second).await.unwrap() {
            InsertOutcome::AlreadyExists(existing) => {
                assert_eq!(existing.storage_path, "2024/01_January/a.jpg")
            }
            other => panic!("expected AlreadyExists, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_path_conflict_is_reported() {
        let (pool, _dir) = test_pool().await;
        let repo = FileRepository::new(&pool);
        repo.insert_if_absent(&record(b"one", "2024/01_January/a.jpg"))
            .await
            .unwrap();

        let clash = record(b"two", "2024/01_January/a.jpg");
        assert!(matches!(
            repo.insert_if_absent(&clash).await.unwrap(),
            InsertOutcome::PathTaken
        ));
        assert!(repo.path_taken("2024/01_January/a.jpg").await.unwrap());
    }

    #[tokio::test]
    async fn test_fast_key_lookup_and_delete() {
        let (pool, _dir) = test_pool().await;
        let repo = FileRepository::new(&pool);
        let rec = record(b"x", "x.jpg");
        repo.insert_if_absent(&rec).await.unwrap();

        let hits = repo
            .find_by_fast_key(&FastKey::from("abc".to_string()))
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);

        assert!(repo.delete(&rec.fingerprint).await.unwrap());
        assert!(repo.get(&rec.fingerprint).await.unwrap().is_none());
    }
}

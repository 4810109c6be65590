//! Backup run database operations

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use uuid::Uuid;

use super::{format_ts, parse_opt_ts, parse_ts};
use crate::error::{AppError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    /// Every file stored or skipped as duplicate
    Success,
    /// Some files failed
    Partial,
    /// Every file failed
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Partial => "partial",
            RunStatus::Failed => "failed",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        match s {
            "running" => Ok(RunStatus::Running),
            "success" => Ok(RunStatus::Success),
            "partial" => Ok(RunStatus::Partial),
            "failed" => Ok(RunStatus::Failed),
            other => Err(AppError::Internal(format!("Unknown run status: {other}"))),
        }
    }
}

/// One batch submission and its totals
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupRun {
    pub id: String,
    pub source_device: Option<String>,
    pub status: RunStatus,
    pub files_processed: i64,
    pub files_backed_up: i64,
    pub files_skipped: i64,
    pub files_failed: i64,
    pub total_bytes: i64,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(sqlx::FromRow)]
struct BackupRunRow {
    id: String,
    source_device: Option<String>,
    status: String,
    files_processed: i64,
    files_backed_up: i64,
    files_skipped: i64,
    files_failed: i64,
    total_bytes: i64,
    started_at: String,
    completed_at: Option<String>,
}

impl TryFrom<BackupRunRow> for BackupRun {
    type Error = AppError;

    fn try_from(row: BackupRunRow) -> Result<Self> {
        Ok(BackupRun {
            id: row.id,
            source_device: row.source_device,
            status: RunStatus::parse(&row.status)?,
            files_processed: row.files_processed,
            files_backed_up: row.files_backed_up,
            files_skipped: row.files_skipped,
            files_failed: row.files_failed,
            total_bytes: row.total_bytes,
            started_at: parse_ts(&row.started_at)?,
            completed_at: parse_opt_ts(row.completed_at.as_deref())?,
        })
    }
}

/// Final counters written when a run completes
#[derive(Debug, Clone, Copy, Default)]
pub struct RunTotals {
    pub backed_up: i64,
    pub skipped: i64,
    pub failed: i64,
    pub total_bytes: i64,
}

pub struct RunRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> RunRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Record a new running batch
    pub async fn start(&self, source_device: Option<&str>) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO backup_runs (id, source_device, status, started_at) VALUES (?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(source_device)
        .bind(RunStatus::Running.as_str())
        .bind(format_ts(Utc::now()))
        .execute(self.pool)
        .await?;
        Ok(id)
    }

    pub async fn complete(&self, id: &str, totals: RunTotals) -> Result<()> {
        let status = match (totals.failed, totals.backed_up + totals.skipped) {
            (0, _) => RunStatus::Success,
            (_, 0) => RunStatus::Failed,
            _ => RunStatus::Partial,
        };

        sqlx::query(
            r#"
            UPDATE backup_runs SET
                status = ?,
                files_processed = ?,
                files_backed_up = ?,
                files_skipped = ?,
                files_failed = ?,
                total_bytes = ?,
                completed_at = ?
            WHERE id = ?
            "#,
        )
        .bind(status.as_str())
        .bind(totals.backed_up + totals.skipped + totals.failed)
        .bind(totals.backed_up)
        .bind(totals.skipped)
        .bind(totals.failed)
        .bind(totals.total_bytes)
        .bind(format_ts(Utc::now()))
        .bind(id)
        .execute(self.pool)
        .await?;
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Option<BackupRun>> {
        let row = sqlx::query_as::<_, BackupRunRow>(
            r#"
            SELECT id, source_device, status, files_processed, files_backed_up,
                   files_skipped, files_failed, total_bytes, started_at, completed_at
            FROM backup_runs WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(self.pool)
        .await?;

        row.map(BackupRun::try_from).transpose()
    }

    pub async fn list_recent(&self, limit: i64) -> Result<Vec<BackupRun>> {
        let rows = sqlx::query_as::<_, BackupRunRow>(
            r#"
            SELECT id, source_device, status, files_processed, files_backed_up,
                   files_skipped, files_failed, total_bytes, started_at, completed_at
            FROM backup_runs ORDER BY started_at DESC LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(self.pool)
        .await?;

        rows.into_iter().map(BackupRun::try_from).collect()
    }
}

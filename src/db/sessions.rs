//! Upload session persistence
//!
//! Every accepted chunk updates the row, so an open session survives a
//! process restart and resumes from its recorded ranges.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use super::{format_ts, parse_opt_ts, parse_ts};
use crate::error::{AppError, Result};
use crate::upload::{RangeSet, SessionOutcome, SessionState, SessionToken, UploadSession};

#[derive(sqlx::FromRow)]
struct SessionRow {
    token: String,
    file_name: String,
    declared_size: i64,
    chunk_size: i64,
    received_ranges: String,
    state: String,
    captured_at: Option<String>,
    source_device: Option<String>,
    fingerprint: Option<String>,
    outcome: Option<String>,
    storage_path: Option<String>,
    error_message: Option<String>,
    created_at: String,
    last_activity: String,
    expires_at: String,
}

impl TryFrom<SessionRow> for UploadSession {
    type Error = AppError;

    fn try_from(row: SessionRow) -> Result<Self> {
        let received: RangeSet = serde_json::from_str(&row.received_ranges)?;
        Ok(UploadSession {
            token: row
                .token
                .parse()
                .map_err(|_| AppError::Internal(format!("Bad session token: {}", row.token)))?,
            file_name: row.file_name,
            declared_size: row.declared_size as u64,
            chunk_size: row.chunk_size as usize,
            received,
            state: row.state.parse().map_err(AppError::Internal)?,
            created_at: parse_ts(&row.created_at)?,
            last_activity: parse_ts(&row.last_activity)?,
            expires_at: parse_ts(&row.expires_at)?,
            captured_at: parse_opt_ts(row.captured_at.as_deref())?,
            source_device: row.source_device,
            fingerprint: row
                .fingerprint
                .map(|f| f.parse())
                .transpose()
                .map_err(|e: crate::hasher::FingerprintParseError| AppError::Internal(e.to_string()))?,
            outcome: row
                .outcome
                .map(|o| o.parse::<SessionOutcome>())
                .transpose()
                .map_err(AppError::Internal)?,
            storage_path: row.storage_path,
            error_message: row.error_message,
        })
    }
}

const SELECT_COLUMNS: &str = "SELECT token, file_name, declared_size, chunk_size, received_ranges, \
     state, captured_at, source_device, fingerprint, outcome, storage_path, error_message, \
     created_at, last_activity, expires_at FROM upload_sessions";

/// Upload session repository
pub struct SessionRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> SessionRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert or replace the durable copy of a session
    pub async fn save(&self, session: &UploadSession) -> Result<()> {
        let ranges = serde_json::to_string(&session.received)?;

        sqlx::query(
            r#"
            INSERT INTO upload_sessions (
                token, file_name, declared_size, chunk_size, received_ranges, state,
                captured_at, source_device, fingerprint, outcome, storage_path, error_message,
                created_at, last_activity, expires_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(token) DO UPDATE SET
                received_ranges = excluded.received_ranges,
                state = excluded.state,
                fingerprint = excluded.fingerprint,
                outcome = excluded.outcome,
                storage_path = excluded.storage_path,
                error_message = excluded.error_message,
                last_activity = excluded.last_activity,
                expires_at = excluded.expires_at
            "#,
        )
        .bind(session.token.to_string())
        .bind(&session.file_name)
        .bind(session.declared_size as i64)
        .bind(session.chunk_size as i64)
        .bind(&ranges)
        .bind(session.state.as_str())
        .bind(session.captured_at.map(format_ts))
        .bind(&session.source_device)
        .bind(session.fingerprint.map(|f| f.to_hex()))
        .bind(session.outcome.map(|o| o.as_str()))
        .bind(&session.storage_path)
        .bind(&session.error_message)
        .bind(format_ts(session.created_at))
        .bind(format_ts(session.last_activity))
        .bind(format_ts(session.expires_at))
        .execute(self.pool)
        .await?;

        Ok(())
    }

    pub async fn get(&self, token: &SessionToken) -> Result<Option<UploadSession>> {
        let row = sqlx::query_as::<_, SessionRow>(&format!("{SELECT_COLUMNS} WHERE token = ?"))
            .bind(token.to_string())
            .fetch_optional(self.pool)
            .await?;

        row.map(UploadSession::try_from).transpose()
    }

    /// Sessions still accepting work
    pub async fn list_active(&self) -> Result<Vec<UploadSession>> {
        let rows = sqlx::query_as::<_, SessionRow>(&format!(
            "{SELECT_COLUMNS} WHERE state IN ('open', 'assembling') ORDER BY created_at"
        ))
        .fetch_all(self.pool)
        .await?;

        rows.into_iter().map(UploadSession::try_from).collect()
    }

    /// Non-terminal sessions whose deadline passed before `now`
    pub async fn list_stale(&self, now: DateTime<Utc>) -> Result<Vec<SessionToken>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT token FROM upload_sessions WHERE state IN ('open', 'assembling') AND expires_at < ?",
        )
        .bind(format_ts(now))
        .fetch_all(self.pool)
        .await?;

        rows.into_iter()
            .map(|(t,)| {
                t.parse()
                    .map_err(|_| AppError::Internal(format!("Bad session token: {t}")))
            })
            .collect()
    }

    pub async fn count_by_state(&self, state: SessionState) -> Result<i64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM upload_sessions WHERE state = ?")
                .bind(state.as_str())
                .fetch_one(self.pool)
                .await?;
        Ok(count)
    }
}

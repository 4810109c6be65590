//! Sync history: one append-only row per terminal transfer

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

use super::{format_ts, parse_ts};
use crate::error::{AppError, Result};
use crate::hasher::Fingerprint;
use crate::upload::SessionToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryOutcome {
    Stored,
    Duplicate,
    Failed,
    Expired,
}

impl HistoryOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            HistoryOutcome::Stored => "stored",
            HistoryOutcome::Duplicate => "duplicate",
            HistoryOutcome::Failed => "failed",
            HistoryOutcome::Expired => "expired",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        match s {
            "stored" => Ok(HistoryOutcome::Stored),
            "duplicate" => Ok(HistoryOutcome::Duplicate),
            "failed" => Ok(HistoryOutcome::Failed),
            "expired" => Ok(HistoryOutcome::Expired),
            other => Err(AppError::Internal(format!("Unknown history outcome: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub id: i64,
    pub fingerprint: Option<Fingerprint>,
    pub session_token: SessionToken,
    pub outcome: HistoryOutcome,
    pub detail: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct HistoryRow {
    id: i64,
    fingerprint: Option<String>,
    session_token: String,
    outcome: String,
    detail: Option<String>,
    recorded_at: String,
}

impl TryFrom<HistoryRow> for HistoryEntry {
    type Error = AppError;

    fn try_from(row: HistoryRow) -> Result<Self> {
        Ok(HistoryEntry {
            id: row.id,
            fingerprint: row
                .fingerprint
                .map(|f| f.parse())
                .transpose()
                .map_err(|e: crate::hasher::FingerprintParseError| AppError::Internal(e.to_string()))?,
            session_token: row
                .session_token
                .parse()
                .map_err(|_| AppError::Internal(format!("Bad session token: {}", row.session_token)))?,
            outcome: HistoryOutcome::parse(&row.outcome)?,
            detail: row.detail,
            recorded_at: parse_ts(&row.recorded_at)?,
        })
    }
}

/// Totals per outcome
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryTotals {
    pub stored: i64,
    pub duplicate: i64,
    pub failed: i64,
    pub expired: i64,
}

/// History repository; rows are never updated or deleted
pub struct HistoryRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> HistoryRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn append(
        &self,
        session_token: &SessionToken,
        fingerprint: Option<&Fingerprint>,
        outcome: HistoryOutcome,
        detail: Option<&str>,
    ) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO sync_history (fingerprint, session_token, outcome, detail, recorded_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(fingerprint.map(|f| f.to_hex()))
        .bind(session_token.to_string())
        .bind(outcome.as_str())
        .bind(detail)
        .bind(format_ts(Utc::now()))
        .execute(self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// Newest first
    pub async fn list_recent(&self, limit: i64) -> Result<Vec<HistoryEntry>> {
        let rows = sqlx::query_as::<_, HistoryRow>(
            r#"
            SELECT id, fingerprint, session_token, outcome, detail, recorded_at
            FROM sync_history ORDER BY id DESC LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(self.pool)
        .await?;

        rows.into_iter().map(HistoryEntry::try_from).collect()
    }

    pub async fn list_for_session(&self, token: &SessionToken) -> Result<Vec<HistoryEntry>> {
        let rows = sqlx::query_as::<_, HistoryRow>(
            r#"
            SELECT id, fingerprint, session_token, outcome, detail, recorded_at
            FROM sync_history WHERE session_token = ? ORDER BY id
            "#,
        )
        .bind(token.to_string())
        .fetch_all(self.pool)
        .await?;

        rows.into_iter().map(HistoryEntry::try_from).collect()
    }

    pub async fn totals(&self) -> Result<HistoryTotals> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT outcome, COUNT(*) FROM sync_history GROUP BY outcome")
                .fetch_all(self.pool)
                .await?;

        let mut totals = HistoryTotals::default();
        for (outcome, count) in rows {
            match HistoryOutcome::parse(&outcome)? {
                HistoryOutcome::Stored => totals.stored = count,
                HistoryOutcome::Duplicate => totals.duplicate = count,
                HistoryOutcome::Failed => totals.failed = count,
                HistoryOutcome::Expired => totals.expired = count,
            }
        }
        Ok(totals)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;
    use crate::hasher::fingerprint_bytes;

    #[tokio::test]
    async fn test_append_only_log() {
        let (pool, _dir) = test_pool().await;
        let repo = HistoryRepository::new(&pool);
        let token = SessionToken::generate();
        let fp = fingerprint_bytes(b"data");

        repo.append(&token, Some(&fp), HistoryOutcome::Stored, None)
            .await
            .unwrap();
        repo.append(&SessionToken::generate(), Some(&fp), HistoryOutcome::Duplicate, None)
            .await
            .unwrap();
        repo.append(&SessionToken::generate(), None, HistoryOutcome::Expired, Some("idle"))
            .await
            .unwrap();

        let recent = repo.list_recent(10).await.unwrap();
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].outcome, HistoryOutcome::Expired);
        assert_eq!(recent[0].detail.as_deref(), Some("idle"));

        let for_session = repo.list_for_session(&token).await.unwrap();
        assert_eq!(for_session.len(), 1);
        assert_eq!(for_session[0].fingerprint, Some(fp));

        let totals = repo.totals().await.unwrap();
        assert_eq!(
            totals,
            HistoryTotals { stored: 1, duplicate: 1, failed: 0, expired: 1 }
        );
    }
}

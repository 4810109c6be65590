//! Database schema initialization

use sqlx::SqlitePool;

use crate::error::Result;

/// Initialize the database schema
pub async fn initialize_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(SCHEMA_SQL)
        .execute(pool)
        .await?;

    Ok(())
}

const SCHEMA_SQL: &str = r#"
-- Stored files; the unique fingerprint column is the deduplication index
CREATE TABLE IF NOT EXISTS file_records (
    fingerprint TEXT PRIMARY KEY,
    storage_path TEXT NOT NULL UNIQUE,
    original_name TEXT NOT NULL,
    size INTEGER NOT NULL,
    mime_type TEXT NOT NULL,
    captured_at TEXT,
    ingested_at TEXT NOT NULL,
    source_device TEXT,
    fast_key TEXT
);

CREATE INDEX IF NOT EXISTS idx_file_records_fast_key ON file_records(fast_key);
CREATE INDEX IF NOT EXISTS idx_file_records_ingested ON file_records(ingested_at);

-- Upload sessions (durable state behind the in-memory session cache)
CREATE TABLE IF NOT EXISTS upload_sessions (
    token TEXT PRIMARY KEY,
    file_name TEXT NOT NULL,
    declared_size INTEGER NOT NULL,
    chunk_size INTEGER NOT NULL,
    received_ranges TEXT NOT NULL DEFAULT '[]',
    state TEXT NOT NULL DEFAULT 'open',
    captured_at TEXT,
    source_device TEXT,
    fingerprint TEXT,
    outcome TEXT,
    storage_path TEXT,
    error_message TEXT,
    created_at TEXT NOT NULL,
    last_activity TEXT NOT NULL,
    expires_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_upload_sessions_state ON upload_sessions(state);
CREATE INDEX IF NOT EXISTS idx_upload_sessions_expires ON upload_sessions(expires_at);

-- Append-only per-file outcome log
CREATE TABLE IF NOT EXISTS sync_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    fingerprint TEXT,
    session_token TEXT NOT NULL,
    outcome TEXT NOT NULL,
    detail TEXT,
    recorded_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_sync_history_fingerprint ON sync_history(fingerprint);
CREATE INDEX IF NOT EXISTS idx_sync_history_session ON sync_history(session_token);
CREATE INDEX IF NOT EXISTS idx_sync_history_recorded ON sync_history(recorded_at);

-- Batch submissions
CREATE TABLE IF NOT EXISTS backup_runs (
    id TEXT PRIMARY KEY,
    source_device TEXT,
    status TEXT NOT NULL DEFAULT 'running',
    files_processed INTEGER NOT NULL DEFAULT 0,
    files_backed_up INTEGER NOT NULL DEFAULT 0,
    files_skipped INTEGER NOT NULL DEFAULT 0,
    files_failed INTEGER NOT NULL DEFAULT 0,
    total_bytes INTEGER NOT NULL DEFAULT 0,
    started_at TEXT NOT NULL,
    completed_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_backup_runs_started ON backup_runs(started_at);

-- Outputs of the encryption post-step
CREATE TABLE IF NOT EXISTS encrypted_artifacts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    fingerprint TEXT NOT NULL,
    encrypted_path TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_encrypted_artifacts_fingerprint ON encrypted_artifacts(fingerprint);
"#;

//! Upload types for the chunked transfer protocol

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::ranges::RangeSet;
use crate::db::FileRecord;
use crate::hasher::Fingerprint;

// ============================================================================
// Session Token
// ============================================================================

/// Opaque, unguessable identifier correlating the chunks of one transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionToken(Uuid);

impl SessionToken {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for SessionToken {
    type Err = TransferError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| TransferError::SessionNotFound(s.to_string()))
    }
}

// ============================================================================
// Session State
// ============================================================================

/// Upload session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// Accepting chunks
    Open,
    /// All declared bytes received, awaiting hash/finalize
    Assembling,
    /// Finalized as a new record or confirmed duplicate
    Completed,
    /// Aborted, corrupted, or storage failure
    Failed,
    /// No activity within the timeout window
    Expired,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Open => "open",
            SessionState::Assembling => "assembling",
            SessionState::Completed => "completed",
            SessionState::Failed => "failed",
            SessionState::Expired => "expired",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Completed | SessionState::Failed | SessionState::Expired
        )
    }
}

impl FromStr for SessionState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(SessionState::Open),
            "assembling" => Ok(SessionState::Assembling),
            "completed" => Ok(SessionState::Completed),
            "failed" => Ok(SessionState::Failed),
            "expired" => Ok(SessionState::Expired),
            other => Err(format!("unknown session state: {other}")),
        }
    }
}

/// How a completed session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionOutcome {
    Stored,
    Duplicate,
}

impl SessionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionOutcome::Stored => "stored",
            SessionOutcome::Duplicate => "duplicate",
        }
    }
}

impl FromStr for SessionOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stored" => Ok(SessionOutcome::Stored),
            "duplicate" => Ok(SessionOutcome::Duplicate),
            other => Err(format!("unknown session outcome: {other}")),
        }
    }
}

// ============================================================================
// Requests
// ============================================================================

/// Request to open a chunked upload session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRequest {
    /// Original file name
    pub file_name: String,

    /// Total file size in bytes
    pub declared_size: u64,

    /// Capture timestamp reported by the device, if known
    #[serde(default)]
    pub captured_at: Option<DateTime<Utc>>,

    /// Source device identifier
    #[serde(default)]
    pub source_device: Option<String>,
}

impl SessionRequest {
    pub fn new(file_name: impl Into<String>, declared_size: u64) -> Self {
        Self {
            file_name: file_name.into(),
            declared_size,
            captured_at: None,
            source_device: None,
        }
    }
}

/// Returned when a session is opened
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionTicket {
    pub token: SessionToken,
    pub chunk_size: usize,
    pub expires_at: DateTime<Utc>,
}

// ============================================================================
// Session
// ============================================================================

/// One file's transfer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadSession {
    pub token: SessionToken,
    pub file_name: String,
    pub declared_size: u64,
    pub chunk_size: usize,
    pub received: RangeSet,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub captured_at: Option<DateTime<Utc>>,
    pub source_device: Option<String>,
    /// Set once finalize has hashed the assembled content
    pub fingerprint: Option<Fingerprint>,
    /// Set when the session completes
    pub outcome: Option<SessionOutcome>,
    /// Archive path of the stored record, or of the existing one for a duplicate
    pub storage_path: Option<String>,
    pub error_message: Option<String>,
}

impl UploadSession {
    pub fn new(request: &SessionRequest, chunk_size: usize, timeout: chrono::Duration) -> Self {
        let now = Utc::now();
        Self {
            token: SessionToken::generate(),
            file_name: request.file_name.clone(),
            declared_size: request.declared_size,
            chunk_size,
            received: RangeSet::new(),
            state: SessionState::Open,
            created_at: now,
            last_activity: now,
            expires_at: now + timeout,
            captured_at: request.captured_at,
            source_device: request.source_device.clone(),
            fingerprint: None,
            outcome: None,
            storage_path: None,
            error_message: None,
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        !self.state.is_terminal() && now > self.expires_at
    }

    /// Record activity, pushing the expiry deadline out
    pub fn touch(&mut self, timeout: chrono::Duration) {
        self.last_activity = Utc::now();
        self.expires_at = self.last_activity + timeout;
    }

    pub fn bytes_received(&self) -> u64 {
        self.received.covered_bytes()
    }

    pub fn bytes_remaining(&self) -> u64 {
        self.declared_size.saturating_sub(self.bytes_received())
    }

    pub fn is_complete(&self) -> bool {
        self.received.is_complete(self.declared_size)
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            token: self.token,
            file_name: self.file_name.clone(),
            state: self.state,
            declared_size: self.declared_size,
            bytes_received: self.bytes_received(),
            bytes_remaining: self.bytes_remaining(),
            missing_ranges: self
                .received
                .missing(self.declared_size)
                .into_iter()
                .map(|r| [r.start, r.end])
                .collect(),
            chunk_size: self.chunk_size,
            expires_at: self.expires_at,
            fingerprint: self.fingerprint,
            outcome: self.outcome,
            storage_path: self.storage_path.clone(),
            error_message: self.error_message.clone(),
        }
    }
}

/// Per-session progress, for rendering resumable uploads
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub token: SessionToken,
    pub file_name: String,
    pub state: SessionState,
    pub declared_size: u64,
    pub bytes_received: u64,
    pub bytes_remaining: u64,
    pub missing_ranges: Vec<[u64; 2]>,
    pub chunk_size: usize,
    pub expires_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<Fingerprint>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<SessionOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

// ============================================================================
// Outcomes
// ============================================================================

/// Result of the optional encryption post-step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum EncryptionOutcome {
    NotConfigured,
    Encrypted { path: PathBuf },
    /// Degraded: the plaintext record stays stored
    Failed { reason: String },
}

/// How a finalized file ended up
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum FileOutcome {
    Stored {
        record: FileRecord,
        encryption: EncryptionOutcome,
    },
    Duplicate {
        existing: FileRecord,
    },
}

impl FileOutcome {
    pub fn record(&self) -> &FileRecord {
        match self {
            FileOutcome::Stored { record, .. } => record,
            FileOutcome::Duplicate { existing } => existing,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, FileOutcome::Duplicate { .. })
    }

    pub fn kind(&self) -> SessionOutcome {
        match self {
            FileOutcome::Stored { .. } => SessionOutcome::Stored,
            FileOutcome::Duplicate { .. } => SessionOutcome::Duplicate,
        }
    }

    /// Stored, but the encryption post-step failed
    pub fn is_degraded(&self) -> bool {
        matches!(
            self,
            FileOutcome::Stored {
                encryption: EncryptionOutcome::Failed { .. },
                ..
            }
        )
    }
}

/// Result of a chunk write
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "camelCase")]
pub enum WriteOutcome {
    /// Chunk recorded (or an identical replay ignored); more bytes expected
    Accepted { status: SessionStatus },
    /// The chunk completed the file and finalize ran
    Completed { outcome: FileOutcome },
}

// ============================================================================
// Error Types
// ============================================================================

/// Transfer error types
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransferError {
    #[error("Source unreadable: {0}")]
    Read(String),

    #[error("Size mismatch: declared {declared} bytes, got {actual}")]
    SizeMismatch { declared: u64, actual: u64 },

    #[error("Storage write failed: {0}")]
    StorageWrite(String),

    #[error("Session expired: {0}")]
    ExpiredSession(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Session is {state:?} and no longer accepts work")]
    SessionClosed { state: SessionState },

    #[error("Invalid chunk: {0}")]
    InvalidChunk(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("File too large: {size} bytes (max: {max})")]
    FileTooLarge { size: u64, max: u64 },

    #[error("Database error: {0}")]
    Database(String),
}

impl TransferError {
    /// Whether resubmitting the same work may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransferError::Read(_) | TransferError::StorageWrite(_))
    }

    /// Get HTTP status code for this error
    pub fn status_code(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Self::Read(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::SizeMismatch { .. } => StatusCode::CONFLICT,
            Self::StorageWrite(_) => StatusCode::INSUFFICIENT_STORAGE,
            Self::ExpiredSession(_) => StatusCode::GONE,
            Self::SessionNotFound(_) => StatusCode::NOT_FOUND,
            Self::SessionClosed { .. } => StatusCode::CONFLICT,
            Self::InvalidChunk(_) => StatusCode::BAD_REQUEST,
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::FileTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Read(_) => "READ_ERROR",
            Self::SizeMismatch { .. } => "SIZE_MISMATCH",
            Self::StorageWrite(_) => "STORAGE_WRITE_ERROR",
            Self::ExpiredSession(_) => "EXPIRED_SESSION",
            Self::SessionNotFound(_) => "SESSION_NOT_FOUND",
            Self::SessionClosed { .. } => "SESSION_CLOSED",
            Self::InvalidChunk(_) => "INVALID_CHUNK",
            Self::InvalidRequest(_) => "INVALID_REQUEST",
            Self::FileTooLarge { .. } => "FILE_TOO_LARGE",
            Self::Database(_) => "DATABASE_ERROR",
        }
    }
}

impl From<crate::error::AppError> for TransferError {
    fn from(err: crate::error::AppError) -> Self {
        TransferError::Database(err.to_string())
    }
}

impl From<crate::hasher::HashError> for TransferError {
    fn from(err: crate::hasher::HashError) -> Self {
        TransferError::Read(err.to_string())
    }
}

//! Transfer Engine
//!
//! Drives every file from submission to a terminal outcome: staging, hashing,
//! the index claim, placement in the archive and the optional encryption
//! post-step. Chunked uploads and whole local files share the same session
//! lifecycle and the same finalize path.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;
use sqlx::SqlitePool;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use super::progress::{ProgressSnapshot, ProgressTracker};
use super::retry::RetryPolicy;
use crate::archive::{mime_type_for, sanitize_file_name, ArchiveOrganizer, PlacementError};
use crate::config::EngineConfig;
use crate::db::{
    FileRecord, FileRepository, HistoryOutcome, HistoryRepository, InsertOutcome, RunRepository,
    RunTotals, SessionRepository,
};
use crate::encryption::{AesGcmTransform, EncryptionTransform};
use crate::error::{AppError, Result};
use crate::hasher::{self, FastKey, Fingerprint, HashMode};
use crate::source::CandidateFile;
use crate::upload::{
    ChunkStorage, ChunkStore, DeduplicationIndex, EncryptionOutcome, FileOutcome,
    LocalChunkStorage, SessionEntry, SessionManager, SessionRequest, SessionState, SessionStatus,
    SessionTicket, SessionToken, TransferError, WriteOutcome,
};

// ============================================================================
// Results
// ============================================================================

/// One file of a batch that did not make it
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchFailure {
    pub path: PathBuf,
    pub code: &'static str,
    pub error: String,
}

/// Totals of a batch submission
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSummary {
    pub run_id: String,
    pub backed_up: usize,
    pub skipped_duplicates: usize,
    pub failed: usize,
    pub total_bytes: u64,
    pub failures: Vec<BatchFailure>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VerifyStatus {
    Intact,
    Missing,
    Corrupted,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyReport {
    pub fingerprint: Fingerprint,
    pub storage_path: String,
    pub status: VerifyStatus,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStats {
    pub stored_files: i64,
    pub stored_bytes: i64,
    pub live_sessions: usize,
    pub cached_fingerprints: usize,
}

/// What finalize needs to know about a file besides its bytes
struct FileMeta {
    file_name: String,
    size: u64,
    captured_at: Option<DateTime<Utc>>,
    source_device: Option<String>,
    fast_key: Option<FastKey>,
}

impl FileMeta {
    fn from_session(session: &crate::upload::UploadSession, fast_key: Option<FastKey>) -> Self {
        Self {
            file_name: session.file_name.clone(),
            size: session.declared_size,
            captured_at: session.captured_at,
            source_device: session.source_device.clone(),
            fast_key,
        }
    }
}

// ============================================================================
// Transfer Engine
// ============================================================================

#[derive(Clone)]
pub struct TransferEngine {
    inner: Arc<TransferEngineInner>,
}

struct TransferEngineInner {
    config: EngineConfig,
    db: SqlitePool,
    sessions: SessionManager,
    chunks: ChunkStore,
    index: DeduplicationIndex,
    archive: ArchiveOrganizer,
    encryption: Option<Arc<dyn EncryptionTransform>>,
    progress: ProgressTracker,

    /// Open/Assembling sessions and whole-file transfers
    transfer_slots: Arc<Semaphore>,

    retry: RetryPolicy,
}

impl TransferEngine {
    /// Engine with local staging and, when a key path is configured, AES-GCM
    /// encryption of stored files
    pub async fn new(config: EngineConfig, db: SqlitePool) -> Result<Self> {
        let encryption = match &config.encryption_key_path {
            Some(key_path) => {
                let transform = AesGcmTransform::open(key_path, &config.archive_root)
                    .map_err(|e| AppError::Internal(e.to_string()))?;
                Some(Arc::new(transform) as Arc<dyn EncryptionTransform>)
            }
            None => None,
        };
        let backend = Box::new(LocalChunkStorage::new(config.staging_dir()));
        Self::with_components(config, db, backend, encryption).await
    }

    /// Engine with an explicit staging backend and encryption step
    pub async fn with_components(
        config: EngineConfig,
        db: SqlitePool,
        backend: Box<dyn ChunkStorage>,
        encryption: Option<Arc<dyn EncryptionTransform>>,
    ) -> Result<Self> {
        tokio::fs::create_dir_all(&config.archive_root).await?;
        tokio::fs::create_dir_all(config.staging_dir()).await?;

        let file_ops = Arc::new(Semaphore::new(config.max_concurrent_file_ops.max(1)));
        let transfer_slots = Arc::new(Semaphore::new(config.max_concurrent_transfers.max(1)));
        let retry = RetryPolicy::new(config.storage_retries);

        tracing::info!(
            archive_root = %config.archive_root.display(),
            hash_mode = ?config.hash_mode,
            chunk_size = config.chunk_size,
            max_concurrent_transfers = config.max_concurrent_transfers,
            max_concurrent_file_ops = config.max_concurrent_file_ops,
            encryption = encryption.is_some(),
            "Transfer engine ready"
        );

        Ok(Self {
            inner: Arc::new(TransferEngineInner {
                sessions: SessionManager::new(db.clone(), config.session_timeout),
                chunks: ChunkStore::with_backend(backend, file_ops, retry),
                index: DeduplicationIndex::new(db.clone()),
                archive: ArchiveOrganizer::new(config.archive_root.clone()),
                progress: ProgressTracker::new(),
                encryption,
                transfer_slots,
                retry,
                config,
                db,
            }),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn index(&self) -> &DeduplicationIndex {
        &self.inner.index
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.inner.sessions
    }

    async fn acquire_slot(&self) -> std::result::Result<OwnedSemaphorePermit, TransferError> {
        self.inner
            .transfer_slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| TransferError::StorageWrite("transfer pool closed".into()))
    }

    async fn acquire_file_op(&self) -> std::result::Result<OwnedSemaphorePermit, TransferError> {
        self.inner
            .chunks
            .file_ops()
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| TransferError::StorageWrite("file operation pool closed".into()))
    }

    /// Size limits. Chunked sessions need at least one byte; a local file may
    /// be empty.
    fn validate_size(&self, size: u64, allow_empty: bool) -> std::result::Result<(), TransferError> {
        if size == 0 && !allow_empty {
            return Err(TransferError::InvalidRequest("declared size must be positive".into()));
        }
        if size > self.inner.config.max_file_size {
            return Err(TransferError::FileTooLarge {
                size,
                max: self.inner.config.max_file_size,
            });
        }
        Ok(())
    }

    // ========================================================================
    // Chunked Sessions
    // ========================================================================

    /// Open a chunked upload session, waiting for a free transfer slot
    pub async fn open_session(
        &self,
        request: SessionRequest,
    ) -> std::result::Result<SessionTicket, TransferError> {
        self.validate_size(request.declared_size, false)?;

        let queued = self.inner.progress.queue_one();
        let permit = self.acquire_slot().await?;
        let (session, _handle) = self
            .inner
            .sessions
            .create(&request, self.inner.config.chunk_size, Some(permit))
            .await?;
        queued.start();

        Ok(SessionTicket {
            token: session.token,
            chunk_size: session.chunk_size,
            expires_at: session.expires_at,
        })
    }

    /// Write `data` at `offset`. The chunk that completes the file also runs
    /// finalize and returns its outcome.
    pub async fn write_chunk(
        &self,
        token: &SessionToken,
        offset: u64,
        data: &[u8],
    ) -> std::result::Result<WriteOutcome, TransferError> {
        let handle = self.inner.sessions.handle(token).await?;
        if handle.abort_requested() {
            return Err(TransferError::SessionClosed {
                state: SessionState::Failed,
            });
        }

        let mut entry = handle.lock().await;
        if handle.abort_requested() {
            return Err(TransferError::SessionClosed {
                state: SessionState::Failed,
            });
        }

        self.check_live(&mut entry).await?;
        self.attach(&mut entry).await?;

        if entry.session.state == SessionState::Assembling {
            // Finalize was interrupted; every byte is already staged
            return self
                .finalize_locked(&mut entry)
                .await
                .map(|outcome| WriteOutcome::Completed { outcome });
        }

        let len = data.len() as u64;
        if len == 0 {
            return Err(TransferError::InvalidChunk("empty chunk".into()));
        }
        if len > entry.session.chunk_size as u64 {
            return Err(TransferError::InvalidChunk(format!(
                "chunk of {} bytes exceeds chunk size {}",
                len, entry.session.chunk_size
            )));
        }

        let declared = entry.session.declared_size;
        let end = match offset.checked_add(len) {
            Some(end) if end <= declared => end,
            _ => {
                let err = TransferError::SizeMismatch {
                    declared,
                    actual: offset.saturating_add(len),
                };
                self.fail_locked(&mut entry, &err.to_string()).await;
                return Err(err);
            }
        };
        let range = offset..end;
        let timeout = self.inner.sessions.timeout();

        if entry.session.received.contains(&range) {
            tracing::debug!(
                session_id = %token,
                offset = offset,
                len = len,
                "Replayed chunk ignored"
            );
            entry.session.touch(timeout);
            self.inner.sessions.persist(&entry.session).await?;
            return Ok(WriteOutcome::Accepted {
                status: entry.session.status(),
            });
        }

        if let Err(e) = self.inner.chunks.write_chunk(token, offset, data).await {
            self.fail_locked(&mut entry, &e.to_string()).await;
            return Err(e);
        }

        entry.session.received.insert(range);
        entry.session.touch(timeout);

        if entry.session.is_complete() {
            entry.session.state = SessionState::Assembling;
            self.inner.sessions.persist(&entry.session).await?;
            tracing::info!(
                session_id = %token,
                bytes = declared,
                "All bytes received, finalizing"
            );
            return self
                .finalize_locked(&mut entry)
                .await
                .map(|outcome| WriteOutcome::Completed { outcome });
        }

        self.inner.sessions.persist(&entry.session).await?;
        Ok(WriteOutcome::Accepted {
            status: entry.session.status(),
        })
    }

    /// Abort a session. Writers already queued on it bail out; aborting a
    /// finished session changes nothing.
    pub async fn abort(&self, token: &SessionToken) -> std::result::Result<SessionStatus, TransferError> {
        let handle = self.inner.sessions.handle(token).await?;
        handle.request_abort();

        let mut entry = handle.lock().await;
        if !entry.session.state.is_terminal() {
            self.fail_locked(&mut entry, "aborted").await;
            tracing::info!(session_id = %token, "Upload session aborted");
        }
        Ok(entry.session.status())
    }

    /// Status of a session. Never waits behind an in-progress write: a busy
    /// session reports its last persisted state.
    pub async fn session_status(
        &self,
        token: &SessionToken,
    ) -> std::result::Result<SessionStatus, TransferError> {
        let handle = self.inner.sessions.handle(token).await?;

        if let Some(mut entry) = handle.try_lock() {
            if entry.session.is_expired_at(Utc::now()) {
                self.expire_locked(&mut entry).await;
            }
            return Ok(entry.session.status());
        }

        SessionRepository::new(&self.inner.db)
            .get(token)
            .await?
            .map(|session| session.status())
            .ok_or_else(|| TransferError::SessionNotFound(token.to_string()))
    }

    // ========================================================================
    // Whole Files
    // ========================================================================

    /// Transfer one local file
    pub async fn submit_whole(
        &self,
        candidate: &CandidateFile,
        source_device: Option<&str>,
    ) -> std::result::Result<FileOutcome, TransferError> {
        self.submit_whole_inner(candidate, source_device, false).await
    }

    async fn submit_whole_inner(
        &self,
        candidate: &CandidateFile,
        source_device: Option<&str>,
        queued: bool,
    ) -> std::result::Result<FileOutcome, TransferError> {
        let permit = self.acquire_slot().await?;
        self.inner.progress.start(queued);

        if let Err(e) = self.validate_size(candidate.size, true) {
            self.inner.progress.failed();
            return Err(e);
        }

        let request = SessionRequest {
            file_name: candidate.file_name(),
            declared_size: candidate.size,
            captured_at: candidate.capture_time(),
            source_device: source_device.map(str::to_string),
        };
        let chunk_size = usize::try_from(candidate.size.max(1)).unwrap_or(usize::MAX);

        let (_, handle) = match self
            .inner
            .sessions
            .create(&request, chunk_size, Some(permit))
            .await
        {
            Ok(created) => created,
            Err(e) => {
                self.inner.progress.failed();
                return Err(e);
            }
        };

        let mut entry = handle.lock().await;
        match self.transfer_whole(&mut entry, &candidate.path).await {
            Ok(outcome) => {
                self.complete_locked(&mut entry, &outcome).await;
                Ok(outcome)
            }
            Err(e) => {
                self.fail_locked(&mut entry, &e.to_string()).await;
                Err(e)
            }
        }
    }

    /// Stage and commit a local file. In fast mode a fast-key miss copies and
    /// hashes in one pass; a hit (or full mode) hashes first so a duplicate is
    /// never copied.
    async fn transfer_whole(
        &self,
        entry: &mut SessionEntry,
        path: &Path,
    ) -> std::result::Result<FileOutcome, TransferError> {
        let token = entry.session.token;
        let declared = entry.session.declared_size;
        let read_err = |e: std::io::Error| TransferError::Read(format!("{}: {}", path.display(), e));

        let metadata = tokio::fs::metadata(path).await.map_err(read_err)?;
        if !metadata.is_file() {
            return Err(TransferError::Read(format!("{} is not a regular file", path.display())));
        }
        if metadata.len() != declared {
            return Err(TransferError::SizeMismatch {
                declared,
                actual: metadata.len(),
            });
        }
        let modified = metadata.modified().ok().map(DateTime::<Utc>::from);

        let fast_key = {
            let _op = self.acquire_file_op().await?;
            hasher::fast_key(path, declared, modified).await?
        };

        let hash_first = match self.inner.config.hash_mode {
            HashMode::Full => true,
            HashMode::Fast => self.inner.index.candidates_for_fast_key(&fast_key).await?,
        };

        let mut expected = None;
        if hash_first {
            let (fingerprint, len) = {
                let _op = self.acquire_file_op().await?;
                hasher::fingerprint_file(path).await?
            };
            if len != declared {
                return Err(TransferError::SizeMismatch {
                    declared,
                    actual: len,
                });
            }
            if let Some(existing) = self.inner.index.lookup(&fingerprint).await? {
                entry.session.fingerprint = Some(fingerprint);
                tracing::info!(
                    session_id = %token,
                    fingerprint = %fingerprint,
                    existing = %existing.storage_path,
                    "Duplicate detected before copy"
                );
                return Ok(FileOutcome::Duplicate { existing });
            }
            expected = Some(fingerprint);
        }

        entry.session.state = SessionState::Assembling;
        let fingerprint = self.inner.chunks.stage_file(&token, path, declared).await?;
        if expected.is_some_and(|e| e != fingerprint) {
            return Err(TransferError::Read(format!(
                "{} changed while being copied",
                path.display()
            )));
        }

        entry.session.received.insert(0..declared);
        entry.session.fingerprint = Some(fingerprint);
        let meta = FileMeta::from_session(&entry.session, Some(fast_key));
        self.commit_staged(&token, fingerprint, &meta).await
    }

    /// Transfer many local files concurrently. Each file succeeds or fails on
    /// its own; the run is recorded in `backup_runs`.
    pub async fn submit_batch(
        &self,
        candidates: Vec<CandidateFile>,
        source_device: Option<String>,
    ) -> std::result::Result<BatchSummary, TransferError> {
        let run_id = RunRepository::new(&self.inner.db)
            .start(source_device.as_deref())
            .await?;
        let total = candidates.len();

        tracing::info!(
            run_id = %run_id,
            files = total,
            source_device = ?source_device,
            "Starting batch"
        );

        self.inner.progress.enqueue(total as u64);

        let concurrency = self.inner.config.max_concurrent_transfers.max(1);
        let results: Vec<_> = futures::stream::iter(candidates)
            .map(|candidate| {
                let engine = self.clone();
                let device = source_device.clone();
                async move {
                    let result = engine
                        .submit_whole_inner(&candidate, device.as_deref(), true)
                        .await;
                    (candidate, result)
                }
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;

        let mut summary = BatchSummary {
            run_id,
            backed_up: 0,
            skipped_duplicates: 0,
            failed: 0,
            total_bytes: 0,
            failures: Vec::new(),
        };

        for (candidate, result) in results {
            match result {
                Ok(FileOutcome::Stored { record, .. }) => {
                    summary.backed_up += 1;
                    summary.total_bytes += record.size;
                }
                Ok(FileOutcome::Duplicate { .. }) => summary.skipped_duplicates += 1,
                Err(e) => {
                    summary.failed += 1;
                    summary.failures.push(BatchFailure {
                        path: candidate.path,
                        code: e.code(),
                        error: e.to_string(),
                    });
                }
            }
        }

        RunRepository::new(&self.inner.db)
            .complete(
                &summary.run_id,
                RunTotals {
                    backed_up: summary.backed_up as i64,
                    skipped: summary.skipped_duplicates as i64,
                    failed: summary.failed as i64,
                    total_bytes: summary.total_bytes as i64,
                },
            )
            .await?;

        tracing::info!(
            run_id = %summary.run_id,
            backed_up = summary.backed_up,
            skipped = summary.skipped_duplicates,
            failed = summary.failed,
            total_bytes = summary.total_bytes,
            "Batch finished"
        );

        Ok(summary)
    }

    // ========================================================================
    // Finalize
    // ========================================================================

    /// Hash the staged bytes of a complete session and commit them
    async fn finalize_locked(
        &self,
        entry: &mut SessionEntry,
    ) -> std::result::Result<FileOutcome, TransferError> {
        match self.resolve_staged(entry).await {
            Ok(outcome) => {
                self.complete_locked(entry, &outcome).await;
                Ok(outcome)
            }
            Err(e) => {
                self.fail_locked(entry, &e.to_string()).await;
                Err(e)
            }
        }
    }

    async fn resolve_staged(
        &self,
        entry: &mut SessionEntry,
    ) -> std::result::Result<FileOutcome, TransferError> {
        let token = entry.session.token;
        let (fingerprint, len) = self.inner.chunks.hash_staged(&token).await?;
        if len != entry.session.declared_size {
            return Err(TransferError::SizeMismatch {
                declared: entry.session.declared_size,
                actual: len,
            });
        }
        entry.session.fingerprint = Some(fingerprint);

        let meta = FileMeta::from_session(&entry.session, None);
        self.commit_staged(&token, fingerprint, &meta).await
    }

    /// Claim the fingerprint with a planned path, then move the staged file
    /// there. A failed move releases the claim.
    async fn commit_staged(
        &self,
        token: &SessionToken,
        fingerprint: Fingerprint,
        meta: &FileMeta,
    ) -> std::result::Result<FileOutcome, TransferError> {
        if let Some(existing) = self.inner.index.lookup(&fingerprint).await? {
            self.inner.chunks.discard(token).await;
            return Ok(FileOutcome::Duplicate { existing });
        }

        let staged = self.inner.chunks.staged_path(token);
        let ingested_at = Utc::now();
        let date = meta.captured_at.unwrap_or(ingested_at);
        let original_name = sanitize_file_name(&meta.file_name);

        let mut attempt = 0;
        loop {
            let storage_path = self
                .inner
                .archive
                .plan(&meta.file_name, date, &fingerprint, attempt)
                .ok_or_else(|| {
                    TransferError::StorageWrite(format!(
                        "no free storage path for {}",
                        original_name
                    ))
                })?;
            attempt += 1;

            let record = FileRecord {
                fingerprint,
                storage_path: storage_path.clone(),
                original_name: original_name.clone(),
                size: meta.size,
                mime_type: mime_type_for(&original_name),
                captured_at: meta.captured_at,
                ingested_at,
                source_device: meta.source_device.clone(),
                fast_key: meta.fast_key.clone(),
            };

            let record = match self.inner.index.insert(&record).await? {
                InsertOutcome::Inserted(record) => record,
                InsertOutcome::AlreadyExists(existing) => {
                    self.inner.chunks.discard(token).await;
                    return Ok(FileOutcome::Duplicate { existing });
                }
                InsertOutcome::PathTaken => continue,
            };

            match self.place(&staged, &storage_path).await {
                Ok(Ok(absolute)) => {
                    let encryption = self.encrypt(&record, &absolute).await;
                    tracing::info!(
                        session_id = %token,
                        fingerprint = %fingerprint,
                        storage_path = %storage_path,
                        size = meta.size,
                        "Stored file"
                    );
                    return Ok(FileOutcome::Stored { record, encryption });
                }
                Ok(Err(occupied)) => {
                    tracing::debug!(
                        target_path = %occupied.display(),
                        "Archive path holds an unindexed file, trying next name"
                    );
                    self.inner.index.release(&fingerprint).await?;
                }
                Err(e) => {
                    self.inner.index.release(&fingerprint).await?;
                    return Err(e);
                }
            }
        }
    }

    /// Retried placement. `Ok(Err(path))` when the target is occupied.
    async fn place(
        &self,
        staged: &Path,
        storage_path: &str,
    ) -> std::result::Result<std::result::Result<PathBuf, PathBuf>, TransferError> {
        let _op = self.acquire_file_op().await?;
        let archive = &self.inner.archive;
        self.inner
            .retry
            .run("place", || async move {
                match archive.place(staged, storage_path).await {
                    Ok(path) => Ok(Ok(path)),
                    Err(PlacementError::Occupied(path)) => Ok(Err(path)),
                    Err(e @ PlacementError::Io { .. }) => {
                        Err(TransferError::StorageWrite(e.to_string()))
                    }
                }
            })
            .await
    }

    async fn encrypt(&self, record: &FileRecord, absolute: &Path) -> EncryptionOutcome {
        let Some(transform) = &self.inner.encryption else {
            return EncryptionOutcome::NotConfigured;
        };

        let applied = {
            let _op = match self.acquire_file_op().await {
                Ok(op) => op,
                Err(e) => return EncryptionOutcome::Failed { reason: e.to_string() },
            };
            transform.apply(absolute).await
        };

        match applied {
            Ok(path) => {
                if let Err(e) = FileRepository::new(&self.inner.db)
                    .record_encrypted(&record.fingerprint, &path.to_string_lossy())
                    .await
                {
                    tracing::warn!(
                        fingerprint = %record.fingerprint,
                        error = %e,
                        "Failed to record encrypted artifact"
                    );
                }
                EncryptionOutcome::Encrypted { path }
            }
            Err(e) => {
                tracing::warn!(
                    fingerprint = %record.fingerprint,
                    error = %e,
                    "Encryption failed, keeping plaintext copy"
                );
                EncryptionOutcome::Failed {
                    reason: e.to_string(),
                }
            }
        }
    }

    // ========================================================================
    // Session Transitions
    // ========================================================================

    /// Reject writes to expired or finished sessions
    async fn check_live(&self, entry: &mut SessionEntry) -> std::result::Result<(), TransferError> {
        if entry.session.is_expired_at(Utc::now()) {
            self.expire_locked(entry).await;
        }
        match entry.session.state {
            SessionState::Open | SessionState::Assembling => Ok(()),
            SessionState::Expired => Err(TransferError::ExpiredSession(entry.session.token.to_string())),
            state => Err(TransferError::SessionClosed { state }),
        }
    }

    /// First touch of a session in this process: take a slot if one is free
    /// and make sure the staged bytes survived
    async fn attach(&self, entry: &mut SessionEntry) -> std::result::Result<(), TransferError> {
        if entry.attached {
            return Ok(());
        }
        entry.attached = true;
        if entry.permit.is_none() {
            entry.permit = self.inner.transfer_slots.clone().try_acquire_owned().ok();
        }
        self.inner.progress.start(false);

        let high_water = entry.session.received.high_water_mark();
        if high_water == 0 {
            return Ok(());
        }

        let staged = self.inner.chunks.staged_len(&entry.session.token).await?;
        match staged {
            Some(len) if len >= high_water => Ok(()),
            other => {
                let reason = match other {
                    Some(len) => format!("staged file holds {len} bytes, expected at least {high_water}"),
                    None => "staged file missing after restart".to_string(),
                };
                self.fail_locked(entry, &reason).await;
                Err(TransferError::SessionClosed {
                    state: SessionState::Failed,
                })
            }
        }
    }

    fn release_locked(&self, entry: &mut SessionEntry) {
        entry.permit.take();
        if !entry.attached {
            entry.attached = true;
            self.inner.progress.start(false);
        }
    }

    async fn persist_terminal(&self, entry: &SessionEntry) {
        if let Err(e) = self.inner.sessions.persist(&entry.session).await {
            tracing::error!(
                session_id = %entry.session.token,
                state = entry.session.state.as_str(),
                error = %e,
                "Failed to persist terminal session state"
            );
        }
        self.inner.sessions.evict(&entry.session.token).await;
    }

    async fn record_history(
        &self,
        token: &SessionToken,
        fingerprint: Option<&Fingerprint>,
        outcome: HistoryOutcome,
        detail: Option<&str>,
    ) {
        if let Err(e) = HistoryRepository::new(&self.inner.db)
            .append(token, fingerprint, outcome, detail)
            .await
        {
            tracing::error!(
                session_id = %token,
                outcome = outcome.as_str(),
                error = %e,
                "Failed to append sync history"
            );
        }
    }

    async fn complete_locked(&self, entry: &mut SessionEntry, outcome: &FileOutcome) {
        self.release_locked(entry);
        entry.session.state = SessionState::Completed;
        entry.session.fingerprint = Some(outcome.record().fingerprint);
        entry.session.outcome = Some(outcome.kind());
        entry.session.storage_path = Some(outcome.record().storage_path.clone());
        self.persist_terminal(entry).await;

        let token = entry.session.token;
        match outcome {
            FileOutcome::Stored { record, encryption } => {
                let detail = match encryption {
                    EncryptionOutcome::Failed { reason } => Some(format!("encryption failed: {reason}")),
                    _ => None,
                };
                self.record_history(
                    &token,
                    Some(&record.fingerprint),
                    HistoryOutcome::Stored,
                    detail.as_deref(),
                )
                .await;
                self.inner.progress.stored(record.size);
            }
            FileOutcome::Duplicate { existing } => {
                self.inner.chunks.discard(&token).await;
                self.record_history(
                    &token,
                    Some(&existing.fingerprint),
                    HistoryOutcome::Duplicate,
                    Some(&existing.storage_path),
                )
                .await;
                self.inner.progress.duplicate();
                tracing::info!(
                    session_id = %token,
                    fingerprint = %existing.fingerprint,
                    existing = %existing.storage_path,
                    "Duplicate skipped"
                );
            }
        }
    }

    async fn fail_locked(&self, entry: &mut SessionEntry, reason: &str) {
        self.release_locked(entry);
        entry.session.state = SessionState::Failed;
        entry.session.error_message = Some(reason.to_string());
        self.persist_terminal(entry).await;

        let token = entry.session.token;
        self.inner.chunks.discard(&token).await;
        self.record_history(
            &token,
            entry.session.fingerprint.as_ref(),
            HistoryOutcome::Failed,
            Some(reason),
        )
        .await;
        self.inner.progress.failed();

        tracing::warn!(
            session_id = %token,
            file_name = %entry.session.file_name,
            reason = %reason,
            "Transfer failed"
        );
    }

    async fn expire_locked(&self, entry: &mut SessionEntry) {
        self.release_locked(entry);
        entry.session.state = SessionState::Expired;
        entry.session.error_message = Some("no activity within session timeout".to_string());
        self.persist_terminal(entry).await;

        let token = entry.session.token;
        self.inner.chunks.discard(&token).await;
        self.record_history(&token, None, HistoryOutcome::Expired, None).await;
        self.inner.progress.expired();

        tracing::info!(
            session_id = %token,
            file_name = %entry.session.file_name,
            bytes_received = entry.session.bytes_received(),
            "Upload session expired"
        );
    }

    // ========================================================================
    // Maintenance
    // ========================================================================

    /// Expire every idle session that is not currently busy
    pub async fn sweep_expired(&self) -> usize {
        let now = Utc::now();
        let mut tokens: Vec<SessionToken> = self
            .inner
            .sessions
            .cached()
            .await
            .into_iter()
            .map(|(token, _)| token)
            .collect();

        match self.inner.sessions.stale_tokens(now).await {
            Ok(stale) => {
                for token in stale {
                    if !tokens.contains(&token) {
                        tokens.push(token);
                    }
                }
            }
            Err(e) => tracing::error!(error = %e, "Failed to list stale sessions"),
        }

        let mut expired = 0;
        for token in tokens {
            let Ok(handle) = self.inner.sessions.handle(&token).await else {
                continue;
            };
            let Some(mut entry) = handle.try_lock() else {
                continue;
            };
            if entry.session.is_expired_at(now) {
                self.expire_locked(&mut entry).await;
                expired += 1;
            }
        }

        if expired > 0 {
            tracing::info!(count = expired, "Expired idle upload sessions");
        }
        expired
    }

    /// Start background expiry sweep
    pub fn start_sweeper(self, interval: std::time::Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(interval);

            loop {
                interval.tick().await;
                self.sweep_expired().await;
            }
        })
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn progress(&self) -> ProgressSnapshot {
        self.inner.progress.snapshot()
    }

    pub fn subscribe_progress(&self) -> tokio::sync::watch::Receiver<ProgressSnapshot> {
        self.inner.progress.subscribe()
    }

    pub async fn stats(&self) -> std::result::Result<EngineStats, TransferError> {
        let files = FileRepository::new(&self.inner.db);
        Ok(EngineStats {
            stored_files: files.count().await?,
            stored_bytes: files.total_size().await?,
            live_sessions: self.inner.sessions.session_count().await,
            cached_fingerprints: self.inner.index.cache_stats().await.entries,
        })
    }

    /// Re-hash an archived file and compare with its fingerprint.
    /// `None` when nothing is stored under the fingerprint.
    pub async fn verify(
        &self,
        fingerprint: &Fingerprint,
    ) -> std::result::Result<Option<VerifyReport>, TransferError> {
        let Some(record) = self.inner.index.lookup(fingerprint).await? else {
            return Ok(None);
        };
        let absolute = self.inner.archive.absolute(&record.storage_path);

        let status = if !tokio::fs::try_exists(&absolute).await.unwrap_or(false) {
            VerifyStatus::Missing
        } else {
            let _op = self.acquire_file_op().await?;
            match hasher::fingerprint_file(&absolute).await {
                Ok((actual, _)) if actual == *fingerprint => VerifyStatus::Intact,
                Ok(_) => VerifyStatus::Corrupted,
                Err(_) => VerifyStatus::Missing,
            }
        };

        if status != VerifyStatus::Intact {
            tracing::warn!(
                fingerprint = %fingerprint,
                storage_path = %record.storage_path,
                status = ?status,
                "Archived file failed verification"
            );
        }

        Ok(Some(VerifyReport {
            fingerprint: *fingerprint,
            storage_path: record.storage_path,
            status,
        }))
    }

    /// Copy an archived file to `destination` (a file path, or a directory to
    /// receive it under its original name) and check the copy's fingerprint.
    /// `None` when nothing is stored under the fingerprint.
    pub async fn restore(
        &self,
        fingerprint: &Fingerprint,
        destination: &Path,
    ) -> std::result::Result<Option<PathBuf>, TransferError> {
        let Some(record) = self.inner.index.lookup(fingerprint).await? else {
            return Ok(None);
        };
        let source = self.inner.archive.absolute(&record.storage_path);
        let target = if tokio::fs::metadata(destination)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
        {
            destination.join(&record.original_name)
        } else {
            destination.to_path_buf()
        };

        let write_err = |e: std::io::Error| {
            TransferError::StorageWrite(format!("{}: {}", target.display(), e))
        };

        let _op = self.acquire_file_op().await?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(write_err)?;
        }
        tokio::fs::copy(&source, &target).await.map_err(write_err)?;

        let (actual, _) = hasher::fingerprint_file(&target).await?;
        if actual != *fingerprint {
            let _ = tokio::fs::remove_file(&target).await;
            return Err(TransferError::StorageWrite(format!(
                "restored copy of {} does not match its fingerprint",
                record.storage_path
            )));
        }

        tracing::info!(
            fingerprint = %fingerprint,
            target = %target.display(),
            "Restored file"
        );
        Ok(Some(target))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;
    use crate::hasher::fingerprint_bytes;
    use crate::upload::chunk_store::FlakyStorage;
    use crate::upload::SessionOutcome;
    use std::time::Duration;
    use tempfile::TempDir;

    fn config(root: &Path) -> EngineConfig {
        EngineConfig {
            chunk_size: 400,
            storage_retries: 2,
            ..EngineConfig::with_archive_root(root.join("archive"))
        }
    }

    async fn engine(dir: &TempDir, pool: SqlitePool) -> TransferEngine {
        TransferEngine::new(config(dir.path()), pool).await.unwrap()
    }

    fn sample(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
    }

    async fn candidate(dir: &TempDir, name: &str, data: &[u8]) -> CandidateFile {
        let path = dir.path().join("source").join(name);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, data).unwrap();
        CandidateFile::from_path(path).await.unwrap()
    }

    #[tokio::test]
    async fn test_chunked_upload_stores_file() {
        let dir = TempDir::new().unwrap();
        let (pool, _db) = test_pool().await;
        let engine = engine(&dir, pool.clone()).await;
        let data = sample(1000, 1);

        let ticket = engine
            .open_session(SessionRequest::new("IMG_0001.JPG", 1000))
            .await
            .unwrap();
        assert_eq!(ticket.chunk_size, 400);

        let first = engine.write_chunk(&ticket.token, 0, &data[..400]).await.unwrap();
        assert!(matches!(first, WriteOutcome::Accepted { .. }));
        engine.write_chunk(&ticket.token, 400, &data[400..800]).await.unwrap();
        let last = engine.write_chunk(&ticket.token, 800, &data[800..]).await.unwrap();

        let WriteOutcome::Completed { outcome } = last else {
            panic!("expected completion");
        };
        let FileOutcome::Stored { record, encryption } = outcome else {
            panic!("expected a stored file");
        };
        assert_eq!(record.fingerprint, fingerprint_bytes(&data));
        assert_eq!(record.mime_type, "image/jpeg");
        assert_eq!(encryption, EncryptionOutcome::NotConfigured);

        let stored = engine.inner.archive.absolute(&record.storage_path);
        assert_eq!(std::fs::read(stored).unwrap(), data);
        assert!(!engine.inner.chunks.staged_path(&ticket.token).exists());

        let status = engine.session_status(&ticket.token).await.unwrap();
        assert_eq!(status.state, SessionState::Completed);
        assert_eq!(engine.progress().stored_files, 1);
        assert_eq!(engine.progress().in_flight_files, 0);
    }

    #[tokio::test]
    async fn test_completed_status_reports_outcome() {
        let dir = TempDir::new().unwrap();
        let (pool, _db) = test_pool().await;
        let engine = engine(&dir, pool.clone()).await;
        let data = sample(300, 14);

        let mut paths = Vec::new();
        for name in ["IMG_1.JPG", "IMG_1 copy.JPG"] {
            let ticket = engine.open_session(SessionRequest::new(name, 300)).await.unwrap();
            engine.write_chunk(&ticket.token, 0, &data).await.unwrap();

            // The final response may be lost; status alone tells the result
            let replay = engine.write_chunk(&ticket.token, 0, &data).await;
            assert!(matches!(replay, Err(TransferError::SessionClosed { .. })));

            let status = engine.session_status(&ticket.token).await.unwrap();
            assert_eq!(status.state, SessionState::Completed);
            assert_eq!(status.fingerprint, Some(fingerprint_bytes(&data)));
            paths.push((status.outcome, status.storage_path.clone()));

            let persisted = SessionRepository::new(&pool)
                .get(&ticket.token)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(persisted.outcome, status.outcome);
            assert_eq!(persisted.storage_path, status.storage_path);
        }

        assert_eq!(paths[0].0, Some(SessionOutcome::Stored));
        assert_eq!(paths[1].0, Some(SessionOutcome::Duplicate));
        assert!(paths[0].1.is_some());
        assert_eq!(paths[0].1, paths[1].1);
    }

    #[tokio::test]
    async fn test_waiting_sessions_count_as_queued() {
        let dir = TempDir::new().unwrap();
        let (pool, _db) = test_pool().await;
        let cfg = EngineConfig {
            max_concurrent_transfers: 1,
            ..config(dir.path())
        };
        let engine = TransferEngine::new(cfg, pool).await.unwrap();

        let first = engine.open_session(SessionRequest::new("a.jpg", 100)).await.unwrap();

        let waiting = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.open_session(SessionRequest::new("b.jpg", 100)).await })
        };
        for _ in 0..100 {
            if engine.progress().queued_files == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(engine.progress().queued_files, 1);
        assert_eq!(engine.progress().in_flight_files, 1);

        engine.abort(&first.token).await.unwrap();
        waiting.await.unwrap().unwrap();

        let progress = engine.progress();
        assert_eq!(progress.queued_files, 0);
        assert_eq!(progress.in_flight_files, 1);
    }

    #[tokio::test]
    async fn test_exif_date_picks_archive_folder() {
        let dir = TempDir::new().unwrap();
        let (pool, _db) = test_pool().await;
        let engine = engine(&dir, pool).await;

        let photo = candidate(
            &dir,
            "IMG_2019.JPG",
            &crate::source::jpeg_with_exif_date("2019:07:04 12:30:00"),
        )
        .await;
        let outcome = engine.submit_whole(&photo, None).await.unwrap();
        assert_eq!(outcome.record().storage_path, "2019/07_July/IMG_2019.JPG");

        let record = outcome.record();
        let captured = record.captured_at.unwrap();
        assert_eq!(captured, photo.captured_at.unwrap());
    }

    #[tokio::test]
    async fn test_empty_local_file_is_stored() {
        let dir = TempDir::new().unwrap();
        let (pool, _db) = test_pool().await;
        let engine = engine(&dir, pool).await;

        let empty = candidate(&dir, "empty.jpg", &[]).await;
        let outcome = engine.submit_whole(&empty, None).await.unwrap();
        assert!(!outcome.is_duplicate());
        assert_eq!(outcome.record().size, 0);
        assert_eq!(outcome.record().fingerprint, fingerprint_bytes(&[]));

        // Chunked sessions still need a positive size
        let chunked = engine.open_session(SessionRequest::new("empty.jpg", 0)).await;
        assert!(matches!(chunked, Err(TransferError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn test_open_session_validation() {
        let dir = TempDir::new().unwrap();
        let (pool, _db) = test_pool().await;
        let engine = engine(&dir, pool).await;

        let empty = engine.open_session(SessionRequest::new("a.jpg", 0)).await;
        assert!(matches!(empty, Err(TransferError::InvalidRequest(_))));

        let huge = engine
            .open_session(SessionRequest::new("a.mov", engine.config().max_file_size + 1))
            .await;
        assert!(matches!(huge, Err(TransferError::FileTooLarge { .. })));
    }

    #[tokio::test]
    async fn test_chunk_validation() {
        let dir = TempDir::new().unwrap();
        let (pool, _db) = test_pool().await;
        let engine = engine(&dir, pool).await;

        let ticket = engine.open_session(SessionRequest::new("a.jpg", 1000)).await.unwrap();

        let empty = engine.write_chunk(&ticket.token, 0, &[]).await;
        assert!(matches!(empty, Err(TransferError::InvalidChunk(_))));

        let oversized = engine.write_chunk(&ticket.token, 0, &[0u8; 401]).await;
        assert!(matches!(oversized, Err(TransferError::InvalidChunk(_))));

        // Still open after rejected chunks
        let status = engine.session_status(&ticket.token).await.unwrap();
        assert_eq!(status.state, SessionState::Open);

        let past_end = engine.write_chunk(&ticket.token, 900, &[0u8; 200]).await;
        assert!(matches!(past_end, Err(TransferError::SizeMismatch { declared: 1000, actual: 1100 })));

        let status = engine.session_status(&ticket.token).await.unwrap();
        assert_eq!(status.state, SessionState::Failed);
        assert!(status.error_message.is_some());

        let after = engine.write_chunk(&ticket.token, 0, &[0u8; 10]).await;
        assert!(matches!(
            after,
            Err(TransferError::SessionClosed { state: SessionState::Failed })
        ));
    }

    #[tokio::test]
    async fn test_abort_blocks_further_writes() {
        let dir = TempDir::new().unwrap();
        let (pool, _db) = test_pool().await;
        let engine = engine(&dir, pool.clone()).await;

        let ticket = engine.open_session(SessionRequest::new("a.jpg", 1000)).await.unwrap();
        engine.write_chunk(&ticket.token, 0, &sample(400, 2)).await.unwrap();
        assert!(engine.inner.chunks.staged_path(&ticket.token).exists());

        let status = engine.abort(&ticket.token).await.unwrap();
        assert_eq!(status.state, SessionState::Failed);
        assert!(!engine.inner.chunks.staged_path(&ticket.token).exists());

        let write = engine.write_chunk(&ticket.token, 400, &sample(400, 2)).await;
        assert!(matches!(write, Err(TransferError::SessionClosed { .. })));

        // Idempotent
        let again = engine.abort(&ticket.token).await.unwrap();
        assert_eq!(again.state, SessionState::Failed);

        let history = HistoryRepository::new(&pool)
            .list_for_session(&ticket.token)
            .await
            .unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].outcome, HistoryOutcome::Failed);
    }

    #[tokio::test]
    async fn test_duplicate_whole_file_is_not_copied() {
        let dir = TempDir::new().unwrap();
        let (pool, _db) = test_pool().await;
        let engine = engine(&dir, pool).await;
        let data = sample(5000, 3);

        let first = candidate(&dir, "a/IMG_1.JPG", &data).await;
        let second = candidate(&dir, "b/IMG_1.JPG", &data).await;

        let stored = engine.submit_whole(&first, Some("phone")).await.unwrap();
        assert!(!stored.is_duplicate());
        assert_eq!(stored.record().source_device.as_deref(), Some("phone"));

        let duplicate = engine.submit_whole(&second, Some("phone")).await.unwrap();
        let FileOutcome::Duplicate { existing } = duplicate else {
            panic!("expected duplicate");
        };
        assert_eq!(existing.storage_path, stored.record().storage_path);
        assert_eq!(engine.stats().await.unwrap().stored_files, 1);
    }

    #[tokio::test]
    async fn test_same_name_different_content_gets_suffix() {
        let dir = TempDir::new().unwrap();
        let (pool, _db) = test_pool().await;
        let engine = engine(&dir, pool).await;

        let first = candidate(&dir, "a/IMG_1.JPG", &sample(300, 4)).await;
        let second = candidate(&dir, "b/IMG_1.JPG", &sample(300, 5)).await;

        let a = engine.submit_whole(&first, None).await.unwrap();
        let b = engine.submit_whole(&second, None).await.unwrap();

        assert!(a.record().storage_path.ends_with("/IMG_1.JPG"));
        let suffix = b.record().fingerprint.short(8);
        assert!(b.record().storage_path.ends_with(&format!("/IMG_1_{suffix}.JPG")));
    }

    #[tokio::test]
    async fn test_unindexed_file_in_archive_is_not_overwritten() {
        let dir = TempDir::new().unwrap();
        let (pool, _db) = test_pool().await;
        let engine = engine(&dir, pool).await;
        let source = candidate(&dir, "IMG_9.JPG", &sample(100, 6)).await;

        let date = source.modified.unwrap();
        let squatter = engine.inner.archive.absolute(&format!(
            "{}/IMG_9.JPG",
            crate::archive::month_dir(date)
        ));
        std::fs::create_dir_all(squatter.parent().unwrap()).unwrap();
        std::fs::write(&squatter, b"not indexed").unwrap();

        let outcome = engine.submit_whole(&source, None).await.unwrap();
        assert_ne!(engine.inner.archive.absolute(&outcome.record().storage_path), squatter);
        assert_eq!(std::fs::read(&squatter).unwrap(), b"not indexed");
    }

    #[tokio::test]
    async fn test_transient_staging_failures_are_retried() {
        let dir = TempDir::new().unwrap();
        let (pool, _db) = test_pool().await;
        let cfg = config(dir.path());
        let backend = Box::new(FlakyStorage::new(cfg.staging_dir(), 2));
        let engine = TransferEngine::with_components(cfg, pool, backend, None)
            .await
            .unwrap();

        let ticket = engine.open_session(SessionRequest::new("a.jpg", 100)).await.unwrap();
        let outcome = engine.write_chunk(&ticket.token, 0, &sample(100, 7)).await.unwrap();
        assert!(matches!(outcome, WriteOutcome::Completed { .. }));
    }

    #[tokio::test]
    async fn test_persistent_staging_failure_fails_session() {
        let dir = TempDir::new().unwrap();
        let (pool, _db) = test_pool().await;
        let cfg = config(dir.path());
        let backend = Box::new(FlakyStorage::new(cfg.staging_dir(), 10));
        let engine = TransferEngine::with_components(cfg, pool, backend, None)
            .await
            .unwrap();

        let ticket = engine.open_session(SessionRequest::new("a.jpg", 100)).await.unwrap();
        let result = engine.write_chunk(&ticket.token, 0, &sample(100, 8)).await;
        assert!(matches!(result, Err(TransferError::StorageWrite(_))));

        let status = engine.session_status(&ticket.token).await.unwrap();
        assert_eq!(status.state, SessionState::Failed);
        assert_eq!(engine.progress().failed_files, 1);
    }

    struct BrokenTransform;

    #[async_trait::async_trait]
    impl EncryptionTransform for BrokenTransform {
        async fn apply(&self, _path: &Path) -> std::result::Result<PathBuf, crate::encryption::EncryptionError> {
            Err(crate::encryption::EncryptionError::Encryption("no key".into()))
        }
    }

    #[tokio::test]
    async fn test_encryption_failure_degrades_outcome() {
        let dir = TempDir::new().unwrap();
        let (pool, _db) = test_pool().await;
        let cfg = config(dir.path());
        let backend = Box::new(LocalChunkStorage::new(cfg.staging_dir()));
        let engine = TransferEngine::with_components(cfg, pool, backend, Some(Arc::new(BrokenTransform)))
            .await
            .unwrap();

        let source = candidate(&dir, "IMG_2.JPG", &sample(64, 9)).await;
        let outcome = engine.submit_whole(&source, None).await.unwrap();

        assert!(outcome.is_degraded());
        let stored = engine.inner.archive.absolute(&outcome.record().storage_path);
        assert!(stored.exists());
        assert!(engine.index().lookup(&outcome.record().fingerprint).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_encryption_writes_artifact() {
        let dir = TempDir::new().unwrap();
        let (pool, _db) = test_pool().await;
        let cfg = EngineConfig {
            encryption_key_path: Some(dir.path().join("backup.key")),
            ..config(dir.path())
        };
        let engine = TransferEngine::new(cfg, pool.clone()).await.unwrap();

        let source = candidate(&dir, "IMG_3.JPG", &sample(64, 10)).await;
        let outcome = engine.submit_whole(&source, None).await.unwrap();

        let FileOutcome::Stored { record, encryption: EncryptionOutcome::Encrypted { path } } = outcome else {
            panic!("expected an encrypted artifact");
        };
        assert!(path.exists());
        let recorded = FileRepository::new(&pool)
            .encrypted_paths(&record.fingerprint)
            .await
            .unwrap();
        assert_eq!(recorded, vec![path.to_string_lossy().into_owned()]);
    }

    #[tokio::test]
    async fn test_verify_and_restore() {
        let dir = TempDir::new().unwrap();
        let (pool, _db) = test_pool().await;
        let engine = engine(&dir, pool).await;
        let data = sample(2048, 11);

        let source = candidate(&dir, "clip.mov", &data).await;
        let record = engine.submit_whole(&source, None).await.unwrap().record().clone();

        let report = engine.verify(&record.fingerprint).await.unwrap().unwrap();
        assert_eq!(report.status, VerifyStatus::Intact);

        let restore_dir = dir.path().join("restore");
        std::fs::create_dir_all(&restore_dir).unwrap();
        let restored = engine
            .restore(&record.fingerprint, &restore_dir)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(restored, restore_dir.join("clip.mov"));
        assert_eq!(std::fs::read(&restored).unwrap(), data);

        let stored = engine.inner.archive.absolute(&record.storage_path);
        std::fs::write(&stored, b"bit rot").unwrap();
        let report = engine.verify(&record.fingerprint).await.unwrap().unwrap();
        assert_eq!(report.status, VerifyStatus::Corrupted);

        std::fs::remove_file(&stored).unwrap();
        let report = engine.verify(&record.fingerprint).await.unwrap().unwrap();
        assert_eq!(report.status, VerifyStatus::Missing);

        let unknown = fingerprint_bytes(b"never stored");
        assert!(engine.verify(&unknown).await.unwrap().is_none());
        assert!(engine.restore(&unknown, &restore_dir).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sweep_expires_idle_sessions() {
        let dir = TempDir::new().unwrap();
        let (pool, _db) = test_pool().await;
        let cfg = EngineConfig {
            session_timeout: Duration::from_millis(50),
            ..config(dir.path())
        };
        let engine = TransferEngine::new(cfg, pool).await.unwrap();

        let ticket = engine.open_session(SessionRequest::new("a.jpg", 1000)).await.unwrap();
        engine.write_chunk(&ticket.token, 0, &sample(400, 12)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(engine.sweep_expired().await, 1);
        assert_eq!(engine.sweep_expired().await, 0);

        assert!(!engine.inner.chunks.staged_path(&ticket.token).exists());
        assert_eq!(engine.progress().expired_sessions, 1);

        let status = engine.session_status(&ticket.token).await.unwrap();
        assert_eq!(status.state, SessionState::Expired);
    }

    #[tokio::test]
    async fn test_status_of_busy_session_reads_database() {
        let dir = TempDir::new().unwrap();
        let (pool, _db) = test_pool().await;
        let engine = engine(&dir, pool).await;

        let ticket = engine.open_session(SessionRequest::new("a.jpg", 1000)).await.unwrap();
        engine.write_chunk(&ticket.token, 0, &sample(400, 13)).await.unwrap();

        let handle = engine.sessions().handle(&ticket.token).await.unwrap();
        let _busy = handle.lock().await;

        let status = engine.session_status(&ticket.token).await.unwrap();
        assert_eq!(status.bytes_received, 400);
        assert_eq!(status.state, SessionState::Open);
    }
}

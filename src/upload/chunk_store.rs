//! Chunk Store
//!
//! Staging area for in-flight transfers. Each session owns one staging file
//! that chunks are written into at their offsets; nothing in staging is ever
//! visible in the archive until finalize moves it there.

use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Semaphore;

use super::types::{SessionToken, TransferError};
use crate::hasher::{fingerprint_file, Fingerprint, StreamingHasher};
use crate::transfer::RetryPolicy;

const COPY_BUFFER_SIZE: usize = 1024 * 1024;

// ============================================================================
// Chunk Storage Trait
// ============================================================================

/// Trait for staging backends
#[async_trait::async_trait]
pub trait ChunkStorage: Send + Sync {
    /// Write `data` at `offset` in the session's staging file, durably
    async fn write_at(
        &self,
        token: &SessionToken,
        offset: u64,
        data: &[u8],
    ) -> Result<(), TransferError>;

    /// Copy a whole source file into staging, hashing it in the same pass.
    ///
    /// Fails with `SizeMismatch` if the source does not hold exactly
    /// `expected_size` bytes.
    async fn stage_copy(
        &self,
        token: &SessionToken,
        source: &Path,
        expected_size: u64,
    ) -> Result<Fingerprint, TransferError>;

    /// Full-content fingerprint of the staged bytes
    async fn hash_staged(&self, token: &SessionToken) -> Result<(Fingerprint, u64), TransferError>;

    /// Length of the staging file, `None` if it does not exist
    async fn staged_len(&self, token: &SessionToken) -> Result<Option<u64>, TransferError>;

    /// Remove staged bytes; returns whether anything was removed
    async fn discard(&self, token: &SessionToken) -> Result<bool, TransferError>;

    /// Location of the staging file
    fn staged_path(&self, token: &SessionToken) -> PathBuf;
}

// ============================================================================
// Chunk Store (Main Implementation)
// ============================================================================

/// Staging store with a pluggable backend, bounded file concurrency and
/// retried writes
#[derive(Clone)]
pub struct ChunkStore {
    inner: Arc<ChunkStoreInner>,
}

struct ChunkStoreInner {
    backend: Box<dyn ChunkStorage>,

    /// Shared with every other disk-bound operation of the engine
    file_ops: Arc<Semaphore>,

    retry: RetryPolicy,
}

impl ChunkStore {
    /// Create with local filesystem staging
    pub fn with_local_storage(
        staging_dir: PathBuf,
        file_ops: Arc<Semaphore>,
        retry: RetryPolicy,
    ) -> Self {
        Self::with_backend(Box::new(LocalChunkStorage::new(staging_dir)), file_ops, retry)
    }

    pub fn with_backend(
        backend: Box<dyn ChunkStorage>,
        file_ops: Arc<Semaphore>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            inner: Arc::new(ChunkStoreInner {
                backend,
                file_ops,
                retry,
            }),
        }
    }

    async fn file_permit(&self) -> Result<tokio::sync::SemaphorePermit<'_>, TransferError> {
        self.inner
            .file_ops
            .acquire()
            .await
            .map_err(|_| TransferError::StorageWrite("file operation pool closed".into()))
    }

    /// Write one chunk, retrying transient storage failures
    pub async fn write_chunk(
        &self,
        token: &SessionToken,
        offset: u64,
        data: &[u8],
    ) -> Result<(), TransferError> {
        let _permit = self.file_permit().await?;
        let backend = &self.inner.backend;
        self.inner
            .retry
            .run("write_chunk", || backend.write_at(token, offset, data))
            .await?;

        tracing::debug!(
            token = %token,
            offset = offset,
            len = data.len(),
            "Chunk staged"
        );
        Ok(())
    }

    /// Stage a whole local file, returning its fingerprint
    pub async fn stage_file(
        &self,
        token: &SessionToken,
        source: &Path,
        expected_size: u64,
    ) -> Result<Fingerprint, TransferError> {
        let _permit = self.file_permit().await?;
        let backend = &self.inner.backend;
        self.inner
            .retry
            .run("stage_file", || backend.stage_copy(token, source, expected_size))
            .await
    }

    pub async fn hash_staged(&self, token: &SessionToken) -> Result<(Fingerprint, u64), TransferError> {
        let _permit = self.file_permit().await?;
        self.inner.backend.hash_staged(token).await
    }

    pub async fn staged_len(&self, token: &SessionToken) -> Result<Option<u64>, TransferError> {
        self.inner.backend.staged_len(token).await
    }

    /// Drop staged bytes, logging rather than failing on errors
    pub async fn discard(&self, token: &SessionToken) {
        match self.inner.backend.discard(token).await {
            Ok(true) => tracing::debug!(token = %token, "Discarded staged bytes"),
            Ok(false) => {}
            Err(e) => tracing::warn!(token = %token, error = %e, "Failed to discard staged bytes"),
        }
    }

    pub fn staged_path(&self, token: &SessionToken) -> PathBuf {
        self.inner.backend.staged_path(token)
    }

    pub(crate) fn file_ops(&self) -> &Arc<Semaphore> {
        &self.inner.file_ops
    }
}

// ============================================================================
// Local Filesystem Storage
// ============================================================================

/// Local filesystem staging under `<archive>/.staging`
pub struct LocalChunkStorage {
    base_path: PathBuf,
}

impl LocalChunkStorage {
    pub fn new(base_path: PathBuf) -> Self {
        Self { base_path }
    }
}

fn storage_err(context: &str, e: io::Error) -> TransferError {
    TransferError::StorageWrite(format!("{context}: {e}"))
}

#[async_trait::async_trait]
impl ChunkStorage for LocalChunkStorage {
    async fn write_at(
        &self,
        token: &SessionToken,
        offset: u64,
        data: &[u8],
    ) -> Result<(), TransferError> {
        tokio::fs::create_dir_all(&self.base_path)
            .await
            .map_err(|e| storage_err("Failed to create staging dir", e))?;

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(self.staged_path(token))
            .await
            .map_err(|e| storage_err("Failed to open staging file", e))?;

        file.seek(io::SeekFrom::Start(offset))
            .await
            .map_err(|e| storage_err("Failed to seek staging file", e))?;
        file.write_all(data)
            .await
            .map_err(|e| storage_err("Failed to write chunk", e))?;
        file.sync_data()
            .await
            .map_err(|e| storage_err("Failed to sync chunk", e))?;

        Ok(())
    }

    async fn stage_copy(
        &self,
        token: &SessionToken,
        source: &Path,
        expected_size: u64,
    ) -> Result<Fingerprint, TransferError> {
        tokio::fs::create_dir_all(&self.base_path)
            .await
            .map_err(|e| storage_err("Failed to create staging dir", e))?;

        let source = source.to_path_buf();
        let dest = self.staged_path(token);

        tokio::task::spawn_blocking(move || copy_and_hash(&source, &dest, expected_size))
            .await
            .map_err(|e| TransferError::StorageWrite(format!("Copy task failed: {e}")))?
    }

    async fn hash_staged(&self, token: &SessionToken) -> Result<(Fingerprint, u64), TransferError> {
        fingerprint_file(&self.staged_path(token))
            .await
            .map_err(|e| TransferError::StorageWrite(e.to_string()))
    }

    async fn staged_len(&self, token: &SessionToken) -> Result<Option<u64>, TransferError> {
        match tokio::fs::metadata(self.staged_path(token)).await {
            Ok(metadata) => Ok(Some(metadata.len())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(storage_err("Failed to stat staging file", e)),
        }
    }

    async fn discard(&self, token: &SessionToken) -> Result<bool, TransferError> {
        match tokio::fs::remove_file(self.staged_path(token)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(storage_err("Failed to remove staging file", e)),
        }
    }

    fn staged_path(&self, token: &SessionToken) -> PathBuf {
        self.base_path.join(format!("{token}.part"))
    }
}

/// Copy `source` to `dest` while hashing; read failures are `Read`, write
/// failures are `StorageWrite`
fn copy_and_hash(source: &Path, dest: &Path, expected_size: u64) -> Result<Fingerprint, TransferError> {
    let read_err = |e: io::Error| TransferError::Read(format!("{}: {}", source.display(), e));

    let mut input = File::open(source).map_err(read_err)?;
    let mut output = File::create(dest).map_err(|e| storage_err("Failed to create staging file", e))?;
    let mut hasher = StreamingHasher::new();
    let mut buffer = vec![0u8; COPY_BUFFER_SIZE];

    loop {
        let n = match input.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(read_err(e)),
        };
        if hasher.bytes_hashed() + n as u64 > expected_size {
            return Err(TransferError::SizeMismatch {
                declared: expected_size,
                actual: hasher.bytes_hashed() + n as u64,
            });
        }
        hasher.update(&buffer[..n]);
        output
            .write_all(&buffer[..n])
            .map_err(|e| storage_err("Failed to write staging file", e))?;
    }

    if hasher.bytes_hashed() != expected_size {
        return Err(TransferError::SizeMismatch {
            declared: expected_size,
            actual: hasher.bytes_hashed(),
        });
    }

    output
        .sync_all()
        .map_err(|e| storage_err("Failed to sync staging file", e))?;

    Ok(hasher.finish())
}

// ============================================================================
// Test Backends
// ============================================================================

/// Local staging whose first `failures` writes fail with `StorageWrite`
#[cfg(test)]
pub(crate) struct FlakyStorage {
    inner: LocalChunkStorage,
    failures: std::sync::atomic::AtomicU32,
}

#[cfg(test)]
impl FlakyStorage {
    pub(crate) fn new(base_path: PathBuf, failures: u32) -> Self {
        Self {
            inner: LocalChunkStorage::new(base_path),
            failures: std::sync::atomic::AtomicU32::new(failures),
        }
    }

    fn trip(&self) -> Result<(), TransferError> {
        use std::sync::atomic::Ordering;
        let tripped = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if tripped {
            Err(TransferError::StorageWrite("injected failure".into()))
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
#[async_trait::async_trait]
impl ChunkStorage for FlakyStorage {
    async fn write_at(&self, token: &SessionToken, offset: u64, data: &[u8]) -> Result<(), TransferError> {
        self.trip()?;
        self.inner.write_at(token, offset, data).await
    }

    async fn stage_copy(&self, token: &SessionToken, source: &Path, expected_size: u64) -> Result<Fingerprint, TransferError> {
        self.trip()?;
        self.inner.stage_copy(token, source, expected_size).await
    }

    async fn hash_staged(&self, token: &SessionToken) -> Result<(Fingerprint, u64), TransferError> {
        self.inner.hash_staged(token).await
    }

    async fn staged_len(&self, token: &SessionToken) -> Result<Option<u64>, TransferError> {
        self.inner.staged_len(token).await
    }

    async fn discard(&self, token: &SessionToken) -> Result<bool, TransferError> {
        self.inner.discard(token).await
    }

    fn staged_path(&self, token: &SessionToken) -> PathBuf {
        self.inner.staged_path(token)
    }
}

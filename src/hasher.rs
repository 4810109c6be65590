//! Content Hasher
//!
//! SHA-256 content fingerprints (the deduplication key) and cheap sampled
//! fast keys (a pre-filter only, never a proof of duplication).

use std::fmt;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest as _, Sha256};

/// Bytes sampled from each region of a file for the fast key: 1MB
pub const FAST_SAMPLE_SIZE: u64 = 1024 * 1024;

const READ_BUFFER_SIZE: usize = 64 * 1024;

// ============================================================================
// Types
// ============================================================================

/// SHA-256 digest of a file's full content
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First `len` hex characters, used for collision suffixes
    pub fn short(&self, len: usize) -> String {
        let mut hex = self.to_hex();
        hex.truncate(len);
        hex
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.short(16))
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Invalid fingerprint: {0}")]
pub struct FingerprintParseError(String);

impl FromStr for Fingerprint {
    type Err = FingerprintParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|_| FingerprintParseError(s.to_string()))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| FingerprintParseError(s.to_string()))?;
        Ok(Self(bytes))
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Sampled pre-filter key (size + mtime + bounded content samples)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FastKey(String);

impl FastKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for FastKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Hashing mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashMode {
    /// Hash the entire content before deciding anything
    Full,
    /// Consult the fast key first; hits are still confirmed by a full hash
    Fast,
}

impl FromStr for HashMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "full" => Ok(HashMode::Full),
            "fast" => Ok(HashMode::Fast),
            other => Err(format!("unknown hash mode: {other}")),
        }
    }
}

/// Result of [`fingerprint`], tagged by the mode that produced it
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Digest {
    Full(Fingerprint),
    Fast(FastKey),
}

#[derive(Debug, thiserror::Error)]
pub enum HashError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Hash task failed: {0}")]
    Task(String),
}

// ============================================================================
// Streaming
// ============================================================================

/// Incremental full-content hasher, fed while bytes are copied
#[derive(Clone, Default)]
pub struct StreamingHasher {
    inner: Sha256,
    bytes: u64,
}

impl StreamingHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
        self.bytes += data.len() as u64;
    }

    pub fn bytes_hashed(&self) -> u64 {
        self.bytes
    }

    pub fn finish(self) -> Fingerprint {
        Fingerprint(self.inner.finalize().into())
    }
}

// ============================================================================
// Entry points
// ============================================================================

/// Fingerprint an in-memory buffer
pub fn fingerprint_bytes(data: &[u8]) -> Fingerprint {
    let mut hasher = StreamingHasher::new();
    hasher.update(data);
    hasher.finish()
}

/// Fingerprint everything a reader yields; returns the digest and byte count
pub fn fingerprint_reader<R: Read>(mut reader: R) -> io::Result<(Fingerprint, u64)> {
    let mut hasher = StreamingHasher::new();
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let n = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        hasher.update(&buffer[..n]);
    }

    let bytes = hasher.bytes_hashed();
    Ok((hasher.finish(), bytes))
}

/// Full-content fingerprint of a file, computed on a blocking thread
pub async fn fingerprint_file(path: &Path) -> Result<(Fingerprint, u64), HashError> {
    let owned = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        File::open(&owned)
            .and_then(fingerprint_reader)
            .map_err(|source| HashError::Read {
                path: owned.clone(),
                source,
            })
    })
    .await
    .map_err(|e| HashError::Task(e.to_string()))?
}

/// Fast key of a file using the default sample size
pub async fn fast_key(
    path: &Path,
    size: u64,
    modified: Option<DateTime<Utc>>,
) -> Result<FastKey, HashError> {
    let owned = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        fast_key_with_sample(&owned, size, modified, FAST_SAMPLE_SIZE).map_err(|source| {
            HashError::Read {
                path: owned.clone(),
                source,
            }
        })
    })
    .await
    .map_err(|e| HashError::Task(e.to_string()))?
}

/// Sampled key: size, mtime seconds, a prefix, and for files larger than
/// three samples also a middle and a tail sample.
pub fn fast_key_with_sample(
    path: &Path,
    size: u64,
    modified: Option<DateTime<Utc>>,
    sample: u64,
) -> io::Result<FastKey> {
    let mut hasher = Sha256::new();
    hasher.update(size.to_le_bytes());
    hasher.update(modified.map(|t| t.timestamp()).unwrap_or(0).to_le_bytes());

    let mut file = File::open(path)?;
    let mut buffer = Vec::with_capacity(sample.min(size) as usize);

    (&mut file).take(sample.min(size)).read_to_end(&mut buffer)?;
    hasher.update(&buffer);

    if size > sample * 3 {
        for offset in [size / 2 - sample / 2, size - sample] {
            buffer.clear();
            file.seek(SeekFrom::Start(offset))?;
            (&mut file).take(sample).read_to_end(&mut buffer)?;
            hasher.update(&buffer);
        }
    }

    Ok(FastKey(hex::encode(hasher.finalize())))
}

/// Digest of a file in the requested mode
pub async fn fingerprint(path: &Path, mode: HashMode) -> Result<Digest, HashError> {
    match mode {
        HashMode::Full => fingerprint_file(path)
            .await
            .map(|(fingerprint, _)| Digest::Full(fingerprint)),
        HashMode::Fast => {
            let metadata = tokio::fs::metadata(path)
                .await
                .map_err(|source| HashError::Read {
                    path: path.to_path_buf(),
                    source,
                })?;
            let modified = metadata.modified().ok().map(DateTime::<Utc>::from);
            fast_key(path, metadata.len(), modified).await.map(Digest::Fast)
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

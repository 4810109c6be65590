//! At-rest encryption post-step
//!
//! Runs after a file is placed in the archive. The plaintext copy and its
//! record are kept either way; a failure here only degrades the outcome.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Key, Nonce,
};

const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum EncryptionError {
    #[error("Encryption failed: {0}")]
    Encryption(String),
    #[error("Decryption failed: {0}")]
    Decryption(String),
    #[error("Key management error: {0}")]
    KeyManagement(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Transform applied to each newly stored file
#[async_trait::async_trait]
pub trait EncryptionTransform: Send + Sync {
    /// Encrypt the archived file at `path`, returning the artifact location
    async fn apply(&self, path: &Path) -> Result<PathBuf, EncryptionError>;
}

/// AES-256-GCM with a random nonce per file, written as `nonce || ciphertext`
/// to `<archive>/encrypted/<relative path>.enc`
pub struct AesGcmTransform {
    cipher: Arc<Aes256Gcm>,
    archive_root: PathBuf,
    output_dir: PathBuf,
}

impl AesGcmTransform {
    /// Load the hex key at `key_path`, generating one if the file is missing
    pub fn open(key_path: &Path, archive_root: impl Into<PathBuf>) -> Result<Self, EncryptionError> {
        let key = if key_path.exists() {
            load_key(key_path)?
        } else {
            let key = Aes256Gcm::generate_key(OsRng);
            store_key(key_path, &key)?;
            tracing::info!(key_path = %key_path.display(), "Generated new encryption key");
            key
        };

        let archive_root = archive_root.into();
        Ok(Self {
            cipher: Arc::new(Aes256Gcm::new(&key)),
            output_dir: archive_root.join("encrypted"),
            archive_root,
        })
    }

    fn output_path(&self, path: &Path) -> PathBuf {
        let relative = path
            .strip_prefix(&self.archive_root)
            .map(Path::to_path_buf)
            .unwrap_or_else(|_| PathBuf::from(path.file_name().unwrap_or_default()));
        let mut name = relative.into_os_string();
        name.push(".enc");
        self.output_dir.join(name)
    }

    /// Recover the plaintext of an artifact written by [`apply`](EncryptionTransform::apply)
    pub async fn decrypt_file(&self, path: &Path) -> Result<Vec<u8>, EncryptionError> {
        let data = tokio::fs::read(path).await?;
        if data.len() < NONCE_LEN {
            return Err(EncryptionError::Decryption("artifact shorter than nonce".into()));
        }
        let (nonce, ciphertext) = data.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|e| EncryptionError::Decryption(format!("AES-GCM decryption failed: {}", e)))
    }
}

#[async_trait::async_trait]
impl EncryptionTransform for AesGcmTransform {
    async fn apply(&self, path: &Path) -> Result<PathBuf, EncryptionError> {
        let output = self.output_path(path);
        if let Some(parent) = output.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let cipher = self.cipher.clone();
        let source = path.to_path_buf();
        let sealed = tokio::task::spawn_blocking(move || -> Result<Vec<u8>, EncryptionError> {
            let plaintext = std::fs::read(&source)?;
            let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
            let ciphertext = cipher
                .encrypt(&nonce, plaintext.as_slice())
                .map_err(|e| EncryptionError::Encryption(format!("AES-GCM encryption failed: {}", e)))?;

            let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
            sealed.extend_from_slice(&nonce);
            sealed.extend_from_slice(&ciphertext);
            Ok(sealed)
        })
        .await
        .map_err(|e| EncryptionError::Encryption(format!("Encryption task failed: {e}")))??;

        tokio::fs::write(&output, sealed).await?;

        tracing::debug!(
            source = %path.display(),
            output = %output.display(),
            "Encrypted archived file"
        );
        Ok(output)
    }
}

fn load_key(path: &Path) -> Result<Key<Aes256Gcm>, EncryptionError> {
    let encoded = std::fs::read_to_string(path)?;
    let bytes = hex::decode(encoded.trim())
        .map_err(|e| EncryptionError::KeyManagement(format!("Invalid key format: {}", e)))?;

    if bytes.len() != KEY_LEN {
        return Err(EncryptionError::KeyManagement(
            "Invalid key length, expected 32 bytes".to_string(),
        ));
    }

    Ok(*Key::<Aes256Gcm>::from_slice(&bytes))
}

fn store_key(path: &Path, key: &Key<Aes256Gcm>) -> Result<(), EncryptionError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, hex::encode(key.as_slice()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_encrypts_into_mirror_tree() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("archive");
        let file = root.join("2024").join("03_March").join("IMG_1.JPG");
        std::fs::create_dir_all(file.parent().unwrap()).unwrap();
        std::fs::write(&file, b"secret photo").unwrap();

        let transform = AesGcmTransform::open(&dir.path().join("keys/backup.key"), &root).unwrap();
        let output = transform.apply(&file).await.unwrap();

        assert_eq!(
            output,
            root.join("encrypted").join("2024").join("03_March").join("IMG_1.JPG.enc")
        );
        let sealed = std::fs::read(&output).unwrap();
        assert_ne!(&sealed[NONCE_LEN..], b"secret photo");
        assert_eq!(transform.decrypt_file(&output).await.unwrap(), b"secret photo");
    }

    #[tokio::test]
    async fn test_key_is_reused() {
        let dir = TempDir::new().unwrap();
        let key_path = dir.path().join("backup.key");
        let file = dir.path().join("a.jpg");
        std::fs::write(&file, b"bytes").unwrap();

        let first = AesGcmTransform::open(&key_path, dir.path()).unwrap();
        let output = first.apply(&file).await.unwrap();

        let second = AesGcmTransform::open(&key_path, dir.path()).unwrap();
        assert_eq!(second.decrypt_file(&output).await.unwrap(), b"bytes");
    }

    #[test]
    fn test_rejects_bad_key_file() {
        let dir = TempDir::new().unwrap();
        let key_path = dir.path().join("bad.key");
        std::fs::write(&key_path, "abcd").unwrap();

        let result = AesGcmTransform::open(&key_path, dir.path());
        assert!(matches!(result, Err(EncryptionError::KeyManagement(_))));
    }
}

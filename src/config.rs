//! Configuration management for the media backup server

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::hasher::HashMode;

/// Default chunk size: 10MB
pub const DEFAULT_CHUNK_SIZE: usize = 10 * 1024 * 1024;

/// Maximum file size: 5GB
pub const DEFAULT_MAX_FILE_SIZE: u64 = 5 * 1024 * 1024 * 1024;

/// Concurrent finalize/upload workers
pub const DEFAULT_MAX_CONCURRENT_TRANSFERS: usize = 5;

/// Concurrent raw file operations
pub const DEFAULT_MAX_CONCURRENT_FILE_OPS: usize = 10;

/// Session inactivity timeout: 24 hours
pub const DEFAULT_SESSION_TIMEOUT_SECS: u64 = 24 * 60 * 60;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub engine: EngineConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
}

/// Options handed to the transfer engine at construction.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Maximum accepted chunk length for network sessions
    pub chunk_size: usize,
    /// Ceiling on open/assembling sessions and whole-file finalize work
    pub max_concurrent_transfers: usize,
    /// Ceiling on chunk writes, staging copies and hashing reads
    pub max_concurrent_file_ops: usize,
    pub hash_mode: HashMode,
    pub session_timeout: Duration,
    pub archive_root: PathBuf,
    pub max_file_size: u64,
    /// Attempts for a staging or finalize write before the session fails
    pub storage_retries: u32,
    pub sweep_interval: Duration,
    /// Enables the AES-GCM encryption post-step when set
    pub encryption_key_path: Option<PathBuf>,
}

impl EngineConfig {
    /// Defaults rooted at the given archive directory
    pub fn with_archive_root(archive_root: impl Into<PathBuf>) -> Self {
        Self {
            archive_root: archive_root.into(),
            ..Self::default()
        }
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.archive_root.join(".staging")
    }

    pub fn encrypted_dir(&self) -> PathBuf {
        self.archive_root.join("encrypted")
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_concurrent_transfers: DEFAULT_MAX_CONCURRENT_TRANSFERS,
            max_concurrent_file_ops: DEFAULT_MAX_CONCURRENT_FILE_OPS,
            hash_mode: HashMode::Fast,
            session_timeout: Duration::from_secs(DEFAULT_SESSION_TIMEOUT_SECS),
            archive_root: PathBuf::from("./media_backup"),
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            storage_retries: 3,
            sweep_interval: Duration::from_secs(300),
            encryption_key_path: None,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8765,
            },
            database: DatabaseConfig {
                url: "sqlite:./backup_metadata.db".to_string(),
            },
            engine: EngineConfig::default(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = EngineConfig::default();

        let engine = EngineConfig {
            chunk_size: parse_var("CHUNK_SIZE", defaults.chunk_size)?,
            max_concurrent_transfers: parse_var(
                "MAX_CONCURRENT_UPLOADS",
                defaults.max_concurrent_transfers,
            )?,
            max_concurrent_file_ops: parse_var(
                "MAX_CONCURRENT_FILE_OPERATIONS",
                defaults.max_concurrent_file_ops,
            )?,
            hash_mode: parse_var("HASH_MODE", defaults.hash_mode)?,
            session_timeout: Duration::from_secs(parse_var(
                "SESSION_TIMEOUT_SECS",
                DEFAULT_SESSION_TIMEOUT_SECS,
            )?),
            archive_root: env::var("ARCHIVE_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.archive_root),
            max_file_size: parse_var("MAX_UPLOAD_SIZE", defaults.max_file_size)?,
            storage_retries: parse_var("STORAGE_RETRIES", defaults.storage_retries)?,
            sweep_interval: Duration::from_secs(parse_var(
                "SWEEP_INTERVAL_SECS",
                defaults.sweep_interval.as_secs(),
            )?),
            encryption_key_path: env::var("ENCRYPTION_KEY_PATH").ok().map(PathBuf::from),
        };

        if engine.max_concurrent_transfers == 0 || engine.max_concurrent_file_ops == 0 {
            return Err(ConfigError::InvalidValue {
                key: "MAX_CONCURRENT_*",
                value: "0".to_string(),
            });
        }

        Ok(Config {
            server: ServerConfig {
                host: env::var("SERVER_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: parse_var("SERVER_PORT", 8765)?,
            },
            database: DatabaseConfig {
                url: env::var("DATABASE_URL")
                    .unwrap_or_else(|_| "sqlite:./backup_metadata.db".to_string()),
            },
            engine,
        })
    }
}

fn parse_var<T: FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue { key, value }),
        Err(_) => Ok(default),
    }
}

//! Media Backup Server Library
//!
//! Deduplicating, resumable transfer engine for backing up photos and videos
//! from a device. The server binary in main.rs exposes it over HTTP.
//!
//! # Modules
//!
//! - `transfer`: The engine driving each file to a stored or duplicate outcome
//! - `upload`: Sessions, staging and the fingerprint index
//! - `hasher`: Content fingerprints and fast pre-filter keys
//! - `archive`: Date-based layout of stored files
//! - `db`: SQLite persistence

pub mod archive;
pub mod config;
pub mod db;
pub mod encryption;
pub mod error;
pub mod hasher;
pub mod routes;
pub mod source;
pub mod state;
pub mod transfer;
pub mod upload;

pub use config::{Config, EngineConfig};
pub use transfer::{BatchSummary, TransferEngine};

//! Chunked Upload Module
//!
//! Implements resumable transfers with:
//! - Byte-range chunks written at arbitrary offsets into a staging file
//! - Durable session state so an interrupted transfer resumes after restart
//! - A fingerprint index guaranteeing each content is stored once
//!
//! Protocol Flow:
//! 1. Client opens a session with file name and declared size
//! 2. Client sends chunks in any order, replays are harmless
//! 3. The chunk completing `[0, size)` triggers hashing and finalize
//! 4. Server reports the file as stored or as a duplicate of an existing one

pub mod chunk_store;
pub mod deduplication;
pub mod ranges;
pub mod session;
pub mod types;

pub use chunk_store::{ChunkStorage, ChunkStore, LocalChunkStorage};
pub use deduplication::{CacheStats, DeduplicationIndex};
pub use ranges::RangeSet;
pub use session::{SessionEntry, SessionHandle, SessionManager};
pub use types::*;

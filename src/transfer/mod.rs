//! Transfer orchestration
//!
//! The engine that carries files from submission to a terminal outcome,
//! plus its progress counters and storage retry policy.

pub mod engine;
pub mod progress;
pub mod retry;

pub use engine::{
    BatchFailure, BatchSummary, EngineStats, TransferEngine, VerifyReport, VerifyStatus,
};
pub use progress::{ProgressSnapshot, ProgressTracker, QueuedFile};
pub use retry::RetryPolicy;

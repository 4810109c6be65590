//! Import Routes
//!
//! Back up a mounted device directory in one batch.
//!
//! Endpoints:
//! - POST /api/v1/imports - Scan a directory for media and transfer every file

use std::path::PathBuf;

use axum::{extract::State, routing::post, Json, Router};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::source::{scan_media, ScanError};
use crate::state::AppState;
use crate::transfer::BatchSummary;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportRequest {
    /// Mounted source directory
    pub path: PathBuf,
    #[serde(default)]
    pub device_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportResponse {
    pub files_found: usize,
    /// Unreadable entries and symlinks left out of the scan
    pub entries_skipped: u64,
    #[serde(flatten)]
    pub summary: BatchSummary,
}

pub fn router() -> Router<AppState> {
    Router::new().route("/", post(start_import))
}

/// POST /api/v1/imports
///
/// Runs to completion; per-file failures are reported in the summary.
async fn start_import(
    State(state): State<AppState>,
    Json(request): Json<ImportRequest>,
) -> Result<Json<ImportResponse>> {
    let root = request.path.clone();
    let scan = tokio::task::spawn_blocking(move || scan_media(&root))
        .await
        .map_err(|e| AppError::Internal(format!("scan task failed: {e}")))?
        .map_err(|e| match e {
            ScanError::NotFound(_) => AppError::NotFound(e.to_string()),
            ScanError::NotDirectory(_) => AppError::BadRequest(e.to_string()),
        })?;

    let files_found = scan.files.len();
    let summary = state
        .engine()
        .submit_batch(scan.files, request.device_id)
        .await
        .map_err(|e| AppError::Internal(e.to_string()))?;

    Ok(Json(ImportResponse {
        files_found,
        entries_skipped: scan.skipped,
        summary,
    }))
}

//! Activity Routes
//!
//! Read-only views of transfer progress and past outcomes.
//!
//! Endpoints:
//! - GET /api/v1/progress - Live progress counters
//! - GET /api/v1/stats - Archive totals
//! - GET /api/v1/history?limit=N - Most recent sync history entries
//! - GET /api/v1/runs?limit=N - Most recent batch runs
//! - GET /api/v1/files/:fingerprint/verify - Re-hash one archived file

use axum::{
    extract::{Path, Query, State},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::db::{BackupRun, HistoryEntry, HistoryRepository, HistoryTotals, RunRepository};
use crate::error::{AppError, Result};
use crate::hasher::Fingerprint;
use crate::state::AppState;
use crate::transfer::{EngineStats, ProgressSnapshot, VerifyReport};

const DEFAULT_LIMIT: i64 = 50;
const MAX_LIMIT: i64 = 500;

#[derive(Debug, Deserialize)]
struct ListQuery {
    limit: Option<i64>,
}

impl ListQuery {
    fn limit(&self) -> i64 {
        self.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HistoryResponse {
    totals: HistoryTotals,
    entries: Vec<HistoryEntry>,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/v1/progress", get(get_progress))
        .route("/api/v1/stats", get(get_stats))
        .route("/api/v1/history", get(list_history))
        .route("/api/v1/runs", get(list_runs))
        .route("/api/v1/files/:fingerprint/verify", get(verify_file))
}

async fn get_progress(State(state): State<AppState>) -> Json<ProgressSnapshot> {
    Json(state.engine().progress())
}

async fn get_stats(State(state): State<AppState>) -> Result<Json<EngineStats>> {
    let stats = state
        .engine()
        .stats()
        .await
        .map_err(|e| AppError::Internal(e.to_string()))?;
    Ok(Json(stats))
}

async fn list_history(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<HistoryResponse>> {
    let repo = HistoryRepository::new(state.db());
    Ok(Json(HistoryResponse {
        totals: repo.totals().await?,
        entries: repo.list_recent(query.limit()).await?,
    }))
}

async fn list_runs(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<BackupRun>>> {
    let runs = RunRepository::new(state.db()).list_recent(query.limit()).await?;
    Ok(Json(runs))
}

async fn verify_file(
    State(state): State<AppState>,
    Path(fingerprint): Path<String>,
) -> Result<Json<VerifyReport>> {
    let fingerprint: Fingerprint = fingerprint
        .parse()
        .map_err(|e: crate::hasher::FingerprintParseError| AppError::BadRequest(e.to_string()))?;

    state
        .engine()
        .verify(&fingerprint)
        .await
        .map_err(|e| AppError::Internal(e.to_string()))?
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("No file with fingerprint {fingerprint}")))
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{send, test_app};
    use crate::hasher::fingerprint_bytes;
    use crate::source::CandidateFile;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tempfile::TempDir;

    fn get(uri: &str) -> Request<Body> {
        Request::get(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_activity_after_batch() {
        let dir = TempDir::new().unwrap();
        let (app, state) = test_app(&dir).await;

        let source = dir.path().join("IMG_1.JPG");
        std::fs::write(&source, b"photo bytes").unwrap();
        let candidate = CandidateFile::from_path(&source).await.unwrap();
        let summary = state
            .engine()
            .submit_batch(vec![candidate.clone(), candidate], Some("phone".into()))
            .await
            .unwrap();
        assert_eq!(summary.backed_up + summary.skipped_duplicates, 2);

        let (status, body) = send(&app, get("/api/v1/progress")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["storedFiles"], 1);
        assert_eq!(body["duplicateFiles"], 1);
        assert_eq!(body["queuedFiles"], 0);

        let (_, body) = send(&app, get("/api/v1/history?limit=10")).await;
        assert_eq!(body["entries"].as_array().unwrap().len(), 2);
        assert_eq!(body["totals"]["stored"], 1);

        let (_, body) = send(&app, get("/api/v1/runs")).await;
        let runs = body.as_array().unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0]["status"], "success");
        assert_eq!(runs[0]["sourceDevice"], "phone");

        let (_, body) = send(&app, get("/api/v1/stats")).await;
        assert_eq!(body["storedFiles"], 1);

        let fp = fingerprint_bytes(b"photo bytes");
        let (status, body) = send(&app, get(&format!("/api/v1/files/{fp}/verify"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "intact");
    }

    #[tokio::test]
    async fn test_verify_unknown_and_malformed() {
        let dir = TempDir::new().unwrap();
        let (app, _) = test_app(&dir).await;

        let (status, _) = send(&app, get("/api/v1/files/xyz/verify")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let fp = fingerprint_bytes(b"never stored");
        let (status, _) = send(&app, get(&format!("/api/v1/files/{fp}/verify"))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}

//! Upload Routes
//!
//! HTTP endpoints for chunked, resumable uploads.
//!
//! Endpoints:
//! - POST /api/v1/sessions - Open a session for one file
//! - PUT /api/v1/sessions/:token/chunks?offset=N - Write raw bytes at an offset
//! - GET /api/v1/sessions/:token - Session status and missing ranges
//! - DELETE /api/v1/sessions/:token - Abort the session

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::state::AppState;
use crate::upload::{
    SessionRequest, SessionStatus, SessionTicket, SessionToken, TransferError, WriteOutcome,
};

// ============================================================================
// Error Response
// ============================================================================

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    code: &'static str,
}

impl IntoResponse for TransferError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(code = self.code(), error = %self, "Transfer request failed");
        }

        let body = Json(ErrorResponse {
            error: self.to_string(),
            code: self.code(),
        });

        (status, body).into_response()
    }
}

// ============================================================================
// Router
// ============================================================================

/// Create the upload router. Request bodies may carry one full chunk.
pub fn router(chunk_size: usize) -> Router<AppState> {
    Router::new()
        .route("/", post(open_session))
        .route("/:token", axum::routing::get(get_session).delete(abort_session))
        .route("/:token/chunks", put(write_chunk))
        .layer(DefaultBodyLimit::max(chunk_size.max(1024 * 1024)))
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /api/v1/sessions
async fn open_session(
    State(state): State<AppState>,
    Json(request): Json<SessionRequest>,
) -> Result<(StatusCode, Json<SessionTicket>), TransferError> {
    let ticket = state.engine().open_session(request).await?;
    Ok((StatusCode::CREATED, Json(ticket)))
}

#[derive(Debug, Deserialize)]
struct ChunkQuery {
    offset: u64,
}

/// PUT /api/v1/sessions/:token/chunks?offset=N
///
/// The raw body is the chunk. The chunk that completes the file returns the
/// finalize outcome.
async fn write_chunk(
    State(state): State<AppState>,
    Path(token): Path<String>,
    Query(query): Query<ChunkQuery>,
    body: Bytes,
) -> Result<Json<WriteOutcome>, TransferError> {
    let token: SessionToken = token.parse()?;
    let outcome = state.engine().write_chunk(&token, query.offset, &body).await?;
    Ok(Json(outcome))
}

/// GET /api/v1/sessions/:token
async fn get_session(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> Result<Json<SessionStatus>, TransferError> {
    let token: SessionToken = token.parse()?;
    Ok(Json(state.engine().session_status(&token).await?))
}

/// DELETE /api/v1/sessions/:token
async fn abort_session(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> Result<Json<SessionStatus>, TransferError> {
    let token: SessionToken = token.parse()?;
    Ok(Json(state.engine().abort(&token).await?))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::super::test_support::{json_request, send, test_app};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::json;
    use tempfile::TempDir;

    fn chunk(token: &str, offset: u64, data: Vec<u8>) -> Request<Body> {
        Request::put(format!("/api/v1/sessions/{token}/chunks?offset={offset}"))
            .body(Body::from(data))
            .unwrap()
    }

    #[tokio::test]
    async fn test_upload_flow() {
        let dir = TempDir::new().unwrap();
        let (app, _) = test_app(&dir).await;
        let data: Vec<u8> = (0..600u32).map(|i| (i % 251) as u8).collect();

        let (status, ticket) = send(
            &app,
            json_request(
                "POST",
                "/api/v1/sessions",
                json!({ "fileName": "IMG_0001.JPG", "declaredSize": 600, "sourceDevice": "phone" }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(ticket["chunkSize"], 400);
        let token = ticket["token"].as_str().unwrap().to_string();

        let (status, body) = send(&app, chunk(&token, 400, data[400..].to_vec())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["result"], "accepted");
        assert_eq!(body["status"]["missingRanges"], json!([[0, 400]]));

        let (status, body) = send(&app, chunk(&token, 0, data[..400].to_vec())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["result"], "completed");
        assert_eq!(body["outcome"]["outcome"], "stored");
        assert_eq!(body["outcome"]["record"]["sourceDevice"], "phone");

        let request = Request::get(format!("/api/v1/sessions/{token}"))
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(&app, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["state"], "completed");
        assert_eq!(body["outcome"], "stored");
        assert!(body["storagePath"].as_str().unwrap().ends_with("/IMG_0001.JPG"));

        let (status, body) = send(&app, chunk(&token, 0, vec![1, 2, 3])).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["code"], "SESSION_CLOSED");
    }

    #[tokio::test]
    async fn test_unknown_and_malformed_tokens() {
        let dir = TempDir::new().unwrap();
        let (app, _) = test_app(&dir).await;

        let request = Request::get("/api/v1/sessions/not-a-token")
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(&app, request).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "SESSION_NOT_FOUND");

        let request = Request::get(format!("/api/v1/sessions/{}", uuid::Uuid::new_v4()))
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(&app, request).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_open_rejects_empty_file() {
        let dir = TempDir::new().unwrap();
        let (app, _) = test_app(&dir).await;

        let (status, body) = send(
            &app,
            json_request("POST", "/api/v1/sessions", json!({ "fileName": "a.jpg", "declaredSize": 0 })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "INVALID_REQUEST");
    }

    #[tokio::test]
    async fn test_abort() {
        let dir = TempDir::new().unwrap();
        let (app, _) = test_app(&dir).await;

        let (_, ticket) = send(
            &app,
            json_request("POST", "/api/v1/sessions", json!({ "fileName": "a.jpg", "declaredSize": 1000 })),
        )
        .await;
        let token = ticket["token"].as_str().unwrap().to_string();

        let request = Request::delete(format!("/api/v1/sessions/{token}"))
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(&app, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["state"], "failed");
        assert_eq!(body["errorMessage"], "aborted");
    }
}

//! Route modules for the media backup server

pub mod activity;
pub mod health;
pub mod imports;
pub mod upload;

use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Full HTTP surface with tracing and CORS layers
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let chunk_size = state.config().engine.chunk_size;

    Router::new()
        .merge(health::router())
        .merge(activity::router())
        .nest("/api/v1/sessions", upload::router(chunk_size))
        .nest("/api/v1/imports", imports::router())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

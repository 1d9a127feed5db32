//! API Routes
//!
//! Configures the Axum router with all bridge endpoints.

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use super::handlers::{
    cache_stats_handler, fetch_handler, health_handler, invalidate_handler, mutate_handler,
    query_handler, AppState,
};

/// Creates the main router with all endpoints configured.
///
/// # Endpoints
/// - `POST /query` - Run a multi-endpoint fetch job
/// - `POST /fetch` - Paginate a single endpoint
/// - `POST /mutate` - Create, update or delete a remote resource
/// - `GET /cache/stats` - Cache introspection
/// - `POST /cache/invalidate` - Drop cached responses
/// - `GET /health` - Health check endpoint
///
/// # Middleware
/// - CORS: Allows any origin
/// - Tracing: Logs all requests
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/query", post(query_handler))
        .route("/fetch", post(fetch_handler))
        .route("/mutate", post(mutate_handler))
        .route("/cache/stats", get(cache_stats_handler))
        .route("/cache/invalidate", post(invalidate_handler))
        .route("/health", get(health_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

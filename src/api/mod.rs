//! API Module
//!
//! HTTP handlers and routing for the bridge REST API.
//!
//! # Endpoints
//! - `POST /query` - Run a fetch job and return its envelope
//! - `POST /fetch` - Single-endpoint paginated fetch
//! - `POST /mutate` - Remote write followed by cache invalidation
//! - `GET /cache/stats` - Cache statistics
//! - `POST /cache/invalidate` - Cache invalidation
//! - `GET /health` - Health check endpoint

pub mod handlers;
pub mod routes;

pub use handlers::*;
pub use routes::create_router;

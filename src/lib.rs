//! CRM Bridge - cached, rate-aware gateway to a CRM REST API
//!
//! Fetches and paginates remote list endpoints through a shared response
//! cache, reduces the combined records with caller-supplied snippets, and
//! serves the result over HTTP.

pub mod api;
pub mod cache;
pub mod client;
pub mod config;
pub mod dates;
pub mod error;
pub mod models;
pub mod pipeline;
pub mod query;
pub mod tasks;

pub use api::AppState;
pub use config::Config;
pub use pipeline::QueryService;
pub use tasks::spawn_cleanup_task;

//! Error types for the CRM bridge
//!
//! Provides unified error handling using thiserror.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};
use thiserror::Error;

// == Fetch Error Enum ==
/// Failure of a single call against the remote CRM API.
#[derive(Error, Debug)]
pub enum FetchError {
    /// Remote answered with an error status other than 429
    #[error("HTTP {status} from remote API")]
    Http {
        status: u16,
        /// Structured error body, when the remote sent parseable JSON
        body: Option<Value>,
    },

    /// Remote answered 429 Too Many Requests
    #[error("Rate limit exceeded, wait before retrying")]
    RateLimited,

    /// No response at all (connect failure, timeout, TLS...)
    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// Response body was not valid JSON
    #[error("Invalid JSON in response: {0}")]
    Decode(#[from] serde_json::Error),
}

impl FetchError {
    /// True when the remote was never reached.
    pub fn is_transport(&self) -> bool {
        matches!(self, FetchError::Transport(_))
    }

    /// Human readable description including the remote error body.
    pub fn detail(&self) -> String {
        match self {
            FetchError::Http {
                status,
                body: Some(body),
            } => format!("{} Bad Request: {}", status, body),
            FetchError::Http { status, body: None } => format!("{} Bad Request", status),
            other => other.to_string(),
        }
    }
}

// == Query Error Enum ==
/// Failure of the processing stage of a job.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum QueryError {
    /// The transformation snippet failed
    #[error("{message}")]
    Processing { message: String },

    /// The transformation produced a payload above the configured limit
    #[error("Result size ({actual_mb:.2} MB) exceeds limit ({limit_mb} MB)")]
    ResultTooLarge { limit_mb: u64, actual_mb: f64 },
}

// == Script Error Enum ==
/// Errors raised while parsing or evaluating a transformation snippet.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ScriptError {
    #[error("SyntaxError: {message} (line {line})")]
    Syntax { line: usize, message: String },

    #[error("NameError: name '{0}' is not defined")]
    Name(String),

    #[error("TypeError: {0}")]
    Type(String),

    #[error("KeyError: {0}")]
    Key(String),

    #[error("IndexError: {0}")]
    Index(String),

    #[error("ValueError: {0}")]
    Value(String),

    #[error("ZeroDivisionError: division by zero")]
    ZeroDivision,

    #[error("Evaluation budget of {0} steps exhausted")]
    Budget(u64),

    #[error("RecursionError: maximum nesting depth of {0} exceeded")]
    Depth(usize),
}

impl ScriptError {
    /// Errors after which an expression-mode attempt is retried as a block.
    pub fn allows_block_fallback(&self) -> bool {
        matches!(self, ScriptError::Syntax { .. } | ScriptError::Name(_))
    }
}

// == Config Error Enum ==
/// Fatal startup configuration problems.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{0} environment variable is required. Set it in .env file or environment variables.")]
    MissingCredential(&'static str),

    #[error("Invalid value '{value}' for {name}")]
    Invalid { name: &'static str, value: String },
}

// == App Error Enum ==
/// Error type returned by the HTTP handlers.
#[derive(Error, Debug)]
pub enum AppError {
    /// Invalid request data
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Remote CRM call failed
    #[error(transparent)]
    Upstream(#[from] FetchError),
}

// == IntoResponse Implementation ==
impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            AppError::InvalidRequest(msg) => (StatusCode::BAD_REQUEST, json!({ "error": msg })),
            AppError::Upstream(FetchError::RateLimited) => (
                StatusCode::TOO_MANY_REQUESTS,
                json!({ "error": self.to_string() }),
            ),
            AppError::Upstream(FetchError::Http { status, body }) => (
                StatusCode::BAD_GATEWAY,
                json!({
                    "error": self.to_string(),
                    "remoteStatus": status,
                    "remoteBody": body,
                }),
            ),
            AppError::Upstream(_) => (StatusCode::BAD_GATEWAY, json!({ "error": self.to_string() })),
        };

        (status, Json(body)).into_response()
    }
}

// == Result Type Alias ==
/// Convenience Result type for the HTTP handlers.
pub type Result<T> = std::result::Result<T, AppError>;

//! Response DTOs for the bridge API
//!
//! Defines the job envelope and the bodies of the auxiliary endpoints.

use serde::Serialize;
use serde_json::Value;

use crate::models::DateRange;

/// Record count of one fetched endpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointCount {
    pub endpoint: String,
    pub record_count: usize,
}

/// An endpoint whose pagination was cut short; its records so far are kept.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointFailure {
    pub endpoint: String,
    pub message: String,
    pub records_kept: usize,
}

/// Timing and volume figures of a job.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Performance {
    pub total_records_fetched: usize,
    pub processing_time_ms: u64,
    pub total_time_ms: u64,
    pub per_endpoint_counts: Vec<EndpointCount>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub fetch_errors: Vec<EndpointFailure>,
}

/// Envelope of a job that reached the processing stage.
///
/// Processing failures live inside `results`, never in `success`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSuccess {
    pub success: bool,
    pub query: String,
    pub executed_at: String,
    pub date_range: Option<DateRange>,
    pub performance: Performance,
    pub results: Value,
}

/// Envelope of a job that failed before processing.
#[derive(Debug, Clone, Serialize)]
pub struct JobFailure {
    pub success: bool,
    pub error: String,
    pub message: String,
    pub query: String,
    pub recommendation: String,
}

/// Response body of `POST /query`.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum JobEnvelope {
    Success(JobSuccess),
    Failure(JobFailure),
}

impl JobEnvelope {
    pub fn is_success(&self) -> bool {
        matches!(self, JobEnvelope::Success(_))
    }
}

/// Response body of `POST /fetch`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchResponse {
    pub endpoint: String,
    pub record_count: usize,
    pub requests: usize,
    pub records: Vec<Value>,
    /// Set when pagination stopped on an error
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Response body of `POST /mutate`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MutateResponse {
    pub endpoint: String,
    pub method: String,
    /// Cached responses dropped after the write
    pub invalidated: usize,
    pub result: Value,
}

/// Response body of `POST /cache/invalidate`.
#[derive(Debug, Clone, Serialize)]
pub struct InvalidateResponse {
    pub removed: usize,
    pub pattern: Option<String>,
}

/// Response body for the health endpoint (GET /health)
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Health status (e.g., "healthy")
    pub status: String,
    /// Current timestamp in ISO 8601 format
    pub timestamp: String,
}

impl HealthResponse {
    /// Creates a new HealthResponse with current timestamp
    pub fn healthy() -> Self {
        Self {
            status: "healthy".to_string(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn performance() -> Performance {
        Performance {
            total_records_fetched: 3,
            processing_time_ms: 1,
            total_time_ms: 9,
            per_endpoint_counts: vec![EndpointCount {
                endpoint: "people".into(),
                record_count: 3,
            }],
            fetch_errors: vec![],
        }
    }

    #[test]
    fn test_success_envelope_shape() {
        let envelope = JobEnvelope::Success(JobSuccess {
            success: true,
            query: "people".into(),
            executed_at: "2025-06-01T00:00:00Z".into(),
            date_range: None,
            performance: performance(),
            results: json!({"people": []}),
        });
        let json = serde_json::to_value(&envelope).unwrap();

        assert_eq!(json["success"], true);
        assert_eq!(json["dateRange"], Value::Null);
        assert_eq!(json["performance"]["totalRecordsFetched"], 3);
        assert_eq!(json["performance"]["perEndpointCounts"][0]["recordCount"], 3);
        assert!(json["performance"].get("fetchErrors").is_none());
        assert!(envelope.is_success());
    }

    #[test]
    fn test_failure_envelope_shape() {
        let envelope = JobEnvelope::Failure(JobFailure {
            success: false,
            error: "Query execution failed".into(),
            message: "boom".into(),
            query: "q".into(),
            recommendation: "retry".into(),
        });
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["recommendation"], "retry");
        assert!(!envelope.is_success());
    }

    #[test]
    fn test_health_response_serialize() {
        let resp = HealthResponse::healthy();
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains("healthy"));
        assert!(json.contains("timestamp"));
    }
}

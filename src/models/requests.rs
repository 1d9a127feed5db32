//! Request DTOs for the bridge API
//!
//! Defines the structure of incoming job and tool-call bodies.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cache::Params;

/// Inclusive ISO-8601 date range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: String,
    pub end: String,
}

/// One endpoint to fetch as part of a job.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointSpec {
    /// API path such as `/people`
    pub endpoint: String,
    #[serde(default)]
    pub params: Params,
    /// Record field the job's date range applies to
    #[serde(default)]
    pub date_field: Option<String>,
}

/// Request body for `POST /query`.
///
/// # Fields
/// - `description`: Human readable description echoed in the envelope
/// - `endpoints`: Endpoints to fetch, in order
/// - `dateRange`: Optional range applied to endpoints with a `dateField`
/// - `processing`: Optional transformation snippet
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchJob {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub endpoints: Vec<EndpointSpec>,
    #[serde(default)]
    pub date_range: Option<DateRange>,
    #[serde(default)]
    pub processing: Option<String>,
}

impl FetchJob {
    /// Validates the job shape.
    ///
    /// Returns an error message if validation fails, None if valid.
    pub fn validate(&self) -> Option<String> {
        if self.endpoints.is_empty() {
            return Some("At least one endpoint is required".to_string());
        }
        validate_endpoints(self.endpoints.iter().map(|spec| spec.endpoint.as_str()))
    }
}

/// Request body for `POST /fetch`: one paginated endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchRequest {
    pub endpoint: String,
    #[serde(default)]
    pub params: Params,
    #[serde(default)]
    pub date_field: Option<String>,
    #[serde(default)]
    pub date_range: Option<DateRange>,
    /// Overrides the configured page size (capped by it)
    #[serde(default)]
    pub page_size: Option<usize>,
}

impl FetchRequest {
    pub fn validate(&self) -> Option<String> {
        validate_endpoints(std::iter::once(self.endpoint.as_str()))
    }
}

/// HTTP method allowed through `POST /mutate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MutationMethod {
    Post,
    Put,
    Delete,
}

impl MutationMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationMethod::Post => "POST",
            MutationMethod::Put => "PUT",
            MutationMethod::Delete => "DELETE",
        }
    }
}

/// Request body for `POST /mutate`: create, update or delete a resource.
#[derive(Debug, Clone, Deserialize)]
pub struct MutateRequest {
    pub method: MutationMethod,
    pub endpoint: String,
    #[serde(default)]
    pub body: Option<Value>,
}

impl MutateRequest {
    pub fn validate(&self) -> Option<String> {
        if self.method != MutationMethod::Delete && self.body.is_none() {
            return Some(format!("{} requires a body", self.method.as_str()));
        }
        validate_endpoints(std::iter::once(self.endpoint.as_str()))
    }
}

/// Request body for `POST /cache/invalidate`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InvalidateRequest {
    /// Endpoint substring; everything is cleared when absent
    #[serde(default)]
    pub pattern: Option<String>,
}

fn validate_endpoints<'a>(endpoints: impl Iterator<Item = &'a str>) -> Option<String> {
    for endpoint in endpoints {
        if !endpoint.starts_with('/') || endpoint.len() < 2 {
            return Some(format!(
                "Invalid endpoint '{}': expected a path such as /people",
                endpoint
            ));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_deserialize() {
        let json = r#"{
            "description": "Calls last month",
            "endpoints": [
                {"endpoint": "/calls", "params": {"userId": 3}, "dateField": "created"},
                {"endpoint": "/users"}
            ],
            "dateRange": {"start": "2025-06-01", "end": "2025-06-30"},
            "processing": "len(data['calls'])"
        }"#;
        let job: FetchJob = serde_json::from_str(json).unwrap();

        assert_eq!(job.endpoints.len(), 2);
        assert_eq!(job.endpoints[0].date_field.as_deref(), Some("created"));
        assert_eq!(job.endpoints[0].params["userId"], 3);
        assert!(job.endpoints[1].params.is_empty());
        assert_eq!(job.date_range.as_ref().unwrap().end, "2025-06-30");
        assert!(job.validate().is_none());
    }

    #[test]
    fn test_job_without_endpoints_is_invalid() {
        let job: FetchJob = serde_json::from_str(r#"{"description": "nothing"}"#).unwrap();
        assert!(job.validate().is_some());
    }

    #[test]
    fn test_job_with_bad_endpoint_is_invalid() {
        let job: FetchJob =
            serde_json::from_str(r#"{"endpoints": [{"endpoint": "people"}]}"#).unwrap();
        assert!(job.validate().unwrap().contains("people"));
    }

    #[test]
    fn test_mutate_request() {
        let req: MutateRequest =
            serde_json::from_str(r#"{"method": "POST", "endpoint": "/people", "body": {"name": "Ann"}}"#)
                .unwrap();
        assert_eq!(req.method, MutationMethod::Post);
        assert!(req.validate().is_none());

        let missing_body: MutateRequest =
            serde_json::from_str(r#"{"method": "PUT", "endpoint": "/people/1"}"#).unwrap();
        assert!(missing_body.validate().is_some());

        let delete: MutateRequest =
            serde_json::from_str(r#"{"method": "DELETE", "endpoint": "/people/1"}"#).unwrap();
        assert!(delete.validate().is_none());
    }

    #[test]
    fn test_mutate_rejects_get() {
        let result: Result<MutateRequest, _> =
            serde_json::from_str(r#"{"method": "GET", "endpoint": "/people"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_invalidate_request_defaults() {
        let req: InvalidateRequest = serde_json::from_str("{}").unwrap();
        assert!(req.pattern.is_none());
    }
}

//! Response Assembler
//!
//! Collects what a job fetched and wraps the processed result into the
//! outward envelope.

use std::time::Duration;

use serde_json::{Map, Value};

use crate::models::{
    DateRange, EndpointCount, EndpointFailure, JobEnvelope, JobFailure, JobSuccess, Performance,
};

/// `error` field of every failure envelope.
pub const JOB_FAILED: &str = "Query execution failed";

const JOB_FAILED_RECOMMENDATION: &str =
    "Verify endpoint names and parameters. Check logs for details.";

/// Dataset key of an endpoint: `/people` -> `people`, `/custom-fields` -> `custom_fields`.
pub fn dataset_key(endpoint: &str) -> String {
    endpoint
        .replace(['/', '-'], "_")
        .trim_start_matches('_')
        .to_string()
}

// == Fetched Dataset ==
/// Records of every endpoint of one job, keyed by [`dataset_key`].
#[derive(Debug, Default)]
pub struct FetchedDataset {
    records: Map<String, Value>,
    counts: Vec<EndpointCount>,
    failures: Vec<EndpointFailure>,
}

impl FetchedDataset {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores the records of `endpoint`.
    ///
    /// Two endpoints sharing a key keep the later records under the earlier
    /// position in the counts.
    pub fn insert(&mut self, endpoint: &str, records: Vec<Value>) {
        let key = dataset_key(endpoint);
        let count = EndpointCount {
            endpoint: key.clone(),
            record_count: records.len(),
        };
        match self.counts.iter_mut().find(|c| c.endpoint == key) {
            Some(slot) => *slot = count,
            None => self.counts.push(count),
        }
        self.records.insert(key, Value::Array(records));
    }

    /// Records an endpoint whose pagination stopped on an error.
    pub fn record_failure(&mut self, endpoint: &str, message: String, records_kept: usize) {
        self.failures.push(EndpointFailure {
            endpoint: endpoint.to_string(),
            message,
            records_kept,
        });
    }

    pub fn total_records(&self) -> usize {
        self.counts.iter().map(|c| c.record_count).sum()
    }

    pub fn failures(&self) -> &[EndpointFailure] {
        &self.failures
    }

    pub fn counts(&self) -> &[EndpointCount] {
        &self.counts
    }

    /// Splits into the `data` object handed to the executor and the
    /// per-endpoint bookkeeping.
    pub fn into_parts(self) -> (Value, Vec<EndpointCount>, Vec<EndpointFailure>) {
        (Value::Object(self.records), self.counts, self.failures)
    }
}

// == Envelopes ==
/// Timings of a finished job.
#[derive(Debug, Clone, Copy, Default)]
pub struct JobTimings {
    pub processing: Duration,
    pub total: Duration,
}

/// Builds the success envelope.
pub fn success(
    query: &str,
    date_range: Option<DateRange>,
    counts: Vec<EndpointCount>,
    fetch_errors: Vec<EndpointFailure>,
    timings: JobTimings,
    results: Value,
) -> JobEnvelope {
    let total_records_fetched = counts.iter().map(|c| c.record_count).sum();
    JobEnvelope::Success(JobSuccess {
        success: true,
        query: query.to_string(),
        executed_at: chrono::Utc::now().to_rfc3339(),
        date_range,
        performance: Performance {
            total_records_fetched,
            processing_time_ms: millis(timings.processing),
            total_time_ms: millis(timings.total),
            per_endpoint_counts: counts,
            fetch_errors,
        },
        results,
    })
}

/// Builds the failure envelope.
pub fn failure(query: &str, message: impl Into<String>) -> JobEnvelope {
    JobEnvelope::Failure(JobFailure {
        success: false,
        error: JOB_FAILED.to_string(),
        message: message.into(),
        query: query.to_string(),
        recommendation: JOB_FAILED_RECOMMENDATION.to_string(),
    })
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_dataset_key() {
        assert_eq!(dataset_key("/people"), "people");
        assert_eq!(dataset_key("/custom-fields"), "custom_fields");
        assert_eq!(dataset_key("/people/12/notes"), "people_12_notes");
        assert_eq!(dataset_key("deals"), "deals");
    }

    #[test]
    fn test_duplicate_key_replaces_records() {
        let mut dataset = FetchedDataset::new();
        dataset.insert("/people", vec![json!({"id": 1})]);
        dataset.insert("/calls", vec![]);
        dataset.insert("people", vec![json!({"id": 2}), json!({"id": 3})]);

        assert_eq!(dataset.counts().len(), 2);
        assert_eq!(dataset.counts()[0].endpoint, "people");
        assert_eq!(dataset.counts()[0].record_count, 2);
        assert_eq!(dataset.total_records(), 2);

        let (data, _, _) = dataset.into_parts();
        assert_eq!(data["people"], json!([{"id": 2}, {"id": 3}]));
        assert_eq!(data["calls"], json!([]));
    }

    #[test]
    fn test_success_envelope_counts_records() {
        let counts = vec![
            EndpointCount {
                endpoint: "people".into(),
                record_count: 2,
            },
            EndpointCount {
                endpoint: "deals".into(),
                record_count: 5,
            },
        ];
        let envelope = success(
            "pipeline review",
            None,
            counts,
            vec![],
            JobTimings {
                processing: Duration::from_millis(4),
                total: Duration::from_millis(30),
            },
            json!({"total": 7}),
        );

        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["success"], true);
        assert_eq!(json["query"], "pipeline review");
        assert_eq!(json["performance"]["totalRecordsFetched"], 7);
        assert_eq!(json["performance"]["processingTimeMs"], 4);
        assert_eq!(json["performance"]["totalTimeMs"], 30);
        assert_eq!(json["results"]["total"], 7);
        assert!(json["executedAt"].as_str().unwrap().contains('T'));
    }

    #[test]
    fn test_failure_envelope() {
        let json = serde_json::to_value(failure("q", "At least one endpoint is required")).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["error"], JOB_FAILED);
        assert_eq!(json["message"], "At least one endpoint is required");
        assert!(json["recommendation"].as_str().unwrap().contains("endpoint"));
    }
}

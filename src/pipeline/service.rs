//! Query Service
//!
//! Drives a job end to end: fetch every endpoint, run the transformation,
//! assemble the envelope. Also backs the single-endpoint fetch and the
//! mutation tool calls.

use std::sync::Arc;
use std::time::Instant;

use reqwest::Method;
use tracing::{debug, info, warn};

use crate::cache::{Params, SharedCache};
use crate::client::{resource_prefix, DateWindow, FetcherSettings, PageQuery, RemoteFetcher};
use crate::config::Config;
use crate::error::FetchError;
use crate::models::{
    DateRange, FetchJob, FetchRequest, FetchResponse, JobEnvelope, MutateRequest, MutateResponse,
    MutationMethod,
};
use crate::pipeline::assembler::{self, FetchedDataset, JobTimings};
use crate::query::QueryExecutor;

// == Query Service ==
#[derive(Debug)]
pub struct QueryService {
    fetcher: Arc<RemoteFetcher>,
    executor: QueryExecutor,
    max_page_size: usize,
}

impl QueryService {
    pub fn new(fetcher: Arc<RemoteFetcher>, executor: QueryExecutor, max_page_size: usize) -> Self {
        Self {
            fetcher,
            executor,
            max_page_size: max_page_size.max(1),
        }
    }

    /// Wires a fetcher over `cache` and an executor from configuration.
    pub fn from_config(config: &Config, cache: SharedCache) -> Result<Self, FetchError> {
        let fetcher = RemoteFetcher::new(FetcherSettings::from_config(config), cache)?;
        Ok(Self::new(
            Arc::new(fetcher),
            QueryExecutor::from_config(config),
            config.max_page_size,
        ))
    }

    pub fn fetcher(&self) -> &RemoteFetcher {
        &self.fetcher
    }

    fn page_query(
        &self,
        endpoint: &str,
        params: Params,
        page_size: usize,
        date_field: Option<&str>,
        date_range: Option<&DateRange>,
    ) -> PageQuery {
        let window = match (date_field, date_range) {
            (Some(field), Some(range)) => {
                let window = DateWindow::parse(field, range);
                if window.is_none() {
                    warn!(
                        endpoint,
                        start = %range.start,
                        end = %range.end,
                        "date range does not parse, fetching without date filter"
                    );
                }
                window
            }
            _ => None,
        };
        PageQuery::from_caller_params(endpoint, params, page_size).with_window(window)
    }

    // == Run Job ==
    /// Runs `job` and returns its envelope.
    ///
    /// Endpoint errors are reported in `performance.fetchErrors` and keep the
    /// records fetched before them. The job itself fails only when it is
    /// invalid or when no endpoint could reach the remote at all.
    pub async fn run(&self, job: FetchJob) -> JobEnvelope {
        let started = Instant::now();

        if let Some(message) = job.validate() {
            warn!(query = %job.description, %message, "rejected invalid job");
            return assembler::failure(&job.description, message);
        }

        info!(
            query = %job.description,
            endpoints = job.endpoints.len(),
            "running query job"
        );

        let mut dataset = FetchedDataset::new();
        let mut transport_failures = 0;
        let mut last_error = None;

        for spec in &job.endpoints {
            let query = self.page_query(
                &spec.endpoint,
                spec.params.clone(),
                self.max_page_size,
                spec.date_field.as_deref(),
                job.date_range.as_ref(),
            );
            let run = self.fetcher.fetch_all_pages(&query).await;
            debug!(
                endpoint = %spec.endpoint,
                records = run.records.len(),
                requests = run.requests,
                "endpoint fetched"
            );

            if let Some(err) = run.error {
                if err.is_transport() {
                    transport_failures += 1;
                }
                let message = err.detail();
                dataset.record_failure(&spec.endpoint, message.clone(), run.records.len());
                last_error = Some(message);
            }
            dataset.insert(&spec.endpoint, run.records);
        }

        if transport_failures == job.endpoints.len() && dataset.total_records() == 0 {
            let message = last_error.unwrap_or_else(|| "Remote API unreachable".to_string());
            warn!(query = %job.description, %message, "every endpoint failed");
            return assembler::failure(&job.description, message);
        }

        let (data, counts, failures) = dataset.into_parts();
        let executor = self.executor.clone();
        let snippet = job.processing.clone();
        let outcome =
            match tokio::task::spawn_blocking(move || executor.execute(snippet.as_deref(), data))
                .await
            {
                Ok(outcome) => outcome,
                Err(err) => {
                    warn!(query = %job.description, error = %err, "processing task aborted");
                    return assembler::failure(&job.description, err.to_string());
                }
            };

        let timings = JobTimings {
            processing: outcome.elapsed,
            total: started.elapsed(),
        };
        info!(
            query = %job.description,
            mode = ?outcome.mode,
            diagnostic = outcome.result.is_diagnostic(),
            total_ms = timings.total.as_millis() as u64,
            "query job finished"
        );

        assembler::success(
            &job.description,
            job.date_range,
            counts,
            failures,
            timings,
            outcome.result.into_value(),
        )
    }

    // == Fetch One ==
    /// Paginates a single endpoint without any processing.
    pub async fn fetch_one(&self, request: FetchRequest) -> FetchResponse {
        let page_size = request
            .page_size
            .filter(|size| *size > 0)
            .map_or(self.max_page_size, |size| size.min(self.max_page_size));
        let query = self.page_query(
            &request.endpoint,
            request.params,
            page_size,
            request.date_field.as_deref(),
            request.date_range.as_ref(),
        );
        let run = self.fetcher.fetch_all_pages(&query).await;

        FetchResponse {
            endpoint: request.endpoint,
            record_count: run.records.len(),
            requests: run.requests,
            records: run.records,
            error: run.error.map(|err| err.detail()),
        }
    }

    // == Mutate ==
    /// Forwards a write to the remote and drops cached reads of the resource.
    pub async fn mutate(&self, request: MutateRequest) -> Result<MutateResponse, FetchError> {
        let method = match request.method {
            MutationMethod::Post => Method::POST,
            MutationMethod::Put => Method::PUT,
            MutationMethod::Delete => Method::DELETE,
        };
        let body = match request.method {
            MutationMethod::Delete => None,
            _ => request.body.as_ref(),
        };

        let result = self
            .fetcher
            .request(method, &request.endpoint, &Params::new(), body)
            .await?;

        let prefix = resource_prefix(&request.endpoint);
        let invalidated = self.fetcher.invalidate_resource(&prefix).await;
        info!(
            method = request.method.as_str(),
            endpoint = %request.endpoint,
            invalidated,
            "mutation applied"
        );

        Ok(MutateResponse {
            endpoint: request.endpoint,
            method: request.method.as_str().to_string(),
            invalidated,
            result,
        })
    }
}

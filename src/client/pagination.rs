//! Pagination
//!
//! Walks a list endpoint page by page, optionally keeping only records inside
//! a date window and stopping early once pages fall behind the window.

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::cache::Params;
use crate::client::RemoteFetcher;
use crate::dates::{parse_range_end, parse_timestamp};
use crate::error::FetchError;
use crate::models::DateRange;

/// Key of the pagination metadata object in list responses.
pub const METADATA_KEY: &str = "_metadata";

// == Date Window ==
/// Inclusive `[start, end]` filter on one record field.
#[derive(Debug, Clone, PartialEq)]
pub struct DateWindow {
    pub field: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl DateWindow {
    /// Builds a window, or `None` when either bound does not parse.
    pub fn parse(field: &str, range: &DateRange) -> Option<Self> {
        Some(Self {
            field: field.to_string(),
            start: parse_timestamp(&range.start)?,
            end: parse_range_end(&range.end)?,
        })
    }

    fn record_date(&self, record: &Value) -> Option<DateTime<Utc>> {
        record
            .get(&self.field)
            .and_then(Value::as_str)
            .and_then(parse_timestamp)
    }

    /// True when the record's date lies inside the window.
    ///
    /// Records without a parseable date never match.
    pub fn contains(&self, record: &Value) -> bool {
        self.record_date(record)
            .is_some_and(|date| self.start <= date && date <= self.end)
    }

    /// True when the record is dated before the window opens.
    pub fn precedes(&self, record: &Value) -> bool {
        self.record_date(record).is_some_and(|date| date < self.start)
    }
}

// == Page Query ==
/// One paginated fetch.
#[derive(Debug, Clone)]
pub struct PageQuery {
    pub endpoint: String,
    /// Base parameters, without `limit`/`offset`
    pub params: Params,
    pub page_size: usize,
    pub start_offset: usize,
    pub window: Option<DateWindow>,
    /// Stop once this many records were collected
    pub record_cap: Option<usize>,
}

impl PageQuery {
    pub fn new(endpoint: impl Into<String>, params: Params, page_size: usize) -> Self {
        Self {
            endpoint: endpoint.into(),
            params,
            page_size: page_size.max(1),
            start_offset: 0,
            window: None,
            record_cap: None,
        }
    }

    /// Builds a query from caller parameters.
    ///
    /// A caller `limit` caps the number of records returned (and shrinks the
    /// page size to match); a caller `offset` becomes the starting offset.
    pub fn from_caller_params(endpoint: impl Into<String>, mut params: Params, max_page_size: usize) -> Self {
        let limit = params.remove("limit").and_then(|v| positive_int(&v));
        let offset = params.remove("offset").and_then(|v| positive_int(&v));

        let mut query = Self::new(endpoint, params, max_page_size);
        if let Some(limit) = limit {
            query.page_size = limit.min(query.page_size);
            query.record_cap = Some(limit);
        }
        query.start_offset = offset.unwrap_or(0);
        query
    }

    pub fn with_window(mut self, window: Option<DateWindow>) -> Self {
        self.window = window;
        self
    }

    fn page_params(&self, offset: usize) -> Params {
        let mut params = self.params.clone();
        params.insert("limit".into(), json!(self.page_size));
        params.insert("offset".into(), json!(offset));
        params
    }
}

fn positive_int(value: &Value) -> Option<usize> {
    let n = match value {
        Value::Number(n) => n.as_u64().map(|n| n as usize),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    };
    n.filter(|n| *n > 0)
}

// == Page Outcome ==
/// Result of one page request, inspected by the pagination loop.
#[derive(Debug)]
pub enum PageOutcome {
    /// A page of records; `total` is the remote's reported total, if any
    Page { records: Vec<Value>, total: Option<u64> },
    /// The response carried no record list
    End,
    /// The request failed
    Failed(FetchError),
}

impl PageOutcome {
    /// Classifies a list response.
    pub fn from_response(response: Value) -> Self {
        let Value::Object(mut body) = response else {
            return PageOutcome::End;
        };

        let total = body
            .get(METADATA_KEY)
            .and_then(Value::as_object)
            .map(|meta| meta.get("total").and_then(Value::as_u64).unwrap_or(0));

        let list_key = body
            .iter()
            .find(|(key, value)| key.as_str() != METADATA_KEY && value.is_array())
            .map(|(key, _)| key.clone());

        match list_key.and_then(|key| body.remove(&key)) {
            Some(Value::Array(records)) => PageOutcome::Page { records, total },
            _ => PageOutcome::End,
        }
    }
}

// == Page Run ==
/// Everything collected by a paginated fetch.
#[derive(Debug, Default)]
pub struct PageRun {
    pub records: Vec<Value>,
    /// Page requests issued (cache hits included)
    pub requests: usize,
    /// The error that cut pagination short, if any
    pub error: Option<FetchError>,
}

impl RemoteFetcher {
    async fn fetch_page(&self, query: &PageQuery, offset: usize) -> PageOutcome {
        match self.get(&query.endpoint, &query.page_params(offset)).await {
            Ok(response) => PageOutcome::from_response(response),
            Err(err) => PageOutcome::Failed(err),
        }
    }

    // == Fetch All Pages ==
    /// Collects every page of `query`.
    ///
    /// Stops when the reported total is reached, a short page arrives, the
    /// date window has been passed, the record cap is met, or a request
    /// fails. On failure the records gathered so far are kept.
    pub async fn fetch_all_pages(&self, query: &PageQuery) -> PageRun {
        let mut run = PageRun::default();
        let mut offset = query.start_offset;

        loop {
            run.requests += 1;
            let (records, total) = match self.fetch_page(query, offset).await {
                PageOutcome::Page { records, total } => (records, total),
                PageOutcome::End => break,
                PageOutcome::Failed(err) => {
                    warn!(endpoint = %query.endpoint, offset, error = %err.detail(), "pagination stopped by error");
                    run.error = Some(err);
                    break;
                }
            };

            let fetched = records.len();
            let mut done = false;

            let kept = match &query.window {
                Some(window) => {
                    let passed_window = records.last().is_some_and(|last| window.precedes(last));
                    let kept: Vec<Value> = records.into_iter().filter(|r| window.contains(r)).collect();
                    if kept.is_empty() && passed_window {
                        debug!(endpoint = %query.endpoint, offset, "page is older than the date window");
                        done = true;
                    }
                    kept
                }
                None => records,
            };
            run.records.extend(kept);

            match total {
                Some(total) => {
                    offset += query.page_size;
                    if offset as u64 >= total {
                        done = true;
                    }
                }
                None => done = true,
            }

            if fetched < query.page_size {
                done = true;
            }

            if let Some(cap) = query.record_cap {
                if run.records.len() >= cap {
                    run.records.truncate(cap);
                    done = true;
                }
            }

            if done {
                break;
            }
        }

        debug!(
            endpoint = %query.endpoint,
            records = run.records.len(),
            requests = run.requests,
            "pagination finished"
        );
        run
    }
}

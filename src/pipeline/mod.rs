//! Pipeline Module
//!
//! Ties the fetcher and the query executor together into jobs and builds
//! the response envelopes.

pub mod assembler;
mod service;

pub use assembler::{dataset_key, FetchedDataset, JobTimings, JOB_FAILED};
pub use service::QueryService;

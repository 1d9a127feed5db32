//! Request and Response models for the bridge API
//!
//! This module defines the DTOs (Data Transfer Objects) used for
//! serializing/deserializing job and tool-call bodies.

pub mod requests;
pub mod responses;

// Re-export commonly used types
pub use requests::{
    DateRange, EndpointSpec, FetchJob, FetchRequest, InvalidateRequest, MutateRequest,
    MutationMethod,
};
pub use responses::{
    EndpointCount, EndpointFailure, FetchResponse, HealthResponse, InvalidateResponse,
    JobEnvelope, JobFailure, JobSuccess, MutateResponse, Performance,
};

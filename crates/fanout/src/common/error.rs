//! Error types for the batching and fan-out pipeline.
//!
//! This module defines the central `Error` enum. Errors are `Clone` because a
//! single job-wide failure (e.g. [`Error::DispatchUnavailable`]) is delivered
//! to every caller whose request shared that job.
//!
//! ## Error Cases
//! - `UnknownRequest`: A fragment or status update referenced a request the
//!   ledger no longer tracks. Recoverable; the caller drops the message.
//! - `DispatchUnavailable`: A closed job could not be enqueued after all retry
//!   attempts. Terminal for every request in that job.
//! - `Generation`: The generation function failed for one request. Terminal
//!   for that request only.
//! - `CallerDisconnected`: The caller went away before its stream completed.
//! - `WorkerUnavailable`: A job was claimed but could not be processed at all.
//! - `EnqueueFailed`: A single enqueue attempt was rejected by the queue.
//! - `ChannelError`: An internal communication failure between tasks.
//! - `InvalidRequest`: The caller's payload was rejected.
//! - `InvalidConfig`: The service configuration is unusable.
//! - `ServiceShutdown`: The service is shutting down.

use crate::common::types::{JobId, RequestId};

pub type Result<T> = core::result::Result<T, Error>;

/// Unified error type for the batching service.
#[derive(Clone, thiserror::Error, Debug, PartialEq, Eq)]
pub enum Error {
    /// The ledger has no entry for this request (never registered, or already
    /// reaped).
    #[error("Unknown request: {id}")]
    UnknownRequest { id: RequestId },

    /// The job holding this request never reached the work queue.
    #[error("Dispatch unavailable for job {job_id} after {attempts} attempts: {reason}")]
    DispatchUnavailable {
        job_id: JobId,
        attempts: u32,
        reason: String,
    },

    /// The generation function failed while producing this request's output.
    #[error("Generation error: {0}")]
    Generation(#[from] GenerationError),

    /// The caller disconnected before the stream completed.
    #[error("Caller disconnected")]
    CallerDisconnected,

    /// The job was claimed by a worker but could not be processed.
    #[error("Worker unavailable for job {job_id}: {reason}")]
    WorkerUnavailable { job_id: JobId, reason: String },

    /// The work queue rejected a job.
    #[error("Enqueue failed: {reason}")]
    EnqueueFailed { reason: String },

    /// Internal channel send/receive failure.
    #[error("Channel error: {context}")]
    ChannelError { context: String },

    /// The request payload was invalid.
    #[error("Invalid request: {reason}")]
    InvalidRequest { reason: String },

    /// The service configuration was invalid.
    #[error("Invalid config: {reason}")]
    InvalidConfig { reason: String },

    /// The service is in the process of shutting down.
    #[error("Service is shutting down")]
    ServiceShutdown,
}

impl Error {
    /// Returns `true` if the request carrying this error never produced any
    /// output because its job was not processed, as opposed to a generation
    /// failure part-way through.
    #[must_use]
    pub const fn is_unprocessed(&self) -> bool {
        matches!(
            self,
            Self::DispatchUnavailable { .. } | Self::WorkerUnavailable { .. } | Self::ServiceShutdown
        )
    }
}

/// Failure reported by a [`Generate`](crate::Generate) implementation.
#[derive(Clone, thiserror::Error, Debug, PartialEq, Eq)]
#[error("{message}")]
pub struct GenerationError {
    message: String,
}

impl GenerationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

//! # Identifiers, jobs and fragments
//!
//! This module defines the data that flows through the pipeline:
//!
//! - [`RequestId`] / [`JobId`] - opaque ULID-backed identifiers
//! - [`Prompt`] - the caller's generation input
//! - [`RequestStatus`] / [`JobStatus`] - forward-only lifecycles
//! - [`Job`] - an ordered batch of [`JobEntry`] values
//! - [`Fragment`] / [`RelayMessage`] - the worker-to-relay wire messages
//! - [`Delivery`] - what a caller reads from its delivery channel
//!
//! Identifiers are ULIDs generated by [`ferroid`] and render as 26-character
//! Crockford base32 strings.

use crate::common::error::{Error, Result};
use core::fmt;
use core::time::Duration;
use ferroid::id::ULID;
use std::sync::Arc;
use tokio::time::Instant;

macro_rules! ulid_newtype {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(ULID);

        impl $name {
            /// Allocates a fresh identifier.
            #[must_use]
            pub fn new() -> Self {
                Self(ULID::now())
            }

            /// Returns the raw 128-bit value.
            #[must_use]
            pub const fn to_raw(&self) -> u128 {
                self.0.to_raw()
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }
    };
}

ulid_newtype!(
    /// Identifies one caller's request for its whole lifetime.
    RequestId
);

ulid_newtype!(
    /// Identifies one batch of requests, assigned when the batch opens.
    JobId
);

/// Caller-supplied generation input.
///
/// Cheap to clone: the text is shared between the ledger and the job that
/// carries it to a worker.
#[derive(Clone, PartialEq, Eq)]
pub struct Prompt(Arc<str>);

impl Prompt {
    /// Validates and wraps a prompt.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRequest`] if the prompt is empty or whitespace.
    pub fn new(text: impl Into<String>) -> Result<Self> {
        let text = text.into();
        if text.trim().is_empty() {
            return Err(Error::InvalidRequest {
                reason: "Prompt cannot be empty".to_string(),
            });
        }
        Ok(Self(Arc::from(text)))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Prompt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Prompt").field("len", &self.0.len()).finish()
    }
}

/// Lifecycle of a single request.
///
/// Statuses only move forward; see [`RequestStatus::rank`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RequestStatus {
    Pending,
    Batched,
    Queued,
    Processing,
    Streaming,
    Completed,
    Failed(Error),
}

impl RequestStatus {
    /// Position in the lifecycle. Both terminal statuses share the last rank.
    #[must_use]
    pub const fn rank(&self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Batched => 1,
            Self::Queued => 2,
            Self::Processing => 3,
            Self::Streaming => 4,
            Self::Completed | Self::Failed(_) => 5,
        }
    }

    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed(_))
    }

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Batched => "batched",
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Streaming => "streaming",
            Self::Completed => "completed",
            Self::Failed(_) => "failed",
        }
    }
}

/// Lifecycle of a job.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum JobStatus {
    Open,
    Closed,
    Enqueued,
    Running,
    Done,
    Failed,
}

/// One request inside a job, carrying the payload the worker needs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobEntry {
    pub request_id: RequestId,
    pub prompt: Prompt,
}

/// A batch of requests processed as one unit of work.
///
/// Mutable only while [`JobStatus::Open`] and only by the batcher that owns
/// it.
#[derive(Clone, Debug)]
pub struct Job {
    pub id: JobId,
    pub entries: Vec<JobEntry>,
    pub opened_at: Instant,
    pub closed_at: Option<Instant>,
    pub status: JobStatus,
}

impl Job {
    pub(crate) fn open(id: JobId, opened_at: Instant, capacity: usize) -> Self {
        Self {
            id,
            entries: Vec::with_capacity(capacity),
            opened_at,
            closed_at: None,
            status: JobStatus::Open,
        }
    }

    pub(crate) fn close(&mut self, at: Instant) {
        debug_assert_eq!(self.status, JobStatus::Open);
        self.closed_at = Some(at);
        self.status = JobStatus::Closed;
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Request ids in arrival order.
    #[must_use]
    pub fn request_ids(&self) -> Vec<RequestId> {
        self.entries.iter().map(|e| e.request_id).collect()
    }

    /// Time the job spent open, if it has been closed.
    #[must_use]
    pub fn window(&self) -> Option<Duration> {
        self.closed_at.map(|closed| closed - self.opened_at)
    }
}

/// Payload of a [`Fragment`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FragmentBody {
    /// A chunk of generated text.
    Content(String),
    /// Natural end of the request's stream.
    Final,
    /// The request failed; no further fragments follow.
    Error(Error),
}

/// One tagged chunk of a request's output, or its terminal marker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Fragment {
    pub job_id: JobId,
    pub request_id: RequestId,
    /// Per-request position, contiguous from 0.
    pub sequence: u64,
    pub body: FragmentBody,
}

impl Fragment {
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self.body, FragmentBody::Final | FragmentBody::Error(_))
    }
}

/// Outcome counters for a processed job.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct JobStats {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub elapsed: Duration,
}

impl JobStats {
    #[must_use]
    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.succeeded as f64 / self.total as f64
    }

    #[must_use]
    pub fn avg_processing_time(&self) -> Duration {
        match u32::try_from(self.total) {
            Ok(0) | Err(_) => Duration::ZERO,
            Ok(total) => self.elapsed / total,
        }
    }
}

/// Messages emitted by workers and consumed by the
/// [`StreamRelay`](crate::StreamRelay).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RelayMessage {
    /// A worker claimed the job and is about to run its requests.
    JobStarted {
        job_id: JobId,
        request_ids: Vec<RequestId>,
    },
    /// Output for one request.
    Fragment(Fragment),
    /// The job could not be processed; every request in it fails.
    JobFailed {
        job_id: JobId,
        request_ids: Vec<RequestId>,
        error: Error,
    },
    /// Every request in the job reached a terminal fragment.
    JobFinished {
        job_id: JobId,
        status: JobStatus,
        stats: JobStats,
    },
}

/// Item read by the caller from its delivery channel.
///
/// A stream carries any number of `Text` items followed by exactly one
/// terminal item.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Delivery {
    Text(String),
    Completed,
    Failed(Error),
}

impl Delivery {
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::Text(_))
    }
}

impl From<FragmentBody> for Delivery {
    fn from(body: FragmentBody) -> Self {
        match body {
            FragmentBody::Content(text) => Self::Text(text),
            FragmentBody::Final => Self::Completed,
            FragmentBody::Error(e) => Self::Failed(e),
        }
    }
}

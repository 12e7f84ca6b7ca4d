//! Routes worker output to the callers that are waiting for it.
//!
//! The relay is the only consumer of the worker-to-intake channel. Each
//! fragment is checked against the [`RequestLedger`] (known request, owning
//! job, next expected sequence, not yet terminal) before being forwarded to
//! the request's delivery channel. Anything that fails those checks is
//! dropped, which makes duplicate and late fragments harmless.

use crate::{
    common::types::{Fragment, RelayMessage, RequestStatus},
    ledger::{DropReason, RequestLedger, Route},
};
use core::time::Duration;
use std::sync::Arc;
use tokio::sync::mpsc;

/// What happened to a single fragment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Forwarded to the caller.
    Delivered,
    /// Rejected by the ledger.
    Dropped(DropReason),
    /// The request is no longer tracked.
    Unknown,
    /// The caller stopped reading; the request was cancelled.
    Abandoned,
}

/// Demultiplexes [`RelayMessage`]s into per-request delivery channels.
pub struct StreamRelay {
    ledger: Arc<RequestLedger>,
    delivery_timeout: Duration,
}

impl StreamRelay {
    #[must_use]
    pub const fn new(ledger: Arc<RequestLedger>, delivery_timeout: Duration) -> Self {
        Self {
            ledger,
            delivery_timeout,
        }
    }

    /// Handles messages until every worker has dropped its sender.
    pub async fn run(self, mut rx: mpsc::Receiver<RelayMessage>) {
        while let Some(message) = rx.recv().await {
            self.handle(message).await;
        }

        #[cfg(feature = "tracing")]
        tracing::debug!("Relay stopped");
    }

    /// Applies one message to the ledger and the delivery channels.
    pub async fn handle(&self, message: RelayMessage) {
        match message {
            RelayMessage::JobStarted {
                job_id: _job_id,
                request_ids,
            } => {
                #[cfg(feature = "tracing")]
                tracing::trace!("Job {_job_id} started ({} requests)", request_ids.len());
                for id in request_ids {
                    let _ = self.ledger.mark(id, RequestStatus::Processing);
                }
            }
            RelayMessage::Fragment(fragment) => {
                let _outcome = self.route(fragment).await;
                #[cfg(feature = "tracing")]
                if !matches!(_outcome, RouteOutcome::Delivered) {
                    tracing::trace!("Fragment not delivered: {_outcome:?}");
                }
            }
            RelayMessage::JobFailed {
                job_id: _job_id,
                request_ids,
                error,
            } => {
                #[cfg(feature = "tracing")]
                tracing::warn!("Job {_job_id} failed: {error}");
                for id in request_ids {
                    let _ = self.ledger.fail(id, error.clone());
                }
            }
            RelayMessage::JobFinished {
                job_id: _job_id,
                status: _status,
                stats: _stats,
            } => {
                #[cfg(feature = "tracing")]
                tracing::debug!(
                    "Job {_job_id} finished ({_status:?}): {}/{} succeeded ({:.0}%)",
                    _stats.succeeded,
                    _stats.total,
                    _stats.success_rate() * 100.0
                );
            }
        }
    }

    /// Routes one fragment to its caller.
    ///
    /// A send that cannot complete within the delivery timeout, or that finds
    /// the channel closed, cancels the request so a stalled caller cannot hold
    /// up every other stream for longer than one timeout.
    pub async fn route(&self, fragment: Fragment) -> RouteOutcome {
        let request_id = fragment.request_id;
        let (sender, delivery) = match self.ledger.route(fragment) {
            Ok(Route::Deliver { sender, delivery }) => (sender, delivery),
            Ok(Route::Drop(reason)) => return RouteOutcome::Dropped(reason),
            Err(_) => return RouteOutcome::Unknown,
        };

        // The relay is a single task: while this send waits, no other request
        // receives output. `stream_buffer_size` and `delivery_timeout` bound
        // that stall.
        match tokio::time::timeout(self.delivery_timeout, sender.send(delivery)).await {
            Ok(Ok(())) => RouteOutcome::Delivered,
            Ok(Err(_)) | Err(_) => {
                #[cfg(feature = "tracing")]
                tracing::debug!("Caller of request {request_id} stopped reading; cancelling");
                self.ledger.cancel(request_id);
                RouteOutcome::Abandoned
            }
        }
    }
}

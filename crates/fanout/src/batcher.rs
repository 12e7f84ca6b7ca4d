//! Groups incoming requests into jobs.
//!
//! At most one job is open at a time. A request either joins the open job or
//! opens a new one. The open job closes exactly once, on whichever comes
//! first:
//!
//! - it reaches `max_requests_per_job` entries (size trigger), or
//! - `batch_window` has elapsed since it opened (time trigger).
//!
//! A closing job is handed to the dispatcher while the slot is still locked,
//! so the dispatcher sees jobs in the order they closed and a request can
//! never join a job that is already on its way out. Capacity on the bounded
//! channel is reserved before the slot changes; a backlogged dispatcher
//! therefore holds up submitters instead of letting closed jobs pile up.

use crate::{
    common::{
        error::{Error, Result},
        types::{Job, JobEntry, JobId, RequestId},
    },
    ledger::RequestLedger,
};
use core::time::Duration;
use std::sync::{Arc, Weak};
use tokio::sync::{Mutex, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Why a job was closed.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CloseReason {
    /// The job reached its request limit.
    Full,
    /// The batch window elapsed.
    Window,
    /// The service flushed the open job during shutdown.
    Flush,
}

impl CloseReason {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Window => "window",
            Self::Flush => "flush",
        }
    }
}

/// Channel capacity reserved for a closing job, or the reason there is none.
type Handoff<'a> = core::result::Result<mpsc::Permit<'a, Job>, mpsc::error::SendError<()>>;

struct OpenJob {
    job: Job,
    timer: CancellationToken,
}

struct Inner {
    slot: Mutex<Option<OpenJob>>,
    ledger: Arc<RequestLedger>,
    closed_tx: mpsc::Sender<Job>,
    window: Duration,
    max_requests: usize,
}

/// Assigns requests to jobs and closes jobs on size or time.
#[derive(Clone)]
pub struct Batcher {
    inner: Arc<Inner>,
}

impl Batcher {
    /// Creates a batcher that sends closed jobs on `closed_tx`.
    #[must_use]
    pub fn new(
        ledger: Arc<RequestLedger>,
        closed_tx: mpsc::Sender<Job>,
        window: Duration,
        max_requests: usize,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                slot: Mutex::new(None),
                ledger,
                closed_tx,
                window,
                max_requests: max_requests.max(1),
            }),
        }
    }

    /// Appends a registered request to the open job, opening one if needed,
    /// and returns the job it joined.
    ///
    /// If the request fills the job, the job is closed before this returns,
    /// waiting for room on the dispatcher channel if necessary.
    ///
    /// # Errors
    ///
    /// - [`Error::UnknownRequest`] / [`Error::InvalidRequest`] if the request
    ///   is not a pending, unassigned ledger entry.
    /// - [`Error::ChannelError`] if the job filled up and the dispatcher is
    ///   gone. The job's requests have already been failed in that case.
    pub async fn submit(&self, request_id: RequestId) -> Result<JobId> {
        let inner = &self.inner;
        let mut slot = inner.slot.lock().await;
        let job_id = slot.as_ref().map_or_else(JobId::new, |open| open.job.id);

        let fills = slot.as_ref().map_or(0, |open| open.job.len()) + 1 >= inner.max_requests;
        let handoff = if fills {
            Some(inner.closed_tx.reserve().await)
        } else {
            None
        };

        // Assign before touching the slot so a rejected request never
        // leaves an empty job behind.
        let prompt = inner.ledger.assign(request_id, job_id)?;

        let open = slot.get_or_insert_with(|| inner.open(job_id));
        open.job.entries.push(JobEntry { request_id, prompt });

        #[cfg(feature = "tracing")]
        tracing::trace!(
            "Request {request_id} joined job {job_id} ({}/{})",
            open.job.len(),
            inner.max_requests
        );

        if let Some(handoff) = handoff {
            if let Some(open) = slot.take() {
                open.timer.cancel();
                inner.close(open.job, CloseReason::Full, handoff)?;
            }
        }
        Ok(job_id)
    }

    /// Closes the open job, if any, regardless of its size or age.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ChannelError`] if the dispatcher is gone.
    pub async fn flush(&self) -> Result<()> {
        let inner = &self.inner;
        let mut slot = inner.slot.lock().await;
        if slot.is_none() {
            return Ok(());
        }

        let handoff = inner.closed_tx.reserve().await;
        if let Some(open) = slot.take() {
            open.timer.cancel();
            inner.close(open.job, CloseReason::Flush, handoff)?;
        }
        Ok(())
    }

    /// Id of the currently open job.
    pub async fn open_job(&self) -> Option<JobId> {
        self.inner.slot.lock().await.as_ref().map(|open| open.job.id)
    }
}

impl Inner {
    /// Opens a job and arms its window timer.
    fn open(self: &Arc<Self>, job_id: JobId) -> OpenJob {
        let opened_at = Instant::now();
        let timer = CancellationToken::new();
        tokio::spawn(window_timer(
            Arc::downgrade(self),
            job_id,
            opened_at + self.window,
            timer.clone(),
        ));

        #[cfg(feature = "tracing")]
        tracing::debug!("Opened job {job_id}");

        OpenJob {
            job: Job::open(job_id, opened_at, self.max_requests),
            timer,
        }
    }

    /// Stamps `job` as closed and hands it to the dispatcher. Called with the
    /// slot locked.
    fn close(&self, mut job: Job, reason: CloseReason, handoff: Handoff<'_>) -> Result<()> {
        job.close(Instant::now());

        #[cfg(feature = "tracing")]
        tracing::debug!(
            "Closed job {} with {} requests after {:?} ({})",
            job.id,
            job.len(),
            job.window().unwrap_or_default(),
            reason.as_str()
        );
        #[cfg(not(feature = "tracing"))]
        let _ = reason;

        match handoff {
            Ok(permit) => {
                permit.send(job);
                Ok(())
            }
            Err(_) => {
                for id in job.request_ids() {
                    let _ = self.ledger.fail(id, Error::ServiceShutdown);
                }
                Err(Error::ChannelError {
                    context: format!(
                        "Dispatcher dropped before job {} could be handed off",
                        job.id
                    ),
                })
            }
        }
    }
}

/// Closes `job_id` at `deadline` unless the size trigger got there first.
async fn window_timer(
    inner: Weak<Inner>,
    job_id: JobId,
    deadline: Instant,
    cancelled: CancellationToken,
) {
    tokio::select! {
        () = cancelled.cancelled() => return,
        () = tokio::time::sleep_until(deadline) => {}
    }

    let Some(inner) = inner.upgrade() else {
        return;
    };

    // Only close the job this timer was armed for.
    let mut slot = inner.slot.lock().await;
    if !matches!(slot.as_ref(), Some(open) if open.job.id == job_id) {
        return;
    }

    let handoff = inner.closed_tx.reserve().await;
    if let Some(open) = slot.take() {
        if let Err(_e) = inner.close(open.job, CloseReason::Window, handoff) {
            #[cfg(feature = "tracing")]
            tracing::warn!("Window close for job {job_id} failed: {_e}");
        }
    }
}

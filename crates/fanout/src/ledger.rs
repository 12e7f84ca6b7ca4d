//! In-flight request tracking and per-request delivery channels.
//!
//! The [`RequestLedger`] is the routing table of the intake side. Every
//! request registered with it gets a bounded delivery channel: the ledger
//! keeps the sending half and hands the receiving half to the caller as a
//! [`DeliveryStream`].
//!
//! Entries are keyed by [`RequestId`], so no cross-request locking is needed
//! beyond the map's own mutex, which is never held across an `.await`.
//!
//! Terminal requests stay in the ledger as tombstones until
//! [`RequestLedger::sweep`] reaps them. While a tombstone exists, late
//! fragments and repeated terminal marks are silently ignored; after it is
//! reaped they surface as [`Error::UnknownRequest`], which callers treat as
//! "drop".

use crate::common::{
    error::{Error, Result},
    types::{Delivery, Fragment, JobId, Prompt, RequestId, RequestStatus},
};
use core::pin::Pin;
use core::task::{Context, Poll};
use core::time::Duration;
use futures::Stream;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;

/// Snapshot of a request as tracked by the ledger.
#[derive(Clone, Debug)]
pub struct Request {
    pub id: RequestId,
    pub prompt: Prompt,
    pub arrival_time: Instant,
    pub status: RequestStatus,
    /// Set once the request has been appended to a job.
    pub job_id: Option<JobId>,
}

struct Entry {
    request: Request,
    delivery: Option<mpsc::Sender<Delivery>>,
    next_sequence: u64,
    finished_at: Option<Instant>,
}

impl Entry {
    /// Moves the entry to a terminal status and releases the sender. Returns
    /// `None` if the channel was already released.
    fn finish(&mut self, status: RequestStatus) -> Option<mpsc::Sender<Delivery>> {
        debug_assert!(status.is_terminal());
        self.request.status = status;
        self.finished_at = Some(Instant::now());
        self.delivery.take()
    }
}

/// Why the relay should drop a fragment instead of delivering it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DropReason {
    /// The request already reached a terminal status.
    Terminal,
    /// The sequence number was already delivered.
    Duplicate { expected: u64, got: u64 },
    /// The sequence number skipped ahead.
    Gap { expected: u64, got: u64 },
    /// The fragment was produced by a job that does not own the request.
    ForeignJob,
}

/// Decision returned by [`RequestLedger::route`].
#[derive(Debug)]
pub enum Route {
    /// Send `delivery` on `sender`. When `delivery` is terminal the ledger has
    /// already released its own copy of the sender, so dropping `sender`
    /// after the send closes the channel.
    Deliver {
        sender: mpsc::Sender<Delivery>,
        delivery: Delivery,
    },
    Drop(DropReason),
}

/// Concurrency-safe table of in-flight requests.
pub struct RequestLedger {
    entries: Mutex<HashMap<RequestId, Entry>>,
    buffer_size: usize,
}

impl RequestLedger {
    /// Creates an empty ledger whose delivery channels hold up to
    /// `buffer_size` undelivered items.
    #[must_use]
    pub fn new(buffer_size: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            buffer_size: buffer_size.max(1),
        }
    }

    /// Registers a new request and returns its id together with the stream
    /// the caller drains.
    ///
    /// Dropping the returned stream before it yields a terminal item cancels
    /// the request.
    pub fn register(self: &Arc<Self>, prompt: Prompt) -> (RequestId, DeliveryStream) {
        let id = RequestId::new();
        let (tx, rx) = mpsc::channel(self.buffer_size);

        let entry = Entry {
            request: Request {
                id,
                prompt,
                arrival_time: Instant::now(),
                status: RequestStatus::Pending,
                job_id: None,
            },
            delivery: Some(tx),
            next_sequence: 0,
            finished_at: None,
        };
        self.entries.lock().insert(id, entry);

        #[cfg(feature = "tracing")]
        tracing::trace!("Registered request {id}");

        let stream = DeliveryStream {
            id,
            inner: ReceiverStream::new(rx),
            ledger: Arc::downgrade(self),
            finished: false,
        };
        (id, stream)
    }

    /// Returns a snapshot of the request.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownRequest`] if the id was never registered or
    /// has been swept.
    pub fn lookup(&self, id: RequestId) -> Result<Request> {
        self.entries
            .lock()
            .get(&id)
            .map(|entry| entry.request.clone())
            .ok_or(Error::UnknownRequest { id })
    }

    /// Advances the request's status.
    ///
    /// Statuses only move forward: marking a status that is not later than
    /// the current one, or marking a terminal request, is a no-op. Marking a
    /// terminal status closes the delivery channel with the matching terminal
    /// item.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownRequest`] if the id is not tracked.
    pub fn mark(&self, id: RequestId, status: RequestStatus) -> Result<()> {
        let released = {
            let mut entries = self.entries.lock();
            let entry = entries.get_mut(&id).ok_or(Error::UnknownRequest { id })?;

            if entry.request.status.is_terminal() || status.rank() <= entry.request.status.rank()
            {
                return Ok(());
            }

            if !status.is_terminal() {
                entry.request.status = status;
                return Ok(());
            }

            let delivery = match &status {
                RequestStatus::Failed(e) => Delivery::Failed(e.clone()),
                _ => Delivery::Completed,
            };
            entry.finish(status).map(|sender| (sender, delivery))
        };

        // A full channel means the caller stopped reading; the stream falls
        // back to the ledger status when it sees the channel close.
        if let Some((sender, delivery)) = released {
            let _ = sender.try_send(delivery);
        }
        Ok(())
    }

    /// Fails the request with `error`, closing its delivery channel.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownRequest`] if the id is not tracked.
    pub fn fail(&self, id: RequestId, error: Error) -> Result<()> {
        self.mark(id, RequestStatus::Failed(error))
    }

    /// Caller-side cancellation hook.
    ///
    /// Marks the request as [`Error::CallerDisconnected`] and drops the
    /// sender without writing to it. Returns `false` if the request was
    /// unknown or already terminal.
    pub fn cancel(&self, id: RequestId) -> bool {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(&id) else {
            return false;
        };
        if entry.request.status.is_terminal() {
            return false;
        }
        drop(entry.finish(RequestStatus::Failed(Error::CallerDisconnected)));

        #[cfg(feature = "tracing")]
        tracing::debug!("Request {id} cancelled by caller");
        true
    }

    /// Records that the request joined `job_id` and returns its prompt.
    ///
    /// # Errors
    ///
    /// - [`Error::UnknownRequest`] if the id is not tracked.
    /// - [`Error::InvalidRequest`] if the request already belongs to a job or
    ///   is no longer pending.
    pub(crate) fn assign(&self, id: RequestId, job_id: JobId) -> Result<Prompt> {
        let mut entries = self.entries.lock();
        let entry = entries.get_mut(&id).ok_or(Error::UnknownRequest { id })?;

        if entry.request.job_id.is_some() || entry.request.status != RequestStatus::Pending {
            return Err(Error::InvalidRequest {
                reason: format!(
                    "Request {id} is {} and cannot join job {job_id}",
                    entry.request.status.as_str()
                ),
            });
        }

        entry.request.job_id = Some(job_id);
        entry.request.status = RequestStatus::Batched;
        Ok(entry.request.prompt.clone())
    }

    /// Decides what to do with a fragment arriving from a worker.
    ///
    /// Checks, atomically with respect to other ledger operations, that the
    /// request is live, owned by the fragment's job and expecting exactly this
    /// sequence number; then advances the expected sequence and the status.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownRequest`] if the id is not tracked.
    pub fn route(&self, fragment: Fragment) -> Result<Route> {
        let mut entries = self.entries.lock();
        let id = fragment.request_id;
        let entry = entries.get_mut(&id).ok_or(Error::UnknownRequest { id })?;

        if entry.request.status.is_terminal() {
            return Ok(Route::Drop(DropReason::Terminal));
        }
        if entry.request.job_id != Some(fragment.job_id) {
            return Ok(Route::Drop(DropReason::ForeignJob));
        }

        let expected = entry.next_sequence;
        let got = fragment.sequence;
        if got < expected {
            return Ok(Route::Drop(DropReason::Duplicate { expected, got }));
        }
        if got > expected {
            return Ok(Route::Drop(DropReason::Gap { expected, got }));
        }
        entry.next_sequence += 1;

        let terminal = fragment.is_terminal();
        let delivery = Delivery::from(fragment.body);
        let sender = if terminal {
            let status = match &delivery {
                Delivery::Failed(e) => RequestStatus::Failed(e.clone()),
                _ => RequestStatus::Completed,
            };
            entry.finish(status)
        } else {
            entry.request.status = RequestStatus::Streaming;
            entry.delivery.clone()
        };

        Ok(match sender {
            Some(sender) => Route::Deliver { sender, delivery },
            None => Route::Drop(DropReason::Terminal),
        })
    }

    /// Fails every live request with `error`. Returns how many were failed.
    pub fn fail_all(&self, error: &Error) -> usize {
        let released: Vec<_> = {
            let mut entries = self.entries.lock();
            entries
                .values_mut()
                .filter(|entry| !entry.request.status.is_terminal())
                .filter_map(|entry| entry.finish(RequestStatus::Failed(error.clone())))
                .collect()
        };
        let count = released.len();
        for sender in released {
            let _ = sender.try_send(Delivery::Failed(error.clone()));
        }
        count
    }

    /// Removes terminal entries that finished more than `retention` ago.
    /// Returns how many entries were removed.
    pub fn sweep(&self, retention: Duration) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| {
            entry
                .finished_at
                .is_none_or(|finished| now.duration_since(finished) < retention)
        });
        before - entries.len()
    }

    /// Number of requests that have not reached a terminal status.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.entries
            .lock()
            .values()
            .filter(|entry| !entry.request.status.is_terminal())
            .count()
    }

    /// Number of tracked entries, tombstones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

/// Receiving half of a request's delivery channel.
///
/// Yields [`Delivery::Text`] items followed by exactly one terminal item. If
/// the channel closes without a terminal item (the request was cancelled or
/// the relay gave up on it), the stream synthesizes one from the ledger's
/// view of the request.
///
/// Dropping the stream early invokes [`RequestLedger::cancel`].
pub struct DeliveryStream {
    id: RequestId,
    inner: ReceiverStream<Delivery>,
    ledger: Weak<RequestLedger>,
    finished: bool,
}

impl DeliveryStream {
    #[must_use]
    pub const fn request_id(&self) -> RequestId {
        self.id
    }

    /// Terminal item for a channel that closed before delivering one.
    ///
    /// The ledger already holds the outcome: the relay may have given up on a
    /// full channel after the request completed.
    fn closing_item(&self) -> Delivery {
        let status = self
            .ledger
            .upgrade()
            .and_then(|ledger| ledger.lookup(self.id).ok())
            .map(|request| request.status);
        match status {
            Some(RequestStatus::Completed) => Delivery::Completed,
            Some(RequestStatus::Failed(e)) => Delivery::Failed(e),
            _ => Delivery::Failed(Error::ChannelError {
                context: format!("Delivery channel for {} closed without a terminal item", self.id),
            }),
        }
    }
}

impl Stream for DeliveryStream {
    type Item = Delivery;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished {
            return Poll::Ready(None);
        }
        match Pin::new(&mut self.inner).poll_next(cx) {
            Poll::Ready(Some(delivery)) => {
                if delivery.is_terminal() {
                    self.finished = true;
                }
                Poll::Ready(Some(delivery))
            }
            Poll::Ready(None) => {
                self.finished = true;
                Poll::Ready(Some(self.closing_item()))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for DeliveryStream {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Some(ledger) = self.ledger.upgrade() {
            ledger.cancel(self.id);
        }
    }
}

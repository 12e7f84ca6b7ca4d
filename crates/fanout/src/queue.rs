//! Work queue abstraction between the dispatcher and the worker pool.
//!
//! [`WorkQueue`] models an at-least-once broker: a claimed job stays
//! in-flight until it is acknowledged, and a negative acknowledgement puts it
//! back at the head of the queue for another worker. [`MemoryQueue`] is the
//! in-process implementation used by the server and the tests.

use crate::common::{
    error::{Error, Result},
    types::{Job, JobId},
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use tokio::sync::Notify;

/// A job handed to a worker, with the number of times it has been claimed
/// (including this one).
#[derive(Clone, Debug)]
pub struct Claim {
    pub job: Job,
    pub deliveries: u32,
}

/// Queue between the intake side and the worker side.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Adds a job to the tail of the queue.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EnqueueFailed`] if the queue cannot accept the job.
    async fn enqueue(&self, job: Job) -> Result<()>;

    /// Waits for the next job. Returns `None` once the queue is closed and
    /// drained.
    async fn claim(&self) -> Option<Claim>;

    /// Marks a claimed job as finished. Acknowledging an unknown job is a
    /// no-op.
    async fn ack(&self, job_id: JobId) -> Result<()>;

    /// Returns a claimed job to the head of the queue for redelivery.
    async fn nack(&self, job_id: JobId) -> Result<()>;

    /// Stops accepting jobs and wakes every waiting consumer.
    fn close(&self);
}

struct Queued {
    job: Job,
    deliveries: u32,
}

#[derive(Default)]
struct State {
    pending: VecDeque<Queued>,
    in_flight: HashMap<JobId, Queued>,
    closed: bool,
}

/// Bounded, FIFO, in-process [`WorkQueue`].
///
/// Capacity counts both pending and in-flight jobs, so a stuck worker pool
/// eventually pushes back on the dispatcher.
pub struct MemoryQueue {
    state: Mutex<State>,
    notify: Notify,
    capacity: usize,
}

impl MemoryQueue {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(State::default()),
            notify: Notify::new(),
            capacity,
        }
    }

    /// Number of jobs waiting to be claimed.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Number of claimed, unacknowledged jobs.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.state.lock().in_flight.len()
    }

    fn try_claim(&self) -> core::result::Result<Claim, bool> {
        let mut state = self.state.lock();
        let Some(mut queued) = state.pending.pop_front() else {
            return Err(state.closed);
        };
        queued.deliveries += 1;
        let claim = Claim {
            job: queued.job.clone(),
            deliveries: queued.deliveries,
        };
        state.in_flight.insert(claim.job.id, queued);
        Ok(claim)
    }
}

#[async_trait]
impl WorkQueue for MemoryQueue {
    async fn enqueue(&self, job: Job) -> Result<()> {
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(Error::EnqueueFailed {
                    reason: "queue is closed".to_string(),
                });
            }
            if state.pending.len() + state.in_flight.len() >= self.capacity {
                return Err(Error::EnqueueFailed {
                    reason: format!("queue is full ({} jobs)", self.capacity),
                });
            }
            state.pending.push_back(Queued { job, deliveries: 0 });
        }
        self.notify.notify_one();
        Ok(())
    }

    async fn claim(&self) -> Option<Claim> {
        loop {
            // Register interest before checking so a concurrent enqueue
            // cannot slip between the check and the wait.
            let notified = self.notify.notified();
            match self.try_claim() {
                Ok(claim) => return Some(claim),
                Err(true) => return None,
                Err(false) => notified.await,
            }
        }
    }

    async fn ack(&self, job_id: JobId) -> Result<()> {
        self.state.lock().in_flight.remove(&job_id);
        Ok(())
    }

    async fn nack(&self, job_id: JobId) -> Result<()> {
        {
            let mut state = self.state.lock();
            let Some(queued) = state.in_flight.remove(&job_id) else {
                return Ok(());
            };
            state.pending.push_front(queued);
        }
        self.notify.notify_one();
        Ok(())
    }

    fn close(&self) {
        self.state.lock().closed = true;
        self.notify.notify_waiters();
    }
}

//! Hands closed jobs to the work queue.
//!
//! Enqueue failures are retried with bounded exponential backoff. Once the
//! attempts are exhausted every request in the job is failed with
//! [`Error::DispatchUnavailable`], so no caller waits on a job that will never
//! run.

use crate::{
    common::{
        error::{Error, Result},
        types::{Job, JobStatus, RequestStatus},
    },
    config::RetryPolicy,
    ledger::RequestLedger,
    queue::WorkQueue,
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Enqueues closed jobs, retrying transient queue failures.
pub struct JobDispatcher {
    queue: Arc<dyn WorkQueue>,
    ledger: Arc<RequestLedger>,
    retry: RetryPolicy,
    cancel: CancellationToken,
}

impl JobDispatcher {
    #[must_use]
    pub fn new(
        queue: Arc<dyn WorkQueue>,
        ledger: Arc<RequestLedger>,
        retry: RetryPolicy,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            queue,
            ledger,
            retry,
            cancel,
        }
    }

    /// Consumes closed jobs in the order the batcher closed them until the
    /// channel closes.
    pub async fn run(self, mut closed_rx: mpsc::Receiver<Job>) {
        while let Some(job) = closed_rx.recv().await {
            if let Err(_e) = self.dispatch(job).await {
                #[cfg(feature = "tracing")]
                tracing::error!("{_e}");
            }
        }

        #[cfg(feature = "tracing")]
        tracing::debug!("Dispatcher stopped");
    }

    /// Enqueues one job.
    ///
    /// On success every request in the job is marked
    /// [`RequestStatus::Queued`]. A worker may already have started the job by
    /// then; forward-only status updates make the late mark a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DispatchUnavailable`] after the retry policy is
    /// exhausted or the dispatcher is cancelled mid-retry. The job's requests
    /// have been failed with the same error.
    pub async fn dispatch(&self, mut job: Job) -> Result<()> {
        job.status = JobStatus::Enqueued;
        let job_id = job.id;
        let request_ids = job.request_ids();

        let mut attempt = 0;
        let reason = loop {
            attempt += 1;
            let reason = match self.queue.enqueue(job.clone()).await {
                Ok(()) => {
                    #[cfg(feature = "tracing")]
                    tracing::debug!(
                        "Enqueued job {job_id} ({} requests) on attempt {attempt}",
                        request_ids.len()
                    );
                    for id in &request_ids {
                        let _ = self.ledger.mark(*id, RequestStatus::Queued);
                    }
                    return Ok(());
                }
                Err(e) => e.to_string(),
            };

            if attempt >= self.retry.max_attempts {
                break reason;
            }

            let backoff = self.retry.backoff(attempt);
            #[cfg(feature = "tracing")]
            tracing::warn!(
                "Enqueue of job {job_id} failed (attempt {attempt}/{}), retrying in {backoff:?}: {reason}",
                self.retry.max_attempts
            );

            tokio::select! {
                () = self.cancel.cancelled() => break format!("{reason} (cancelled during retry)"),
                () = tokio::time::sleep(backoff) => {}
            }
        };

        let error = Error::DispatchUnavailable {
            job_id,
            attempts: attempt,
            reason,
        };
        for id in request_ids {
            let _ = self.ledger.fail(id, error.clone());
        }
        Err(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::types::{Delivery, JobId, Prompt};
    use crate::testing::{FlakyQueue, job_for};
    use core::time::Duration;
    use futures::StreamExt;

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(40),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_the_queue_accepts() {
        let ledger = Arc::new(RequestLedger::new(4));
        let queue = Arc::new(FlakyQueue::new(2));
        let dispatcher = JobDispatcher::new(
            queue.clone(),
            Arc::clone(&ledger),
            policy(5),
            CancellationToken::new(),
        );

        let (id, _stream) = ledger.register(Prompt::new("x").unwrap());
        let job = job_for(&ledger, &[id]);
        let job_id = job.id;

        let start = tokio::time::Instant::now();
        dispatcher.dispatch(job).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(10 + 20));
        assert_eq!(queue.attempts(), 3);
        assert_eq!(queue.accepted(), vec![job_id]);
        assert_eq!(ledger.lookup(id).unwrap().status, RequestStatus::Queued);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_fail_every_request() {
        let ledger = Arc::new(RequestLedger::new(4));
        let queue = Arc::new(FlakyQueue::new(u32::MAX));
        let dispatcher = JobDispatcher::new(
            queue.clone(),
            Arc::clone(&ledger),
            policy(3),
            CancellationToken::new(),
        );

        let (a, mut sa) = ledger.register(Prompt::new("a").unwrap());
        let (b, mut sb) = ledger.register(Prompt::new("b").unwrap());
        let job = job_for(&ledger, &[a, b]);
        let job_id = job.id;

        let err = dispatcher.dispatch(job).await.unwrap_err();
        assert!(matches!(
            err,
            Error::DispatchUnavailable { job_id: j, attempts: 3, .. } if j == job_id
        ));
        assert_eq!(queue.attempts(), 3);

        for stream in [&mut sa, &mut sb] {
            match stream.next().await {
                Some(Delivery::Failed(e)) => assert_eq!(e, err),
                other => panic!("unexpected delivery: {other:?}"),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_cuts_the_retry_short() {
        let ledger = Arc::new(RequestLedger::new(4));
        let cancel = CancellationToken::new();
        let dispatcher = JobDispatcher::new(
            Arc::new(FlakyQueue::new(u32::MAX)),
            Arc::clone(&ledger),
            policy(10),
            cancel.clone(),
        );
        cancel.cancel();

        let (id, _stream) = ledger.register(Prompt::new("x").unwrap());
        let err = dispatcher.dispatch(job_for(&ledger, &[id])).await.unwrap_err();
        assert!(matches!(err, Error::DispatchUnavailable { attempts: 1, .. }));
        assert!(ledger.lookup(id).unwrap().status.is_terminal());
    }

    #[tokio::test]
    async fn run_preserves_closure_order() {
        let ledger = Arc::new(RequestLedger::new(4));
        let queue = Arc::new(FlakyQueue::new(0));
        let dispatcher = JobDispatcher::new(
            queue.clone(),
            Arc::clone(&ledger),
            policy(1),
            CancellationToken::new(),
        );

        let (tx, rx) = mpsc::channel(8);
        let mut expected: Vec<JobId> = Vec::new();
        let mut streams = Vec::new();
        for text in ["a", "b", "c"] {
            let (id, stream) = ledger.register(Prompt::new(text).unwrap());
            streams.push(stream);
            let job = job_for(&ledger, &[id]);
            expected.push(job.id);
            tx.send(job).await.unwrap();
        }
        drop(tx);

        dispatcher.run(rx).await;
        assert_eq!(queue.accepted(), expected);
    }
}

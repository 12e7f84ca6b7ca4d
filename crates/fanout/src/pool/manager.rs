//! Fixed-size pool of queue-draining workers.
//!
//! Unlike a push-based pool, workers pull jobs from the shared
//! [`WorkQueue`](crate::WorkQueue) themselves; the pool only owns each
//! worker's control channel and the shared [`CancellationToken`] used to stop
//! in-progress generation.

use super::worker::{WorkerCommand, WorkerContext, worker_loop};
use core::time::Duration;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::timeout,
};
use tokio_util::sync::CancellationToken;

/// How long shutdown waits for each worker's acknowledgement.
const SHUTDOWN_ACK_TIMEOUT: Duration = Duration::from_secs(3);

pub struct WorkerPool {
    workers: Vec<mpsc::Sender<WorkerCommand>>,
    handles: Vec<JoinHandle<()>>,
    shutdown_token: CancellationToken,
}

impl WorkerPool {
    /// Spawns `num_workers` workers sharing `ctx`.
    #[must_use]
    pub fn spawn(num_workers: usize, ctx: &WorkerContext) -> Self {
        let mut workers = Vec::with_capacity(num_workers);
        let mut handles = Vec::with_capacity(num_workers);
        for worker_id in 0..num_workers {
            let (tx, rx) = mpsc::channel(1);
            handles.push(tokio::spawn(worker_loop(worker_id, rx, ctx.clone())));
            workers.push(tx);
        }

        #[cfg(feature = "tracing")]
        tracing::debug!("Spawned {num_workers} workers");

        Self {
            workers,
            handles,
            shutdown_token: ctx.cancel.clone(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Stops every worker.
    ///
    /// - Cancels the shared token so in-progress jobs end their requests with
    ///   [`Error::ServiceShutdown`](crate::Error::ServiceShutdown).
    /// - Sends a [`WorkerCommand::Shutdown`] to each worker.
    /// - Waits (up to 3 seconds per worker) for acknowledgements.
    pub async fn shutdown(self) {
        #[cfg(feature = "tracing")]
        tracing::debug!("Cancelling in-progress work via shutdown token");
        self.shutdown_token.cancel();

        #[cfg(feature = "tracing")]
        tracing::debug!("Notifying all workers to shut down");
        let mut acks = Vec::with_capacity(self.workers.len());
        for (i, worker) in self.workers.iter().enumerate() {
            let (tx, rx) = oneshot::channel();
            if let Err(_e) = worker.send(WorkerCommand::Shutdown { response: tx }).await {
                #[cfg(feature = "tracing")]
                tracing::error!("Failed to send shutdown to worker {i}: {_e}");
            } else {
                acks.push((i, rx));
            }
        }

        let waits = acks.into_iter().map(|(_i, rx)| async move {
            match timeout(SHUTDOWN_ACK_TIMEOUT, rx).await {
                Ok(Ok(())) => {
                    #[cfg(feature = "tracing")]
                    tracing::trace!("Worker {_i} shutdown acknowledged");
                }
                Ok(Err(_e)) => {
                    #[cfg(feature = "tracing")]
                    tracing::error!("Worker {_i} dropped its acknowledgement: {_e}");
                }
                Err(_) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!("Worker {_i} shutdown timed out");
                }
            }
        });
        futures::future::join_all(waits).await;

        for handle in self.handles {
            if !handle.is_finished() {
                handle.abort();
            }
        }

        #[cfg(feature = "tracing")]
        tracing::info!("Worker pool shutdown complete");
    }
}

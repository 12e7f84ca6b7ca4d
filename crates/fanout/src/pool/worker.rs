use crate::{
    common::types::RelayMessage, generator::Generate, queue::WorkQueue,
    streaming::processor::process_job,
};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

/// Control messages sent to a worker by the [`WorkerPool`](crate::WorkerPool).
#[derive(Debug)]
pub enum WorkerCommand {
    /// Stop claiming jobs and acknowledge on `response`.
    Shutdown { response: oneshot::Sender<()> },
}

/// Everything a worker needs to process jobs. Shared by all workers.
#[derive(Clone)]
pub struct WorkerContext {
    pub queue: Arc<dyn WorkQueue>,
    pub generator: Arc<dyn Generate>,
    pub relay_tx: mpsc::Sender<RelayMessage>,
    pub cancel: CancellationToken,
    /// Claims of one job before it is failed instead of redelivered.
    pub max_deliveries: u32,
    /// Requests of one job run concurrently on this worker.
    pub concurrency: usize,
}

/// Worker task: claims one job at a time from the shared queue and runs it to
/// completion.
///
/// Control commands take priority over new claims. Once the queue is closed
/// and drained the worker idles until it is told to shut down, so every
/// worker acknowledges exactly one [`WorkerCommand::Shutdown`].
pub async fn worker_loop(
    worker_id: usize,
    mut commands: mpsc::Receiver<WorkerCommand>,
    ctx: WorkerContext,
) {
    #[cfg(feature = "tracing")]
    tracing::trace!("Worker {worker_id} started");

    let mut draining = false;
    loop {
        let command = if draining {
            commands.recv().await
        } else {
            tokio::select! {
                biased;
                command = commands.recv() => command,
                claim = ctx.queue.claim() => {
                    match claim {
                        Some(claim) => process_job(worker_id, claim, &ctx).await,
                        None => {
                            #[cfg(feature = "tracing")]
                            tracing::debug!("Worker {worker_id} found the queue closed");
                            draining = true;
                        }
                    }
                    continue;
                }
            }
        };

        match command {
            Some(WorkerCommand::Shutdown { response }) => {
                #[cfg(feature = "tracing")]
                tracing::debug!("Worker {worker_id} received shutdown signal");

                if response.send(()).is_err() {
                    #[cfg(feature = "tracing")]
                    tracing::error!("Worker {worker_id} failed to acknowledge shutdown");
                }
                break;
            }
            None => break,
        }
    }

    #[cfg(feature = "tracing")]
    tracing::trace!("Worker {worker_id} stopped");
}

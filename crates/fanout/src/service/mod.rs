//! The public entry point: wires the ledger, batcher, dispatcher, worker pool
//! and relay together and owns their lifecycle.
//!
//! ```text
//! submit ──► RequestLedger ──► Batcher ──► JobDispatcher ──► WorkQueue
//!                 ▲                                              │
//!                 │                                              ▼
//!   DeliveryStream ◄── StreamRelay ◄──── RelayMessage ◄──── WorkerPool
//! ```

use crate::{
    batcher::Batcher,
    common::{
        error::{Error, Result},
        types::{JobId, Prompt, RequestId},
    },
    config::ServiceConfig,
    dispatcher::JobDispatcher,
    generator::Generate,
    ledger::{DeliveryStream, RequestLedger},
    pool::{WorkerContext, WorkerPool},
    queue::WorkQueue,
    streaming::StreamRelay,
};
use core::time::Duration;
use parking_lot::Mutex;
use portable_atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;


/// Poll interval while waiting for in-flight streams to drain.
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Handle returned to a caller for one submitted prompt.
pub struct RequestHandle {
    pub request_id: RequestId,
    /// The job the request joined.
    pub job_id: JobId,
    /// The caller's delivery stream. Dropping it cancels the request.
    pub stream: DeliveryStream,
}

struct Inner {
    config: ServiceConfig,
    ledger: Arc<RequestLedger>,
    batcher: Batcher,
    queue: Arc<dyn WorkQueue>,
    pool: Mutex<Option<WorkerPool>>,
    shutdown_token: CancellationToken,
    shutting_down: AtomicBool,
}

/// Batching text-generation service.
///
/// Cheap to clone; every clone drives the same pipeline.
#[derive(Clone)]
pub struct BatchService {
    inner: Arc<Inner>,
}

impl BatchService {
    /// Validates `config` and spawns the pipeline's background tasks on the
    /// current Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if `config` fails validation.
    pub fn new(
        config: ServiceConfig,
        queue: Arc<dyn WorkQueue>,
        generator: Arc<dyn Generate>,
    ) -> Result<Self> {
        config.validate()?;

        let ledger = Arc::new(RequestLedger::new(config.stream_buffer_size));
        let shutdown_token = CancellationToken::new();

        let (closed_tx, closed_rx) = mpsc::channel(config.dispatch_buffer_size);
        let batcher = Batcher::new(
            Arc::clone(&ledger),
            closed_tx,
            config.batch_window,
            config.max_requests_per_job,
        );

        let dispatcher = JobDispatcher::new(
            Arc::clone(&queue),
            Arc::clone(&ledger),
            config.retry,
            shutdown_token.clone(),
        );
        tokio::spawn(dispatcher.run(closed_rx));

        let (relay_tx, relay_rx) = mpsc::channel(config.fragment_buffer_size);
        let relay = StreamRelay::new(Arc::clone(&ledger), config.delivery_timeout);
        tokio::spawn(relay.run(relay_rx));

        let ctx = WorkerContext {
            queue: Arc::clone(&queue),
            generator,
            relay_tx,
            cancel: shutdown_token.clone(),
            max_deliveries: config.max_deliveries,
            concurrency: config.intra_job_concurrency,
        };
        let pool = WorkerPool::spawn(config.num_workers, &ctx);
        drop(ctx);

        tokio::spawn(sweep_ledger(
            Arc::downgrade(&ledger),
            config.ledger_retention,
            shutdown_token.clone(),
        ));

        #[cfg(feature = "tracing")]
        tracing::info!(
            "Batch service started: window={:?}, max_requests_per_job={}, workers={}",
            config.batch_window,
            config.max_requests_per_job,
            config.num_workers
        );

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                ledger,
                batcher,
                queue,
                pool: Mutex::new(Some(pool)),
                shutdown_token,
                shutting_down: AtomicBool::new(false),
            }),
        })
    }

    /// Accepts a prompt, registers it and places it in a job.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidRequest`] if the prompt is empty.
    /// - [`Error::ServiceShutdown`] once [`shutdown`](Self::shutdown) has
    ///   begun.
    /// - [`Error::ChannelError`] if the job could not be handed to the
    ///   dispatcher.
    pub async fn submit(&self, prompt: impl Into<String>) -> Result<RequestHandle> {
        let prompt = Prompt::new(prompt)?;
        if self.is_shutting_down() {
            return Err(Error::ServiceShutdown);
        }

        let (request_id, stream) = self.inner.ledger.register(prompt);
        let job_id = self.inner.batcher.submit(request_id).await?;

        Ok(RequestHandle {
            request_id,
            job_id,
            stream,
        })
    }

    /// Gracefully shuts the pipeline down.
    ///
    /// 1. Refuse new submissions.
    /// 2. Close the open job so its requests are dispatched.
    /// 3. Wait up to `shutdown_timeout` for in-flight streams to drain.
    /// 4. Cancel remaining work and stop the workers.
    /// 5. Close the queue and fail anything still in flight with
    ///    [`Error::ServiceShutdown`].
    ///
    /// Calling it more than once is a no-op.
    pub async fn shutdown(&self) {
        let inner = &self.inner;

        // === Phase 0: Stop accepting new requests ===
        if inner.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        #[cfg(feature = "tracing")]
        tracing::info!("Refusing new requests");

        // === Phase 1: Flush the open job ===
        if let Err(_e) = inner.batcher.flush().await {
            #[cfg(feature = "tracing")]
            tracing::warn!("Failed to flush the open job: {_e}");
        }

        // === Phase 2: Wait for in-flight streams to drain ===
        #[cfg(feature = "tracing")]
        tracing::info!(
            "Draining in-flight requests ({} active)",
            inner.ledger.in_flight()
        );
        let drained = timeout(inner.config.shutdown_timeout, async {
            while inner.ledger.in_flight() > 0 {
                sleep(DRAIN_POLL_INTERVAL).await;
            }
        })
        .await;

        match drained {
            Ok(()) => {
                #[cfg(feature = "tracing")]
                tracing::debug!("All in-flight requests drained");
            }
            Err(_) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(
                    "Graceful drain timed out ({} requests still active)",
                    inner.ledger.in_flight()
                );
            }
        }

        // === Phase 3: Cancel remaining work and stop the workers ===
        inner.shutdown_token.cancel();
        let pool = inner.pool.lock().take();
        if let Some(pool) = pool {
            pool.shutdown().await;
        }

        // === Phase 4: Close the queue and release stragglers ===
        inner.queue.close();
        let _failed = inner.ledger.fail_all(&Error::ServiceShutdown);

        #[cfg(feature = "tracing")]
        tracing::info!("Batch service shut down ({_failed} requests failed)");
    }

    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::Acquire)
    }

    /// The request ledger, for status lookups.
    #[must_use]
    pub fn ledger(&self) -> &RequestLedger {
        &self.inner.ledger
    }

    #[must_use]
    pub fn config(&self) -> &ServiceConfig {
        &self.inner.config
    }
}

/// Periodically reaps terminal ledger entries older than `retention`.
async fn sweep_ledger(
    ledger: std::sync::Weak<RequestLedger>,
    retention: Duration,
    cancel: CancellationToken,
) {
    let period = (retention / 2).max(Duration::from_millis(100));
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            () = sleep(period) => {}
        }
        let Some(ledger) = ledger.upgrade() else {
            break;
        };
        let _swept = ledger.sweep(retention);

        #[cfg(feature = "tracing")]
        if _swept > 0 {
            tracing::trace!("Swept {_swept} finished requests");
        }
    }
}

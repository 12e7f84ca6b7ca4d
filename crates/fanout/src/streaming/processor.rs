use crate::{
    common::{
        error::Error,
        types::{
            Fragment, FragmentBody, Job, JobEntry, JobId, JobStats, JobStatus, RelayMessage,
        },
    },
    pool::worker::WorkerContext,
    queue::Claim,
};
use futures::StreamExt;
use tokio::time::Instant;

/// How a single request ended on the worker side.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RequestOutcome {
    /// A `Final` fragment was emitted.
    Completed,
    /// An `Error` fragment was emitted.
    Failed,
    /// The relay went away; the request's terminal fragment was never sent.
    Abandoned,
}

/// Runs one claimed job to completion.
///
/// The generator's readiness probe gates the whole batch: an unreachable
/// generator returns the job to the queue until it has been claimed
/// `max_deliveries` times, after which every request fails with
/// [`Error::WorkerUnavailable`].
///
/// Otherwise each request is run through the generator (sequentially, or up
/// to `concurrency` at a time), its output tagged with contiguous sequence
/// numbers and terminated by exactly one `Final` or `Error` fragment. A
/// failing request never affects its siblings.
#[cfg_attr(
    feature = "tracing",
    tracing::instrument(level = "debug", skip_all, fields(worker_id = _worker_id, job_id = %claim.job.id, deliveries = claim.deliveries))
)]
#[allow(clippy::used_underscore_binding)]
pub async fn process_job(_worker_id: usize, claim: Claim, ctx: &WorkerContext) {
    let Claim { mut job, deliveries } = claim;

    if let Err(e) = ctx.generator.ready().await {
        handle_unavailable(_worker_id, &mut job, deliveries, e.message(), ctx).await;
        return;
    }

    job.status = JobStatus::Running;
    let started = RelayMessage::JobStarted {
        job_id: job.id,
        request_ids: job.request_ids(),
    };
    if ctx.relay_tx.send(started).await.is_err() {
        #[cfg(feature = "tracing")]
        tracing::warn!("Worker {_worker_id} lost the relay before starting job {}", job.id);
        let _ = ctx.queue.nack(job.id).await;
        return;
    }

    let start = Instant::now();
    let outcomes: Vec<RequestOutcome> = if ctx.concurrency <= 1 {
        let mut outcomes = Vec::with_capacity(job.len());
        for entry in job.entries.iter().cloned() {
            outcomes.push(process_request(job.id, entry, ctx).await);
        }
        outcomes
    } else {
        let job_id = job.id;
        futures::stream::iter(job.entries.clone())
            .map(|entry| process_request(job_id, entry, ctx))
            .buffer_unordered(ctx.concurrency)
            .collect()
            .await
    };

    let succeeded = outcomes
        .iter()
        .filter(|o| **o == RequestOutcome::Completed)
        .count();
    let stats = JobStats {
        total: outcomes.len(),
        succeeded,
        failed: outcomes.len() - succeeded,
        elapsed: start.elapsed(),
    };
    // Every request reached a terminal fragment; per-request failures are
    // reported on their own streams.
    job.status = JobStatus::Done;

    #[cfg(feature = "tracing")]
    tracing::info!(
        "Worker {_worker_id} finished job {} ({:?}): {}/{} succeeded in {:?}, avg {:?}",
        job.id,
        job.status,
        stats.succeeded,
        stats.total,
        stats.elapsed,
        stats.avg_processing_time()
    );

    let _ = ctx
        .relay_tx
        .send(RelayMessage::JobFinished {
            job_id: job.id,
            status: job.status,
            stats,
        })
        .await;

    if let Err(_e) = ctx.queue.ack(job.id).await {
        #[cfg(feature = "tracing")]
        tracing::warn!("Worker {_worker_id} failed to ack job {}: {_e}", job.id);
    }
}

#[allow(clippy::used_underscore_binding)]
async fn handle_unavailable(
    _worker_id: usize,
    job: &mut Job,
    deliveries: u32,
    reason: &str,
    ctx: &WorkerContext,
) {
    if deliveries < ctx.max_deliveries && !ctx.cancel.is_cancelled() {
        #[cfg(feature = "tracing")]
        tracing::warn!(
            "Worker {_worker_id} cannot run job {} (delivery {deliveries}/{}): {reason}; returning it to the queue",
            job.id,
            ctx.max_deliveries
        );
        if ctx.queue.nack(job.id).await.is_ok() {
            return;
        }
    }

    job.status = JobStatus::Failed;

    #[cfg(feature = "tracing")]
    tracing::error!(
        "Worker {_worker_id} giving up on job {} after {deliveries} deliveries: {reason}",
        job.id
    );

    let failed = RelayMessage::JobFailed {
        job_id: job.id,
        request_ids: job.request_ids(),
        error: Error::WorkerUnavailable {
            job_id: job.id,
            reason: reason.to_string(),
        },
    };
    let _ = ctx.relay_tx.send(failed).await;
    let _ = ctx.queue.ack(job.id).await;
}

/// Streams one request's output to the relay.
async fn process_request(job_id: JobId, entry: JobEntry, ctx: &WorkerContext) -> RequestOutcome {
    let request_id = entry.request_id;
    let mut output = ctx.generator.generate(&entry.prompt);
    let mut sequence = 0_u64;

    let (body, outcome) = loop {
        let next = tokio::select! {
            biased;
            () = ctx.cancel.cancelled() => {
                break (FragmentBody::Error(Error::ServiceShutdown), RequestOutcome::Failed);
            }
            next = output.next() => next,
        };

        match next {
            Some(Ok(text)) => {
                let fragment = Fragment {
                    job_id,
                    request_id,
                    sequence,
                    body: FragmentBody::Content(text),
                };
                if ctx.relay_tx.send(RelayMessage::Fragment(fragment)).await.is_err() {
                    return RequestOutcome::Abandoned;
                }
                sequence += 1;
            }
            Some(Err(e)) => {
                #[cfg(feature = "tracing")]
                tracing::debug!("Generation failed for request {request_id}: {e}");
                break (FragmentBody::Error(Error::Generation(e)), RequestOutcome::Failed);
            }
            None => break (FragmentBody::Final, RequestOutcome::Completed),
        }
    };

    let terminal = Fragment {
        job_id,
        request_id,
        sequence,
        body,
    };
    if ctx.relay_tx.send(RelayMessage::Fragment(terminal)).await.is_err() {
        return RequestOutcome::Abandoned;
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::error::GenerationError;
    use crate::common::types::RequestId;
    use crate::generator::Generate;
    use crate::queue::{MemoryQueue, WorkQueue};
    use crate::testing::{Script, ScriptedGenerator, UnavailableGenerator, closed_job};
    use core::time::Duration;
    use std::collections::HashMap;
    use std::sync::Arc;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    fn context(
        generator: Arc<dyn Generate>,
        queue: Arc<MemoryQueue>,
        concurrency: usize,
    ) -> (WorkerContext, mpsc::Receiver<RelayMessage>) {
        let (relay_tx, relay_rx) = mpsc::channel(1024);
        let ctx = WorkerContext {
            queue,
            generator,
            relay_tx,
            cancel: CancellationToken::new(),
            max_deliveries: 2,
            concurrency,
        };
        (ctx, relay_rx)
    }

    fn job_with_prompts(prompts: &[&str]) -> Job {
        let mut job = closed_job(prompts.len());
        for (entry, prompt) in job.entries.iter_mut().zip(prompts) {
            entry.prompt = crate::Prompt::new(*prompt).unwrap();
        }
        job
    }

    async fn claim(queue: &MemoryQueue, job: &Job) -> Claim {
        queue.enqueue(job.clone()).await.unwrap();
        queue.claim().await.unwrap()
    }

    fn drain(rx: &mut mpsc::Receiver<RelayMessage>) -> Vec<RelayMessage> {
        core::iter::from_fn(|| rx.try_recv().ok()).collect()
    }

    fn fragments_by_request(messages: &[RelayMessage]) -> HashMap<RequestId, Vec<Fragment>> {
        let mut map: HashMap<RequestId, Vec<Fragment>> = HashMap::new();
        for message in messages {
            if let RelayMessage::Fragment(f) = message {
                map.entry(f.request_id).or_default().push(f.clone());
            }
        }
        map
    }

    #[tokio::test]
    async fn emits_contiguous_fragments_and_one_terminal_per_request() {
        let generator = ScriptedGenerator::new()
            .script("first", Script::Text(vec!["a", "b", "c"]))
            .script("second", Script::Text(vec!["x"]));
        let queue = Arc::new(MemoryQueue::new(4));
        let (ctx, mut rx) = context(Arc::new(generator), Arc::clone(&queue), 1);
        let job = job_with_prompts(&["first", "second"]);

        process_job(0, claim(&queue, &job).await, &ctx).await;
        let messages = drain(&mut rx);

        assert!(matches!(
            &messages[0],
            RelayMessage::JobStarted { job_id, request_ids } if *job_id == job.id && *request_ids == job.request_ids()
        ));
        assert!(matches!(
            messages.last(),
            Some(RelayMessage::JobFinished { status: JobStatus::Done, stats, .. }) if stats.total == 2 && stats.succeeded == 2
        ));

        let by_request = fragments_by_request(&messages);
        for (entry, expected) in job.entries.iter().zip([3, 1]) {
            let fragments = &by_request[&entry.request_id];
            assert_eq!(fragments.len(), expected + 1);
            for (i, fragment) in fragments.iter().enumerate() {
                assert_eq!(fragment.sequence, i as u64);
                assert_eq!(fragment.job_id, job.id);
            }
            assert_eq!(fragments.last().unwrap().body, FragmentBody::Final);
            assert_eq!(fragments.iter().filter(|f| f.is_terminal()).count(), 1);
        }

        // Sequential processing keeps arrival order across requests.
        let order: Vec<_> = messages
            .iter()
            .filter_map(|m| match m {
                RelayMessage::Fragment(f) => Some(f.request_id),
                _ => None,
            })
            .collect();
        let split = order.iter().position(|id| *id == job.entries[1].request_id).unwrap();
        assert!(order[..split].iter().all(|id| *id == job.entries[0].request_id));
        assert_eq!(queue.in_flight(), 0);
    }

    #[tokio::test]
    async fn a_failing_request_does_not_affect_its_siblings() {
        let generator = ScriptedGenerator::new()
            .script("ok one", Script::Text(vec!["1"]))
            .script("broken", Script::FailAfter(vec!["partial"], "model exploded"))
            .script("ok two", Script::Text(vec!["2"]));
        let queue = Arc::new(MemoryQueue::new(4));
        let (ctx, mut rx) = context(Arc::new(generator), Arc::clone(&queue), 1);
        let job = job_with_prompts(&["ok one", "broken", "ok two"]);

        process_job(0, claim(&queue, &job).await, &ctx).await;
        let messages = drain(&mut rx);
        let by_request = fragments_by_request(&messages);

        let broken = &by_request[&job.entries[1].request_id];
        assert_eq!(broken[0].body, FragmentBody::Content("partial".into()));
        assert_eq!(
            broken[1].body,
            FragmentBody::Error(Error::Generation(GenerationError::new("model exploded")))
        );
        for i in [0, 2] {
            let fragments = &by_request[&job.entries[i].request_id];
            assert_eq!(fragments.last().unwrap().body, FragmentBody::Final);
        }
        assert!(matches!(
            messages.last(),
            Some(RelayMessage::JobFinished { status: JobStatus::Done, stats, .. })
                if stats.succeeded == 2 && stats.failed == 1
        ));
    }

    #[tokio::test]
    async fn concurrent_requests_keep_per_request_order() {
        let generator = ScriptedGenerator::new().with_delay(Duration::from_millis(1));
        let queue = Arc::new(MemoryQueue::new(4));
        let (ctx, mut rx) = context(Arc::new(generator), Arc::clone(&queue), 3);
        let job = job_with_prompts(&["a b c d", "e f", "g h i"]);

        process_job(0, claim(&queue, &job).await, &ctx).await;
        let by_request = fragments_by_request(&drain(&mut rx));

        for (entry, words) in job.entries.iter().zip([4, 2, 3]) {
            let fragments = &by_request[&entry.request_id];
            assert_eq!(fragments.len(), words + 1);
            assert!(fragments.windows(2).all(|w| w[1].sequence == w[0].sequence + 1));
        }
    }

    #[tokio::test]
    async fn unavailable_generator_redelivers_then_fails_the_job() {
        let queue = Arc::new(MemoryQueue::new(4));
        let (ctx, mut rx) = context(Arc::new(UnavailableGenerator), Arc::clone(&queue), 1);
        let job = closed_job(2);

        let first = claim(&queue, &job).await;
        assert_eq!(first.deliveries, 1);
        process_job(0, first, &ctx).await;
        assert!(drain(&mut rx).is_empty());
        assert_eq!(queue.pending(), 1);

        let second = queue.claim().await.unwrap();
        assert_eq!(second.deliveries, 2);
        process_job(0, second, &ctx).await;

        let messages = drain(&mut rx);
        assert!(matches!(
            &messages[..],
            [RelayMessage::JobFailed { job_id, request_ids, error: Error::WorkerUnavailable { .. } }]
                if *job_id == job.id && *request_ids == job.request_ids()
        ));
        assert_eq!(queue.pending() + queue.in_flight(), 0);
    }

    #[tokio::test]
    async fn cancellation_ends_requests_with_shutdown() {
        let generator = ScriptedGenerator::new().with_delay(Duration::from_secs(60));
        let queue = Arc::new(MemoryQueue::new(4));
        let (ctx, mut rx) = context(Arc::new(generator), Arc::clone(&queue), 1);
        ctx.cancel.cancel();
        let job = closed_job(2);

        process_job(0, claim(&queue, &job).await, &ctx).await;
        let by_request = fragments_by_request(&drain(&mut rx));
        for entry in &job.entries {
            assert_eq!(
                by_request[&entry.request_id],
                vec![Fragment {
                    job_id: job.id,
                    request_id: entry.request_id,
                    sequence: 0,
                    body: FragmentBody::Error(Error::ServiceShutdown),
                }]
            );
        }
    }
}

//! Test doubles shared by the unit tests.

use crate::{
    common::{
        error::{Error, GenerationError, Result},
        types::{Job, JobEntry, JobId, Prompt, RequestId},
    },
    generator::{Generate, TextStream},
    ledger::RequestLedger,
    queue::{Claim, MemoryQueue, WorkQueue},
};
use async_trait::async_trait;
use core::time::Duration;
use futures::StreamExt;
use parking_lot::Mutex;
use portable_atomic::{AtomicU32, Ordering};
use std::collections::HashMap;
use tokio::time::Instant;

/// A closed job of `n` fresh, unregistered requests.
pub fn closed_job(n: usize) -> Job {
    let mut job = Job::open(JobId::new(), Instant::now(), n);
    for i in 0..n {
        job.entries.push(JobEntry {
            request_id: RequestId::new(),
            prompt: Prompt::new(format!("prompt {i}")).unwrap(),
        });
    }
    job.close(Instant::now());
    job
}

/// A closed job holding the given registered requests, assigned in the
/// ledger the way the batcher would.
pub fn job_for(ledger: &RequestLedger, ids: &[RequestId]) -> Job {
    let job_id = JobId::new();
    let mut job = Job::open(job_id, Instant::now(), ids.len());
    for id in ids {
        let prompt = ledger.assign(*id, job_id).unwrap();
        job.entries.push(JobEntry {
            request_id: *id,
            prompt,
        });
    }
    job.close(Instant::now());
    job
}

/// Rejects the first `failures` enqueues, then behaves like a
/// [`MemoryQueue`].
pub struct FlakyQueue {
    inner: MemoryQueue,
    failures: u32,
    attempts: AtomicU32,
    accepted: Mutex<Vec<JobId>>,
}

impl FlakyQueue {
    pub fn new(failures: u32) -> Self {
        Self {
            inner: MemoryQueue::new(1024),
            failures,
            attempts: AtomicU32::new(0),
            accepted: Mutex::new(Vec::new()),
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::Relaxed)
    }

    pub fn accepted(&self) -> Vec<JobId> {
        self.accepted.lock().clone()
    }
}

#[async_trait]
impl WorkQueue for FlakyQueue {
    async fn enqueue(&self, job: Job) -> Result<()> {
        let attempt = self.attempts.fetch_add(1, Ordering::Relaxed) + 1;
        if attempt <= self.failures {
            return Err(Error::EnqueueFailed {
                reason: format!("broker unavailable (attempt {attempt})"),
            });
        }
        let job_id = job.id;
        self.inner.enqueue(job).await?;
        self.accepted.lock().push(job_id);
        Ok(())
    }

    async fn claim(&self) -> Option<Claim> {
        self.inner.claim().await
    }

    async fn ack(&self, job_id: JobId) -> Result<()> {
        self.inner.ack(job_id).await
    }

    async fn nack(&self, job_id: JobId) -> Result<()> {
        self.inner.nack(job_id).await
    }

    fn close(&self) {
        self.inner.close();
    }
}

/// What a [`ScriptedGenerator`] produces for one prompt.
#[derive(Clone, Debug)]
pub enum Script {
    /// Yield these fragments, then end.
    Text(Vec<&'static str>),
    /// Yield these fragments, then fail.
    FailAfter(Vec<&'static str>, &'static str),
}

/// Deterministic generator keyed by prompt text.
///
/// Prompts without a script echo back their words. Every fragment is
/// preceded by `delay`.
#[derive(Default)]
pub struct ScriptedGenerator {
    scripts: HashMap<String, Script>,
    delay: Duration,
}

impl ScriptedGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn script(mut self, prompt: &str, script: Script) -> Self {
        self.scripts.insert(prompt.to_string(), script);
        self
    }
}

#[async_trait]
impl Generate for ScriptedGenerator {
    fn generate(&self, prompt: &Prompt) -> TextStream {
        let (fragments, failure): (Vec<String>, Option<&'static str>) =
            match self.scripts.get(prompt.as_str()) {
                Some(Script::Text(parts)) => (parts.iter().map(|p| (*p).to_string()).collect(), None),
                Some(Script::FailAfter(parts, message)) => {
                    (parts.iter().map(|p| (*p).to_string()).collect(), Some(*message))
                }
                None => (
                    prompt
                        .as_str()
                        .split_whitespace()
                        .map(|w| format!("{w} "))
                        .collect(),
                    None,
                ),
            };

        let delay = self.delay;
        let items = fragments
            .into_iter()
            .map(Ok)
            .chain(failure.map(|m| Err(GenerationError::new(m))));
        futures::stream::iter(items)
            .then(move |item| async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                item
            })
            .boxed()
    }
}

/// Generator whose readiness probe always fails.
pub struct UnavailableGenerator;

#[async_trait]
impl Generate for UnavailableGenerator {
    async fn ready(&self) -> core::result::Result<(), GenerationError> {
        Err(GenerationError::new("model not loaded"))
    }

    fn generate(&self, _prompt: &Prompt) -> TextStream {
        futures::stream::empty().boxed()
    }
}

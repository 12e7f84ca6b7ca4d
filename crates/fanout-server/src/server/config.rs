use anyhow::{Context, bail};
use clap::Parser;
use core::time::Duration;
use fanout::{RetryPolicy, ServiceConfig};

/// Runtime configuration for the `fanout-server` binary.
///
/// These settings control how prompts are grouped into jobs, how many workers
/// process them, and how much output is buffered between the workers and each
/// caller. All values are parsed from CLI arguments or environment variables
/// (including a `.env` file), with defaults suitable for local use.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "fanout-server",
    version,
    about = "An HTTP service that batches prompts and streams each caller's output over SSE"
)]
pub struct CliArgs {
    /// Maximum time, in milliseconds, a job stays open for more requests.
    ///
    /// A job closes when this window elapses after its first request, or
    /// earlier once it is full.
    ///
    /// Environment variable: `BATCH_WINDOW_MS`
    #[arg(long, env = "BATCH_WINDOW_MS", default_value_t = 250)]
    pub batch_window_ms: u64,

    /// Number of requests that closes a job immediately.
    ///
    /// Environment variable: `MAX_REQUESTS_PER_JOB`
    #[arg(long, env = "MAX_REQUESTS_PER_JOB", default_value_t = 4)]
    pub max_requests_per_job: usize,

    /// Number of worker tasks claiming jobs from the queue.
    ///
    /// Environment variable: `NUM_WORKERS`
    #[arg(long, env = "NUM_WORKERS", default_value_t = 2)]
    pub num_workers: usize,

    /// Requests of the same job a worker generates concurrently. `1` keeps
    /// them in arrival order.
    ///
    /// Environment variable: `INTRA_JOB_CONCURRENCY`
    #[arg(long, env = "INTRA_JOB_CONCURRENCY", default_value_t = 1)]
    pub intra_job_concurrency: usize,

    /// Bound on jobs held by the in-memory queue, pending plus claimed.
    ///
    /// Environment variable: `QUEUE_CAPACITY`
    #[arg(long, env = "QUEUE_CAPACITY", default_value_t = 1024)]
    pub queue_capacity: usize,

    /// Enqueue attempts for a closed job before its requests are failed.
    ///
    /// Environment variable: `DISPATCH_MAX_ATTEMPTS`
    #[arg(long, env = "DISPATCH_MAX_ATTEMPTS", default_value_t = 5)]
    pub dispatch_max_attempts: u32,

    /// Delay, in milliseconds, before the first enqueue retry. Doubles on
    /// every further attempt.
    ///
    /// Environment variable: `DISPATCH_BACKOFF_MS`
    #[arg(long, env = "DISPATCH_BACKOFF_MS", default_value_t = 50)]
    pub dispatch_backoff_ms: u64,

    /// Upper bound, in milliseconds, for any single retry delay.
    ///
    /// Environment variable: `DISPATCH_MAX_BACKOFF_MS`
    #[arg(long, env = "DISPATCH_MAX_BACKOFF_MS", default_value_t = 2000)]
    pub dispatch_max_backoff_ms: u64,

    /// Claims of the same job before it is failed as unprocessable.
    ///
    /// Environment variable: `MAX_DELIVERIES`
    #[arg(long, env = "MAX_DELIVERIES", default_value_t = 3)]
    pub max_deliveries: u32,

    /// Capacity of each caller's delivery channel.
    ///
    /// Lower values push back on the relay sooner when a caller reads slowly;
    /// higher values absorb bursts.
    ///
    /// Environment variable: `STREAM_BUFFER_SIZE`
    #[arg(long, env = "STREAM_BUFFER_SIZE", default_value_t = 64)]
    pub stream_buffer_size: usize,

    /// Capacity of the channel shared by all workers to reach the relay.
    ///
    /// Environment variable: `FRAGMENT_BUFFER_SIZE`
    #[arg(long, env = "FRAGMENT_BUFFER_SIZE", default_value_t = 1024)]
    pub fragment_buffer_size: usize,

    /// How long, in milliseconds, the relay waits on a full delivery channel
    /// before cancelling that request.
    ///
    /// Environment variable: `DELIVERY_TIMEOUT_MS`
    #[arg(long, env = "DELIVERY_TIMEOUT_MS", default_value_t = 5000)]
    pub delivery_timeout_ms: u64,

    /// How long, in milliseconds, finished requests stay queryable.
    ///
    /// Environment variable: `LEDGER_RETENTION_MS`
    #[arg(long, env = "LEDGER_RETENTION_MS", default_value_t = 30_000)]
    pub ledger_retention_ms: u64,

    /// Seconds to wait for in-flight streams to finish on shutdown.
    ///
    /// Environment variable: `SHUTDOWN_TIMEOUT`
    #[arg(long, env = "SHUTDOWN_TIMEOUT", default_value_t = 5)]
    pub shutdown_timeout: u64,

    /// Per-character delay, in milliseconds, of the mock generator.
    ///
    /// Environment variable: `CHAR_DELAY_MS`
    #[arg(long, env = "CHAR_DELAY_MS", default_value_t = 10)]
    pub char_delay_ms: u64,

    /// Upper bound, in milliseconds, of the random pause the mock generator
    /// takes after some words.
    ///
    /// Environment variable: `MAX_WORD_PAUSE_MS`
    #[arg(long, env = "MAX_WORD_PAUSE_MS", default_value_t = 200)]
    pub max_word_pause_ms: u64,

    /// Address to listen on.
    ///
    /// Environment variable: `SERVER_ADDR`
    #[arg(long, env = "SERVER_ADDR", default_value_t = String::from("0.0.0.0:8000"))]
    pub server_addr: String,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub service: ServiceConfig,
    pub queue_capacity: usize,
    pub char_delay: Duration,
    pub max_word_pause: Duration,
    pub server_addr: String,
}

impl TryFrom<CliArgs> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        if args.queue_capacity == 0 {
            bail!("QUEUE_CAPACITY must be greater than 0");
        }

        if args.batch_window_ms == 0 {
            bail!("BATCH_WINDOW_MS must be greater than 0");
        }

        let service = ServiceConfig {
            batch_window: Duration::from_millis(args.batch_window_ms),
            max_requests_per_job: args.max_requests_per_job,
            num_workers: args.num_workers,
            intra_job_concurrency: args.intra_job_concurrency,
            retry: RetryPolicy {
                max_attempts: args.dispatch_max_attempts,
                initial_backoff: Duration::from_millis(args.dispatch_backoff_ms),
                max_backoff: Duration::from_millis(args.dispatch_max_backoff_ms),
            },
            max_deliveries: args.max_deliveries,
            stream_buffer_size: args.stream_buffer_size,
            fragment_buffer_size: args.fragment_buffer_size,
            delivery_timeout: Duration::from_millis(args.delivery_timeout_ms),
            ledger_retention: Duration::from_millis(args.ledger_retention_ms),
            shutdown_timeout: Duration::from_secs(args.shutdown_timeout),
            ..ServiceConfig::default()
        };
        service.validate().context("Invalid service configuration")?;

        Ok(Self {
            service,
            queue_capacity: args.queue_capacity,
            char_delay: Duration::from_millis(args.char_delay_ms),
            max_word_pause: Duration::from_millis(args.max_word_pause_ms),
            server_addr: args.server_addr,
        })
    }
}

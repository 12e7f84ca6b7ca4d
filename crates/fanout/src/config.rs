use crate::common::error::{Error, Result};
use core::time::Duration;

/// Bounded exponential backoff used by the [`JobDispatcher`](crate::JobDispatcher)
/// when the work queue rejects a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total enqueue attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub initial_backoff: Duration,
    /// Upper bound for any single delay.
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Delay to wait after the given (1-based) failed attempt.
    ///
    /// Doubles from `initial_backoff` and saturates at `max_backoff`.
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1_u32
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(2),
        }
    }
}

/// Runtime configuration for a [`BatchService`](crate::BatchService).
///
/// Only `batch_window` and `max_requests_per_job` shape batching; the rest
/// size channels, the worker pool and the lifecycle timeouts.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Maximum time a job may stay open before it is closed.
    pub batch_window: Duration,
    /// A job closes as soon as it holds this many requests.
    pub max_requests_per_job: usize,
    /// Number of worker tasks pulling jobs from the queue.
    pub num_workers: usize,
    /// Requests of one job a worker may run at the same time. `1` runs them
    /// strictly in arrival order.
    pub intra_job_concurrency: usize,
    /// Retry policy for enqueueing closed jobs.
    pub retry: RetryPolicy,
    /// Claims of the same job before it is failed as unprocessable.
    pub max_deliveries: u32,
    /// Capacity of each caller's delivery channel.
    pub stream_buffer_size: usize,
    /// Capacity of the worker-to-relay channel.
    pub fragment_buffer_size: usize,
    /// Capacity of the batcher-to-dispatcher channel.
    pub dispatch_buffer_size: usize,
    /// How long the relay waits on a full delivery channel before giving up
    /// on that caller.
    pub delivery_timeout: Duration,
    /// How long terminal requests stay in the ledger before being swept.
    pub ledger_retention: Duration,
    /// How long shutdown waits for in-flight streams to drain.
    pub shutdown_timeout: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            batch_window: Duration::from_millis(250),
            max_requests_per_job: 4,
            num_workers: 2,
            intra_job_concurrency: 1,
            retry: RetryPolicy::default(),
            max_deliveries: 3,
            stream_buffer_size: 64,
            fragment_buffer_size: 1024,
            dispatch_buffer_size: 64,
            delivery_timeout: Duration::from_secs(5),
            ledger_retention: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

impl ServiceConfig {
    /// Checks every bound the pipeline relies on.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("max_requests_per_job", self.max_requests_per_job),
            ("num_workers", self.num_workers),
            ("intra_job_concurrency", self.intra_job_concurrency),
            ("stream_buffer_size", self.stream_buffer_size),
            ("fragment_buffer_size", self.fragment_buffer_size),
            ("dispatch_buffer_size", self.dispatch_buffer_size),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, value)| *value == 0) {
            return Err(Error::InvalidConfig {
                reason: format!("{name} must be greater than 0"),
            });
        }

        if self.batch_window.is_zero() {
            return Err(Error::InvalidConfig {
                reason: "batch_window must be greater than 0".to_string(),
            });
        }

        if self.retry.max_attempts == 0 {
            return Err(Error::InvalidConfig {
                reason: "retry.max_attempts must be greater than 0".to_string(),
            });
        }

        if self.max_deliveries == 0 {
            return Err(Error::InvalidConfig {
                reason: "max_deliveries must be greater than 0".to_string(),
            });
        }

        if self.retry.initial_backoff > self.retry.max_backoff {
            return Err(Error::InvalidConfig {
                reason: format!(
                    "retry.initial_backoff ({:?}) exceeds retry.max_backoff ({:?})",
                    self.retry.initial_backoff, self.retry.max_backoff
                ),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_saturates() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(70),
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(10));
        assert_eq!(policy.backoff(2), Duration::from_millis(20));
        assert_eq!(policy.backoff(3), Duration::from_millis(40));
        assert_eq!(policy.backoff(4), Duration::from_millis(70));
        assert_eq!(policy.backoff(40), Duration::from_millis(70));
    }

    #[test]
    fn default_config_is_valid() {
        assert!(ServiceConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let config = ServiceConfig {
            max_requests_per_job: 0,
            ..ServiceConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(matches!(err, Error::InvalidConfig { ref reason } if reason.contains("max_requests_per_job")));
    }

    #[test]
    fn zero_window_is_rejected() {
        let config = ServiceConfig {
            batch_window: Duration::ZERO,
            ..ServiceConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn inverted_backoff_bounds_are_rejected() {
        let config = ServiceConfig {
            retry: RetryPolicy {
                max_attempts: 3,
                initial_backoff: Duration::from_secs(5),
                max_backoff: Duration::from_secs(1),
            },
            ..ServiceConfig::default()
        };
        assert!(config.validate().is_err());
    }
}

use std::time::Duration;

use crate::config::BackoffConfig;

/// Exponential backoff between handler retry attempts.
///
/// Delays are a pure function of the attempt number, so one policy value can
/// be shared by any number of concurrent handling tasks. `max_elapsed` is the
/// total time budget for a single message's retry sequence; the dispatcher
/// declares a message exhausted once it is spent, independently of the
/// attempt-count bound.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    initial_interval: Duration,
    coefficient: u32,
    maximum_interval: Duration,
    max_elapsed: Duration,
}

impl BackoffPolicy {
    pub const fn new(
        initial_interval: Duration,
        coefficient: u32,
        maximum_interval: Duration,
        max_elapsed: Duration,
    ) -> Self {
        Self {
            initial_interval,
            coefficient,
            maximum_interval,
            max_elapsed,
        }
    }

    pub fn from_config(config: &BackoffConfig) -> Self {
        Self {
            initial_interval: config.backoff_initial_interval.0,
            coefficient: config.backoff_coefficient,
            maximum_interval: config.backoff_maximum_interval.0,
            max_elapsed: config.backoff_max_elapsed.0,
        }
    }

    /// Delay to wait after the given failed attempt. Attempts are counted
    /// from 1, matching `DeliveredMessage::retry_count`.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let candidate = match self.coefficient.checked_pow(exponent) {
            Some(factor) => self.initial_interval.saturating_mul(factor),
            None => self.maximum_interval,
        };
        candidate.min(self.maximum_interval)
    }

    pub fn max_elapsed(&self) -> Duration {
        self.max_elapsed
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(500),
            coefficient: 2,
            maximum_interval: Duration::from_secs(60),
            max_elapsed: Duration::from_secs(300),
        }
    }
}

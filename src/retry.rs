use std::thread;
use std::time::Duration;

use log::warn;
use rand::Rng as _;

/// Retry decision returned by the error classifier callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryAction {
    Retry,
    Abort,
}

/// Per-run retry budget for a single item. Items that exhaust it are marked
/// failed and picked up again by the next run.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay_secs: u64,
    pub max_delay_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay_secs: 2,
            max_delay_secs: 30,
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `retry` (0-indexed):
    /// `min(base * 2^retry, max) + jitter(0..base)`.
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let exp_delay = self
            .base_delay_secs
            .saturating_mul(1u64.checked_shl(retry).unwrap_or(u64::MAX));
        let capped = exp_delay.min(self.max_delay_secs);
        let jitter = if self.base_delay_secs > 0 {
            rand::thread_rng().gen_range(0..self.base_delay_secs)
        } else {
            0
        };
        Duration::from_secs(capped + jitter)
    }
}

/// Run `operation` until it succeeds, the classifier aborts, or
/// `max_retries + 1` attempts have been made. Returns the last error on
/// failure.
pub fn retry_with_backoff<F, T, E, C>(
    config: &RetryConfig,
    label: &str,
    classifier: C,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut(u32) -> Result<T, E>,
    C: Fn(&E) -> RetryAction,
    E: std::fmt::Display,
{
    let total_attempts = config.max_retries + 1;
    let mut attempt = 0;

    loop {
        match operation(attempt) {
            Ok(val) => return Ok(val),
            Err(e) => {
                if classifier(&e) == RetryAction::Abort || attempt + 1 >= total_attempts {
                    return Err(e);
                }
                let delay = config.delay_for_retry(attempt);
                warn!(
                    "{}: retryable error (attempt {}/{}), retrying in {}s: {}",
                    label,
                    attempt + 1,
                    total_attempts,
                    delay.as_secs(),
                    e
                );
                thread::sleep(delay);
                attempt += 1;
            }
        }
    }
}

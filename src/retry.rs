//! Bounded exponential backoff for remote operations.

use std::thread;
use std::time::{Duration, Instant};

use rand::Rng;

use crate::classify::classify;
use crate::config::Settings;
use crate::error::SyncError;
use crate::git::{CancelToken, GitError};

/// Granularity of the cancellation check while waiting between attempts.
const SLEEP_SLICE: Duration = Duration::from_millis(100);

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one.
    pub attempts: u32,
    pub initial_delay: Duration,
    /// Backoff multiplier.
    pub factor: f64,
    /// Relative jitter applied to every delay, `0.1` meaning ±10 %.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

impl RetryPolicy {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            attempts: settings.remote_operation_attempts.max(1),
            initial_delay: Duration::from_millis(settings.retry_initial_delay_ms),
            factor: settings.retry_factor,
            jitter: settings.retry_jitter,
        }
    }

    /// A policy that retries `attempts` times without waiting.
    #[cfg(test)]
    pub fn immediate(attempts: u32) -> Self {
        Self {
            attempts,
            initial_delay: Duration::ZERO,
            factor: 1.0,
            jitter: 0.0,
        }
    }

    /// Delay before attempt `attempt + 1`, where `attempt` is 1-based.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_millis() as f64 * self.factor.powi(attempt.saturating_sub(1) as i32);
        let ms = if self.jitter > 0.0 {
            base * (1.0 + rand::thread_rng().gen_range(-self.jitter..=self.jitter))
        } else {
            base
        };
        Duration::from_millis(ms.max(0.0) as u64)
    }
}

/// Sleep for `delay`, returning early with `Cancelled` when the token fires.
pub fn sleep_cancellable(delay: Duration, cancel: &CancelToken) -> Result<(), GitError> {
    let deadline = Instant::now() + delay;
    loop {
        if cancel.is_cancelled() {
            return Err(GitError::Cancelled);
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(());
        }
        thread::sleep(SLEEP_SLICE.min(deadline - now));
    }
}

/// Run `op` until it succeeds or its failure is no longer recoverable.
///
/// `op` receives the 1-based attempt number. The last error is returned unchanged.
pub fn retry<T>(
    policy: &RetryPolicy,
    cancel: &CancelToken,
    operation: &str,
    mut op: impl FnMut(u32) -> Result<T, SyncError>,
) -> Result<T, SyncError> {
    let mut attempt = 1;
    loop {
        match op(attempt) {
            Ok(value) => {
                if attempt > 1 {
                    log::debug!("{} succeeded on attempt {}", operation, attempt);
                }
                return Ok(value);
            }
            Err(err) => {
                let failure = classify(&err);
                if !failure.is_recoverable(attempt, policy.attempts) {
                    return Err(err);
                }
                let delay = policy.delay_after(attempt);
                log::warn!(
                    "{} attempt {} failed: {}. Retrying in {:?}",
                    operation,
                    attempt,
                    err,
                    delay
                );
                sleep_cancellable(delay, cancel)?;
                attempt += 1;
            }
        }
    }
}

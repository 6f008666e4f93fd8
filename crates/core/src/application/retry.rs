// Retry logic: opt-in job re-execution and bounded backoff for transient failures
use crate::error::Result;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{info, warn};

use crate::application::dispatcher::constants::DEFAULT_RETRY_BASE_DELAY_MS;

/// Retry decision result
#[derive(Debug, PartialEq, Eq)]
pub enum RetryDecision {
    /// Requeue the job (with backoff delay in ms)
    Retry(i64),
    /// Record the failure as terminal
    Failed,
}

/// Re-execution policy for failed scans.
///
/// Disabled by default: a failed scan is recorded as a terminal outcome and
/// its message acknowledged. When enabled, a failure under the attempt budget
/// is requeued instead, and nothing terminal is recorded for that attempt.
#[derive(Debug, Clone)]
pub struct JobRetryPolicy {
    pub enabled: bool,
    pub max_attempts: i32,
    pub base_delay_ms: i64,
    pub backoff_factor: f64,
}

impl Default for JobRetryPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            max_attempts: 3,
            base_delay_ms: DEFAULT_RETRY_BASE_DELAY_MS,
            backoff_factor: 2.0,
        }
    }
}

impl JobRetryPolicy {
    pub fn enabled(max_attempts: i32, base_delay_ms: i64) -> Self {
        Self {
            enabled: true,
            max_attempts,
            base_delay_ms,
            ..Self::default()
        }
    }

    /// Decide what to do with a failed attempt.
    ///
    /// `attempts` counts executions so far, including the one that just failed.
    ///
    /// Backoff: delay = base_delay * (backoff_factor ^ (attempts - 1)) * (1.0 ± 0.1)
    pub fn should_retry(&self, job_id: &str, attempts: i32) -> RetryDecision {
        if !self.enabled {
            return RetryDecision::Failed;
        }
        if attempts >= self.max_attempts {
            warn!(
                job_id = %job_id,
                attempts = %attempts,
                max_attempts = %self.max_attempts,
                "Max retry attempts reached"
            );
            return RetryDecision::Failed;
        }

        let base = self.base_delay_ms as f64 * self.backoff_factor.powi((attempts - 1).max(0));

        // Deterministic ±10% jitter per job so requeued siblings spread out
        let jitter_seed = job_id.chars().map(|c| c as u32).sum::<u32>();
        let jitter_factor = 0.9 + ((jitter_seed % 21) as f64 / 100.0);
        let delay_ms = (base * jitter_factor) as i64;

        info!(
            job_id = %job_id,
            attempt = %attempts,
            max_attempts = %self.max_attempts,
            delay_ms = %delay_ms,
            "Scheduling retry"
        );
        RetryDecision::Retry(delay_ms)
    }
}

/// Delay schedule for bounded retry loops (attempt numbers start at 1)
#[derive(Debug, Clone, Copy)]
pub enum Backoff {
    /// base, 2*base, 3*base, ...
    Linear(Duration),
    /// base, 2*base, 4*base, ... (capped at 64*base) with up to 50% random jitter
    Exponential(Duration),
}

impl Backoff {
    pub fn delay(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        match *self {
            Backoff::Linear(base) => base * attempt,
            Backoff::Exponential(base) => {
                let exp = base * 2u32.pow((attempt - 1).min(6));
                let jitter_ms = rand::thread_rng().gen_range(0..=exp.as_millis() as u64 / 2);
                exp + Duration::from_millis(jitter_ms)
            }
        }
    }
}

/// Run `op` until it succeeds, fails with a non-transient error, or runs out of attempts
pub async fn retry_transient<T, F, Fut>(
    what: &str,
    attempts: u32,
    backoff: Backoff,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < attempts => {
                let delay = backoff.delay(attempt);
                warn!(
                    operation = %what,
                    attempt = %attempt,
                    delay_ms = %delay.as_millis(),
                    error = %e,
                    "Transient failure, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

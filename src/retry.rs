//! Retry/backoff executor.
//!
//! Every adapter call made by a [`Target`](crate::target::Target) runs
//! through [`RetryExecutor::run`], which
//!
//! - admits at most `max_concurrency` in-flight attempts per target
//!   (excess callers wait for a permit),
//! - retries [`StoreError::Transient`] failures up to `max_retries` times
//!   with exponential or linear backoff,
//! - enforces one overall deadline across all attempts, and
//! - aborts promptly when the caller's [`CancelToken`] fires.
//!
//! Semantic outcomes (not found, precondition failed, lease conflict) are
//! returned on the first attempt and never retried.

use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::cancel::CancelToken;
use crate::config::{RetryBackoff, TargetConfig};
use crate::errors::{Result, StoreError};
use crate::metrics;

/// Retry tuning for one target.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Overall deadline across all attempts and backoff sleeps.
    pub timeout: Duration,
    pub backoff: RetryBackoff,
    /// Delay before the first retry; also the linear increment.
    pub base_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Randomise each delay within `[nominal / 2, nominal]`.
    pub jitter: bool,
    /// In-flight attempt limit.
    pub max_concurrency: usize,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&TargetConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &TargetConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            timeout: Duration::from_secs(config.timeout_seconds),
            backoff: config.retry_backoff,
            base_delay: Duration::from_millis(config.retry_base_delay_ms),
            max_delay: Duration::from_millis(config.retry_max_delay_ms),
            jitter: config.retry_jitter,
            max_concurrency: config.max_concurrency.max(1),
        }
    }

    /// Nominal delay before retry number `retry` (1-based), before jitter.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let retry = retry.max(1);
        let nominal = match self.backoff {
            RetryBackoff::Exponential => {
                let factor = 2u32.saturating_pow(retry - 1);
                self.base_delay.saturating_mul(factor)
            }
            RetryBackoff::Linear => self.base_delay.saturating_mul(retry),
        };
        nominal.min(self.max_delay)
    }

    /// Delay actually slept before retry number `retry`.
    ///
    /// Never shorter than `previous`, so the sequence of sleeps within one
    /// call is non-decreasing even with jitter.
    fn next_delay(&self, retry: u32, previous: Duration) -> Duration {
        let nominal = self.delay_for(retry);
        let delay = if self.jitter && !nominal.is_zero() {
            let half = nominal / 2;
            let spread = (nominal - half).as_millis() as u64;
            half + Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
        } else {
            nominal
        };
        delay.max(previous).min(self.max_delay.max(previous))
    }
}

/// Runs adapter calls under the retry policy and concurrency limit.
pub struct RetryExecutor {
    target: String,
    policy: RetryPolicy,
    permits: Arc<Semaphore>,
}

impl RetryExecutor {
    pub fn new(target: impl Into<String>, policy: RetryPolicy) -> Self {
        let permits = Arc::new(Semaphore::new(policy.max_concurrency));
        Self {
            target: target.into(),
            policy,
            permits,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Permits currently free.
    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    fn cancelled(&self, operation: &'static str) -> StoreError {
        StoreError::Cancelled {
            target: self.target.clone(),
            operation,
        }
    }

    fn deadline_exceeded(
        &self,
        operation: &'static str,
        last_error: Option<StoreError>,
    ) -> StoreError {
        StoreError::DeadlineExceeded {
            target: self.target.clone(),
            operation,
            timeout: self.policy.timeout,
            last_error: last_error.map(Box::new),
        }
    }

    /// Run `call` until it succeeds, fails non-transiently, runs out of
    /// retries, hits the deadline, or `cancel` fires.
    ///
    /// `call` is invoked once per attempt and must build a fresh future
    /// each time.
    pub async fn run<T, F, Fut>(
        &self,
        operation: &'static str,
        key: &str,
        cancel: &CancelToken,
        mut call: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let started = Instant::now();
        let deadline = started + self.policy.timeout;
        let mut previous_delay = Duration::ZERO;
        let mut attempt: u32 = 0;
        let mut last_error: Option<StoreError> = None;

        let result = loop {
            if cancel.is_cancelled() {
                break Err(self.cancelled(operation));
            }
            attempt += 1;

            let permits = Arc::clone(&self.permits);
            let attempt_fut = async {
                let _permit = permits
                    .acquire_owned()
                    .await
                    .map_err(|_| self.cancelled(operation))?;
                call().await
            };

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => break Err(self.cancelled(operation)),
                res = tokio::time::timeout_at(deadline, attempt_fut) => res,
            };

            let err = match outcome {
                Err(_elapsed) => break Err(self.deadline_exceeded(operation, last_error.take())),
                Ok(Ok(value)) => break Ok(value),
                Ok(Err(err)) => err,
            };

            if !err.is_transient() {
                break Err(err);
            }
            if attempt > self.policy.max_retries {
                break Err(StoreError::RetriesExhausted {
                    target: self.target.clone(),
                    operation,
                    attempts: attempt,
                    source: Box::new(err),
                });
            }

            let delay = self.policy.next_delay(attempt, previous_delay);
            previous_delay = delay;
            warn!(
                "Retrying {} on target={} key={} after transient failure \
                 (attempt {}/{}, backoff {:?}): {}",
                operation,
                self.target,
                key,
                attempt,
                self.policy.max_retries + 1,
                delay,
                err
            );
            metrics::record_retry(&self.target, operation);

            if Instant::now() + delay >= deadline {
                // Sleeping would overrun the deadline; report it now with
                // the cause rather than waiting it out.
                break Err(self.deadline_exceeded(operation, Some(err)));
            }
            last_error = Some(err);

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break Err(self.cancelled(operation)),
                _ = tokio::time::sleep(delay) => {}
            }
        };

        let status = match &result {
            Ok(_) => "ok",
            Err(e) => e.kind().as_str(),
        };
        debug!(
            "{} on target={} key={} finished: status={} attempts={} elapsed={:?}",
            operation,
            self.target,
            key,
            status,
            attempt,
            started.elapsed()
        );
        metrics::record_operation(&self.target, operation, status, started.elapsed());

        result
    }
}

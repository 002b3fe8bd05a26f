use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use stepflow_core::config::RetryConfig;
use stepflow_core::error::{Result, StepflowError};

/// How many times to attempt a call and how long to wait between attempts.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
    /// Treat `InvalidParams` as final instead of retrying it.
    pub fail_fast_on_invalid_params: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            jitter: config.jitter,
            fail_fast_on_invalid_params: config.fail_fast_on_invalid_params,
        }
    }
}

impl RetryPolicy {
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries.max(1);
        self
    }

    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }
}

/// Whether another attempt could change the outcome.
pub fn is_retryable(e: &StepflowError, policy: &RetryPolicy) -> bool {
    match e {
        StepflowError::InvalidParams { .. } => !policy.fail_fast_on_invalid_params,
        StepflowError::CircuitOpen { .. }
        | StepflowError::Cancelled
        | StepflowError::Validation(_)
        | StepflowError::NotFound(_)
        | StepflowError::Config(_) => false,
        _ => true,
    }
}

/// Delay after failed attempt `attempt` (1-based): `base * 2^(attempt-1)`, capped.
pub fn calculate_backoff(attempt: u32, policy: &RetryPolicy) -> Duration {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
    let delay = policy.base_delay.saturating_mul(factor).min(policy.max_delay);
    if policy.jitter {
        // 0.8x to 1.2x
        let jitter = 0.8 + rand::random::<f64>() * 0.4;
        Duration::from_millis((delay.as_millis() as f64 * jitter) as u64)
    } else {
        delay
    }
}

/// Runs an operation with bounded retries and exponential backoff.
///
/// Stateless between calls. It does not touch circuit breakers; callers
/// record the final outcome themselves.
#[derive(Debug, Clone, Default)]
pub struct RetryingInvoker {
    policy: RetryPolicy,
}

impl RetryingInvoker {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `operation` until it succeeds, fails with a non-retryable error,
    /// or runs out of attempts. The last error is returned unchanged.
    ///
    /// The operation receives the 1-based attempt number. Cancelling `cancel`
    /// during a backoff ends the call with `Cancelled`; an attempt already
    /// running is left to finish.
    pub async fn invoke<T, F, Fut>(
        &self,
        target: &str,
        cancel: &CancellationToken,
        mut operation: F,
    ) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_retries = self.policy.max_retries.max(1);
        let mut attempt = 1;
        loop {
            let err = match operation(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(target_key = %target, attempt, "Call succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) => e,
            };

            if attempt >= max_retries || !is_retryable(&err, &self.policy) {
                return Err(err);
            }

            let backoff = calculate_backoff(attempt, &self.policy);
            warn!(
                target_key = %target,
                attempt,
                max_retries,
                backoff_ms = backoff.as_millis() as u64,
                error = %err,
                "Retrying agent call"
            );
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(StepflowError::Cancelled),
                _ = tokio::time::sleep(backoff) => {}
            }
            attempt += 1;
        }
    }
}

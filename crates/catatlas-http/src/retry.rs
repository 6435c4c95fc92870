//! Retry with exponential backoff and jitter

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{ApiError, ErrorKind, HttpError, Result};

/// Decides whether a classified failure is retried, given the 0-based attempt index
pub type ShouldRetry = Arc<dyn Fn(&ApiError, u32) -> bool + Send + Sync>;

/// Observes a retry before the backoff sleep: error, 1-based attempt number, delay
pub type OnRetry = Arc<dyn Fn(&ApiError, u32, Duration) + Send + Sync>;

/// Upper bound of the added jitter, as a fraction of the computed delay
const JITTER_FRACTION: u128 = 4;

/// Retry configuration
#[derive(Clone)]
pub struct RetryConfig {
    /// Total attempts including the first one (at least 1)
    pub max_attempts: u32,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Backoff multiplier
    pub backoff_multiplier: f64,
    /// Overrides the error's own retryable flag
    pub should_retry: Option<ShouldRetry>,
    pub on_retry: Option<OnRetry>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(10_000),
            backoff_multiplier: 2.0,
            should_retry: None,
            on_retry: None,
        }
    }
}

impl RetryConfig {
    /// Create a new retry config with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set total attempts, including the first one
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Set delay before the first retry
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set maximum delay between retries
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set backoff multiplier
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Decide retries with `predicate` instead of the error's own flag
    pub fn with_should_retry<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&ApiError, u32) -> bool + Send + Sync + 'static,
    {
        self.should_retry = Some(Arc::new(predicate));
        self
    }

    /// Observe each retry before its backoff sleep
    pub fn with_on_retry<F>(mut self, hook: F) -> Self
    where
        F: Fn(&ApiError, u32, Duration) + Send + Sync + 'static,
    {
        self.on_retry = Some(Arc::new(hook));
        self
    }

    /// Calculate delay for given attempt index, without jitter
    ///
    /// `min(initial_delay * backoff_multiplier^attempt, max_delay)`
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let delay_ms =
            self.initial_delay.as_millis() as f64 * self.backoff_multiplier.powi(exponent);
        let max_ms = self.max_delay.as_millis() as f64;

        // NaN and infinity collapse to the cap
        let capped = if delay_ms.is_finite() {
            delay_ms.clamp(0.0, max_ms)
        } else {
            max_ms
        };
        Duration::from_millis(capped as u64)
    }

    /// Delay for the given attempt index with jitter applied
    ///
    /// Always within `[d, 1.25 * d]` where `d` is [`calculate_delay`](Self::calculate_delay).
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        apply_jitter(self.calculate_delay(attempt))
    }

    fn decide(&self, error: &ApiError, attempt: u32) -> bool {
        match &self.should_retry {
            Some(predicate) => predicate(error, attempt),
            None => error.retryable(),
        }
    }
}

impl fmt::Debug for RetryConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryConfig")
            .field("max_attempts", &self.max_attempts)
            .field("initial_delay", &self.initial_delay)
            .field("max_delay", &self.max_delay)
            .field("backoff_multiplier", &self.backoff_multiplier)
            .field("should_retry", &self.should_retry.is_some())
            .field("on_retry", &self.on_retry.is_some())
            .finish()
    }
}

/// Add a uniformly random amount in `[0, delay / 4]`
fn apply_jitter(delay: Duration) -> Duration {
    let delay_ms = delay.as_millis();
    let max_jitter = u64::try_from(delay_ms / JITTER_FRACTION).unwrap_or(u64::MAX);
    if max_jitter == 0 {
        return delay;
    }
    let jitter = rand::thread_rng().gen_range(0..=max_jitter);
    delay.saturating_add(Duration::from_millis(jitter))
}

/// Re-executes an operation on retryable classified failures
#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    /// Create a retry policy
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Get retry configuration
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Execute operation with retry logic
    ///
    /// Non-[`HttpError::Api`] errors propagate on first sight. When the policy
    /// still wants to retry after the last allowed attempt, the error is
    /// re-tagged as `MAX_RETRIES_EXCEEDED`. A fired `cancel` token stops the
    /// loop, including during the backoff sleep.
    pub async fn run<T, F, Fut>(
        &self,
        mut operation: F,
        cancel: Option<&CancellationToken>,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut total_delay = Duration::ZERO;
        let mut attempt = 0;

        loop {
            let error = match operation().await {
                Ok(result) => {
                    if attempt > 0 {
                        debug!(
                            "Request succeeded after {} retries ({:?} backoff)",
                            attempt, total_delay
                        );
                    }
                    return Ok(result);
                }
                Err(HttpError::Api(error)) => error,
                Err(other) => {
                    debug!("Unclassified error is not retried: {other}");
                    return Err(other);
                }
            };

            let cancelled = cancel.is_some_and(CancellationToken::is_cancelled);
            if cancelled || error.kind() == ErrorKind::Cancelled {
                return Err(if error.kind() == ErrorKind::Cancelled {
                    error.into()
                } else {
                    ApiError::cancelled(error.endpoint()).into()
                });
            }

            if !self.config.decide(&error, attempt) {
                debug!("Non-retryable error: {error}");
                return Err(error.into());
            }

            if attempt + 1 >= max_attempts {
                warn!("Request failed after {} attempts: {}", max_attempts, error);
                return Err(error.exhausted(max_attempts).into());
            }

            let delay = self.config.jittered_delay(attempt);
            warn!(
                "Request failed (attempt {}/{}), retrying in {:?}: {}",
                attempt + 1,
                max_attempts,
                delay,
                error
            );
            if let Some(hook) = &self.config.on_retry {
                hook(&error, attempt + 1, delay);
            }

            match cancel {
                Some(token) => {
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => {
                            return Err(ApiError::cancelled(error.endpoint()).into());
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                None => tokio::time::sleep(delay).await,
            }

            total_delay += delay;
            attempt += 1;
        }
    }
}

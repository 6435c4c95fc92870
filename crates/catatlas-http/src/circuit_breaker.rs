//! Circuit breaker pattern implementation for backend resilience
//!
//! The breaker stops calling a failing dependency for a cooldown period,
//! then lets probe requests through to test recovery.
//!
//! ```text
//! Closed   --(failure_count >= failure_threshold)--> Open
//! Open     --(open_duration elapsed, next call)----> HalfOpen
//! HalfOpen --(success_count >= success_threshold)--> Closed
//! HalfOpen --(any failure)-------------------------> Open
//! ```
//!
//! State lives behind a mutex so a breaker can be shared across tasks on a
//! multi-threaded runtime. The lock is never held across an await point.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{ApiError, ErrorKind, Result};

/// Observer for state transitions: (old, new)
pub type StateChangeHook = Arc<dyn Fn(CircuitState, CircuitState) + Send + Sync>;

/// State of the circuit breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Circuit is closed - requests flow through normally
    Closed,
    /// Circuit is open - requests fail immediately
    Open,
    /// Circuit is half-open - probe requests test recovery
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Configuration for circuit breaker behavior
#[derive(Clone)]
pub struct CircuitBreakerConfig {
    /// Number of failures before opening the circuit
    pub failure_threshold: u32,
    /// Number of successful calls in half-open state before closing
    pub success_threshold: u32,
    /// How long the circuit stays open before a probe is allowed
    pub open_duration: Duration,
    pub on_state_change: Option<StateChangeHook>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            open_duration: Duration::from_millis(60_000),
            on_state_change: None,
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a new circuit breaker config
    pub fn new() -> Self {
        Self::default()
    }

    /// Set failure threshold
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// Set success threshold for half-open state
    pub fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold;
        self
    }

    /// Set how long the circuit stays open
    pub fn with_open_duration(mut self, duration: Duration) -> Self {
        self.open_duration = duration;
        self
    }

    /// Observe state transitions
    pub fn with_on_state_change<F>(mut self, hook: F) -> Self
    where
        F: Fn(CircuitState, CircuitState) + Send + Sync + 'static,
    {
        self.on_state_change = Some(Arc::new(hook));
        self
    }
}

impl fmt::Debug for CircuitBreakerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreakerConfig")
            .field("failure_threshold", &self.failure_threshold)
            .field("success_threshold", &self.success_threshold)
            .field("open_duration", &self.open_duration)
            .field("on_state_change", &self.on_state_change.is_some())
            .finish()
    }
}

/// Internal state tracking
#[derive(Debug)]
struct CircuitBreakerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    /// Only meaningful while open
    next_attempt_at: Instant,
}

impl Default for CircuitBreakerState {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            next_attempt_at: Instant::now(),
        }
    }
}

/// Coarse health derived from the breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
}

/// Point-in-time view of a breaker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitStats {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    /// Time until the next probe is allowed; `None` unless open
    pub next_attempt_in: Option<Duration>,
}

impl CircuitStats {
    /// Healthy while closed, degraded otherwise
    pub fn health(&self) -> HealthStatus {
        match self.state {
            CircuitState::Closed => HealthStatus::Healthy,
            CircuitState::Open | CircuitState::HalfOpen => HealthStatus::Degraded,
        }
    }
}

/// Circuit breaker for protecting against cascade failures
///
/// # Usage
///
/// ```ignore
/// let breaker = CircuitBreaker::new("catatlas-api", CircuitBreakerConfig::default());
///
/// let entries = breaker
///     .execute(|| async { fetch_entries().await })
///     .await?;
/// ```
pub struct CircuitBreaker {
    /// Dependency identifier
    name: String,
    config: CircuitBreakerConfig,
    state: Mutex<CircuitBreakerState>,
}

type Transition = Option<(CircuitState, CircuitState)>;

impl CircuitBreaker {
    /// Create a new circuit breaker
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: Mutex::new(CircuitBreakerState::default()),
        }
    }

    /// Get the dependency name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get configuration
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Get current circuit state
    pub fn state(&self) -> CircuitState {
        self.state.lock().state
    }

    /// Run `operation` through the breaker
    ///
    /// While open and inside the cooldown, fails with `CIRCUIT_BREAKER_OPEN`
    /// without invoking `operation`.
    pub async fn execute<T, F, Fut>(&self, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.acquire()?;

        match operation().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(err) => {
                self.record_failure();
                Err(err)
            }
        }
    }

    /// Admit or reject a call, moving Open to HalfOpen once the cooldown is over
    fn acquire(&self) -> Result<()> {
        let transition = {
            let mut state = self.state.lock();
            if state.state != CircuitState::Open {
                return Ok(());
            }

            let now = Instant::now();
            if now < state.next_attempt_at {
                let remaining = state.next_attempt_at - now;
                debug!(
                    "Circuit breaker {} rejecting call, {:?} until probe",
                    self.name, remaining
                );
                return Err(self.open_error(remaining).into());
            }

            state.state = CircuitState::HalfOpen;
            state.success_count = 0;
            info!("Circuit breaker for {} transitioning to HalfOpen", self.name);
            Some((CircuitState::Open, CircuitState::HalfOpen))
        };

        self.notify(transition);
        Ok(())
    }

    /// Record a successful call
    pub fn record_success(&self) {
        let transition = {
            let mut state = self.state.lock();
            match state.state {
                CircuitState::Closed => {
                    // Successes continuously heal a closed circuit
                    state.failure_count = 0;
                    None
                }
                CircuitState::HalfOpen => {
                    state.success_count += 1;
                    debug!(
                        "Circuit breaker {} HalfOpen success {}/{}",
                        self.name, state.success_count, self.config.success_threshold
                    );

                    if state.success_count >= self.config.success_threshold {
                        state.state = CircuitState::Closed;
                        state.failure_count = 0;
                        state.success_count = 0;
                        info!(
                            "Circuit breaker for {} recovered, transitioning to Closed",
                            self.name
                        );
                        Some((CircuitState::HalfOpen, CircuitState::Closed))
                    } else {
                        None
                    }
                }
                CircuitState::Open => {
                    // A call admitted before the circuit opened finished late
                    debug!("Circuit breaker {} recorded success while Open", self.name);
                    None
                }
            }
        };

        self.notify(transition);
    }

    /// Record a failed call
    pub fn record_failure(&self) {
        let transition = {
            let mut state = self.state.lock();
            state.failure_count += 1;

            match state.state {
                CircuitState::Closed => {
                    debug!(
                        "Circuit breaker {} failure {}/{}",
                        self.name, state.failure_count, self.config.failure_threshold
                    );

                    if state.failure_count >= self.config.failure_threshold {
                        self.trip(&mut state);
                        warn!(
                            "Circuit breaker for {} opened after {} failures",
                            self.name, state.failure_count
                        );
                        Some((CircuitState::Closed, CircuitState::Open))
                    } else {
                        None
                    }
                }
                CircuitState::HalfOpen => {
                    // Any failure in half-open immediately reopens
                    self.trip(&mut state);
                    warn!(
                        "Circuit breaker for {} reopened after failure in HalfOpen state",
                        self.name
                    );
                    Some((CircuitState::HalfOpen, CircuitState::Open))
                }
                CircuitState::Open => None,
            }
        };

        self.notify(transition);
    }

    /// Force the circuit open for a full cooldown
    pub fn force_open(&self) {
        let transition = {
            let mut state = self.state.lock();
            let old = state.state;
            self.trip(&mut state);
            info!("Circuit breaker for {} force opened", self.name);
            (old != CircuitState::Open).then_some((old, CircuitState::Open))
        };

        self.notify(transition);
    }

    /// Force the circuit closed with zeroed counters
    pub fn reset(&self) {
        let transition = {
            let mut state = self.state.lock();
            let old = state.state;
            *state = CircuitBreakerState::default();
            debug!("Circuit breaker for {} reset", self.name);
            (old != CircuitState::Closed).then_some((old, CircuitState::Closed))
        };

        self.notify(transition);
    }

    /// Snapshot of state, counters, and time until the next probe
    pub fn stats(&self) -> CircuitStats {
        let state = self.state.lock();
        let next_attempt_in = (state.state == CircuitState::Open)
            .then(|| state.next_attempt_at.saturating_duration_since(Instant::now()));

        CircuitStats {
            name: self.name.clone(),
            state: state.state,
            failure_count: state.failure_count,
            success_count: state.success_count,
            next_attempt_in,
        }
    }

    /// Get failure count
    pub fn failure_count(&self) -> u32 {
        self.state.lock().failure_count
    }

    /// Get success count (meaningful only in half-open state)
    pub fn success_count(&self) -> u32 {
        self.state.lock().success_count
    }

    fn trip(&self, state: &mut CircuitBreakerState) {
        state.state = CircuitState::Open;
        state.next_attempt_at = Instant::now() + self.config.open_duration;
        state.success_count = 0;
    }

    fn open_error(&self, remaining: Duration) -> ApiError {
        let seconds = remaining.as_millis().div_ceil(1000);
        let seconds = u64::try_from(seconds).unwrap_or(u64::MAX);
        ApiError::new(
            ErrorKind::CircuitBreakerOpen,
            format!(
                "Circuit breaker for {} is open. Retry in {}s",
                self.name, seconds
            ),
        )
        .with_retryable(false)
        .with_retry_after(seconds)
    }

    fn notify(&self, transition: Transition) {
        if let (Some((old, new)), Some(hook)) = (transition, &self.config.on_state_change) {
            hook(old, new);
        }
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("state", &*self.state.lock())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HttpError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn failure() -> HttpError {
        ApiError::new(ErrorKind::ServerError, "boom").into()
    }

    async fn fail(cb: &CircuitBreaker) {
        let _: Result<()> = cb.execute(|| async { Err(failure()) }).await;
    }

    async fn succeed(cb: &CircuitBreaker) {
        cb.execute(|| async { Ok(()) }).await.unwrap();
    }

    fn open_quickly() -> CircuitBreakerConfig {
        CircuitBreakerConfig::default()
            .with_failure_threshold(2)
            .with_success_threshold(2)
            .with_open_duration(Duration::from_millis(1000))
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_breaker_starts_closed() {
        let cb = CircuitBreaker::new("test", CircuitBreakerConfig::default());
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.stats().health(), HealthStatus::Healthy);
        assert!(cb.stats().next_attempt_in.is_none());
        assert_eq!(cb.name(), "test");
        assert_eq!(cb.config().failure_threshold, 5);
        assert_eq!(cb.config().success_threshold, 2);
        assert_eq!(cb.config().open_duration, Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_opens_after_threshold_failures() {
        let cb = CircuitBreaker::new("test", open_quickly());

        fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Closed);

        fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.stats().health(), HealthStatus::Degraded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_circuit_rejects_without_invoking() {
        let cb = CircuitBreaker::new("test", open_quickly());
        fail(&cb).await;
        fail(&cb).await;

        let invoked = AtomicU32::new(0);
        let result: Result<()> = cb
            .execute(|| async {
                invoked.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;

        let err = result.unwrap_err();
        let api = err.api_error().unwrap();
        assert_eq!(api.kind(), ErrorKind::CircuitBreakerOpen);
        assert_eq!(api.retry_after_seconds(), Some(1));
        assert!(!api.retryable());
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_rounds_up() {
        let config = open_quickly().with_open_duration(Duration::from_millis(60_000));
        let cb = CircuitBreaker::new("test", config);
        fail(&cb).await;
        fail(&cb).await;

        tokio::time::advance(Duration::from_millis(500)).await;
        let result: Result<()> = cb.execute(|| async { Ok(()) }).await;
        let err = result.unwrap_err();
        assert_eq!(err.api_error().unwrap().retry_after_seconds(), Some(60));
        assert_eq!(
            cb.stats().next_attempt_in,
            Some(Duration::from_millis(59_500))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_failure_count() {
        let config = CircuitBreakerConfig::default().with_failure_threshold(3);
        let cb = CircuitBreaker::new("test", config);

        fail(&cb).await;
        fail(&cb).await;
        succeed(&cb).await;

        assert_eq!(cb.failure_count(), 0);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_recovers_after_successes() {
        let cb = CircuitBreaker::new("test", open_quickly());
        fail(&cb).await;
        fail(&cb).await;

        tokio::time::advance(Duration::from_millis(1000)).await;

        let invoked = AtomicU32::new(0);
        cb.execute(|| async {
            invoked.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await
        .unwrap();
        assert_eq!(invoked.load(Ordering::SeqCst), 1);
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert_eq!(cb.success_count(), 1);

        succeed(&cb).await;
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.failure_count(), 0);
        assert_eq!(cb.success_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_reopens_on_failure() {
        let cb = CircuitBreaker::new("test", open_quickly());
        fail(&cb).await;
        fail(&cb).await;

        tokio::time::advance(Duration::from_millis(1500)).await;
        succeed(&cb).await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.success_count(), 0);
        // Cooldown restarts from the reopening failure
        assert_eq!(
            cb.stats().next_attempt_in,
            Some(Duration::from_millis(1000))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_state_change_observer() {
        let transitions = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let config = open_quickly().with_on_state_change({
            let transitions = transitions.clone();
            move |old, new| transitions.lock().push((old, new))
        });
        let cb = CircuitBreaker::new("test", config);

        fail(&cb).await;
        fail(&cb).await;
        tokio::time::advance(Duration::from_secs(1)).await;
        succeed(&cb).await;
        succeed(&cb).await;
        cb.force_open();
        cb.reset();

        assert_eq!(
            *transitions.lock(),
            vec![
                (CircuitState::Closed, CircuitState::Open),
                (CircuitState::Open, CircuitState::HalfOpen),
                (CircuitState::HalfOpen, CircuitState::Closed),
                (CircuitState::Closed, CircuitState::Open),
                (CircuitState::Open, CircuitState::Closed),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_observer_may_read_stats() {
        let cb = Arc::new_cyclic(|weak: &std::sync::Weak<CircuitBreaker>| {
            let weak = weak.clone();
            let config = open_quickly().with_on_state_change(move |_, new| {
                if let Some(cb) = weak.upgrade() {
                    assert_eq!(cb.stats().state, new);
                }
            });
            CircuitBreaker::new("test", config)
        });

        fail(&cb).await;
        fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset() {
        let cb = CircuitBreaker::new("test", open_quickly());
        fail(&cb).await;
        fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);

        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.failure_count(), 0);
        succeed(&cb).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_failures_open_once() {
        let transitions = Arc::new(AtomicU32::new(0));
        let config = CircuitBreakerConfig::default()
            .with_failure_threshold(5)
            .with_on_state_change({
                let transitions = transitions.clone();
                move |_, _| {
                    transitions.fetch_add(1, Ordering::SeqCst);
                }
            });
        let cb = Arc::new(CircuitBreaker::new("test", config));

        let tasks: Vec<_> = (0..5)
            .map(|_| {
                let cb = cb.clone();
                tokio::spawn(async move {
                    let _: Result<()> = cb
                        .execute(|| async {
                            tokio::time::sleep(Duration::from_millis(10)).await;
                            Err(failure())
                        })
                        .await;
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.failure_count(), 5);
        assert_eq!(transitions.load(Ordering::SeqCst), 1);
    }
}

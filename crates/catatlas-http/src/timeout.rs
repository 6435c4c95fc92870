//! Per-attempt deadline with cooperative cancellation
//!
//! The operation receives a [`CancellationToken`] that fires when the deadline
//! elapses or when the caller's token fires, whichever comes first. The timer
//! lives inside [`TimeoutGuard::run`] and is dropped on every return path.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{ApiError, ErrorKind, Result};

/// Hook invoked with the configured bound when the deadline fires
pub type TimeoutHook = Arc<dyn Fn(Duration) + Send + Sync>;

/// Bounds a single attempt's duration
#[derive(Clone)]
pub struct TimeoutGuard {
    timeout: Duration,
    endpoint: Option<String>,
    on_timeout: Option<TimeoutHook>,
}

impl TimeoutGuard {
    /// Create a guard with the given per-attempt bound
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            endpoint: None,
            on_timeout: None,
        }
    }

    /// Tag produced errors with the endpoint
    pub fn for_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    /// Observe deadline expiry
    pub fn with_on_timeout<F>(mut self, hook: F) -> Self
    where
        F: Fn(Duration) + Send + Sync + 'static,
    {
        self.on_timeout = Some(Arc::new(hook));
        self
    }

    /// Get the per-attempt bound
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run `operation` under the deadline
    ///
    /// Exactly one of the operation's own result, a `TIMEOUT_ERROR`, or a
    /// `CANCELLED` error is returned. Signals are checked in the order caller
    /// token, operation, timer, so an operation that finishes exactly at the
    /// deadline keeps its result.
    pub async fn run<T, F, Fut>(
        &self,
        operation: F,
        external: Option<&CancellationToken>,
    ) -> Result<T>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let endpoint = self.endpoint.as_deref();
        if external.is_some_and(CancellationToken::is_cancelled) {
            return Err(ApiError::cancelled(endpoint).into());
        }

        let token = match external {
            Some(parent) => parent.child_token(),
            None => CancellationToken::new(),
        };

        let operation = operation(token.clone());
        let timer = tokio::time::sleep(self.timeout);
        let external_cancelled = async {
            match external {
                Some(parent) => parent.cancelled().await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::pin!(operation);
        tokio::pin!(timer);
        tokio::pin!(external_cancelled);

        tokio::select! {
            biased;
            _ = &mut external_cancelled => {
                token.cancel();
                debug!("Request to {:?} cancelled by caller", endpoint);
                Err(ApiError::cancelled(endpoint).into())
            }
            // A result that is already available beats an expired deadline
            result = &mut operation => result,
            _ = &mut timer => {
                token.cancel();
                if let Some(hook) = &self.on_timeout {
                    hook(self.timeout);
                }
                debug!("Request to {:?} timed out after {:?}", endpoint, self.timeout);
                Err(self.timeout_error().into())
            }
        }
    }

    fn timeout_error(&self) -> ApiError {
        let error = ApiError::new(
            ErrorKind::TimeoutError,
            format!("Request timed out after {}ms", self.timeout.as_millis()),
        );
        match &self.endpoint {
            Some(endpoint) => error.with_endpoint(endpoint.clone()),
            None => error,
        }
    }
}

impl fmt::Debug for TimeoutGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimeoutGuard")
            .field("timeout", &self.timeout)
            .field("endpoint", &self.endpoint)
            .field("on_timeout", &self.on_timeout.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HttpError;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_success_passes_through() {
        let guard = TimeoutGuard::new(Duration::from_secs(1));
        let result = guard.run(|_| async { Ok(42) }, None).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test(start_paused = true)]
    async fn test_inner_error_passes_through() {
        let guard = TimeoutGuard::new(Duration::from_secs(1));
        let result: Result<()> = guard
            .run(
                |_| async { Err(ApiError::new(ErrorKind::NotFound, "gone").into()) },
                None,
            )
            .await;
        assert_eq!(result.unwrap_err().kind(), Some(ErrorKind::NotFound));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_fires_and_cancels_token() {
        let hook_calls = Arc::new(AtomicU32::new(0));
        let guard = TimeoutGuard::new(Duration::from_millis(250))
            .for_endpoint("/entries")
            .with_on_timeout({
                let hook_calls = hook_calls.clone();
                move |bound| {
                    assert_eq!(bound, Duration::from_millis(250));
                    hook_calls.fetch_add(1, Ordering::SeqCst);
                }
            });

        let seen = Arc::new(parking_lot::Mutex::new(None::<CancellationToken>));
        let result: Result<()> = guard
            .run(
                {
                    let seen = seen.clone();
                    move |token| async move {
                        *seen.lock() = Some(token);
                        tokio::time::sleep(Duration::from_secs(10)).await;
                        Ok(())
                    }
                },
                None,
            )
            .await;

        let err = result.unwrap_err();
        let api = err.api_error().unwrap();
        assert_eq!(api.kind(), ErrorKind::TimeoutError);
        assert!(api.message().contains("250ms"));
        assert_eq!(api.endpoint(), Some("/entries"));
        assert!(api.retryable());
        assert_eq!(hook_calls.load(Ordering::SeqCst), 1);
        assert!(seen.lock().as_ref().unwrap().is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_timer_fires_after_completion() {
        let hook_calls = Arc::new(AtomicU32::new(0));
        let guard = TimeoutGuard::new(Duration::from_millis(100)).with_on_timeout({
            let hook_calls = hook_calls.clone();
            move |_| {
                hook_calls.fetch_add(1, Ordering::SeqCst);
            }
        });

        let ok = guard.run(|_| async { Ok("fast") }, None).await;
        assert!(ok.is_ok());
        let failed: Result<()> = guard
            .run(|_| async { Err(HttpError::Config("bad".into())) }, None)
            .await;
        assert!(failed.is_err());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(hook_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_external_cancellation_wins() {
        let external = CancellationToken::new();
        let guard = TimeoutGuard::new(Duration::from_secs(30)).for_endpoint("/cats");

        let trigger = external.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });

        let result: Result<()> = guard
            .run(
                |token| async move {
                    token.cancelled().await;
                    Err(ApiError::new(ErrorKind::TimeoutError, "transport aborted").into())
                },
                Some(&external),
            )
            .await;

        let err = result.unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::Cancelled));
        assert!(!err.is_retryable());
    }

    #[tokio::test(start_paused = true)]
    async fn test_already_cancelled_skips_operation() {
        let external = CancellationToken::new();
        external.cancel();
        let calls = Arc::new(AtomicU32::new(0));

        let guard = TimeoutGuard::new(Duration::from_secs(1));
        let result: Result<()> = guard
            .run(
                {
                    let calls = calls.clone();
                    move |_| async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                },
                Some(&external),
            )
            .await;

        assert_eq!(result.unwrap_err().kind(), Some(ErrorKind::Cancelled));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_first_external_cancel_is_inert() {
        let hook_calls = Arc::new(AtomicU32::new(0));
        let guard = TimeoutGuard::new(Duration::from_millis(100)).with_on_timeout({
            let hook_calls = hook_calls.clone();
            move |_| {
                hook_calls.fetch_add(1, Ordering::SeqCst);
            }
        });
        assert_eq!(guard.timeout(), Duration::from_millis(100));

        let external = CancellationToken::new();
        let trigger = external.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });

        let result: Result<()> = guard
            .run(
                |token| async move {
                    token.cancelled().await;
                    Err(ApiError::new(ErrorKind::Unknown, "aborted").into())
                },
                Some(&external),
            )
            .await;

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(external.is_cancelled());
        let err = result.unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::TimeoutError));
        assert!(err.is_retryable());
        assert_eq!(hook_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_result_beats_zero_deadline() {
        let guard = TimeoutGuard::new(Duration::ZERO);
        let result = guard.run(|_| async { Ok(1) }, None).await;
        assert_eq!(result.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_completion_at_deadline_keeps_result() {
        let hook_calls = Arc::new(AtomicU32::new(0));
        let guard = TimeoutGuard::new(Duration::from_millis(100)).with_on_timeout({
            let hook_calls = hook_calls.clone();
            move |_| {
                hook_calls.fetch_add(1, Ordering::SeqCst);
            }
        });

        let result = guard
            .run(
                |_| async {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Ok("posted")
                },
                None,
            )
            .await;

        assert_eq!(result.unwrap(), "posted");
        assert_eq!(hook_calls.load(Ordering::SeqCst), 0);
    }
}

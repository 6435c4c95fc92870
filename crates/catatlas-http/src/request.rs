//! Per-call request options

use std::time::Duration;

use reqwest::{
    header::{HeaderMap, HeaderName, HeaderValue},
    Method,
};
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::{
    error::{HttpError, Result},
    retry::RetryConfig,
};

/// Default per-attempt timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(30_000);

/// Options for one pipeline call
///
/// Never persisted; built fresh for each request.
#[derive(Debug, Clone)]
pub struct RequestConfig {
    pub method: Method,
    pub body: Option<Value>,
    /// Merged over the client's default headers
    pub headers: HeaderMap,
    /// Bound for each individual attempt
    pub timeout: Duration,
    /// `None` disables retries
    pub retry: Option<RetryConfig>,
    pub use_circuit_breaker: bool,
    pub cancel: Option<CancellationToken>,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self::new(Method::GET)
    }
}

impl RequestConfig {
    /// Create a request config with defaults for `method`
    pub fn new(method: Method) -> Self {
        Self {
            method,
            body: None,
            headers: HeaderMap::new(),
            timeout: DEFAULT_TIMEOUT,
            retry: Some(RetryConfig::default()),
            use_circuit_breaker: true,
            cancel: None,
        }
    }

    /// Serialize `body` as the JSON payload
    pub fn with_json<B: Serialize + ?Sized>(mut self, body: &B) -> Result<Self> {
        self.body = Some(serde_json::to_value(body)?);
        Ok(self)
    }

    /// Use an already-built JSON payload
    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Add or replace a header
    pub fn with_header(mut self, name: &str, value: &str) -> Result<Self> {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| HttpError::Config(format!("invalid header name {name:?}: {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| HttpError::Config(format!("invalid header value for {name}: {e}")))?;
        self.headers.insert(name, value);
        Ok(self)
    }

    /// Set per-attempt timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set retry policy
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Disable retries
    pub fn without_retry(mut self) -> Self {
        self.retry = None;
        self
    }

    /// Bypass the circuit breaker
    pub fn without_circuit_breaker(mut self) -> Self {
        self.use_circuit_breaker = false;
        self
    }

    /// Abort the call when `token` fires
    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults() {
        let config = RequestConfig::default();
        assert_eq!(config.method, Method::GET);
        assert_eq!(config.timeout, Duration::from_secs(30));
        assert!(config.use_circuit_breaker);
        assert_eq!(config.retry.as_ref().map(|r| r.max_attempts), Some(3));
        assert!(config.body.is_none());
        assert!(config.cancel.is_none());
    }

    #[test]
    fn test_builder_pattern() {
        #[derive(Serialize)]
        struct Sighting<'a> {
            cat_id: u32,
            notes: &'a str,
        }

        let config = RequestConfig::new(Method::POST)
            .with_json(&Sighting {
                cat_id: 7,
                notes: "by the fountain",
            })
            .unwrap()
            .with_header("X-Trace", "abc")
            .unwrap()
            .with_timeout(Duration::from_secs(5))
            .without_retry()
            .without_circuit_breaker();

        assert_eq!(
            config.body,
            Some(json!({"cat_id": 7, "notes": "by the fountain"}))
        );
        assert_eq!(config.headers.get("x-trace").unwrap(), "abc");
        assert_eq!(config.timeout, Duration::from_secs(5));
        assert!(config.retry.is_none());
        assert!(!config.use_circuit_breaker);
    }

    #[test]
    fn test_invalid_header_rejected() {
        let result = RequestConfig::default().with_header("bad header", "x");
        assert!(matches!(result, Err(HttpError::Config(_))));

        let result = RequestConfig::default().with_header("X-Ok", "line\nbreak");
        assert!(matches!(result, Err(HttpError::Config(_))));
    }
}

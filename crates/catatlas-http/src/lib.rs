//! Resilient request pipeline for the CatAtlas API
//!
//! Wraps every outbound call with a per-attempt timeout, exponential-backoff
//! retry, and a circuit breaker, on top of one structured error taxonomy.
//!
//! ## Features
//!
//! - **Transport-agnostic**: generic over [`Transport`], with reqwest and
//!   in-memory implementations
//! - **Structured errors**: every failure is an [`ApiError`] with a stable
//!   [`ErrorKind`] code
//! - **Cancellation**: callers pass a [`CancellationToken`] that aborts the
//!   in-flight attempt and any pending backoff
//! - **Configurable**: TOML file plus `CATATLAS__*` environment overrides
//!
//! ```ignore
//! let client = ApiClient::<ReqwestTransport>::from_config(&ClientConfig::load(None)?)?;
//! let cats: Vec<Cat> = client.get("/cats").await?;
//! ```

pub mod circuit_breaker;
pub mod classifier;
pub mod client;
pub mod config;
pub mod error;
pub mod request;
pub mod retry;
pub mod timeout;
pub mod transport;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitState, CircuitStats, HealthStatus,
};
pub use client::ApiClient;
pub use config::{CircuitBreakerSettings, ClientConfig, RetrySettings};
pub use error::{ApiError, ErrorKind, HttpError, Result};
pub use request::RequestConfig;
pub use retry::{RetryConfig, RetryPolicy};
pub use timeout::TimeoutGuard;
pub use transport::{
    MockReply, MockTransport, ReqwestTransport, Transport, TransportError, TransportRequest,
    TransportResponse,
};

/// Re-export commonly used types
pub use reqwest::{header, Method, StatusCode};
pub use tokio_util::sync::CancellationToken;

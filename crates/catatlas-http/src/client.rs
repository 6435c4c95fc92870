//! Resilient API client
//!
//! Every call runs through the same layers, outermost first:
//!
//! ```text
//! CircuitBreaker::execute
//!   RetryPolicy::run
//!     TimeoutGuard::run        (fresh deadline per attempt)
//!       Transport::send        (failures classified here)
//! ```
//!
//! The breaker observes only the final outcome of the retried sequence, so a
//! request that recovers on its third attempt counts as one success.

use std::fmt;
use std::sync::Arc;

use reqwest::{
    header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE},
    Method,
};
use serde::{de::DeserializeOwned, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

use crate::{
    circuit_breaker::{CircuitBreaker, CircuitStats},
    classifier,
    config::ClientConfig,
    error::{HttpError, Result},
    request::RequestConfig,
    retry::RetryPolicy,
    timeout::TimeoutGuard,
    transport::{ReqwestTransport, Transport, TransportRequest, TransportResponse},
};

/// API client generic over its transport
pub struct ApiClient<T: Transport = ReqwestTransport> {
    transport: Arc<T>,
    base_url: Option<Url>,
    default_headers: HeaderMap,
    breaker: Arc<CircuitBreaker>,
    /// Template for [`ApiClient::request_config`]
    defaults: RequestConfig,
}

impl ApiClient<ReqwestTransport> {
    /// Build a reqwest-backed client from configuration
    pub fn from_config(config: &ClientConfig) -> Result<Self> {
        config.validate()?;

        let transport = ReqwestTransport::new(config)?;
        let breaker = Arc::new(CircuitBreaker::new(
            config.circuit_breaker.name.clone(),
            config.breaker_config(),
        ));

        let mut defaults = RequestConfig::default().with_timeout(config.timeout());
        defaults.retry = config.retry_config();
        defaults.use_circuit_breaker = config.circuit_breaker.enabled;

        let client = Self::new(transport, breaker).with_defaults(defaults);
        match &config.base_url {
            Some(base_url) => client.with_base_url(base_url),
            None => Ok(client),
        }
    }
}

impl<T: Transport> ApiClient<T> {
    /// Create a client over `transport`, sharing `breaker` with other clients
    pub fn new(transport: T, breaker: Arc<CircuitBreaker>) -> Self {
        let mut default_headers = HeaderMap::new();
        default_headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        Self {
            transport: Arc::new(transport),
            base_url: None,
            default_headers,
            breaker,
            defaults: RequestConfig::default(),
        }
    }

    /// Join relative endpoints onto `base_url`
    pub fn with_base_url(mut self, base_url: &str) -> Result<Self> {
        let mut url =
            Url::parse(base_url).map_err(|e| HttpError::InvalidUrl(format!("{base_url}: {e}")))?;
        if !url.path().ends_with('/') {
            let path = format!("{}/", url.path());
            url.set_path(&path);
        }
        self.base_url = Some(url);
        Ok(self)
    }

    /// Add a header sent with every request unless overridden per call
    pub fn with_default_header(mut self, name: &str, value: &str) -> Result<Self> {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| HttpError::Config(format!("invalid header name {name:?}: {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| HttpError::Config(format!("invalid header value for {name}: {e}")))?;
        self.default_headers.insert(name, value);
        Ok(self)
    }

    /// Replace the per-call defaults used by the verb helpers
    pub fn with_defaults(mut self, defaults: RequestConfig) -> Self {
        self.defaults = defaults;
        self
    }

    /// Get underlying transport
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Get the shared circuit breaker
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Get the base URL, normalized with a trailing slash
    pub fn base_url(&self) -> Option<&Url> {
        self.base_url.as_ref()
    }

    /// Client defaults for `method`, ready to customize
    pub fn request_config(&self, method: Method) -> RequestConfig {
        RequestConfig {
            method,
            ..self.defaults.clone()
        }
    }

    /// Snapshot of the circuit breaker
    pub fn circuit_stats(&self) -> CircuitStats {
        self.breaker.stats()
    }

    /// Force the circuit breaker closed
    pub fn reset_circuit(&self) {
        self.breaker.reset();
    }

    /// Execute a GET request
    pub async fn get<R: DeserializeOwned>(&self, endpoint: &str) -> Result<R> {
        self.request(endpoint, self.request_config(Method::GET))
            .await
    }

    /// Execute a POST request with a JSON body
    pub async fn post<B, R>(&self, endpoint: &str, body: &B) -> Result<R>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let config = self.request_config(Method::POST).with_json(body)?;
        self.request(endpoint, config).await
    }

    /// Execute a PUT request with a JSON body
    pub async fn put<B, R>(&self, endpoint: &str, body: &B) -> Result<R>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let config = self.request_config(Method::PUT).with_json(body)?;
        self.request(endpoint, config).await
    }

    /// Execute a PATCH request with a JSON body
    pub async fn patch<B, R>(&self, endpoint: &str, body: &B) -> Result<R>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let config = self.request_config(Method::PATCH).with_json(body)?;
        self.request(endpoint, config).await
    }

    /// Execute a DELETE request
    pub async fn delete<R: DeserializeOwned>(&self, endpoint: &str) -> Result<R> {
        self.request(endpoint, self.request_config(Method::DELETE))
            .await
    }

    /// Run the pipeline and decode the success body as JSON
    ///
    /// Decoding happens after the breaker recorded the call, so a malformed
    /// body surfaces as [`HttpError::Serialization`] without counting as a
    /// downstream failure.
    pub async fn request<R: DeserializeOwned>(
        &self,
        endpoint: &str,
        config: RequestConfig,
    ) -> Result<R> {
        let response = self.send(endpoint, config).await?;
        Ok(response.json()?)
    }

    /// Run the pipeline and return the raw 2xx response
    pub async fn send(&self, endpoint: &str, config: RequestConfig) -> Result<TransportResponse> {
        let url = self.resolve(endpoint)?;
        let body = config.body.as_ref().map(serde_json::to_vec).transpose()?;

        let mut headers = self.default_headers.clone();
        headers.extend(config.headers.clone());

        let request = TransportRequest {
            method: config.method.clone(),
            url: url.to_string(),
            headers,
            body,
        };
        debug!("API {} {}", request.method, request.url);

        if config.use_circuit_breaker {
            self.breaker
                .execute(|| self.run_with_retry(endpoint, &request, &config))
                .await
        } else {
            self.run_with_retry(endpoint, &request, &config).await
        }
    }

    async fn run_with_retry(
        &self,
        endpoint: &str,
        request: &TransportRequest,
        config: &RequestConfig,
    ) -> Result<TransportResponse> {
        let guard = &TimeoutGuard::new(config.timeout).for_endpoint(endpoint);
        let cancel = config.cancel.as_ref();

        match &config.retry {
            Some(retry) => {
                RetryPolicy::new(retry.clone())
                    .run(move || self.attempt(endpoint, request, guard, cancel), cancel)
                    .await
            }
            None => self.attempt(endpoint, request, guard, cancel).await,
        }
    }

    /// One guarded transport call, classified at the boundary
    async fn attempt(
        &self,
        endpoint: &str,
        request: &TransportRequest,
        guard: &TimeoutGuard,
        cancel: Option<&CancellationToken>,
    ) -> Result<TransportResponse> {
        guard
            .run(
                |token| async move {
                    match self.transport.send(request.clone(), token).await {
                        Ok(response) if response.is_success() => Ok(response),
                        Ok(response) => {
                            debug!(
                                "API {} {} returned {}",
                                request.method,
                                request.url,
                                response.status()
                            );
                            Err(classifier::from_response(&response, endpoint).into())
                        }
                        Err(err) => {
                            debug!("API {} {} failed: {}", request.method, request.url, err);
                            Err(classifier::from_transport_error(err, endpoint).into())
                        }
                    }
                },
                cancel,
            )
            .await
    }

    fn resolve(&self, endpoint: &str) -> Result<Url> {
        let resolved = match &self.base_url {
            Some(base) => base.join(endpoint.trim_start_matches('/')),
            None => Url::parse(endpoint),
        };
        resolved.map_err(|e| HttpError::InvalidUrl(format!("{endpoint}: {e}")))
    }
}

impl<T: Transport> Clone for ApiClient<T> {
    fn clone(&self) -> Self {
        Self {
            transport: Arc::clone(&self.transport),
            base_url: self.base_url.clone(),
            default_headers: self.default_headers.clone(),
            breaker: Arc::clone(&self.breaker),
            defaults: self.defaults.clone(),
        }
    }
}

impl<T: Transport> fmt::Debug for ApiClient<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiClient")
            .field("base_url", &self.base_url.as_ref().map(Url::as_str))
            .field("default_headers", &self.default_headers)
            .field("breaker", &self.breaker.name())
            .field("defaults", &self.defaults)
            .finish()
    }
}

//! Transport seam for the raw network call
//!
//! The pipeline is generic over [`Transport`]. A transport performs exactly one
//! request/response exchange, must stop in-flight I/O once the cancellation
//! token fires, and reports connectivity problems as [`TransportError`].

mod mock;
mod reqwest_transport;

use async_trait::async_trait;
use reqwest::{header::HeaderMap, Method, StatusCode};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub use mock::{MockReply, MockTransport};
pub use reqwest_transport::ReqwestTransport;

/// Transport-level failures, before classification
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The server could not be reached
    #[error("Connection failed: {0}")]
    Connect(String),

    /// The transport's own deadline fired
    #[error("Transport timed out")]
    Timeout,

    /// The request was aborted through its cancellation token
    #[error("Request aborted")]
    Cancelled,

    /// Any other transport failure
    #[error("Transport error: {0}")]
    Other(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            TransportError::Timeout
        } else if err.is_connect() {
            TransportError::Connect(err.to_string())
        } else {
            TransportError::Other(err.to_string())
        }
    }
}

/// A fully built outbound request
#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Option<Vec<u8>>,
}

/// A response as received from the transport
#[derive(Debug, Clone)]
pub struct TransportResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: Vec<u8>,
}

impl TransportResponse {
    /// Create a response from its parts
    pub fn new(status: StatusCode, headers: HeaderMap, body: Vec<u8>) -> Self {
        Self {
            status,
            headers,
            body,
        }
    }

    /// Empty-bodied response with the given status code
    ///
    /// Invalid codes fall back to 500.
    pub fn with_status(status: u16) -> Self {
        let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        Self::new(status, HeaderMap::new(), Vec::new())
    }

    /// Set a JSON body and content type
    pub fn json_body(mut self, value: &serde_json::Value) -> Self {
        self.body = value.to_string().into_bytes();
        self.headers.insert(
            reqwest::header::CONTENT_TYPE,
            reqwest::header::HeaderValue::from_static("application/json"),
        );
        self
    }

    /// Set a plain text body
    pub fn text_body(mut self, text: impl Into<String>) -> Self {
        self.body = text.into().into_bytes();
        self
    }

    /// Add a header; invalid names or values are ignored
    pub fn header(mut self, name: &str, value: &str) -> Self {
        if let (Ok(name), Ok(value)) = (
            reqwest::header::HeaderName::from_bytes(name.as_bytes()),
            reqwest::header::HeaderValue::from_str(value),
        ) {
            self.headers.insert(name, value);
        }
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Canonical reason phrase, empty when unknown
    pub fn status_text(&self) -> &'static str {
        self.status.canonical_reason().unwrap_or("")
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Body as text, replacing invalid UTF-8
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Body decoded as JSON; an empty body decodes as `null`
    pub fn json<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        if self.body.iter().all(u8::is_ascii_whitespace) {
            serde_json::from_slice(b"null")
        } else {
            serde_json::from_slice(&self.body)
        }
    }
}

/// Raw request/response primitive
#[async_trait]
pub trait Transport: Send + Sync {
    /// Perform one exchange, aborting when `cancel` fires
    async fn send(
        &self,
        request: TransportRequest,
        cancel: CancellationToken,
    ) -> std::result::Result<TransportResponse, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_empty_body_decodes_as_null() {
        let response = TransportResponse::with_status(204);
        let value: Option<serde_json::Value> = response.json().unwrap();
        assert!(value.is_none());
        response.json::<()>().unwrap();
    }

    #[test]
    fn test_json_body_round_trip() {
        let response = TransportResponse::with_status(200).json_body(&json!({"id": 1}));
        assert!(response.is_success());
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "application/json"
        );
        let value: serde_json::Value = response.json().unwrap();
        assert_eq!(value["id"], 1);
    }

    #[test]
    fn test_status_text() {
        assert_eq!(TransportResponse::with_status(404).status_text(), "Not Found");
        assert_eq!(
            TransportResponse::with_status(1000).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}

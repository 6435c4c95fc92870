//! Classification of transport outcomes into [`ApiError`]
//!
//! Status table, first match wins:
//!
//! | status | kind |
//! |--------|------|
//! | >= 500 | `SERVER_ERROR` |
//! | 404 | `NOT_FOUND` |
//! | 403 | `FORBIDDEN` |
//! | 401 | `UNAUTHORIZED` |
//! | 400 | `BAD_REQUEST` |
//! | other | `UNKNOWN_ERROR` |
//!
//! Retryable: `>= 500`, `429`, `503`.

use std::time::SystemTime;

use reqwest::header::RETRY_AFTER;
use serde_json::Value;

use crate::{
    error::{ApiError, ErrorKind, HttpError},
    transport::{TransportError, TransportResponse},
};

/// JSON body fields searched for an error message, in order
const MESSAGE_FIELDS: [&str; 3] = ["message", "error", "detail"];

/// Map a status code to its error kind
pub fn classify(status: u16) -> ErrorKind {
    match status {
        s if s >= 500 => ErrorKind::ServerError,
        404 => ErrorKind::NotFound,
        403 => ErrorKind::Forbidden,
        401 => ErrorKind::Unauthorized,
        400 => ErrorKind::BadRequest,
        _ => ErrorKind::Unknown,
    }
}

/// Whether a failed status is worth retrying
pub fn is_retryable(status: u16) -> bool {
    status >= 500 || status == 429 || status == 503
}

/// Classify a non-success response
pub fn from_response(response: &TransportResponse, endpoint: &str) -> ApiError {
    let status = response.status().as_u16();
    let message = extract_message(response);

    let mut error = ApiError::new(classify(status), message)
        .with_status(status)
        .with_endpoint(endpoint)
        .with_retryable(is_retryable(status));

    if let Some(seconds) = response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(parse_retry_after)
    {
        error = error.with_retry_after(seconds);
    }

    error
}

/// Classify a transport-level failure
pub fn from_transport_error(err: TransportError, endpoint: &str) -> ApiError {
    let (kind, message, retryable) = match &err {
        TransportError::Connect(_) => (
            ErrorKind::NetworkError,
            "Network error: unable to reach the server".to_string(),
            true,
        ),
        TransportError::Timeout | TransportError::Cancelled => (
            ErrorKind::TimeoutError,
            "Request was aborted before a response arrived".to_string(),
            true,
        ),
        TransportError::Other(message) => (ErrorKind::Unknown, message.clone(), false),
    };

    ApiError::new(kind, message)
        .with_endpoint(endpoint)
        .with_retryable(retryable)
        .with_cause(err)
}

/// Normalize any pipeline error into one [`ApiError`]
///
/// Already-classified errors pass through unchanged.
pub fn from_error(err: HttpError, endpoint: &str) -> ApiError {
    match err {
        HttpError::Api(api) => api,
        other => ApiError::new(ErrorKind::Unknown, other.to_string())
            .with_endpoint(endpoint)
            .with_retryable(false)
            .with_cause(other),
    }
}

/// Parse a `Retry-After` value as whole seconds
///
/// Accepts delta-seconds and HTTP-dates; dates in the past yield 0.
pub fn parse_retry_after(value: &str) -> Option<u64> {
    let value = value.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(seconds);
    }

    let at = httpdate::parse_http_date(value).ok()?;
    let remaining = at
        .duration_since(SystemTime::now())
        .map(|d| d.as_secs() + u64::from(d.subsec_nanos() > 0))
        .unwrap_or(0);
    Some(remaining)
}

fn extract_message(response: &TransportResponse) -> String {
    let fallback = format!(
        "{} {}",
        response.status().as_u16(),
        response.status_text()
    )
    .trim_end()
    .to_string();

    let text = response.text();
    if text.trim().is_empty() {
        return fallback;
    }

    match serde_json::from_str::<Value>(&text) {
        Ok(Value::Object(body)) => MESSAGE_FIELDS
            .iter()
            .filter_map(|field| body.get(*field))
            .find_map(message_from_value)
            .unwrap_or(fallback),
        Ok(_) => fallback,
        Err(_) => text,
    }
}

fn message_from_value(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) if s.is_empty() => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

//! Error types for the publishing subsystem.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Errors raised by a [`TargetStore`](crate::store::TargetStore).
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing store could not be reached (network, API server down, RBAC).
    #[error("target store unavailable: {0}")]
    Unavailable(String),

    /// The referenced secret no longer exists.
    #[error("secret not found: {0}")]
    NotFound(String),

    #[error("invalid label selector: {0}")]
    InvalidSelector(String),
}

impl From<kube::Error> for StoreError {
    fn from(err: kube::Error) -> Self {
        match &err {
            kube::Error::Api(resp) if resp.code == 404 => Self::NotFound(resp.message.clone()),
            _ => Self::Unavailable(err.to_string()),
        }
    }
}

/// Errors raised while turning a secret into a [`Target`](crate::target::Target).
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TargetParseError {
    #[error("missing required key `{0}`")]
    MissingKey(&'static str),

    #[error("unknown provider `{0}`")]
    UnknownProvider(String),

    #[error("key `{key}` is not valid UTF-8")]
    InvalidUtf8 { key: String },

    #[error("invalid value for `{key}`: {reason}")]
    InvalidValue { key: &'static str, reason: String },
}

/// Errors raised by [`TargetDiscoveryManager::refresh`](crate::discovery::TargetDiscoveryManager::refresh).
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// The store could not be listed; the previous snapshot is still served.
    #[error("target store unreachable: {0}")]
    StoreUnreachable(#[from] StoreError),
}

/// Classification of a failed delivery or probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Connection refused, DNS, TLS, reset.
    Network,
    /// Credentials rejected (401/403, invalid routing key, SMTP auth).
    Auth,
    /// Provider asked us to slow down (429).
    RateLimited,
    /// Provider rejected the payload (400/422) or no payload was rendered.
    MalformedPayload,
    /// The attempt did not finish before its deadline.
    Timeout,
    /// The attempt was cancelled by the caller.
    Cancelled,
    /// Provider-side failure (5xx or unexpected status).
    Provider,
    /// No client is registered for the target's provider.
    Unsupported,
}

impl ErrorKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Auth => "auth",
            Self::RateLimited => "rate_limited",
            Self::MalformedPayload => "malformed_payload",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::Provider => "provider",
            Self::Unsupported => "unsupported",
        }
    }

    /// Classify an HTTP status code returned by a provider.
    #[must_use]
    pub const fn from_http_status(status: u16) -> Self {
        match status {
            401 | 403 | 404 | 410 => Self::Auth,
            429 => Self::RateLimited,
            400 | 413 | 422 => Self::MalformedPayload,
            _ => Self::Provider,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned by a [`PublisherClient`](crate::client::PublisherClient) for one target.
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct DeliveryError {
    pub kind: ErrorKind,
    pub http_status: Option<u16>,
    pub message: String,
}

impl DeliveryError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            http_status: None,
            message: message.into(),
        }
    }

    /// Build an error from a non-success HTTP response.
    pub fn from_status(status: u16, body: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::from_http_status(status),
            http_status: Some(status),
            message: body.into(),
        }
    }
}

/// Errors that make a publish attempt impossible.
///
/// Individual target failures are never reported through this type; they are
/// captured in the [`PublishOutcome`](crate::job::PublishOutcome).
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PublishError {
    #[error("malformed alert: {0}")]
    MalformedAlert(String),
}

/// Why an alert submission was refused.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmitError {
    /// The queue is at capacity (after the configured wait, if any).
    #[error("publishing queue is full")]
    Backpressure,

    /// The queue is shutting down.
    #[error("publishing queue is closed")]
    Closed,

    #[error("alert rejected as malformed")]
    Malformed,
}

impl SubmitError {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Backpressure => "backpressure",
            Self::Closed => "closed",
            Self::Malformed => "malformed",
        }
    }
}

/// Errors raised while reading [`PublishingConfig`](crate::config::PublishingConfig).
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {var}: {reason}")]
    Invalid { var: String, reason: String },
}

/// Evaluation problems observed by the mode manager.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ModeEvaluationError {
    #[error("target discovery failing: {0}")]
    DiscoveryUnavailable(String),

    #[error("evaluation panicked: {0}")]
    Panicked(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_status_classification() {
        assert_eq!(ErrorKind::from_http_status(401), ErrorKind::Auth);
        assert_eq!(ErrorKind::from_http_status(403), ErrorKind::Auth);
        assert_eq!(ErrorKind::from_http_status(429), ErrorKind::RateLimited);
        assert_eq!(ErrorKind::from_http_status(400), ErrorKind::MalformedPayload);
        assert_eq!(ErrorKind::from_http_status(503), ErrorKind::Provider);
    }

    #[test]
    fn test_delivery_error_display() {
        let err = DeliveryError::from_status(429, "slow down");
        assert_eq!(err.kind, ErrorKind::RateLimited);
        assert_eq!(err.http_status, Some(429));
        assert_eq!(err.to_string(), "rate_limited: slow down");
    }

    #[test]
    fn test_error_kind_serialization() {
        let json = serde_json::to_string(&ErrorKind::MalformedPayload).unwrap();
        assert_eq!(json, "\"malformed_payload\"");
    }
}

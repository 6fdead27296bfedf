//! Error types for provider clients.

use publishing::{DeliveryError, ErrorKind};
use thiserror::Error;

/// Longest response body kept in an error message.
const MAX_BODY_CHARS: usize = 512;

/// Errors that can occur while talking to a provider.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// HTTP request failed before a response arrived
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Provider answered with a non-success status
    #[error("provider returned {status}: {body}")]
    Status { status: u16, body: String },

    /// A credential the provider needs is missing from the target secret
    #[error("missing credential `{0}`")]
    MissingCredential(&'static str),

    /// Target endpoint does not fit this provider
    #[error("unsupported endpoint: {0}")]
    Endpoint(String),

    /// Rendered payload is not usable for this provider
    #[error("invalid payload: {0}")]
    Payload(String),

    /// SMTP transport error
    #[error("SMTP error: {0}")]
    Smtp(#[from] lettre::transport::smtp::Error),

    /// Email message could not be built
    #[error("invalid email message: {0}")]
    Message(#[from] lettre::error::Error),

    /// Email address could not be parsed
    #[error("invalid email address: {0}")]
    Address(#[from] lettre::address::AddressError),

    /// SMTP server did not answer the connection test
    #[error("SMTP server at {0} did not respond")]
    SmtpUnreachable(String),
}

impl ChannelError {
    /// Build a status error, truncating long bodies.
    pub fn status(status: u16, body: &str) -> Self {
        let body = if body.chars().count() > MAX_BODY_CHARS {
            let mut cut: String = body.chars().take(MAX_BODY_CHARS).collect();
            cut.push_str("...");
            cut
        } else {
            body.to_string()
        };
        Self::Status { status, body }
    }

    /// Delivery error kind this failure maps to.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Http(e) if e.is_timeout() => ErrorKind::Timeout,
            Self::Http(_) | Self::SmtpUnreachable(_) => ErrorKind::Network,
            Self::Status { status, .. } => ErrorKind::from_http_status(*status),
            Self::MissingCredential(_) => ErrorKind::Auth,
            Self::Endpoint(_) => ErrorKind::Unsupported,
            Self::Payload(_) | Self::Message(_) | Self::Address(_) => ErrorKind::MalformedPayload,
            Self::Smtp(e) => smtp_kind(e),
        }
    }
}

fn smtp_kind(err: &lettre::transport::smtp::Error) -> ErrorKind {
    if err.is_timeout() {
        return ErrorKind::Timeout;
    }
    if let Some(code) = err.status() {
        // 530/534/535: authentication required or rejected
        if code.to_string().starts_with("53") {
            return ErrorKind::Auth;
        }
        return ErrorKind::Provider;
    }
    if err.is_permanent() || err.is_transient() {
        ErrorKind::Provider
    } else {
        ErrorKind::Network
    }
}

impl From<ChannelError> for DeliveryError {
    fn from(err: ChannelError) -> Self {
        let kind = err.kind();
        match err {
            ChannelError::Status { status, body } => {
                let mut delivery = DeliveryError::from_status(status, body);
                delivery.kind = kind;
                delivery
            }
            other => DeliveryError::new(kind, other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_errors_classify_by_code() {
        assert_eq!(ChannelError::status(401, "").kind(), ErrorKind::Auth);
        assert_eq!(ChannelError::status(429, "").kind(), ErrorKind::RateLimited);
        assert_eq!(ChannelError::status(400, "").kind(), ErrorKind::MalformedPayload);
        assert_eq!(ChannelError::status(503, "").kind(), ErrorKind::Provider);
    }

    #[test]
    fn test_delivery_error_keeps_http_status() {
        let err: DeliveryError = ChannelError::status(403, "invalid_token").into();
        assert_eq!(err.kind, ErrorKind::Auth);
        assert_eq!(err.http_status, Some(403));
        assert_eq!(err.message, "invalid_token");
    }

    #[test]
    fn test_long_bodies_are_truncated() {
        let body = "x".repeat(2000);
        let ChannelError::Status { body, .. } = ChannelError::status(500, &body) else {
            panic!("expected status error");
        };
        assert_eq!(body.len(), MAX_BODY_CHARS + 3);
    }

    #[test]
    fn test_missing_credential_is_auth() {
        let err: DeliveryError = ChannelError::MissingCredential("routing_key").into();
        assert_eq!(err.kind, ErrorKind::Auth);
        assert!(err.message.contains("routing_key"));
    }
}

//! Publisher client implementations.

pub mod email;
pub mod pagerduty;
pub mod slack;
pub mod webhook;

use publishing::Target;
use reqwest::StatusCode;

use crate::error::ChannelError;

/// HTTP URL of a target, or an endpoint error naming the provider.
pub(crate) fn http_url<'a>(target: &'a Target, provider: &str) -> Result<&'a str, ChannelError> {
    target.endpoint.url().ok_or_else(|| {
        ChannelError::Endpoint(format!("{provider} target {} has no HTTP url", target.id))
    })
}

/// Turn a response into `Ok(status)` or a status error carrying the body.
pub(crate) async fn check_status(response: reqwest::Response) -> Result<StatusCode, ChannelError> {
    let status = response.status();
    if status.is_success() {
        return Ok(status);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ChannelError::status(status.as_u16(), &body))
}

/// Probe answers that still prove the endpoint is reachable and the
/// credential accepted: success, or a payload complaint.
pub(crate) fn probe_status_ok(status: StatusCode) -> bool {
    status.is_success() || matches!(status.as_u16(), 400 | 422)
}

//! Provider clients for the alertd publishing subsystem.
//!
//! Each client implements [`publishing::PublisherClient`] for one provider:
//!
//! - [`SlackClient`]: Slack incoming webhooks
//! - [`PagerDutyClient`]: PagerDuty Events API v2 (`routing_key` credential)
//! - [`WebhookClient`]: generic JSON webhooks (optional bearer or basic auth)
//! - [`EmailClient`]: SMTP relays via `lettre`
//!
//! [`BasicFormatter`] renders an alert into a payload for each of them.
//!
//! # Usage
//!
//! ```no_run
//! use std::time::Duration;
//!
//! let http = channels::http_client(Duration::from_secs(10)).unwrap();
//! let registry = channels::default_registry(http, Duration::from_secs(10));
//! assert_eq!(registry.providers().count(), 4);
//! ```

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod clients;
pub mod error;
pub mod formatter;

pub use clients::email::EmailClient;
pub use clients::pagerduty::PagerDutyClient;
pub use clients::slack::SlackClient;
pub use clients::webhook::WebhookClient;
pub use error::ChannelError;
pub use formatter::BasicFormatter;

use publishing::ClientRegistry;
use std::sync::Arc;
use std::time::Duration;

/// Shared HTTP client for all HTTP providers.
pub fn http_client(timeout: Duration) -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(concat!("alertd/", env!("CARGO_PKG_VERSION")))
        .build()
}

/// Registry with a client for every provider.
#[must_use]
pub fn default_registry(http: reqwest::Client, smtp_timeout: Duration) -> ClientRegistry {
    ClientRegistry::new()
        .with(Arc::new(SlackClient::new(http.clone())))
        .with(Arc::new(PagerDutyClient::new(http.clone())))
        .with(Arc::new(WebhookClient::new(http)))
        .with(Arc::new(EmailClient::new(smtp_timeout)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use publishing::Provider;

    #[test]
    fn test_default_registry_covers_every_provider() {
        let http = http_client(Duration::from_secs(1)).unwrap();
        let registry = default_registry(http, Duration::from_secs(1));
        for provider in Provider::ALL {
            let client = registry.get(provider).unwrap();
            assert_eq!(client.provider(), provider);
        }
    }
}

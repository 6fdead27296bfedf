//! Slack incoming-webhook client.

use async_trait::async_trait;
use publishing::{Delivery, DeliveryError, Provider, PublisherClient, Target};
use tracing::debug;

use super::{check_status, http_url, probe_status_ok};
use crate::error::ChannelError;

/// Posts rendered payloads to a Slack incoming webhook.
///
/// The webhook URL carries the credential, so targets need no extra keys.
pub struct SlackClient {
    http: reqwest::Client,
}

impl SlackClient {
    #[must_use]
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }

    async fn post(&self, target: &Target, payload: &serde_json::Value) -> Result<Delivery, ChannelError> {
        let url = http_url(target, "slack")?;
        let response = self.http.post(url).json(payload).send().await?;
        let status = check_status(response).await?;
        Ok(Delivery {
            http_status: Some(status.as_u16()),
        })
    }

    async fn check(&self, target: &Target) -> Result<(), ChannelError> {
        let url = http_url(target, "slack")?;

        // An empty object is refused with 400 `no_text` by a live hook and
        // never posts a message; dead or revoked hooks answer 403/404.
        let response = self
            .http
            .post(url)
            .json(&serde_json::json!({}))
            .send()
            .await?;
        if probe_status_ok(response.status()) {
            return Ok(());
        }
        check_status(response).await.map(|_| ())
    }
}

#[async_trait]
impl PublisherClient for SlackClient {
    fn provider(&self) -> Provider {
        Provider::Slack
    }

    async fn send(&self, target: &Target, payload: &serde_json::Value) -> Result<Delivery, DeliveryError> {
        debug!(target_id = %target.id, "Posting to Slack webhook");
        Ok(self.post(target, payload).await?)
    }

    async fn probe(&self, target: &Target) -> Result<(), DeliveryError> {
        Ok(self.check(target).await?)
    }
}

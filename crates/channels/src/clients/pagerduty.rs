//! PagerDuty Events API v2 client.

use async_trait::async_trait;
use publishing::{Delivery, DeliveryError, Provider, PublisherClient, Target};
use tracing::debug;

use super::{check_status, http_url, probe_status_ok};
use crate::error::ChannelError;

/// Credential key holding the integration routing key.
pub const ROUTING_KEY: &str = "routing_key";

/// Sends events to the PagerDuty Events API.
///
/// The rendered payload is an event without a routing key; the key is taken
/// from the target's credentials at send time.
pub struct PagerDutyClient {
    http: reqwest::Client,
}

impl PagerDutyClient {
    #[must_use]
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }

    fn routing_key(target: &Target) -> Result<&str, ChannelError> {
        target
            .credentials
            .get(ROUTING_KEY)
            .filter(|k| !k.is_empty())
            .ok_or(ChannelError::MissingCredential(ROUTING_KEY))
    }

    fn event(target: &Target, payload: &serde_json::Value) -> Result<serde_json::Value, ChannelError> {
        let mut event = payload.clone();
        let fields = event
            .as_object_mut()
            .ok_or_else(|| ChannelError::Payload("PagerDuty event must be a JSON object".to_string()))?;
        fields.insert(
            "routing_key".to_string(),
            serde_json::Value::String(Self::routing_key(target)?.to_string()),
        );
        Ok(event)
    }

    async fn enqueue(&self, target: &Target, payload: &serde_json::Value) -> Result<Delivery, ChannelError> {
        let url = http_url(target, "pagerduty")?;
        let event = Self::event(target, payload)?;
        let response = self.http.post(url).json(&event).send().await?;
        let status = check_status(response).await?;
        Ok(Delivery {
            http_status: Some(status.as_u16()),
        })
    }

    async fn check(&self, target: &Target) -> Result<(), ChannelError> {
        let url = http_url(target, "pagerduty")?;
        let routing_key = Self::routing_key(target)?;

        // An event without a payload is validated and refused with 400;
        // nothing is triggered.
        let response = self
            .http
            .post(url)
            .json(&serde_json::json!({
                "routing_key": routing_key,
                "event_action": "trigger",
            }))
            .send()
            .await?;
        if probe_status_ok(response.status()) {
            return Ok(());
        }
        check_status(response).await.map(|_| ())
    }
}

#[async_trait]
impl PublisherClient for PagerDutyClient {
    fn provider(&self) -> Provider {
        Provider::PagerDuty
    }

    async fn send(&self, target: &Target, payload: &serde_json::Value) -> Result<Delivery, DeliveryError> {
        debug!(target_id = %target.id, "Enqueueing PagerDuty event");
        Ok(self.enqueue(target, payload).await?)
    }

    async fn probe(&self, target: &Target) -> Result<(), DeliveryError> {
        Ok(self.check(target).await?)
    }
}

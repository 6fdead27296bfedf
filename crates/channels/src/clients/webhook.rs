//! Generic JSON webhook client.

use async_trait::async_trait;
use publishing::{Delivery, DeliveryError, Provider, PublisherClient, Target};
use reqwest::RequestBuilder;
use tracing::debug;

use super::{check_status, http_url};
use crate::error::ChannelError;

/// Posts the rendered payload as JSON.
///
/// Optional credentials: `token` (sent as a bearer token) or
/// `username`/`password` (basic auth).
pub struct WebhookClient {
    http: reqwest::Client,
}

impl WebhookClient {
    #[must_use]
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }

    fn authorize(target: &Target, request: RequestBuilder) -> RequestBuilder {
        let creds = &target.credentials;
        if let Some(token) = creds.get("token") {
            request.bearer_auth(token)
        } else if let Some(username) = creds.get("username") {
            request.basic_auth(username, creds.get("password"))
        } else {
            request
        }
    }

    async fn post(&self, target: &Target, payload: &serde_json::Value) -> Result<Delivery, ChannelError> {
        let url = http_url(target, "webhook")?;
        let request = Self::authorize(target, self.http.post(url).json(payload));
        let status = check_status(request.send().await?).await?;
        Ok(Delivery {
            http_status: Some(status.as_u16()),
        })
    }

    async fn check(&self, target: &Target) -> Result<(), ChannelError> {
        let url = http_url(target, "webhook")?;
        let response = Self::authorize(target, self.http.head(url)).send().await?;

        // Receivers often only accept POST, so a 405 still proves the path
        // exists. A missing path, auth refusal, throttling or server error
        // does not.
        match response.status().as_u16() {
            401 | 403 | 404 | 410 | 429 | 500.. => check_status(response).await.map(|_| ()),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl PublisherClient for WebhookClient {
    fn provider(&self) -> Provider {
        Provider::Webhook
    }

    async fn send(&self, target: &Target, payload: &serde_json::Value) -> Result<Delivery, DeliveryError> {
        debug!(target_id = %target.id, "Posting to webhook");
        Ok(self.post(target, payload).await?)
    }

    async fn probe(&self, target: &Target) -> Result<(), DeliveryError> {
        Ok(self.check(target).await?)
    }
}

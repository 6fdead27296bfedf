//! Provider client seam.
//!
//! Transport details (HTTP, SMTP, ...) live behind [`PublisherClient`]; the
//! coordinator and health monitor only see this trait.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::DeliveryError;
use crate::job::{Alert, RenderedPayloads};
use crate::target::{Provider, Target};

/// Successful provider response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Delivery {
    pub http_status: Option<u16>,
}

/// Client for one provider (Slack, PagerDuty, ...).
#[async_trait]
pub trait PublisherClient: Send + Sync {
    /// Provider this client handles.
    fn provider(&self) -> Provider;

    /// Deliver a rendered payload to one target.
    async fn send(&self, target: &Target, payload: &serde_json::Value) -> Result<Delivery, DeliveryError>;

    /// Cheap reachability/credential check, no user-visible side effects.
    async fn probe(&self, target: &Target) -> Result<(), DeliveryError>;
}

/// Renders the per-provider payloads for an alert.
pub trait PayloadFormatter: Send + Sync {
    fn render(&self, alert: &Alert) -> RenderedPayloads;
}

/// Provider → client lookup.
#[derive(Clone, Default)]
pub struct ClientRegistry {
    clients: HashMap<Provider, Arc<dyn PublisherClient>>,
}

impl ClientRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a client, replacing any existing client for its provider.
    #[must_use]
    pub fn with(mut self, client: Arc<dyn PublisherClient>) -> Self {
        self.register(client);
        self
    }

    pub fn register(&mut self, client: Arc<dyn PublisherClient>) {
        self.clients.insert(client.provider(), client);
    }

    #[must_use]
    pub fn get(&self, provider: Provider) -> Option<Arc<dyn PublisherClient>> {
        self.clients.get(&provider).cloned()
    }

    pub fn providers(&self) -> impl Iterator<Item = Provider> + '_ {
        self.clients.keys().copied()
    }
}

//! Shared fixtures for unit tests.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::client::{ClientRegistry, Delivery, PublisherClient};
use crate::config::{DiscoveryConfig, HealthConfig};
use crate::discovery::TargetDiscoveryManager;
use crate::error::{DeliveryError, ErrorKind};
use crate::health::HealthMonitor;
use crate::metrics::PublishingMetrics;
use crate::store::{MemoryTargetStore, TargetStore};
use crate::target::{Provider, Target, TargetId};

pub(crate) const NAMESPACE: &str = "ns";
pub(crate) const THRESHOLD: u32 = 3;

pub(crate) fn id(name: &str) -> TargetId {
    TargetId::new(NAMESPACE, name)
}

/// What a [`ScriptedClient`] does for one target.
#[derive(Clone)]
pub(crate) enum Script {
    Fail(DeliveryError),
    Delay(Duration),
}

/// Client whose behaviour is scripted per target name. Unscripted targets
/// succeed with HTTP 200.
pub(crate) struct ScriptedClient {
    provider: Provider,
    scripts: Mutex<HashMap<String, Script>>,
    pub sends: AtomicUsize,
}

impl ScriptedClient {
    pub(crate) fn new(provider: Provider) -> Arc<Self> {
        Arc::new(Self {
            provider,
            scripts: Mutex::new(HashMap::new()),
            sends: AtomicUsize::new(0),
        })
    }

    pub(crate) fn script(&self, name: &str, script: Script) {
        self.scripts
            .lock()
            .unwrap()
            .insert(id(name).as_str().to_string(), script);
    }

    fn script_for(&self, target: &Target) -> Option<Script> {
        self.scripts.lock().unwrap().get(target.id.as_str()).cloned()
    }
}

#[async_trait]
impl PublisherClient for ScriptedClient {
    fn provider(&self) -> Provider {
        self.provider
    }

    async fn send(&self, target: &Target, _: &serde_json::Value) -> Result<Delivery, DeliveryError> {
        self.sends.fetch_add(1, Ordering::SeqCst);
        match self.script_for(target) {
            Some(Script::Fail(e)) => Err(e),
            Some(Script::Delay(d)) => {
                tokio::time::sleep(d).await;
                Ok(Delivery { http_status: Some(200) })
            }
            None => Ok(Delivery { http_status: Some(200) }),
        }
    }

    async fn probe(&self, target: &Target) -> Result<(), DeliveryError> {
        match self.script_for(target) {
            Some(Script::Fail(e)) => Err(e),
            _ => Ok(()),
        }
    }
}

/// Discovery and health wired to an in-memory store. Health records are
/// driven by hand through [`Harness::probe`]; no probe tasks run.
pub(crate) struct Harness {
    pub store: Arc<MemoryTargetStore>,
    pub metrics: Arc<PublishingMetrics>,
    pub discovery: Arc<TargetDiscoveryManager>,
    pub health: Arc<HealthMonitor>,
    sequence: AtomicU64,
}

impl Harness {
    pub(crate) fn new(clients: ClientRegistry) -> Self {
        let metrics = Arc::new(PublishingMetrics::new().unwrap());
        let store = Arc::new(MemoryTargetStore::new(NAMESPACE));
        let discovery = Arc::new(TargetDiscoveryManager::new(
            Arc::clone(&store) as Arc<dyn TargetStore>,
            DiscoveryConfig {
                namespace: NAMESPACE.to_string(),
                label_selector: "publish=true".to_string(),
                refresh_interval: Duration::from_secs(3600),
            },
            Arc::clone(&metrics),
        ));
        let health = Arc::new(HealthMonitor::new(
            clients,
            HealthConfig {
                failure_threshold: THRESHOLD,
                ..HealthConfig::default()
            },
            Arc::clone(&metrics),
        ));
        Self {
            store,
            metrics,
            discovery,
            health,
            sequence: AtomicU64::new(0),
        }
    }

    /// Define (or redefine) a target and refresh discovery.
    pub(crate) async fn put(&self, name: &str, provider: Provider, enabled: bool) {
        let enabled = if enabled { "true" } else { "false" };
        let url = format!("https://{name}.example/hook");
        let data: Vec<(&str, &str)> = match provider {
            Provider::Email => vec![
                ("provider", "email"),
                ("smtp_host", "smtp.example"),
                ("from", "alerts@example.com"),
                ("to", "oncall@example.com"),
                ("enabled", enabled),
            ],
            other => vec![("provider", other.as_str()), ("url", url.as_str()), ("enabled", enabled)],
        };
        self.store.put(name, &[("publish", "true")], &data);
        self.discovery.refresh().await.unwrap();
        for target in self.discovery.list_targets() {
            self.health.track_without_probe(&target);
        }
    }

    pub(crate) fn probe(&self, name: &str, ok: bool) {
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let result = if ok {
            Ok(())
        } else {
            Err(DeliveryError::new(ErrorKind::Network, "refused"))
        };
        self.health.record_probe(&id(name), seq, result);
    }

    pub(crate) fn mark_unhealthy(&self, name: &str) {
        for _ in 0..THRESHOLD {
            self.probe(name, false);
        }
    }
}

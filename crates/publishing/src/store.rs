//! Read-only access to the secret objects that define delivery targets.
//!
//! The subsystem only ever needs `get`, `list` and `watch` on secrets in one
//! namespace. Nothing in this module writes to the store.

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, ListParams};
use kube::runtime::{watcher, WatchStreamExt};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::RwLock;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::error::StoreError;

/// Reference to one secret, as returned by a list call.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SecretRef {
    pub namespace: String,
    pub name: String,
    /// Opaque version; changes whenever the secret changes.
    pub resource_version: Option<String>,
}

/// Full contents of one secret.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretData {
    pub reference: SecretRef,
    pub labels: BTreeMap<String, String>,
    pub data: BTreeMap<String, Vec<u8>>,
}

/// Push notification from a watching store. Receivers only use it as a hint
/// to refresh; the authoritative state always comes from a fresh list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreChangeEvent {
    Applied { name: String },
    Deleted { name: String },
    /// The watch was (re)established and resynchronised.
    Resynced,
}

#[async_trait]
pub trait TargetStore: Send + Sync {
    /// List secrets matching the label selector.
    async fn list_secrets(&self, label_selector: &str) -> Result<Vec<SecretRef>, StoreError>;

    /// Fetch one secret.
    async fn get_secret(&self, reference: &SecretRef) -> Result<SecretData, StoreError>;

    /// Stream change notifications, or `None` if the store cannot watch.
    fn watch(&self, _label_selector: &str) -> Option<BoxStream<'static, StoreChangeEvent>> {
        None
    }
}

// =============================================================================
// Kubernetes secrets
// =============================================================================

/// [`TargetStore`] backed by Kubernetes `Secret` objects in one namespace.
#[derive(Clone)]
pub struct KubeSecretStore {
    api: Api<Secret>,
    namespace: String,
}

impl KubeSecretStore {
    pub fn new(client: kube::Client, namespace: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            namespace: namespace.to_string(),
        }
    }

    fn to_data(&self, secret: Secret) -> SecretData {
        let metadata = secret.metadata;
        let mut data: BTreeMap<String, Vec<u8>> = secret
            .data
            .unwrap_or_default()
            .into_iter()
            .map(|(k, v)| (k, v.0))
            .collect();

        // stringData is write-only on the API server, but fake clusters and
        // fixtures sometimes return it.
        for (k, v) in secret.string_data.unwrap_or_default() {
            data.entry(k).or_insert_with(|| v.into_bytes());
        }

        SecretData {
            reference: SecretRef {
                namespace: metadata.namespace.unwrap_or_else(|| self.namespace.clone()),
                name: metadata.name.unwrap_or_default(),
                resource_version: metadata.resource_version,
            },
            labels: metadata.labels.unwrap_or_default(),
            data,
        }
    }
}

#[async_trait]
impl TargetStore for KubeSecretStore {
    async fn list_secrets(&self, label_selector: &str) -> Result<Vec<SecretRef>, StoreError> {
        let params = ListParams::default().labels(label_selector);
        let list = self.api.list_metadata(&params).await?;

        let refs: Vec<SecretRef> = list
            .items
            .into_iter()
            .filter_map(|item| {
                let name = item.metadata.name?;
                Some(SecretRef {
                    namespace: item
                        .metadata
                        .namespace
                        .unwrap_or_else(|| self.namespace.clone()),
                    name,
                    resource_version: item.metadata.resource_version,
                })
            })
            .collect();

        debug!(
            namespace = %self.namespace,
            selector = %label_selector,
            count = refs.len(),
            "Listed target secrets"
        );
        Ok(refs)
    }

    async fn get_secret(&self, reference: &SecretRef) -> Result<SecretData, StoreError> {
        let secret = self.api.get(&reference.name).await?;
        Ok(self.to_data(secret))
    }

    fn watch(&self, label_selector: &str) -> Option<BoxStream<'static, StoreChangeEvent>> {
        let config = watcher::Config::default().labels(label_selector);
        let stream = watcher(self.api.clone(), config)
            .default_backoff()
            .filter_map(|event| async move {
                match event {
                    Ok(watcher::Event::Apply(s) | watcher::Event::InitApply(s)) => {
                        Some(StoreChangeEvent::Applied {
                            name: s.metadata.name.unwrap_or_default(),
                        })
                    }
                    Ok(watcher::Event::Delete(s)) => Some(StoreChangeEvent::Deleted {
                        name: s.metadata.name.unwrap_or_default(),
                    }),
                    Ok(watcher::Event::InitDone) => Some(StoreChangeEvent::Resynced),
                    Ok(watcher::Event::Init) => None,
                    Err(e) => {
                        warn!(error = %e, "Secret watch error");
                        None
                    }
                }
            });
        Some(stream.boxed())
    }
}

// =============================================================================
// Label selectors (equality-based subset)
// =============================================================================

/// Equality-based label selector: `key=value`, `key!=value`, `key`, `!key`,
/// comma-separated and ANDed.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LabelSelector {
    requirements: Vec<Requirement>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Requirement {
    Equals(String, String),
    NotEquals(String, String),
    Exists(String),
    NotExists(String),
}

impl LabelSelector {
    pub fn parse(selector: &str) -> Result<Self, StoreError> {
        let mut requirements = Vec::new();
        for term in selector.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            let requirement = if let Some((k, v)) = term.split_once("!=") {
                Requirement::NotEquals(k.trim().to_string(), v.trim().to_string())
            } else if let Some((k, v)) = term.split_once("==").or_else(|| term.split_once('=')) {
                Requirement::Equals(k.trim().to_string(), v.trim().to_string())
            } else if let Some(k) = term.strip_prefix('!') {
                Requirement::NotExists(k.trim().to_string())
            } else {
                Requirement::Exists(term.to_string())
            };

            let key = match &requirement {
                Requirement::Equals(k, _)
                | Requirement::NotEquals(k, _)
                | Requirement::Exists(k)
                | Requirement::NotExists(k) => k,
            };
            if key.is_empty() {
                return Err(StoreError::InvalidSelector(selector.to_string()));
            }
            requirements.push(requirement);
        }
        Ok(Self { requirements })
    }

    #[must_use]
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.requirements.iter().all(|r| match r {
            Requirement::Equals(k, v) => labels.get(k) == Some(v),
            Requirement::NotEquals(k, v) => labels.get(k) != Some(v),
            Requirement::Exists(k) => labels.contains_key(k),
            Requirement::NotExists(k) => !labels.contains_key(k),
        })
    }
}

// =============================================================================
// In-memory store
// =============================================================================

/// In-memory [`TargetStore`] used by tests and local runs without a cluster.
pub struct MemoryTargetStore {
    namespace: String,
    secrets: RwLock<BTreeMap<String, SecretData>>,
    version: AtomicU64,
    unreachable: AtomicBool,
    get_calls: AtomicUsize,
    changes: broadcast::Sender<StoreChangeEvent>,
    watchable: bool,
}

impl MemoryTargetStore {
    pub fn new(namespace: &str) -> Self {
        let (changes, _) = broadcast::channel(64);
        Self {
            namespace: namespace.to_string(),
            secrets: RwLock::new(BTreeMap::new()),
            version: AtomicU64::new(0),
            unreachable: AtomicBool::new(false),
            get_calls: AtomicUsize::new(0),
            changes,
            watchable: false,
        }
    }

    /// Same as [`new`](Self::new) but with watch support.
    pub fn watchable(namespace: &str) -> Self {
        Self {
            watchable: true,
            ..Self::new(namespace)
        }
    }

    /// Create or replace a secret. Bumps its resource version.
    pub fn put(&self, name: &str, labels: &[(&str, &str)], data: &[(&str, &str)]) {
        let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        let secret = SecretData {
            reference: SecretRef {
                namespace: self.namespace.clone(),
                name: name.to_string(),
                resource_version: Some(version.to_string()),
            },
            labels: labels
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect(),
            data: data
                .iter()
                .map(|(k, v)| ((*k).to_string(), v.as_bytes().to_vec()))
                .collect(),
        };

        if let Ok(mut secrets) = self.secrets.write() {
            secrets.insert(name.to_string(), secret);
        }
        let _ = self.changes.send(StoreChangeEvent::Applied {
            name: name.to_string(),
        });
    }

    pub fn remove(&self, name: &str) {
        if let Ok(mut secrets) = self.secrets.write() {
            secrets.remove(name);
        }
        let _ = self.changes.send(StoreChangeEvent::Deleted {
            name: name.to_string(),
        });
    }

    /// Simulate the store becoming unreachable (or reachable again).
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Number of `get_secret` calls served so far.
    pub fn get_calls(&self) -> usize {
        self.get_calls.load(Ordering::SeqCst)
    }

    fn check_reachable(&self) -> Result<(), StoreError> {
        if self.unreachable.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("memory store marked unreachable".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl TargetStore for MemoryTargetStore {
    async fn list_secrets(&self, label_selector: &str) -> Result<Vec<SecretRef>, StoreError> {
        self.check_reachable()?;
        let selector = LabelSelector::parse(label_selector)?;
        let secrets = self
            .secrets
            .read()
            .map_err(|_| StoreError::Unavailable("memory store poisoned".to_string()))?;

        Ok(secrets
            .values()
            .filter(|s| selector.matches(&s.labels))
            .map(|s| s.reference.clone())
            .collect())
    }

    async fn get_secret(&self, reference: &SecretRef) -> Result<SecretData, StoreError> {
        self.check_reachable()?;
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        let secrets = self
            .secrets
            .read()
            .map_err(|_| StoreError::Unavailable("memory store poisoned".to_string()))?;

        secrets
            .get(&reference.name)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(reference.name.clone()))
    }

    fn watch(&self, _label_selector: &str) -> Option<BoxStream<'static, StoreChangeEvent>> {
        if !self.watchable {
            return None;
        }
        let rx = self.changes.subscribe();
        let stream = futures::stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(event) => return Some((event, rx)),
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        return Some((StoreChangeEvent::Resynced, rx));
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Some(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn test_label_selector_matching() {
        let selector = LabelSelector::parse("app=alertd, tier!=test, publishing").unwrap();

        assert!(selector.matches(&labels(&[("app", "alertd"), ("publishing", "")])));
        assert!(!selector.matches(&labels(&[("app", "alertd"), ("tier", "test"), ("publishing", "")])));
        assert!(!selector.matches(&labels(&[("app", "alertd")])));
        assert!(!selector.matches(&labels(&[("app", "other"), ("publishing", "")])));

        let negated = LabelSelector::parse("!legacy").unwrap();
        assert!(negated.matches(&labels(&[])));
        assert!(!negated.matches(&labels(&[("legacy", "yes")])));

        assert!(LabelSelector::parse("").unwrap().matches(&labels(&[])));
        assert!(LabelSelector::parse("=x").is_err());
    }

    #[tokio::test]
    async fn test_memory_store_filters_and_versions() {
        let store = MemoryTargetStore::new("alerting");
        store.put("a", &[("publish", "true")], &[("provider", "slack")]);
        store.put("b", &[("publish", "false")], &[("provider", "slack")]);

        let refs = store.list_secrets("publish=true").await.unwrap();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].name, "a");
        let first_version = refs[0].resource_version.clone();

        store.put("a", &[("publish", "true")], &[("provider", "webhook")]);
        let refs = store.list_secrets("publish=true").await.unwrap();
        assert_ne!(refs[0].resource_version, first_version);

        let data = store.get_secret(&refs[0]).await.unwrap();
        assert_eq!(data.data.get("provider").unwrap(), b"webhook");
        assert_eq!(store.get_calls(), 1);
    }

    #[tokio::test]
    async fn test_memory_store_unreachable() {
        let store = MemoryTargetStore::new("alerting");
        store.set_unreachable(true);
        assert!(matches!(
            store.list_secrets("").await,
            Err(StoreError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_watch_only_when_supported() {
        assert!(MemoryTargetStore::new("ns").watch("").is_none());

        let store = MemoryTargetStore::watchable("ns");
        let mut changes = store.watch("").unwrap();
        store.put("a", &[], &[]);
        assert_eq!(
            changes.next().await,
            Some(StoreChangeEvent::Applied { name: "a".to_string() })
        );
    }
}

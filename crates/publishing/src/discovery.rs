//! Target discovery.
//!
//! Keeps a cached, atomically swapped snapshot of the targets defined in the
//! [`TargetStore`]. Readers never touch the store; they clone the current
//! `Arc<TargetSnapshot>`. A background loop refreshes on a fixed interval and
//! whenever the store's watch stream reports a change.

use chrono::{DateTime, Utc};
use futures::stream::{BoxStream, StreamExt};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::{broadcast, Mutex};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::DiscoveryConfig;
use crate::error::{DiscoveryError, StoreError};
use crate::metrics::PublishingMetrics;
use crate::store::{StoreChangeEvent, TargetStore};
use crate::target::{Target, TargetId};

/// Immutable view of the discovered targets.
#[derive(Debug, Clone, Default)]
pub struct TargetSnapshot {
    pub targets: BTreeMap<TargetId, Arc<Target>>,
    /// Incremented every time a new snapshot is installed.
    pub generation: u64,
    pub created_at: Option<DateTime<Utc>>,
}

impl TargetSnapshot {
    #[must_use]
    pub fn get(&self, id: &TargetId) -> Option<&Arc<Target>> {
        self.targets.get(id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Target>> {
        self.targets.values()
    }
}

/// Diff between two snapshots, broadcast after every refresh that changed
/// something.
#[derive(Debug, Clone, Default)]
pub struct TargetsChanged {
    pub added: Vec<Arc<Target>>,
    pub removed: Vec<Arc<Target>>,
    /// New values of targets whose definition changed.
    pub modified: Vec<Arc<Target>>,
    pub generation: u64,
}

impl TargetsChanged {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.modified.is_empty()
    }
}

/// Refresh bookkeeping, read by the mode manager and the status API.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct DiscoveryStatus {
    pub last_success: Option<DateTime<Utc>>,
    pub last_attempt: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
}

impl DiscoveryStatus {
    /// True while the most recent refresh attempt failed.
    #[must_use]
    pub fn is_failing(&self) -> bool {
        self.consecutive_failures > 0
    }
}

#[derive(Default)]
struct RefreshState {
    /// Secret versions that failed to parse, so they are not re-fetched (or
    /// re-logged) every cycle.
    invalid: HashMap<TargetId, Option<String>>,
}

pub struct TargetDiscoveryManager {
    store: Arc<dyn TargetStore>,
    config: DiscoveryConfig,
    snapshot: RwLock<Arc<TargetSnapshot>>,
    status: RwLock<DiscoveryStatus>,
    refresh_state: Mutex<RefreshState>,
    events: broadcast::Sender<TargetsChanged>,
    metrics: Arc<PublishingMetrics>,
}

impl TargetDiscoveryManager {
    pub fn new(store: Arc<dyn TargetStore>, config: DiscoveryConfig, metrics: Arc<PublishingMetrics>) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            store,
            config,
            snapshot: RwLock::new(Arc::new(TargetSnapshot::default())),
            status: RwLock::new(DiscoveryStatus::default()),
            refresh_state: Mutex::new(RefreshState::default()),
            events,
            metrics,
        }
    }

    /// Current snapshot. Never blocks on I/O.
    pub fn snapshot(&self) -> Arc<TargetSnapshot> {
        Arc::clone(&self.snapshot.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Targets in the current snapshot.
    pub fn list_targets(&self) -> Vec<Arc<Target>> {
        self.snapshot().iter().cloned().collect()
    }

    pub fn status(&self) -> DiscoveryStatus {
        self.status
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Subscribe to [`TargetsChanged`] events.
    pub fn subscribe(&self) -> broadcast::Receiver<TargetsChanged> {
        self.events.subscribe()
    }

    /// Re-scan the store now.
    ///
    /// On success the snapshot is replaced (only if something changed) and a
    /// [`TargetsChanged`] event is emitted (only if a definition changed). On
    /// failure the previous snapshot keeps being served.
    pub async fn refresh(&self) -> Result<Option<TargetsChanged>, DiscoveryError> {
        let mut state = self.refresh_state.lock().await;
        let now = Utc::now();

        let result = self.scan(&mut state, now).await;

        let mut status = self.status.write().unwrap_or_else(PoisonError::into_inner);
        status.last_attempt = Some(now);

        match result {
            Ok(targets) => {
                status.last_success = Some(now);
                status.consecutive_failures = 0;
                status.last_error = None;
                drop(status);
                self.metrics.discovery_refreshes_total.inc();
                Ok(self.install(targets, now))
            }
            Err(e) => {
                status.consecutive_failures += 1;
                status.last_error = Some(e.to_string());
                let failures = status.consecutive_failures;
                drop(status);
                self.metrics.discovery_errors_total.inc();
                warn!(
                    error = %e,
                    consecutive_failures = failures,
                    "Target discovery failed, serving cached snapshot"
                );
                Err(DiscoveryError::StoreUnreachable(e))
            }
        }
    }

    async fn scan(
        &self,
        state: &mut RefreshState,
        now: DateTime<Utc>,
    ) -> Result<BTreeMap<TargetId, Arc<Target>>, StoreError> {
        let refs = self.store.list_secrets(&self.config.label_selector).await?;
        let current = self.snapshot();
        let mut targets = BTreeMap::new();
        let mut seen_invalid = HashMap::new();

        for reference in refs {
            let id = TargetId::new(&reference.namespace, &reference.name);

            // Unchanged secret version: reuse the already parsed value.
            if let Some(existing) = current.get(&id) {
                if reference.resource_version.is_some()
                    && existing.source_version == reference.resource_version
                {
                    targets.insert(id, Arc::clone(existing));
                    continue;
                }
            }
            if reference.resource_version.is_some()
                && state.invalid.get(&id) == Some(&reference.resource_version)
            {
                seen_invalid.insert(id, reference.resource_version.clone());
                continue;
            }

            let secret = match self.store.get_secret(&reference).await {
                Ok(secret) => secret,
                Err(StoreError::NotFound(_)) => {
                    debug!(target_id = %id, "Secret disappeared between list and get");
                    continue;
                }
                Err(e) => return Err(e),
            };

            match Target::from_secret(&secret, now) {
                Ok(target) => {
                    targets.insert(id, Arc::new(target));
                }
                Err(e) => {
                    self.metrics.discovery_invalid_secrets_total.inc();
                    warn!(target_id = %id, error = %e, "Ignoring invalid target secret");
                    seen_invalid.insert(id, reference.resource_version.clone());
                }
            }
        }

        state.invalid = seen_invalid;
        Ok(targets)
    }

    fn install(&self, targets: BTreeMap<TargetId, Arc<Target>>, now: DateTime<Utc>) -> Option<TargetsChanged> {
        let mut slot = self.snapshot.write().unwrap_or_else(PoisonError::into_inner);
        let old = Arc::clone(&slot);

        let unchanged = old.targets.len() == targets.len()
            && old
                .targets
                .iter()
                .zip(targets.iter())
                .all(|((ka, va), (kb, vb))| ka == kb && Arc::ptr_eq(va, vb));
        if unchanged {
            return None;
        }

        let mut changes = TargetsChanged::default();
        for (id, target) in &targets {
            match old.get(id) {
                None => changes.added.push(Arc::clone(target)),
                Some(previous) if !previous.same_definition(target) => {
                    changes.modified.push(Arc::clone(target));
                }
                Some(_) => {}
            }
        }
        for (id, target) in &old.targets {
            if !targets.contains_key(id) {
                changes.removed.push(Arc::clone(target));
            }
        }

        let generation = old.generation + 1;
        let count = targets.len();
        *slot = Arc::new(TargetSnapshot {
            targets,
            generation,
            created_at: Some(now),
        });
        drop(slot);

        self.metrics.discovered_targets.set(count as i64);

        if changes.is_empty() {
            debug!(generation, "Target versions changed without definition changes");
            return None;
        }

        changes.generation = generation;
        info!(
            generation,
            total = count,
            added = changes.added.len(),
            removed = changes.removed.len(),
            modified = changes.modified.len(),
            "Target set changed"
        );
        // No receivers is fine (e.g. during startup).
        let _ = self.events.send(changes.clone());
        Some(changes)
    }

    /// Background refresh loop. Returns when `cancel` fires.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.refresh_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut watch = self.store.watch(&self.config.label_selector);
        let watch_supported = watch.is_some();
        if watch_supported {
            info!(selector = %self.config.label_selector, "Watching target secrets");
        } else {
            info!(
                interval_ms = self.config.refresh_interval.as_millis() as u64,
                "Target store has no watch support, polling only"
            );
        }

        loop {
            let wake = tokio::select! {
                () = cancel.cancelled() => Wake::Cancelled,
                _ = ticker.tick() => Wake::Tick,
                event = next_change(&mut watch) => Wake::Changed(event),
            };

            match wake {
                Wake::Cancelled => break,
                Wake::Tick => {
                    if watch_supported && watch.is_none() {
                        watch = self.store.watch(&self.config.label_selector);
                        if watch.is_some() {
                            info!("Target secret watch re-established");
                        }
                    }
                }
                Wake::Changed(Some(event)) => debug!(?event, "Target store change notification"),
                Wake::Changed(None) => {
                    warn!("Target secret watch ended, falling back to polling until next tick");
                    watch = None;
                    continue;
                }
            }

            if let Err(e) = self.refresh().await {
                error!(error = %e, "Target refresh failed");
            }
        }

        info!("Target discovery stopped");
    }
}

enum Wake {
    Cancelled,
    Tick,
    Changed(Option<StoreChangeEvent>),
}

async fn next_change(watch: &mut Option<BoxStream<'static, StoreChangeEvent>>) -> Option<StoreChangeEvent> {
    match watch {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

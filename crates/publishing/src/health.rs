//! # Target Health Monitor
//!
//! Runs one probe task per discovered target and keeps a [`HealthRecord`] for
//! each. Probing is independent of the discovery cadence; discovery only tells
//! the monitor which targets exist.
//!
//! Status policy is slow to fail, fast to recover:
//!
//! - `failure_threshold` consecutive probe failures mark a target `Unhealthy`
//! - one successful probe marks it `Healthy` and resets the failure counter
//! - new targets start `Unknown`, which counts as not healthy
//!
//! Every probe takes a sequence number before it starts. A result is applied
//! only if its sequence is newer than the one that produced the current record.

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::ClientRegistry;
use crate::config::HealthConfig;
use crate::discovery::{TargetDiscoveryManager, TargetSnapshot, TargetsChanged};
use crate::error::{DeliveryError, ErrorKind};
use crate::metrics::PublishingMetrics;
use crate::target::{Provider, Target, TargetId};

/// Health of one target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    /// Not probed successfully yet, and not failed often enough to be unhealthy.
    Unknown,
}

/// Latest health information for one target.
#[derive(Debug, Clone, Serialize)]
pub struct HealthRecord {
    pub target_id: TargetId,
    pub provider: Provider,
    pub status: HealthStatus,
    pub last_check: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_error_kind: Option<ErrorKind>,
    pub consecutive_failures: u32,
    /// Sequence number of the probe that produced this record.
    pub last_sequence: u64,
}

impl HealthRecord {
    fn unknown(target: &Target) -> Self {
        Self {
            target_id: target.id.clone(),
            provider: target.provider,
            status: HealthStatus::Unknown,
            last_check: None,
            last_error: None,
            last_error_kind: None,
            consecutive_failures: 0,
            last_sequence: 0,
        }
    }
}

/// Broadcast when a target's status flips.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthChanged {
    pub target_id: TargetId,
    pub from: HealthStatus,
    pub to: HealthStatus,
}

struct ProbeHandle {
    target: Arc<Target>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

pub struct HealthMonitor {
    clients: ClientRegistry,
    config: HealthConfig,
    records: RwLock<HashMap<TargetId, HealthRecord>>,
    probes: Mutex<HashMap<TargetId, ProbeHandle>>,
    sequence: AtomicU64,
    events: broadcast::Sender<HealthChanged>,
    shutdown: CancellationToken,
    metrics: Arc<PublishingMetrics>,
}

impl HealthMonitor {
    pub fn new(clients: ClientRegistry, config: HealthConfig, metrics: Arc<PublishingMetrics>) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            clients,
            config,
            records: RwLock::new(HashMap::new()),
            probes: Mutex::new(HashMap::new()),
            sequence: AtomicU64::new(0),
            events,
            shutdown: CancellationToken::new(),
            metrics,
        }
    }

    /// Health record for a target, if the target is known.
    pub fn get_health(&self, id: &TargetId) -> Option<HealthRecord> {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    /// Fast path used on every dispatch.
    pub fn is_healthy(&self, id: &TargetId) -> bool {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .is_some_and(|r| r.status == HealthStatus::Healthy)
    }

    /// All records, sorted by target id.
    pub fn records(&self) -> Vec<HealthRecord> {
        let mut records: Vec<HealthRecord> = self
            .records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        records.sort_by(|a, b| a.target_id.cmp(&b.target_id));
        records
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HealthChanged> {
        self.events.subscribe()
    }

    /// Ids of targets with a running probe task.
    pub fn probed_targets(&self) -> Vec<TargetId> {
        let mut ids: Vec<TargetId> = self
            .probes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    /// Follow discovery until `cancel` fires, then stop every probe.
    pub async fn run(self: Arc<Self>, discovery: Arc<TargetDiscoveryManager>, cancel: CancellationToken) {
        let mut changes = discovery.subscribe();
        self.sync_with(&discovery.snapshot());

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                event = changes.recv() => match event {
                    Ok(change) => self.apply_changes(&change),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "Health monitor lagged behind discovery, resyncing");
                        self.sync_with(&discovery.snapshot());
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }

        self.stop_all().await;
        info!("Health monitor stopped");
    }

    /// Start, restart or stop probes according to a discovery diff.
    pub fn apply_changes(self: &Arc<Self>, change: &TargetsChanged) {
        for target in &change.removed {
            self.remove_target(&target.id);
        }
        for target in &change.added {
            self.add_target(Arc::clone(target));
        }
        for target in &change.modified {
            debug!(target_id = %target.id, "Target definition changed, restarting probe");
            self.add_target(Arc::clone(target));
        }
    }

    /// Reconcile probes against a full snapshot.
    pub fn sync_with(self: &Arc<Self>, snapshot: &TargetSnapshot) {
        let probed: Vec<(TargetId, Arc<Target>)> = self
            .probes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, h)| (id.clone(), Arc::clone(&h.target)))
            .collect();

        for (id, _) in &probed {
            if snapshot.get(id).is_none() {
                self.remove_target(id);
            }
        }
        for target in snapshot.iter() {
            let tracked = probed
                .iter()
                .any(|(id, t)| id == &target.id && Arc::ptr_eq(t, target));
            if !tracked {
                self.add_target(Arc::clone(target));
            }
        }
    }

    fn add_target(self: &Arc<Self>, target: Arc<Target>) {
        {
            let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
            records.entry(target.id.clone()).or_insert_with(|| {
                self.metrics
                    .set_target_health(&target.id, target.provider, HealthStatus::Unknown);
                HealthRecord::unknown(&target)
            });
        }

        let cancel = self.shutdown.child_token();
        let task = tokio::spawn(Arc::clone(self).probe_loop(Arc::clone(&target), cancel.clone()));

        let previous = self
            .probes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                target.id.clone(),
                ProbeHandle {
                    target: Arc::clone(&target),
                    cancel,
                    task,
                },
            );
        if let Some(previous) = previous {
            previous.cancel.cancel();
        } else {
            debug!(target_id = %target.id, provider = %target.provider, "Started health probe");
        }
    }

    /// Track a target without starting its probe task.
    #[cfg(test)]
    pub(crate) fn track_without_probe(&self, target: &Target) {
        self.records
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(target.id.clone())
            .or_insert_with(|| HealthRecord::unknown(target));
    }

    fn remove_target(&self, id: &TargetId) {
        if let Some(handle) = self
            .probes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
        {
            handle.cancel.cancel();
        }
        let removed = self
            .records
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
        if let Some(record) = removed {
            self.metrics.remove_target_health(id, record.provider);
            debug!(target_id = %id, "Stopped health probe and evicted record");
        }
    }

    async fn stop_all(&self) {
        self.shutdown.cancel();
        let handles: Vec<ProbeHandle> = self
            .probes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, h)| h)
            .collect();
        for handle in handles {
            let _ = handle.task.await;
        }
    }

    async fn probe_loop(self: Arc<Self>, target: Arc<Target>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = self.probe_target(&target) => {}
            }

            let delay = jittered(self.config.probe_interval, self.config.jitter);
            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Probe one tracked target right away, outside its schedule.
    ///
    /// Returns the resulting record, or `None` if the target is not tracked.
    pub async fn probe_now(&self, id: &TargetId) -> Option<HealthRecord> {
        let target = self
            .probes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .map(|h| Arc::clone(&h.target))?;
        self.probe_target(&target).await;
        self.get_health(id)
    }

    async fn probe_target(&self, target: &Target) -> Option<HealthChanged> {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;

        let result = match self.clients.get(target.provider) {
            None => Err(DeliveryError::new(
                ErrorKind::Unsupported,
                format!("no client registered for {}", target.provider),
            )),
            Some(client) => {
                match tokio::time::timeout(self.config.probe_timeout, client.probe(target)).await {
                    Ok(result) => result,
                    Err(_) => Err(DeliveryError::new(ErrorKind::Timeout, "probe timed out")),
                }
            }
        };

        self.record_probe(&target.id, sequence, result)
    }

    /// Apply a probe result. Results older than the current record, or for
    /// targets no longer tracked, are discarded.
    pub(crate) fn record_probe(
        &self,
        id: &TargetId,
        sequence: u64,
        result: Result<(), DeliveryError>,
    ) -> Option<HealthChanged> {
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        let record = records.get_mut(id)?;

        if sequence <= record.last_sequence {
            debug!(
                target_id = %id,
                sequence,
                current = record.last_sequence,
                "Discarding stale probe result"
            );
            return None;
        }

        let from = record.status;
        record.last_sequence = sequence;
        record.last_check = Some(Utc::now());

        let outcome = match result {
            Ok(()) => {
                record.consecutive_failures = 0;
                record.last_error = None;
                record.last_error_kind = None;
                record.status = HealthStatus::Healthy;
                "success"
            }
            Err(e) => {
                record.consecutive_failures += 1;
                record.last_error_kind = Some(e.kind);
                record.last_error = Some(e.to_string());
                if record.consecutive_failures >= self.config.failure_threshold {
                    record.status = HealthStatus::Unhealthy;
                }
                debug!(
                    target_id = %id,
                    error = %e,
                    consecutive_failures = record.consecutive_failures,
                    "Health probe failed"
                );
                "failure"
            }
        };

        let to = record.status;
        let provider = record.provider;
        let failures = record.consecutive_failures;
        drop(records);

        self.metrics
            .probes_total
            .with_label_values(&[provider.as_str(), outcome])
            .inc();

        if from == to {
            return None;
        }

        self.metrics.set_target_health(id, provider, to);
        if to == HealthStatus::Healthy {
            info!(target_id = %id, from = ?from, "Target healthy");
        } else {
            warn!(target_id = %id, from = ?from, to = ?to, consecutive_failures = failures, "Target unhealthy");
        }

        let change = HealthChanged {
            target_id: id.clone(),
            from,
            to,
        };
        let _ = self.events.send(change.clone());
        Some(change)
    }
}

/// `base` scaled by a random factor in `[1 - jitter, 1 + jitter]`.
fn jittered(base: Duration, jitter: f64) -> Duration {
    if jitter <= 0.0 {
        return base;
    }
    let factor = rand::thread_rng().gen_range((1.0 - jitter)..=(1.0 + jitter));
    base.mul_f64(factor)
}

//! Publishing subsystem for Alertmanager++.
//!
//! Delivers alerts to a changing set of notification targets (Slack,
//! PagerDuty, webhooks, email) defined as Kubernetes secrets, and degrades to
//! metrics-only operation when no target is usable.
//!
//! # Architecture
//!
//! - [`TargetStore`] reads target secrets ([`KubeSecretStore`] in a cluster,
//!   [`MemoryTargetStore`] in tests)
//! - [`TargetDiscoveryManager`] caches the target set and emits [`TargetsChanged`]
//! - [`HealthMonitor`] probes each target on its own schedule
//! - [`ModeManager`] derives `Normal` / `MetricsOnly` from enabled and healthy targets
//! - [`PublishingQueue`] accepts alerts and feeds a worker pool
//! - [`PublishCoordinator`] fans one alert out to every usable target
//!
//! [`PublishingSystem`] wires these together and owns their background tasks.
//!
//! # Configuration
//!
//! See [`PublishingConfig::from_env`] for the `ALERTD_*` environment variables.

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod client;
pub mod config;
pub mod coordinator;
pub mod discovery;
pub mod error;
pub mod health;
pub mod job;
pub mod metrics;
pub mod mode;
pub mod outcome;
pub mod queue;
pub mod store;
pub mod target;

#[cfg(test)]
pub(crate) mod testing;

pub use client::{ClientRegistry, Delivery, PayloadFormatter, PublisherClient};
pub use config::{
    CoordinatorConfig, DiscoveryConfig, FullQueuePolicy, HealthConfig, MetricsOnlyPolicy,
    ModeConfig, PublishingConfig, QueueConfig, SkippedJobPolicy,
};
pub use coordinator::PublishCoordinator;
pub use discovery::{DiscoveryStatus, TargetDiscoveryManager, TargetSnapshot, TargetsChanged};
pub use error::{
    ConfigError, DeliveryError, DiscoveryError, ErrorKind, PublishError, StoreError, SubmitError,
    TargetParseError,
};
pub use health::{HealthChanged, HealthMonitor, HealthRecord, HealthStatus};
pub use job::{
    Alert, AlertStatus, Disposition, JobReport, PublishJob, PublishOutcome, PublishResult,
    RenderedPayloads,
};
pub use metrics::PublishingMetrics;
pub use mode::{Mode, ModeManager, ModeMetrics, ModeTransitionEvent, Subscription};
pub use outcome::{InMemoryOutcomeLog, OutcomeSink};
pub use queue::{PublishingQueue, SubmitResponse};
pub use store::{KubeSecretStore, MemoryTargetStore, SecretData, SecretRef, StoreChangeEvent, TargetStore};
pub use target::{Credentials, Provider, Target, TargetEndpoint, TargetId};

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Reports kept by the built-in outcome log.
pub const DEFAULT_OUTCOME_LOG_CAPACITY: usize = 1024;

/// All publishing components, wired together.
pub struct PublishingSystem {
    metrics: Arc<PublishingMetrics>,
    discovery: Arc<TargetDiscoveryManager>,
    health: Arc<HealthMonitor>,
    mode: Arc<ModeManager>,
    coordinator: Arc<PublishCoordinator>,
    queue: Arc<PublishingQueue>,
    outcomes: Arc<InMemoryOutcomeLog>,
    formatter: Arc<dyn PayloadFormatter>,
    background: CancellationToken,
    tasks: Mutex<JoinSet<()>>,
}

impl PublishingSystem {
    pub fn new(
        store: Arc<dyn TargetStore>,
        clients: ClientRegistry,
        formatter: Arc<dyn PayloadFormatter>,
        config: PublishingConfig,
        metrics: Arc<PublishingMetrics>,
    ) -> Self {
        let discovery = Arc::new(TargetDiscoveryManager::new(
            store,
            config.discovery,
            Arc::clone(&metrics),
        ));
        let health = Arc::new(HealthMonitor::new(
            clients.clone(),
            config.health,
            Arc::clone(&metrics),
        ));
        let mode = Arc::new(ModeManager::new(
            Arc::clone(&discovery),
            Arc::clone(&health),
            config.mode,
            Arc::clone(&metrics),
        ));
        let coordinator = Arc::new(PublishCoordinator::new(
            Arc::clone(&discovery),
            Arc::clone(&health),
            clients,
            config.coordinator,
            Arc::clone(&metrics),
        ));
        let outcomes = Arc::new(InMemoryOutcomeLog::new(DEFAULT_OUTCOME_LOG_CAPACITY));
        let queue = Arc::new(PublishingQueue::new(
            config.queue,
            Arc::clone(&mode),
            Arc::clone(&coordinator),
            Arc::clone(&outcomes) as Arc<dyn OutcomeSink>,
            Arc::clone(&metrics),
        ));

        Self {
            metrics,
            discovery,
            health,
            mode,
            coordinator,
            queue,
            outcomes,
            formatter,
            background: CancellationToken::new(),
            tasks: Mutex::new(JoinSet::new()),
        }
    }

    /// Run the first discovery refresh, then start every background loop and
    /// the queue workers.
    ///
    /// A failing first refresh is logged, not returned; the discovery loop
    /// keeps retrying and the mode stays `MetricsOnly` meanwhile.
    pub async fn start(&self) {
        if let Err(e) = self.discovery.refresh().await {
            warn!(error = %e, "Initial target discovery failed, will retry");
        }

        {
            let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
            tasks.spawn(Arc::clone(&self.discovery).run(self.background.child_token()));
            tasks.spawn(
                Arc::clone(&self.health).run(Arc::clone(&self.discovery), self.background.child_token()),
            );
            tasks.spawn(Arc::clone(&self.mode).run(self.background.child_token()));
        }
        self.queue.start();
        self.mode.check_mode_transition();

        info!(
            targets = self.discovery.snapshot().len(),
            mode = %self.mode.current_mode(),
            "Publishing subsystem started"
        );
    }

    /// Render and submit an alert.
    pub async fn submit_alert(&self, alert: Alert) -> SubmitResponse {
        let payloads = self.formatter.render(&alert);
        self.queue.submit_alert(alert, payloads).await
    }

    /// Ready once a discovery refresh has succeeded.
    pub fn is_ready(&self) -> bool {
        self.discovery.status().last_success.is_some()
    }

    /// Drain the queue (up to `drain_timeout`), then stop background loops.
    ///
    /// Returns the number of jobs abandoned.
    pub async fn shutdown(&self, drain_timeout: Duration) -> usize {
        let abandoned = self.queue.shutdown(drain_timeout).await;

        self.background.cancel();
        let mut tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                warn!(error = %e, "Background task failed");
            }
        }

        info!(abandoned, "Publishing subsystem stopped");
        abandoned
    }

    pub fn metrics(&self) -> &Arc<PublishingMetrics> {
        &self.metrics
    }

    pub fn discovery(&self) -> &Arc<TargetDiscoveryManager> {
        &self.discovery
    }

    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    pub fn mode(&self) -> &Arc<ModeManager> {
        &self.mode
    }

    pub fn coordinator(&self) -> &Arc<PublishCoordinator> {
        &self.coordinator
    }

    pub fn queue(&self) -> &Arc<PublishingQueue> {
        &self.queue
    }

    pub fn outcomes(&self) -> &Arc<InMemoryOutcomeLog> {
        &self.outcomes
    }
}

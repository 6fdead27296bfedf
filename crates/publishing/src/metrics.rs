//! Prometheus metrics for the publishing subsystem.
//!
//! One [`PublishingMetrics`] instance owns its own registry and is shared by
//! every component through an `Arc`.

use prometheus::{
    Encoder, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge,
    IntGaugeVec, Opts, Registry, TextEncoder,
};

use crate::health::HealthStatus;
use crate::mode::Mode;
use crate::target::{Provider, TargetId};

const LATENCY_BUCKETS: &[f64] = &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0];
const MODE_CHECK_BUCKETS: &[f64] = &[0.000_001, 0.000_005, 0.000_01, 0.000_05, 0.000_1, 0.000_5, 0.001, 0.01];
const TIME_IN_MODE_BUCKETS: &[f64] = &[1.0, 10.0, 60.0, 300.0, 900.0, 3600.0, 21_600.0, 86_400.0];

#[derive(Clone)]
pub struct PublishingMetrics {
    registry: Registry,

    pub mode_metrics_only: IntGauge,
    pub mode_transitions_total: IntCounter,
    pub time_in_mode_seconds: HistogramVec,
    pub mode_check_duration_seconds: Histogram,
    pub mode_evaluation_errors_total: IntCounter,

    pub submissions_total: IntCounter,
    pub submissions_rejected_total: IntCounterVec,
    pub submissions_during_metrics_only_total: IntCounter,
    pub jobs_skipped_total: IntCounter,
    pub jobs_requeued_total: IntCounter,
    pub queue_depth: IntGauge,

    pub target_health: IntGaugeVec,
    pub probes_total: IntCounterVec,

    pub deliveries_total: IntCounterVec,
    pub delivery_duration_seconds: HistogramVec,

    pub discovered_targets: IntGauge,
    pub discovery_refreshes_total: IntCounter,
    pub discovery_errors_total: IntCounter,
    pub discovery_invalid_secrets_total: IntCounter,
}

impl PublishingMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("alertd".to_string()), None)?;

        let mode_metrics_only = IntGauge::new(
            "publishing_mode_metrics_only",
            "1 while the publishing subsystem is in MetricsOnly mode",
        )?;
        let mode_transitions_total =
            IntCounter::new("publishing_mode_transitions_total", "Mode transitions")?;
        let time_in_mode_seconds = HistogramVec::new(
            HistogramOpts::new(
                "publishing_time_in_mode_seconds",
                "Time spent in a mode, observed when leaving it",
            )
            .buckets(TIME_IN_MODE_BUCKETS.to_vec()),
            &["mode"],
        )?;
        let mode_check_duration_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "publishing_mode_check_duration_seconds",
                "Latency of one mode evaluation",
            )
            .buckets(MODE_CHECK_BUCKETS.to_vec()),
        )?;
        let mode_evaluation_errors_total = IntCounter::new(
            "publishing_mode_evaluation_errors_total",
            "Mode evaluations that could not read their inputs",
        )?;

        let submissions_total = IntCounter::new("publishing_submissions_total", "Alerts submitted")?;
        let submissions_rejected_total = IntCounterVec::new(
            Opts::new("publishing_submissions_rejected_total", "Rejected alert submissions"),
            &["reason"],
        )?;
        let submissions_during_metrics_only_total = IntCounter::new(
            "publishing_submissions_during_metrics_only_total",
            "Alerts accepted while in MetricsOnly mode",
        )?;
        let jobs_skipped_total = IntCounter::new(
            "publishing_jobs_skipped_total",
            "Jobs skipped because of MetricsOnly mode",
        )?;
        let jobs_requeued_total = IntCounter::new(
            "publishing_jobs_requeued_total",
            "Skipped jobs re-enqueued after recovery",
        )?;
        let queue_depth = IntGauge::new("publishing_queue_depth", "Jobs waiting in the queue")?;

        let target_health = IntGaugeVec::new(
            Opts::new(
                "publishing_target_health",
                "Target health: 1 healthy, 0 unhealthy, -1 unknown",
            ),
            &["target", "provider"],
        )?;
        let probes_total = IntCounterVec::new(
            Opts::new("publishing_probes_total", "Health probes by result"),
            &["provider", "result"],
        )?;

        let deliveries_total = IntCounterVec::new(
            Opts::new("publishing_deliveries_total", "Per-target deliveries by result"),
            &["provider", "result"],
        )?;
        let delivery_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "publishing_delivery_duration_seconds",
                "Per-target delivery latency",
            )
            .buckets(LATENCY_BUCKETS.to_vec()),
            &["provider"],
        )?;

        let discovered_targets =
            IntGauge::new("publishing_discovered_targets", "Targets in the current snapshot")?;
        let discovery_refreshes_total =
            IntCounter::new("publishing_discovery_refreshes_total", "Successful refreshes")?;
        let discovery_errors_total =
            IntCounter::new("publishing_discovery_errors_total", "Failed refreshes")?;
        let discovery_invalid_secrets_total = IntCounter::new(
            "publishing_discovery_invalid_secrets_total",
            "Secrets skipped because they did not parse",
        )?;

        registry.register(Box::new(mode_metrics_only.clone()))?;
        registry.register(Box::new(mode_transitions_total.clone()))?;
        registry.register(Box::new(time_in_mode_seconds.clone()))?;
        registry.register(Box::new(mode_check_duration_seconds.clone()))?;
        registry.register(Box::new(mode_evaluation_errors_total.clone()))?;
        registry.register(Box::new(submissions_total.clone()))?;
        registry.register(Box::new(submissions_rejected_total.clone()))?;
        registry.register(Box::new(submissions_during_metrics_only_total.clone()))?;
        registry.register(Box::new(jobs_skipped_total.clone()))?;
        registry.register(Box::new(jobs_requeued_total.clone()))?;
        registry.register(Box::new(queue_depth.clone()))?;
        registry.register(Box::new(target_health.clone()))?;
        registry.register(Box::new(probes_total.clone()))?;
        registry.register(Box::new(deliveries_total.clone()))?;
        registry.register(Box::new(delivery_duration_seconds.clone()))?;
        registry.register(Box::new(discovered_targets.clone()))?;
        registry.register(Box::new(discovery_refreshes_total.clone()))?;
        registry.register(Box::new(discovery_errors_total.clone()))?;
        registry.register(Box::new(discovery_invalid_secrets_total.clone()))?;

        // Fail-safe starting mode.
        mode_metrics_only.set(1);

        Ok(Self {
            registry,
            mode_metrics_only,
            mode_transitions_total,
            time_in_mode_seconds,
            mode_check_duration_seconds,
            mode_evaluation_errors_total,
            submissions_total,
            submissions_rejected_total,
            submissions_during_metrics_only_total,
            jobs_skipped_total,
            jobs_requeued_total,
            queue_depth,
            target_health,
            probes_total,
            deliveries_total,
            delivery_duration_seconds,
            discovered_targets,
            discovery_refreshes_total,
            discovery_errors_total,
            discovery_invalid_secrets_total,
        })
    }

    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render all metrics in the Prometheus text format.
    pub fn gather(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }

    pub fn set_mode(&self, mode: Mode) {
        self.mode_metrics_only.set(i64::from(mode == Mode::MetricsOnly));
    }

    pub fn set_target_health(&self, id: &TargetId, provider: Provider, status: HealthStatus) {
        let value = match status {
            HealthStatus::Healthy => 1,
            HealthStatus::Unhealthy => 0,
            HealthStatus::Unknown => -1,
        };
        self.target_health
            .with_label_values(&[id.as_str(), provider.as_str()])
            .set(value);
    }

    pub fn remove_target_health(&self, id: &TargetId, provider: Provider) {
        let _ = self
            .target_health
            .remove_label_values(&[id.as_str(), provider.as_str()]);
    }

    pub fn record_delivery(&self, provider: Provider, success: bool, latency_secs: f64) {
        let result = if success { "success" } else { "failure" };
        self.deliveries_total
            .with_label_values(&[provider.as_str(), result])
            .inc();
        self.delivery_duration_seconds
            .with_label_values(&[provider.as_str()])
            .observe(latency_secs);
    }
}

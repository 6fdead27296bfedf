//! Configuration for the publishing subsystem.
//!
//! Every value has a compiled default and can be overridden through an
//! `ALERTD_*` environment variable. Durations are given in milliseconds.

use serde::Serialize;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

/// Label selector used when none is configured.
pub const DEFAULT_LABEL_SELECTOR: &str = "alertmanager-plus.io/publishing-target=true";

/// Top-level publishing configuration.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PublishingConfig {
    pub discovery: DiscoveryConfig,
    pub health: HealthConfig,
    pub mode: ModeConfig,
    pub queue: QueueConfig,
    pub coordinator: CoordinatorConfig,
}

/// Target discovery configuration.
#[derive(Debug, Clone, Serialize)]
pub struct DiscoveryConfig {
    /// Namespace holding target secrets.
    pub namespace: String,
    /// Label selector that marks a secret as a publishing target.
    pub label_selector: String,
    /// Interval between full re-scans.
    pub refresh_interval: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            namespace: "monitoring".to_string(),
            label_selector: DEFAULT_LABEL_SELECTOR.to_string(),
            refresh_interval: Duration::from_secs(10),
        }
    }
}

/// Health probing configuration.
#[derive(Debug, Clone, Serialize)]
pub struct HealthConfig {
    /// Base interval between probes of one target.
    pub probe_interval: Duration,
    /// Deadline for a single probe.
    pub probe_timeout: Duration,
    /// Fraction of `probe_interval` used as +/- jitter, in `[0, 1)`.
    pub jitter: f64,
    /// Consecutive failures needed before a target is marked unhealthy.
    pub failure_threshold: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(15),
            probe_timeout: Duration::from_secs(5),
            jitter: 0.2,
            failure_threshold: 3,
        }
    }
}

/// Mode manager configuration.
#[derive(Debug, Clone, Serialize)]
pub struct ModeConfig {
    /// Periodic evaluation interval (change events also trigger evaluation).
    pub evaluation_interval: Duration,
    /// How long evaluation errors are tolerated before forcing MetricsOnly.
    pub error_grace: Duration,
}

impl Default for ModeConfig {
    fn default() -> Self {
        Self {
            evaluation_interval: Duration::from_secs(5),
            error_grace: Duration::from_secs(30),
        }
    }
}

/// What `submit` does when the queue is at capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum FullQueuePolicy {
    /// Reject immediately with a backpressure error.
    Reject,
    /// Wait for space up to `timeout`, then reject.
    Block { timeout: Duration },
}

/// What workers do with queued jobs while in MetricsOnly mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricsOnlyPolicy {
    /// Leave jobs queued and back off while the queue has room; once it is
    /// full, jobs are taken and marked skipped.
    Hold,
    /// Take jobs and mark them skipped immediately.
    Skip,
}

/// What happens to a job after it was skipped because of MetricsOnly mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum SkippedJobPolicy {
    /// The skipped outcome is final; the caller resubmits if it wants to.
    Record,
    /// Park skipped jobs and re-enqueue them when the mode returns to Normal.
    RequeueOnRecovery { max_deferred: usize },
}

/// Publishing queue configuration.
#[derive(Debug, Clone, Serialize)]
pub struct QueueConfig {
    pub capacity: usize,
    pub workers: usize,
    pub full_policy: FullQueuePolicy,
    pub metrics_only_policy: MetricsOnlyPolicy,
    /// Worker sleep between mode checks while holding jobs.
    pub metrics_only_backoff: Duration,
    pub skipped_job_policy: SkippedJobPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            workers: 4,
            full_policy: FullQueuePolicy::Reject,
            metrics_only_policy: MetricsOnlyPolicy::Hold,
            metrics_only_backoff: Duration::from_millis(500),
            skipped_job_policy: SkippedJobPolicy::Record,
        }
    }
}

/// Fan-out configuration.
#[derive(Debug, Clone, Serialize)]
pub struct CoordinatorConfig {
    /// Deadline covering the whole fan-out of one alert.
    pub publish_timeout: Duration,
    /// Maximum concurrent deliveries for one alert.
    pub max_concurrency: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            publish_timeout: Duration::from_secs(10),
            max_concurrency: 16,
        }
    }
}

impl PublishingConfig {
    /// Load configuration from `ALERTD_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let vars = Vars { lookup: &lookup };

        let discovery = DiscoveryConfig {
            namespace: vars
                .string("ALERTD_TARGET_NAMESPACE")
                .unwrap_or(defaults.discovery.namespace),
            label_selector: vars
                .string("ALERTD_TARGET_SELECTOR")
                .unwrap_or(defaults.discovery.label_selector),
            refresh_interval: vars.millis(
                "ALERTD_DISCOVERY_INTERVAL_MS",
                defaults.discovery.refresh_interval,
            )?,
        };

        let health = HealthConfig {
            probe_interval: vars.millis("ALERTD_PROBE_INTERVAL_MS", defaults.health.probe_interval)?,
            probe_timeout: vars.millis("ALERTD_PROBE_TIMEOUT_MS", defaults.health.probe_timeout)?,
            jitter: vars.parse("ALERTD_PROBE_JITTER", defaults.health.jitter)?,
            failure_threshold: vars.parse(
                "ALERTD_PROBE_FAILURE_THRESHOLD",
                defaults.health.failure_threshold,
            )?,
        };

        let mode = ModeConfig {
            evaluation_interval: vars.millis(
                "ALERTD_MODE_EVAL_INTERVAL_MS",
                defaults.mode.evaluation_interval,
            )?,
            error_grace: vars.millis("ALERTD_MODE_ERROR_GRACE_MS", defaults.mode.error_grace)?,
        };

        let full_policy = match vars.string("ALERTD_QUEUE_FULL_POLICY").as_deref() {
            None | Some("reject") => FullQueuePolicy::Reject,
            Some("block") => FullQueuePolicy::Block {
                timeout: vars.millis("ALERTD_QUEUE_ENQUEUE_TIMEOUT_MS", Duration::from_secs(1))?,
            },
            Some(other) => return Err(invalid("ALERTD_QUEUE_FULL_POLICY", other, "reject|block")),
        };

        let metrics_only_policy = match vars.string("ALERTD_QUEUE_METRICS_ONLY_POLICY").as_deref() {
            None | Some("hold") => MetricsOnlyPolicy::Hold,
            Some("skip") => MetricsOnlyPolicy::Skip,
            Some(other) => {
                return Err(invalid("ALERTD_QUEUE_METRICS_ONLY_POLICY", other, "hold|skip"))
            }
        };

        let skipped_job_policy = match vars.string("ALERTD_QUEUE_SKIPPED_JOB_POLICY").as_deref() {
            None | Some("record") => SkippedJobPolicy::Record,
            Some("requeue") => SkippedJobPolicy::RequeueOnRecovery {
                max_deferred: vars.parse("ALERTD_QUEUE_MAX_DEFERRED", 10_000)?,
            },
            Some(other) => {
                return Err(invalid("ALERTD_QUEUE_SKIPPED_JOB_POLICY", other, "record|requeue"))
            }
        };

        let queue = QueueConfig {
            capacity: vars.parse("ALERTD_QUEUE_CAPACITY", defaults.queue.capacity)?,
            workers: vars.parse("ALERTD_QUEUE_WORKERS", defaults.queue.workers)?,
            full_policy,
            metrics_only_policy,
            metrics_only_backoff: vars.millis(
                "ALERTD_QUEUE_METRICS_ONLY_BACKOFF_MS",
                defaults.queue.metrics_only_backoff,
            )?,
            skipped_job_policy,
        };

        let coordinator = CoordinatorConfig {
            publish_timeout: vars.millis(
                "ALERTD_PUBLISH_TIMEOUT_MS",
                defaults.coordinator.publish_timeout,
            )?,
            max_concurrency: vars.parse(
                "ALERTD_PUBLISH_MAX_CONCURRENCY",
                defaults.coordinator.max_concurrency,
            )?,
        };

        let config = Self {
            discovery,
            health,
            mode,
            queue,
            coordinator,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks: [(&str, bool, &str); 8] = [
            ("queue.capacity", self.queue.capacity > 0, "must be > 0"),
            ("queue.workers", self.queue.workers > 0, "must be > 0"),
            (
                "health.failure_threshold",
                self.health.failure_threshold >= 1,
                "must be >= 1",
            ),
            (
                "health.jitter",
                (0.0..1.0).contains(&self.health.jitter),
                "must be in [0, 1)",
            ),
            (
                "health.probe_interval",
                !self.health.probe_interval.is_zero(),
                "must be > 0",
            ),
            (
                "discovery.refresh_interval",
                !self.discovery.refresh_interval.is_zero(),
                "must be > 0",
            ),
            (
                "mode.evaluation_interval",
                !self.mode.evaluation_interval.is_zero(),
                "must be > 0",
            ),
            (
                "coordinator.max_concurrency",
                self.coordinator.max_concurrency > 0,
                "must be > 0",
            ),
        ];

        for (var, ok, reason) in checks {
            if !ok {
                return Err(ConfigError::Invalid {
                    var: var.to_string(),
                    reason: reason.to_string(),
                });
            }
        }
        Ok(())
    }
}

struct Vars<'a, F> {
    lookup: &'a F,
}

impl<F> Vars<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T: FromStr>(&self, key: &str, default: T) -> Result<T, ConfigError> {
        match self.string(key) {
            None => Ok(default),
            Some(raw) => raw
                .parse()
                .map_err(|_| invalid(key, &raw, "unparseable value")),
        }
    }

    fn millis(&self, key: &str, default: Duration) -> Result<Duration, ConfigError> {
        match self.string(key) {
            None => Ok(default),
            Some(raw) => raw
                .parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|_| invalid(key, &raw, "expected milliseconds")),
        }
    }
}

fn invalid(var: &str, value: &str, expected: &str) -> ConfigError {
    ConfigError::Invalid {
        var: var.to_string(),
        reason: format!("`{value}` ({expected})"),
    }
}

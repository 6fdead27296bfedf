//! Alerts, publish jobs and their outcomes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{DeliveryError, ErrorKind};
use crate::target::{Provider, TargetId};

/// Alert status as reported by the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    #[default]
    Firing,
    Resolved,
}

/// An alert accepted for publishing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alert {
    /// Stable identifier (fingerprint) of the alert.
    pub id: String,
    #[serde(default)]
    pub status: AlertStatus,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    #[serde(default = "Utc::now")]
    pub starts_at: DateTime<Utc>,
    #[serde(default)]
    pub ends_at: Option<DateTime<Utc>>,
}

impl Alert {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: AlertStatus::Firing,
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
            starts_at: Utc::now(),
            ends_at: None,
        }
    }

    #[must_use]
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }

    /// `alertname` label, if present.
    #[must_use]
    pub fn name(&self) -> &str {
        self.labels.get("alertname").map_or("unknown", String::as_str)
    }

    #[must_use]
    pub fn severity(&self) -> &str {
        self.labels.get("severity").map_or("unknown", String::as_str)
    }
}

/// Provider-specific payloads rendered by the template collaborator.
pub type RenderedPayloads = HashMap<Provider, serde_json::Value>;

/// One delivery attempt of one alert.
///
/// Targets are resolved when a worker dispatches the job, not when it is
/// enqueued, so a target that recovers in between is still used.
#[derive(Debug, Clone)]
pub struct PublishJob {
    pub alert: Arc<Alert>,
    pub payloads: Arc<RenderedPayloads>,
    pub enqueued_at: DateTime<Utc>,
    pub attempt: u32,
}

impl PublishJob {
    pub fn new(alert: Alert, payloads: RenderedPayloads) -> Self {
        Self {
            alert: Arc::new(alert),
            payloads: Arc::new(payloads),
            enqueued_at: Utc::now(),
            attempt: 1,
        }
    }

    /// The same job, queued again with the attempt counter bumped.
    #[must_use]
    pub fn retry(&self) -> Self {
        Self {
            alert: Arc::clone(&self.alert),
            payloads: Arc::clone(&self.payloads),
            enqueued_at: Utc::now(),
            attempt: self.attempt + 1,
        }
    }
}

/// Result of delivering one alert to one target.
#[derive(Debug, Clone, Serialize)]
pub struct PublishResult {
    pub target_id: TargetId,
    pub provider: Provider,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(with = "duration_ms")]
    pub latency: Duration,
    pub timestamp: DateTime<Utc>,
}

impl PublishResult {
    pub fn succeeded(
        target_id: TargetId,
        provider: Provider,
        http_status: Option<u16>,
        latency: Duration,
    ) -> Self {
        Self {
            target_id,
            provider,
            success: true,
            http_status,
            error_kind: None,
            error: None,
            latency,
            timestamp: Utc::now(),
        }
    }

    pub fn failed(target_id: TargetId, provider: Provider, err: &DeliveryError, latency: Duration) -> Self {
        Self {
            target_id,
            provider,
            success: false,
            http_status: err.http_status,
            error_kind: Some(err.kind),
            error: Some(err.message.clone()),
            latency,
            timestamp: Utc::now(),
        }
    }
}

/// Aggregated result of publishing one alert.
#[derive(Debug, Clone, Serialize)]
pub struct PublishOutcome {
    pub alert_id: String,
    pub attempt: u32,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped_due_to_mode: bool,
    pub results: Vec<PublishResult>,
    pub completed_at: DateTime<Utc>,
}

impl PublishOutcome {
    /// Outcome for an alert that was accepted but not delivered because no
    /// target was healthy and enabled.
    pub fn skipped(alert_id: &str, attempt: u32) -> Self {
        Self {
            alert_id: alert_id.to_string(),
            attempt,
            total: 0,
            succeeded: 0,
            failed: 0,
            skipped_due_to_mode: true,
            results: Vec::new(),
            completed_at: Utc::now(),
        }
    }

    pub fn from_results(alert_id: &str, attempt: u32, results: Vec<PublishResult>) -> Self {
        let succeeded = results.iter().filter(|r| r.success).count();
        Self {
            alert_id: alert_id.to_string(),
            attempt,
            total: results.len(),
            succeeded,
            failed: results.len() - succeeded,
            skipped_due_to_mode: false,
            results,
            completed_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn is_partial(&self) -> bool {
        self.succeeded > 0 && self.failed > 0
    }
}

/// What happened to a job once it left the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    /// Dispatched to the coordinator (individual targets may still have failed).
    Dispatched,
    /// Not delivered because the subsystem was in MetricsOnly mode.
    SkippedDueToMode,
    /// Skipped because of MetricsOnly mode and parked until the mode returns
    /// to Normal, when it is queued again as a new attempt.
    Deferred,
    /// The coordinator refused the job as malformed.
    Rejected,
    /// Still queued when the queue shut down.
    Abandoned,
}

/// Final record of one job, handed to the [`OutcomeSink`](crate::outcome::OutcomeSink).
#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    pub alert_id: String,
    pub attempt: u32,
    pub disposition: Disposition,
    pub outcome: PublishOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub(crate) mod duration_ms {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }
}

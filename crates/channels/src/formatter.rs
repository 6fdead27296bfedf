//! Default payload rendering for every provider.

use chrono::Utc;
use publishing::{Alert, AlertStatus, PayloadFormatter, Provider, RenderedPayloads};
use serde::Serialize;
use std::fmt::Write as _;

/// Webhook payload schema version.
pub const WEBHOOK_PAYLOAD_VERSION: &str = "1";

/// Renders alerts into Slack, PagerDuty, webhook and email payloads.
#[derive(Debug, Clone)]
pub struct BasicFormatter {
    source: String,
}

impl BasicFormatter {
    /// `source` names the emitting system in PagerDuty events and footers.
    #[must_use]
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
        }
    }

    fn title(alert: &Alert) -> String {
        let state = match alert.status {
            AlertStatus::Firing => "FIRING",
            AlertStatus::Resolved => "RESOLVED",
        };
        format!("[{state}] {} ({})", alert.name(), alert.severity())
    }

    fn summary(alert: &Alert) -> String {
        alert
            .annotations
            .get("summary")
            .or_else(|| alert.annotations.get("description"))
            .cloned()
            .unwrap_or_else(|| Self::title(alert))
    }

    fn slack(&self, alert: &Alert) -> SlackPayload {
        let color = match (alert.status, alert.severity()) {
            (AlertStatus::Resolved, _) => "#2eb886",
            (_, "critical") => "#e74c3c",
            (_, "warning") => "#f39c12",
            _ => "#3498db",
        };

        let fields = alert
            .labels
            .iter()
            .filter(|(k, _)| k.as_str() != "alertname")
            .map(|(k, v)| SlackField {
                title: k.clone(),
                value: v.clone(),
                short: true,
            })
            .collect();

        let mut footer = format!("{} | {}", self.source, alert.starts_at.format("%Y-%m-%d %H:%M:%S UTC"));
        if let Some(ends_at) = alert.ends_at {
            let secs = (ends_at - alert.starts_at).num_seconds().max(0).unsigned_abs();
            let _ = write!(footer, " | lasted {}", format_duration(secs));
        }

        SlackPayload {
            text: Self::title(alert),
            attachments: vec![SlackAttachment {
                fallback: Self::title(alert),
                color: color.to_string(),
                title: Self::title(alert),
                text: Self::summary(alert),
                fields,
                footer: Some(footer),
                ts: Some(alert.starts_at.timestamp()),
            }],
        }
    }

    fn pagerduty(&self, alert: &Alert) -> serde_json::Value {
        let action = match alert.status {
            AlertStatus::Firing => "trigger",
            AlertStatus::Resolved => "resolve",
        };
        let severity = match alert.severity() {
            "critical" => "critical",
            "error" | "high" => "error",
            "warning" | "medium" => "warning",
            _ => "info",
        };

        serde_json::json!({
            "event_action": action,
            "dedup_key": alert.id,
            "payload": {
                "summary": Self::summary(alert),
                "source": self.source,
                "severity": severity,
                "timestamp": alert.starts_at.to_rfc3339(),
                "custom_details": {
                    "labels": alert.labels,
                    "annotations": alert.annotations,
                },
            },
        })
    }

    fn webhook(alert: &Alert) -> serde_json::Value {
        serde_json::json!({
            "version": WEBHOOK_PAYLOAD_VERSION,
            "alert": alert,
            "rendered_at": Utc::now().to_rfc3339(),
        })
    }

    fn email(&self, alert: &Alert) -> serde_json::Value {
        let mut text = format!("{}\n\n{}\n\nLabels:\n", Self::title(alert), Self::summary(alert));
        for (k, v) in &alert.labels {
            let _ = writeln!(text, "  {k} = {v}");
        }
        let _ = write!(
            text,
            "\nStarted: {}\nSource: {}\n",
            alert.starts_at.format("%Y-%m-%d %H:%M:%S UTC"),
            self.source
        );

        serde_json::json!({
            "subject": Self::title(alert),
            "text": text,
        })
    }
}

impl Default for BasicFormatter {
    fn default() -> Self {
        Self::new("alertd")
    }
}

impl PayloadFormatter for BasicFormatter {
    fn render(&self, alert: &Alert) -> RenderedPayloads {
        let mut payloads = RenderedPayloads::new();
        for provider in Provider::ALL {
            let payload = match provider {
                Provider::Slack => serde_json::to_value(self.slack(alert)),
                Provider::PagerDuty => Ok(self.pagerduty(alert)),
                Provider::Webhook => Ok(Self::webhook(alert)),
                Provider::Email => Ok(self.email(alert)),
            };
            match payload {
                Ok(value) => {
                    payloads.insert(provider, value);
                }
                Err(e) => {
                    tracing::warn!(alert_id = %alert.id, provider = %provider, error = %e, "Failed to render payload");
                }
            }
        }
        payloads
    }
}

// =============================================================================
// Slack API types
// =============================================================================

#[derive(Debug, Serialize)]
struct SlackPayload {
    text: String,
    attachments: Vec<SlackAttachment>,
}

#[derive(Debug, Serialize)]
struct SlackAttachment {
    fallback: String,
    color: String,
    title: String,
    text: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    fields: Vec<SlackField>,
    #[serde(skip_serializing_if = "Option::is_none")]
    footer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ts: Option<i64>,
}

#[derive(Debug, Serialize)]
struct SlackField {
    title: String,
    value: String,
    short: bool,
}

/// Format seconds into a human-readable duration.
fn format_duration(secs: u64) -> String {
    if secs < 60 {
        format!("{secs}s")
    } else if secs < 3600 {
        let mins = secs / 60;
        let remaining_secs = secs % 60;
        if remaining_secs == 0 {
            format!("{mins}m")
        } else {
            format!("{mins}m {remaining_secs}s")
        }
    } else {
        let hours = secs / 3600;
        let mins = (secs % 3600) / 60;
        if mins == 0 {
            format!("{hours}h")
        } else {
            format!("{hours}h {mins}m")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alert() -> Alert {
        Alert::new("fp-7")
            .with_label("alertname", "DiskFull")
            .with_label("severity", "critical")
            .with_label("instance", "db-1")
            .with_annotation("summary", "Disk on db-1 is 98% full")
    }

    #[test]
    fn test_renders_every_provider() {
        let payloads = BasicFormatter::default().render(&alert());
        for provider in Provider::ALL {
            assert!(payloads.contains_key(&provider), "missing {provider}");
        }
    }

    #[test]
    fn test_slack_payload() {
        let payloads = BasicFormatter::default().render(&alert());
        let slack = &payloads[&Provider::Slack];
        assert_eq!(slack["text"], "[FIRING] DiskFull (critical)");
        assert_eq!(slack["attachments"][0]["color"], "#e74c3c");
        assert_eq!(slack["attachments"][0]["text"], "Disk on db-1 is 98% full");
        // alertname is the title, not a field
        let fields = slack["attachments"][0]["fields"].as_array().unwrap();
        assert_eq!(fields.len(), 2);
    }

    #[test]
    fn test_pagerduty_resolve_uses_fingerprint_as_dedup_key() {
        let mut resolved = alert();
        resolved.status = AlertStatus::Resolved;
        let payloads = BasicFormatter::new("prod-alertd").render(&resolved);
        let event = &payloads[&Provider::PagerDuty];

        assert_eq!(event["event_action"], "resolve");
        assert_eq!(event["dedup_key"], "fp-7");
        assert_eq!(event["payload"]["source"], "prod-alertd");
        assert_eq!(event["payload"]["severity"], "critical");
        assert!(event.get("routing_key").is_none());
    }

    #[test]
    fn test_email_payload() {
        let payloads = BasicFormatter::default().render(&alert());
        let email = &payloads[&Provider::Email];
        assert_eq!(email["subject"], "[FIRING] DiskFull (critical)");
        assert!(email["text"].as_str().unwrap().contains("instance = db-1"));
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(45), "45s");
        assert_eq!(format_duration(125), "2m 5s");
        assert_eq!(format_duration(7200), "2h");
    }
}

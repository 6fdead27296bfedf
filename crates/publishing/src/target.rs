//! Delivery targets discovered from secret objects.
//!
//! A target secret carries its definition in the data map:
//!
//! | key          | meaning                                                      |
//! |--------------|--------------------------------------------------------------|
//! | `provider`   | `slack`, `pagerduty`, `webhook` or `email` (required)        |
//! | `url`        | HTTP endpoint (required for slack/webhook, optional for PD)  |
//! | `enabled`    | `true`/`false`, defaults to `true`                           |
//! | `smtp_host`  | SMTP relay (email only)                                      |
//! | `smtp_port`  | SMTP port, defaults to 587 (email only)                      |
//! | `from`, `to` | sender and comma-separated recipients (email only)           |
//!
//! Every other key is treated as a credential (`token`, `routing_key`,
//! `username`, `password`, ...).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::TargetParseError;
use crate::store::SecretData;

/// Default PagerDuty Events API v2 endpoint.
pub const PAGERDUTY_EVENTS_URL: &str = "https://events.pagerduty.com/v2/enqueue";

const DEFAULT_SMTP_PORT: u16 = 587;

const DEFINITION_KEYS: &[&str] = &["provider", "url", "enabled", "smtp_host", "smtp_port", "from", "to"];

/// Notification provider a target delivers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Slack,
    PagerDuty,
    Webhook,
    Email,
}

impl Provider {
    pub const ALL: [Self; 4] = [Self::Slack, Self::PagerDuty, Self::Webhook, Self::Email];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Slack => "slack",
            Self::PagerDuty => "pagerduty",
            Self::Webhook => "webhook",
            Self::Email => "email",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = TargetParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "slack" => Ok(Self::Slack),
            "pagerduty" | "pager_duty" | "pager-duty" => Ok(Self::PagerDuty),
            "webhook" | "http" => Ok(Self::Webhook),
            "email" | "smtp" => Ok(Self::Email),
            other => Err(TargetParseError::UnknownProvider(other.to_string())),
        }
    }
}

/// Stable target identifier: `<namespace>/<secret-name>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TargetId(String);

impl TargetId {
    pub fn new(namespace: &str, name: &str) -> Self {
        Self(format!("{namespace}/{name}"))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TargetId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Where a target delivers to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TargetEndpoint {
    Http {
        url: String,
    },
    Smtp {
        host: String,
        port: u16,
        from: String,
        to: Vec<String>,
    },
}

impl TargetEndpoint {
    /// HTTP URL, if this is an HTTP endpoint.
    #[must_use]
    pub fn url(&self) -> Option<&str> {
        match self {
            Self::Http { url } => Some(url),
            Self::Smtp { .. } => None,
        }
    }
}

/// Opaque credential material. Values never appear in `Debug` output and the
/// type is deliberately not `Serialize`.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials(BTreeMap<String, String>);

impl Credentials {
    #[must_use]
    pub fn new(values: BTreeMap<String, String>) -> Self {
        Self(values)
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.0.keys().map(|k| (k, "<redacted>")))
            .finish()
    }
}

/// One configured delivery destination.
///
/// Targets are immutable: a changed secret yields a new `Target` value, shared
/// as `Arc<Target>` so in-flight jobs keep the version they resolved.
#[derive(Debug, Clone)]
pub struct Target {
    pub id: TargetId,
    pub provider: Provider,
    pub endpoint: TargetEndpoint,
    pub credentials: Credentials,
    pub enabled: bool,
    pub labels: BTreeMap<String, String>,
    pub last_seen: DateTime<Utc>,
    /// Version of the source secret this value was parsed from.
    pub source_version: Option<String>,
}

impl Target {
    /// Parse a target definition out of a secret.
    pub fn from_secret(secret: &SecretData, seen_at: DateTime<Utc>) -> Result<Self, TargetParseError> {
        let mut values = BTreeMap::new();
        for (key, raw) in &secret.data {
            let value = String::from_utf8(raw.clone())
                .map_err(|_| TargetParseError::InvalidUtf8 { key: key.clone() })?;
            values.insert(key.clone(), value.trim().to_string());
        }

        let provider: Provider = values
            .get("provider")
            .ok_or(TargetParseError::MissingKey("provider"))?
            .parse()?;

        let enabled = match values.get("enabled").map(String::as_str) {
            None | Some("") => true,
            Some(v) => parse_bool(v).ok_or_else(|| TargetParseError::InvalidValue {
                key: "enabled",
                reason: format!("expected true/false, got `{v}`"),
            })?,
        };

        let endpoint = match provider {
            Provider::Slack | Provider::Webhook => TargetEndpoint::Http {
                url: require_url(&values)?,
            },
            Provider::PagerDuty => TargetEndpoint::Http {
                url: match values.get("url") {
                    Some(_) => require_url(&values)?,
                    None => PAGERDUTY_EVENTS_URL.to_string(),
                },
            },
            Provider::Email => smtp_endpoint(&values)?,
        };

        let credentials = values
            .into_iter()
            .filter(|(k, _)| !DEFINITION_KEYS.contains(&k.as_str()))
            .collect();

        Ok(Self {
            id: TargetId::new(&secret.reference.namespace, &secret.reference.name),
            provider,
            endpoint,
            credentials: Credentials::new(credentials),
            enabled,
            labels: secret.labels.clone(),
            last_seen: seen_at,
            source_version: secret.reference.resource_version.clone(),
        })
    }

    /// True when both values describe the same destination, ignoring
    /// discovery bookkeeping (`last_seen`, `source_version`).
    #[must_use]
    pub fn same_definition(&self, other: &Self) -> bool {
        self.id == other.id
            && self.provider == other.provider
            && self.endpoint == other.endpoint
            && self.credentials == other.credentials
            && self.enabled == other.enabled
            && self.labels == other.labels
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn require_url(values: &BTreeMap<String, String>) -> Result<String, TargetParseError> {
    let url = values
        .get("url")
        .filter(|u| !u.is_empty())
        .ok_or(TargetParseError::MissingKey("url"))?;

    if !(url.starts_with("https://") || url.starts_with("http://")) {
        return Err(TargetParseError::InvalidValue {
            key: "url",
            reason: "must be an http(s) URL".to_string(),
        });
    }
    Ok(url.clone())
}

fn smtp_endpoint(values: &BTreeMap<String, String>) -> Result<TargetEndpoint, TargetParseError> {
    let host = values
        .get("smtp_host")
        .filter(|h| !h.is_empty())
        .ok_or(TargetParseError::MissingKey("smtp_host"))?
        .clone();

    let port = match values.get("smtp_port") {
        None => DEFAULT_SMTP_PORT,
        Some(p) => p.parse().map_err(|_| TargetParseError::InvalidValue {
            key: "smtp_port",
            reason: format!("`{p}` is not a port number"),
        })?,
    };

    let from = values
        .get("from")
        .filter(|f| !f.is_empty())
        .ok_or(TargetParseError::MissingKey("from"))?
        .clone();

    let to: Vec<String> = values
        .get("to")
        .map(|t| {
            t.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default();

    if to.is_empty() {
        return Err(TargetParseError::MissingKey("to"));
    }

    Ok(TargetEndpoint::Smtp { host, port, from, to })
}

//! Parallel publisher.
//!
//! Fans one alert out to every enabled and healthy target. Targets are read
//! from the same discovery snapshot and health records the mode manager uses,
//! so an empty target set here and `MetricsOnly` there agree without the
//! coordinator consulting the mode.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::ClientRegistry;
use crate::config::CoordinatorConfig;
use crate::discovery::TargetDiscoveryManager;
use crate::error::{DeliveryError, ErrorKind, PublishError};
use crate::health::HealthMonitor;
use crate::job::{PublishJob, PublishOutcome, PublishResult};
use crate::metrics::PublishingMetrics;
use crate::target::{Target, TargetId};

pub struct PublishCoordinator {
    discovery: Arc<TargetDiscoveryManager>,
    health: Arc<HealthMonitor>,
    clients: ClientRegistry,
    config: CoordinatorConfig,
    metrics: Arc<PublishingMetrics>,
}

impl PublishCoordinator {
    pub fn new(
        discovery: Arc<TargetDiscoveryManager>,
        health: Arc<HealthMonitor>,
        clients: ClientRegistry,
        config: CoordinatorConfig,
        metrics: Arc<PublishingMetrics>,
    ) -> Self {
        Self {
            discovery,
            health,
            clients,
            config,
            metrics,
        }
    }

    /// Enabled and healthy targets in the current snapshot.
    pub fn resolve_targets(&self) -> Vec<Arc<Target>> {
        self.discovery
            .snapshot()
            .iter()
            .filter(|t| t.enabled && self.health.is_healthy(&t.id))
            .cloned()
            .collect()
    }

    /// Deliver one job to every resolved target.
    ///
    /// Individual delivery failures end up in the outcome. Only a job that
    /// cannot be attempted at all returns an error. When `cancel` fires or the
    /// publish timeout passes, deliveries still running are aborted and
    /// recorded as failed; results that already completed are kept.
    pub async fn publish(
        &self,
        job: &PublishJob,
        cancel: &CancellationToken,
    ) -> Result<PublishOutcome, PublishError> {
        validate(job)?;
        let alert_id = job.alert.id.as_str();

        let targets = self.resolve_targets();
        if targets.is_empty() {
            debug!(alert_id, "No healthy enabled targets, skipping delivery");
            return Ok(PublishOutcome::skipped(alert_id, job.attempt));
        }

        let started = Instant::now();
        let deadline = tokio::time::Instant::now() + self.config.publish_timeout;
        let permits = Arc::new(Semaphore::new(self.config.max_concurrency.max(1)));
        let mut deliveries = JoinSet::new();

        for target in &targets {
            let target = Arc::clone(target);
            let client = self.clients.get(target.provider);
            let payloads = Arc::clone(&job.payloads);
            let permits = Arc::clone(&permits);

            deliveries.spawn(async move {
                // The semaphore is never closed.
                let _permit = permits.acquire_owned().await.ok();
                let sent_at = Instant::now();

                let sent = match (client, payloads.get(&target.provider)) {
                    (None, _) => Err(DeliveryError::new(
                        ErrorKind::Unsupported,
                        format!("no client registered for {}", target.provider),
                    )),
                    (Some(_), None) => Err(DeliveryError::new(
                        ErrorKind::MalformedPayload,
                        format!("no payload rendered for {}", target.provider),
                    )),
                    (Some(client), Some(payload)) => client.send(&target, payload).await,
                };

                let latency = sent_at.elapsed();
                match sent {
                    Ok(delivery) => {
                        PublishResult::succeeded(target.id.clone(), target.provider, delivery.http_status, latency)
                    }
                    Err(e) => PublishResult::failed(target.id.clone(), target.provider, &e, latency),
                }
            });
        }

        let expired = tokio::time::sleep_until(deadline);
        tokio::pin!(expired);

        let mut results = Vec::with_capacity(targets.len());
        let interrupted = loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break Some(ErrorKind::Cancelled),
                () = &mut expired => break Some(ErrorKind::Timeout),
                joined = deliveries.join_next() => match joined {
                    None => break None,
                    Some(Ok(result)) => results.push(result),
                    Some(Err(e)) => warn!(alert_id, error = %e, "Delivery task failed"),
                },
            }
        };

        if interrupted.is_some() {
            deliveries.abort_all();
        }

        // Targets without a result were aborted, or their task panicked.
        let finished: HashSet<TargetId> = results.iter().map(|r| r.target_id.clone()).collect();
        for target in targets.iter().filter(|t| !finished.contains(&t.id)) {
            let error = match interrupted {
                Some(ErrorKind::Cancelled) => DeliveryError::new(ErrorKind::Cancelled, "publish cancelled"),
                Some(_) => DeliveryError::new(
                    ErrorKind::Timeout,
                    format!(
                        "no response within {}ms",
                        self.config.publish_timeout.as_millis()
                    ),
                ),
                None => DeliveryError::new(ErrorKind::Provider, "delivery task panicked"),
            };
            results.push(PublishResult::failed(
                target.id.clone(),
                target.provider,
                &error,
                started.elapsed(),
            ));
        }

        for result in &results {
            self.metrics
                .record_delivery(result.provider, result.success, result.latency.as_secs_f64());
            if !result.success {
                warn!(
                    alert_id,
                    target_id = %result.target_id,
                    provider = %result.provider,
                    error_kind = ?result.error_kind,
                    http_status = ?result.http_status,
                    error = result.error.as_deref().unwrap_or_default(),
                    "Delivery failed"
                );
            }
        }

        let outcome = PublishOutcome::from_results(alert_id, job.attempt, results);
        info!(
            alert_id,
            attempt = job.attempt,
            total = outcome.total,
            succeeded = outcome.succeeded,
            failed = outcome.failed,
            duration_ms = started.elapsed().as_millis() as u64,
            "Alert published"
        );
        Ok(outcome)
    }
}

fn validate(job: &PublishJob) -> Result<(), PublishError> {
    if job.alert.id.trim().is_empty() {
        return Err(PublishError::MalformedAlert("alert id is empty".to_string()));
    }
    if job.payloads.is_empty() {
        return Err(PublishError::MalformedAlert(format!(
            "alert {} has no rendered payloads",
            job.alert.id
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{Alert, RenderedPayloads};
    use crate::target::Provider;
    use crate::testing::{id, Harness, Script, ScriptedClient};
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn job(providers: &[Provider]) -> PublishJob {
        let payloads: RenderedPayloads = providers
            .iter()
            .map(|p| (*p, serde_json::json!({ "text": "disk full" })))
            .collect();
        PublishJob::new(Alert::new("fp-1").with_label("alertname", "DiskFull"), payloads)
    }

    fn coordinator(h: &Harness, clients: ClientRegistry, timeout: Duration) -> PublishCoordinator {
        PublishCoordinator::new(
            Arc::clone(&h.discovery),
            Arc::clone(&h.health),
            clients,
            CoordinatorConfig {
                publish_timeout: timeout,
                max_concurrency: 16,
            },
            Arc::clone(&h.metrics),
        )
    }

    async fn healthy_webhooks(h: &Harness, names: &[&str]) {
        for name in names {
            h.put(name, Provider::Webhook, true).await;
            h.probe(name, true);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_slow_target_times_out_others_succeed() {
        let client = ScriptedClient::new(Provider::Webhook);
        client.script("d", Script::Delay(Duration::from_secs(60)));
        let h = Harness::new(ClientRegistry::new());
        healthy_webhooks(&h, &["a", "b", "c", "d"]).await;
        let coordinator = coordinator(&h, ClientRegistry::new().with(client), Duration::from_secs(2));

        let outcome = coordinator
            .publish(&job(&[Provider::Webhook]), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.total, 4);
        assert_eq!(outcome.succeeded, 3);
        assert_eq!(outcome.failed, 1);
        assert!(!outcome.skipped_due_to_mode);
        let slow = outcome.results.iter().find(|r| !r.success).unwrap();
        assert_eq!(slow.target_id, id("d"));
        assert_eq!(slow.error_kind, Some(ErrorKind::Timeout));
    }

    #[tokio::test]
    async fn test_no_healthy_targets_skips_without_sending() {
        let client = ScriptedClient::new(Provider::Webhook);
        let h = Harness::new(ClientRegistry::new());
        h.put("a", Provider::Webhook, true).await;
        h.put("b", Provider::Webhook, false).await;
        h.probe("b", true);
        let coordinator = coordinator(&h, ClientRegistry::new().with(client.clone()), Duration::from_secs(2));

        let outcome = coordinator
            .publish(&job(&[Provider::Webhook]), &CancellationToken::new())
            .await
            .unwrap();

        assert!(outcome.skipped_due_to_mode);
        assert_eq!(outcome.total, 0);
        assert_eq!(client.sends.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failures_are_isolated_per_target() {
        let client = ScriptedClient::new(Provider::Webhook);
        client.script("a", Script::Fail(DeliveryError::from_status(401, "bad token")));
        client.script("b", Script::Fail(DeliveryError::from_status(429, "slow down")));
        let h = Harness::new(ClientRegistry::new());
        healthy_webhooks(&h, &["a", "b", "c"]).await;
        let coordinator = coordinator(&h, ClientRegistry::new().with(client), Duration::from_secs(2));

        let outcome = coordinator
            .publish(&job(&[Provider::Webhook]), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.succeeded, 1);
        assert_eq!(outcome.failed, 2);
        assert!(outcome.is_partial());
        let kind = |name: &str| {
            outcome
                .results
                .iter()
                .find(|r| r.target_id == id(name))
                .and_then(|r| r.error_kind)
        };
        assert_eq!(kind("a"), Some(ErrorKind::Auth));
        assert_eq!(kind("b"), Some(ErrorKind::RateLimited));
        assert_eq!(kind("c"), None);
    }

    #[tokio::test]
    async fn test_missing_client_and_payload_are_recorded() {
        let webhook = ScriptedClient::new(Provider::Webhook);
        let slack = ScriptedClient::new(Provider::Slack);
        let h = Harness::new(ClientRegistry::new());
        h.put("hook", Provider::Webhook, true).await;
        h.put("mail", Provider::Email, true).await;
        h.put("chat", Provider::Slack, true).await;
        for name in ["hook", "mail", "chat"] {
            h.probe(name, true);
        }
        let clients = ClientRegistry::new().with(webhook).with(slack);
        let coordinator = coordinator(&h, clients, Duration::from_secs(2));

        // Payloads rendered for webhook and email only.
        let outcome = coordinator
            .publish(&job(&[Provider::Webhook, Provider::Email]), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.total, 3);
        assert_eq!(outcome.succeeded, 1);
        let kind = |name: &str| {
            outcome
                .results
                .iter()
                .find(|r| r.target_id == id(name))
                .and_then(|r| r.error_kind)
        };
        assert_eq!(kind("mail"), Some(ErrorKind::Unsupported));
        assert_eq!(kind("chat"), Some(ErrorKind::MalformedPayload));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_keeps_completed_results() {
        let client = ScriptedClient::new(Provider::Webhook);
        client.script("slow", Script::Delay(Duration::from_secs(30)));
        let h = Harness::new(ClientRegistry::new());
        healthy_webhooks(&h, &["fast", "slow"]).await;
        let coordinator = coordinator(&h, ClientRegistry::new().with(client), Duration::from_secs(60));

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let outcome = coordinator
            .publish(&job(&[Provider::Webhook]), &cancel)
            .await
            .unwrap();

        assert_eq!(outcome.succeeded, 1);
        assert_eq!(outcome.failed, 1);
        let slow = outcome.results.iter().find(|r| r.target_id == id("slow")).unwrap();
        assert_eq!(slow.error_kind, Some(ErrorKind::Cancelled));
    }

    #[tokio::test]
    async fn test_malformed_jobs_are_rejected() {
        let h = Harness::new(ClientRegistry::new());
        let coordinator = coordinator(&h, ClientRegistry::new(), Duration::from_secs(2));

        let no_payloads = PublishJob::new(Alert::new("fp-1"), RenderedPayloads::new());
        assert!(matches!(
            coordinator.publish(&no_payloads, &CancellationToken::new()).await,
            Err(PublishError::MalformedAlert(_))
        ));

        let mut empty_id = job(&[Provider::Webhook]);
        empty_id.alert = Arc::new(Alert::new(" "));
        assert!(coordinator
            .publish(&empty_id, &CancellationToken::new())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_metrics_record_per_provider_results() {
        let client = ScriptedClient::new(Provider::Webhook);
        client.script("b", Script::Fail(DeliveryError::from_status(503, "unavailable")));
        let h = Harness::new(ClientRegistry::new());
        healthy_webhooks(&h, &["a", "b"]).await;
        let coordinator = coordinator(&h, ClientRegistry::new().with(client), Duration::from_secs(2));

        coordinator
            .publish(&job(&[Provider::Webhook]), &CancellationToken::new())
            .await
            .unwrap();

        let deliveries = |result: &str| {
            h.metrics
                .deliveries_total
                .with_label_values(&["webhook", result])
                .get()
        };
        assert_eq!(deliveries("success"), 1);
        assert_eq!(deliveries("failure"), 1);
    }
}

//! # Mode Manager
//!
//! Process-wide `Normal` / `MetricsOnly` state machine.
//!
//! The mode is `MetricsOnly` exactly when the last completed evaluation found
//! no target that is both enabled and healthy. [`ModeManager::check_mode_transition`]
//! is the only writer; everything else reads the mode through
//! [`ModeManager::is_metrics_only`], which is a single atomic load.
//!
//! Evaluation runs on a timer and after every discovery or health change.
//! Evaluation errors (discovery failing, a panic while counting) keep the last
//! mode for `error_grace`, then force `MetricsOnly`.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ModeConfig;
use crate::discovery::TargetDiscoveryManager;
use crate::error::ModeEvaluationError;
use crate::health::HealthMonitor;
use crate::metrics::PublishingMetrics;

/// Publishing mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum Mode {
    /// At least one enabled target is healthy; alerts are delivered.
    Normal = 0,
    /// No enabled target is healthy; alerts are accepted and recorded only.
    MetricsOnly = 1,
}

impl Mode {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::MetricsOnly => "metrics_only",
        }
    }

    const fn from_u8(value: u8) -> Self {
        if value == Self::Normal as u8 {
            Self::Normal
        } else {
            Self::MetricsOnly
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Emitted on every mode change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModeTransitionEvent {
    pub from: Mode,
    pub to: Mode,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
    /// Total transitions so far, including this one.
    pub transition_count: u64,
}

/// Observability view returned by [`ModeManager::mode_metrics`].
#[derive(Debug, Clone, Serialize)]
pub struct ModeMetrics {
    pub mode: Mode,
    pub transition_count: u64,
    #[serde(serialize_with = "serialize_secs")]
    pub time_in_mode: Duration,
    pub mode_since: DateTime<Utc>,
    pub last_transition_reason: Option<String>,
    pub last_transition_at: Option<DateTime<Utc>>,
    pub healthy_enabled_targets: usize,
    /// Whether at least one evaluation has completed since startup.
    pub evaluated: bool,
    /// Set while evaluations are failing.
    pub evaluation_failing_since: Option<DateTime<Utc>>,
}

fn serialize_secs<S: serde::Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(value.as_secs_f64())
}

struct ModeState {
    mode: Mode,
    since: Instant,
    since_at: DateTime<Utc>,
    transition_count: u64,
    last_reason: Option<String>,
    last_transition_at: Option<DateTime<Utc>>,
    healthy_enabled: usize,
    evaluated: bool,
    failing_since: Option<(Instant, DateTime<Utc>)>,
}

type Subscribers = Mutex<HashMap<u64, mpsc::UnboundedSender<ModeTransitionEvent>>>;

pub struct ModeManager {
    mode: AtomicU8,
    state: Mutex<ModeState>,
    discovery: Arc<TargetDiscoveryManager>,
    health: Arc<HealthMonitor>,
    config: ModeConfig,
    subscribers: Arc<Subscribers>,
    next_subscriber: AtomicU64,
    metrics: Arc<PublishingMetrics>,
}

impl ModeManager {
    /// Starts in `MetricsOnly` until the first evaluation proves otherwise.
    pub fn new(
        discovery: Arc<TargetDiscoveryManager>,
        health: Arc<HealthMonitor>,
        config: ModeConfig,
        metrics: Arc<PublishingMetrics>,
    ) -> Self {
        metrics.set_mode(Mode::MetricsOnly);
        Self {
            mode: AtomicU8::new(Mode::MetricsOnly as u8),
            state: Mutex::new(ModeState {
                mode: Mode::MetricsOnly,
                since: Instant::now(),
                since_at: Utc::now(),
                transition_count: 0,
                last_reason: None,
                last_transition_at: None,
                healthy_enabled: 0,
                evaluated: false,
                failing_since: None,
            }),
            discovery,
            health,
            config,
            subscribers: Arc::new(Mutex::new(HashMap::new())),
            next_subscriber: AtomicU64::new(0),
            metrics,
        }
    }

    #[inline]
    pub fn current_mode(&self) -> Mode {
        Mode::from_u8(self.mode.load(Ordering::Acquire))
    }

    #[inline]
    pub fn is_metrics_only(&self) -> bool {
        self.current_mode() == Mode::MetricsOnly
    }

    /// Number of enabled targets whose health is `Healthy` right now.
    fn count_healthy_enabled(&self) -> Result<usize, ModeEvaluationError> {
        let status = self.discovery.status();
        if status.is_failing() {
            return Err(ModeEvaluationError::DiscoveryUnavailable(
                status.last_error.unwrap_or_else(|| "refresh failed".to_string()),
            ));
        }
        let snapshot = self.discovery.snapshot();
        Ok(snapshot
            .iter()
            .filter(|t| t.enabled && self.health.is_healthy(&t.id))
            .count())
    }

    /// Re-evaluate the mode and transition if needed.
    ///
    /// Returns the transition event if the mode changed.
    pub fn check_mode_transition(&self) -> Option<ModeTransitionEvent> {
        let started = std::time::Instant::now();
        let counted = match catch_unwind(AssertUnwindSafe(|| self.count_healthy_enabled())) {
            Ok(result) => result,
            Err(panic) => Err(ModeEvaluationError::Panicked(panic_message(panic.as_ref()))),
        };

        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();

        let (target, reason) = match counted {
            Ok(count) => {
                if let Some((since, _)) = state.failing_since.take() {
                    info!(
                        failed_for_ms = now.duration_since(since).as_millis() as u64,
                        "Mode evaluation recovered"
                    );
                }
                state.healthy_enabled = count;
                let first = !state.evaluated;
                state.evaluated = true;
                let target = if count == 0 { Mode::MetricsOnly } else { Mode::Normal };
                let reason = match (first, count) {
                    (true, 0) => "initial evaluation: no healthy enabled targets".to_string(),
                    (true, n) => format!("initial evaluation: {n} healthy enabled targets"),
                    (false, 0) => "no healthy enabled targets".to_string(),
                    (false, n) => format!("{n} healthy enabled targets"),
                };
                (target, reason)
            }
            Err(e) => {
                self.metrics.mode_evaluation_errors_total.inc();
                let (since, _) = *state.failing_since.get_or_insert((now, Utc::now()));
                let failing_for = now.duration_since(since);
                if failing_for < self.config.error_grace {
                    debug!(
                        error = %e,
                        mode = %state.mode,
                        failing_for_ms = failing_for.as_millis() as u64,
                        "Mode evaluation failed, keeping last mode"
                    );
                    drop(state);
                    self.observe_check(started);
                    return None;
                }
                warn!(error = %e, failing_for_ms = failing_for.as_millis() as u64, "Mode evaluation failing past grace window");
                (
                    Mode::MetricsOnly,
                    format!("evaluation failing for {}s: {e}", failing_for.as_secs()),
                )
            }
        };

        let event = (target != state.mode).then(|| self.transition(&mut state, target, reason, now));
        drop(state);
        self.observe_check(started);
        event
    }

    /// Apply a transition. Caller holds the state lock, so transitions and
    /// subscriber notifications are globally ordered.
    fn transition(&self, state: &mut ModeState, to: Mode, reason: String, now: Instant) -> ModeTransitionEvent {
        let from = state.mode;
        let time_in_previous = now.duration_since(state.since);
        self.metrics
            .time_in_mode_seconds
            .with_label_values(&[from.as_str()])
            .observe(time_in_previous.as_secs_f64());

        let timestamp = Utc::now();
        state.mode = to;
        state.since = now;
        state.since_at = timestamp;
        state.transition_count += 1;
        state.last_reason = Some(reason.clone());
        state.last_transition_at = Some(timestamp);
        self.mode.store(to as u8, Ordering::Release);

        self.metrics.set_mode(to);
        self.metrics.mode_transitions_total.inc();

        match to {
            Mode::MetricsOnly => warn!(
                from = %from,
                to = %to,
                reason = %reason,
                time_in_previous_ms = time_in_previous.as_millis() as u64,
                "Entering MetricsOnly mode: alerts will be recorded but not delivered"
            ),
            Mode::Normal => info!(
                from = %from,
                to = %to,
                reason = %reason,
                time_in_previous_ms = time_in_previous.as_millis() as u64,
                "Publishing mode restored"
            ),
        }

        let event = ModeTransitionEvent {
            from,
            to,
            reason,
            timestamp,
            transition_count: state.transition_count,
        };

        // Unbounded sends never block; callbacks run on each subscriber's task.
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|_, tx| tx.send(event.clone()).is_ok());

        event
    }

    fn observe_check(&self, started: std::time::Instant) {
        self.metrics
            .mode_check_duration_seconds
            .observe(started.elapsed().as_secs_f64());
    }

    pub fn mode_metrics(&self) -> ModeMetrics {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        ModeMetrics {
            mode: state.mode,
            transition_count: state.transition_count,
            time_in_mode: state.since.elapsed(),
            mode_since: state.since_at,
            last_transition_reason: state.last_reason.clone(),
            last_transition_at: state.last_transition_at,
            healthy_enabled_targets: state.healthy_enabled,
            evaluated: state.evaluated,
            evaluation_failing_since: state.failing_since.map(|(_, at)| at),
        }
    }

    /// Register a callback for mode transitions.
    ///
    /// Each subscriber gets its own channel and task, so callbacks see
    /// transitions in order and a slow callback only delays itself. Must be
    /// called from within a Tokio runtime.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&ModeTransitionEvent) + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<ModeTransitionEvent>();
        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, tx);

        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                callback(&event);
            }
        });

        Subscription {
            id,
            subscribers: Arc::downgrade(&self.subscribers),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Evaluation loop. Returns when `cancel` fires.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut targets = self.discovery.subscribe();
        let mut health = self.health.subscribe();
        let mut ticker = tokio::time::interval(self.config.evaluation_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {}
                // Lagged receivers still trigger an evaluation, which reads
                // current state anyway.
                _ = targets.recv() => {}
                _ = health.recv() => {}
            }
            self.check_mode_transition();
        }

        info!(mode = %self.current_mode(), "Mode manager stopped");
    }
}

/// Handle returned by [`ModeManager::subscribe`]. Dropping it unsubscribes;
/// transitions already sent are still delivered.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    id: u64,
    subscribers: Weak<Subscribers>,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(subscribers) = self.subscribers.upgrade() {
            subscribers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&self.id);
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientRegistry;
    use crate::target::Provider;
    use crate::testing::Harness;
    use std::sync::atomic::AtomicUsize;

    struct Fixture {
        h: Harness,
        mode: Arc<ModeManager>,
    }

    impl Fixture {
        fn new(error_grace: Duration) -> Self {
            let h = Harness::new(ClientRegistry::new());
            let mode = Arc::new(ModeManager::new(
                Arc::clone(&h.discovery),
                Arc::clone(&h.health),
                ModeConfig {
                    evaluation_interval: Duration::from_secs(3600),
                    error_grace,
                },
                Arc::clone(&h.metrics),
            ));
            Self { h, mode }
        }

        async fn put(&self, name: &str, enabled: bool) {
            self.h.put(name, Provider::Webhook, enabled).await;
        }

        fn probe(&self, name: &str, ok: bool) {
            self.h.probe(name, ok);
        }
    }

    #[tokio::test]
    async fn test_starts_metrics_only_until_proven_healthy() {
        let f = Fixture::new(Duration::from_secs(30));
        assert!(f.mode.is_metrics_only());

        // Evaluated but nothing healthy: no transition.
        assert!(f.mode.check_mode_transition().is_none());
        assert!(f.mode.mode_metrics().evaluated);

        f.put("a", true).await;
        f.probe("a", true);
        let event = f.mode.check_mode_transition().unwrap();
        assert_eq!(event.from, Mode::MetricsOnly);
        assert_eq!(event.to, Mode::Normal);
        assert_eq!(event.transition_count, 1);
        assert_eq!(f.mode.current_mode(), Mode::Normal);
    }

    #[tokio::test]
    async fn test_disabled_and_unhealthy_targets_do_not_count() {
        let f = Fixture::new(Duration::from_secs(30));
        f.put("a", true).await;
        f.put("b", true).await;
        f.put("c", true).await;
        for name in ["a", "b", "c"] {
            f.probe(name, true);
        }
        f.mode.check_mode_transition();
        assert_eq!(f.mode.current_mode(), Mode::Normal);

        f.put("a", false).await;
        assert!(f.mode.check_mode_transition().is_none());
        assert_eq!(f.mode.mode_metrics().healthy_enabled_targets, 2);

        f.h.mark_unhealthy("b");
        f.h.mark_unhealthy("c");
        let event = f.mode.check_mode_transition().unwrap();
        assert_eq!(event.to, Mode::MetricsOnly);
        assert_eq!(event.reason, "no healthy enabled targets");

        let metrics = f.mode.mode_metrics();
        assert_eq!(metrics.transition_count, 2);
        assert_eq!(metrics.last_transition_reason.as_deref(), Some("no healthy enabled targets"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_discovery_errors_keep_mode_until_grace_expires() {
        let f = Fixture::new(Duration::from_secs(30));
        f.put("a", true).await;
        f.probe("a", true);
        f.mode.check_mode_transition();
        assert_eq!(f.mode.current_mode(), Mode::Normal);

        f.h.store.set_unreachable(true);
        assert!(f.h.discovery.refresh().await.is_err());
        assert!(f.mode.check_mode_transition().is_none());
        assert_eq!(f.mode.current_mode(), Mode::Normal);
        assert!(f.mode.mode_metrics().evaluation_failing_since.is_some());

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(f.mode.check_mode_transition().is_none());

        tokio::time::advance(Duration::from_secs(25)).await;
        let event = f.mode.check_mode_transition().unwrap();
        assert_eq!(event.to, Mode::MetricsOnly);
        assert!(event.reason.starts_with("evaluation failing"));

        // Recovery clears the failure window and restores Normal.
        f.h.store.set_unreachable(false);
        f.h.discovery.refresh().await.unwrap();
        let event = f.mode.check_mode_transition().unwrap();
        assert_eq!(event.to, Mode::Normal);
        assert!(f.mode.mode_metrics().evaluation_failing_since.is_none());
    }

    #[tokio::test]
    async fn test_subscribers_receive_transitions_in_order() {
        let f = Fixture::new(Duration::from_secs(30));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let subscription = f.mode.subscribe(move |event| {
            let _ = tx.send((event.to, event.transition_count));
        });
        assert_eq!(f.mode.subscriber_count(), 1);

        f.put("a", true).await;
        f.probe("a", true);
        f.mode.check_mode_transition();
        f.h.mark_unhealthy("a");
        f.mode.check_mode_transition();

        assert_eq!(rx.recv().await.unwrap(), (Mode::Normal, 1));
        assert_eq!(rx.recv().await.unwrap(), (Mode::MetricsOnly, 2));

        drop(subscription);
        assert_eq!(f.mode.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_slow_subscriber_does_not_block_evaluation() {
        let f = Fixture::new(Duration::from_secs(30));
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let _subscription = f.mode.subscribe(move |_| {
            std::thread::sleep(Duration::from_millis(20));
            counter.fetch_add(1, Ordering::SeqCst);
        });

        f.put("a", true).await;
        let started = std::time::Instant::now();
        for i in 0..5u64 {
            f.probe("a", true);
            f.mode.check_mode_transition();
            f.h.mark_unhealthy("a");
            f.mode.check_mode_transition();
            assert_eq!(f.mode.mode_metrics().transition_count, (i + 1) * 2);
        }
        assert!(started.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_reads_during_transitions() {
        let f = Fixture::new(Duration::from_secs(30));
        f.put("a", true).await;

        let mut readers = Vec::new();
        for _ in 0..64 {
            let mode = Arc::clone(&f.mode);
            readers.push(tokio::spawn(async move {
                let mut metrics_only = 0usize;
                for _ in 0..200 {
                    if mode.is_metrics_only() {
                        metrics_only += 1;
                    }
                    tokio::task::yield_now().await;
                }
                metrics_only
            }));
        }

        for _ in 0..50 {
            f.probe("a", true);
            f.mode.check_mode_transition();
            f.h.mark_unhealthy("a");
            f.mode.check_mode_transition();
        }

        for reader in readers {
            assert!(reader.await.unwrap() <= 200);
        }
        assert_eq!(f.mode.mode_metrics().transition_count, 100);
        assert!(f.mode.is_metrics_only());
    }

    #[test]
    fn test_panic_message_extraction() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn std::any::Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
    }
}

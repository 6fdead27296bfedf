//! # Publishing Queue
//!
//! Bounded job queue drained by a fixed pool of workers.
//!
//! - Intake: `submit_alert` never rejects because of the mode. It rejects only
//!   when the queue is full (per [`FullQueuePolicy`]), closed, or the alert is
//!   malformed.
//! - Workers check the mode under the queue lock when taking work and again
//!   before dispatch. In `MetricsOnly` they follow [`MetricsOnlyPolicy`];
//!   skipped jobs then follow [`SkippedJobPolicy`].
//! - Every job that leaves the queue produces exactly one [`JobReport`].

use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{FullQueuePolicy, MetricsOnlyPolicy, QueueConfig, SkippedJobPolicy};
use crate::coordinator::PublishCoordinator;
use crate::error::SubmitError;
use crate::job::{Alert, Disposition, JobReport, PublishJob, PublishOutcome, RenderedPayloads};
use crate::metrics::PublishingMetrics;
use crate::mode::{Mode, ModeManager, Subscription};
use crate::outcome::OutcomeSink;

/// Answer to an alert submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubmitResponse {
    pub alert_id: String,
    pub accepted: bool,
    pub queued: bool,
    /// Queue depth right after this submission.
    pub queue_depth: usize,
    /// Mode observed at submission time.
    pub mode: Mode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejected_reason: Option<SubmitError>,
}

/// Result of trying to take a job off the queue.
enum Take {
    Job { job: PublishJob, released: bool },
    Hold,
    Empty,
    Stop,
}

struct QueueInner {
    config: QueueConfig,
    jobs: Mutex<VecDeque<PublishJob>>,
    deferred: Mutex<Vec<PublishJob>>,
    /// Set under the `jobs` lock so no push can slip in after the final drain.
    closed: AtomicBool,
    work: Notify,
    space: Notify,
    mode: Arc<ModeManager>,
    coordinator: Arc<PublishCoordinator>,
    sink: Arc<dyn OutcomeSink>,
    metrics: Arc<PublishingMetrics>,
}

pub struct PublishingQueue {
    inner: Arc<QueueInner>,
    workers: Mutex<JoinSet<()>>,
    cancel: CancellationToken,
    recovery: Mutex<Option<Subscription>>,
}

impl PublishingQueue {
    pub fn new(
        config: QueueConfig,
        mode: Arc<ModeManager>,
        coordinator: Arc<PublishCoordinator>,
        sink: Arc<dyn OutcomeSink>,
        metrics: Arc<PublishingMetrics>,
    ) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                config,
                jobs: Mutex::new(VecDeque::new()),
                deferred: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
                work: Notify::new(),
                space: Notify::new(),
                mode,
                coordinator,
                sink,
                metrics,
            }),
            workers: Mutex::new(JoinSet::new()),
            cancel: CancellationToken::new(),
            recovery: Mutex::new(None),
        }
    }

    /// Spawn the worker pool. Must be called from within a Tokio runtime.
    pub fn start(&self) {
        let config = &self.inner.config;

        if let SkippedJobPolicy::RequeueOnRecovery { .. } = config.skipped_job_policy {
            let inner: Weak<QueueInner> = Arc::downgrade(&self.inner);
            let subscription = self.inner.mode.subscribe(move |event| {
                if event.to == Mode::Normal {
                    if let Some(inner) = inner.upgrade() {
                        inner.requeue_deferred();
                    }
                }
            });
            *self.recovery.lock().unwrap_or_else(PoisonError::into_inner) = Some(subscription);
        }

        let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        for index in 0..config.workers {
            let inner = Arc::clone(&self.inner);
            let cancel = self.cancel.child_token();
            workers.spawn(async move { inner.worker(index, cancel).await });
        }

        info!(
            workers = config.workers,
            capacity = config.capacity,
            full_policy = ?config.full_policy,
            metrics_only_policy = ?config.metrics_only_policy,
            skipped_job_policy = ?config.skipped_job_policy,
            "Publishing queue started"
        );
    }

    /// Accept an alert for delivery.
    pub async fn submit_alert(&self, alert: Alert, payloads: RenderedPayloads) -> SubmitResponse {
        let alert_id = alert.id.clone();
        let mode = self.inner.mode.current_mode();
        self.inner.metrics.submissions_total.inc();

        let result = if alert_id.trim().is_empty() {
            Err(SubmitError::Malformed)
        } else {
            self.submit_job(PublishJob::new(alert, payloads)).await
        };

        match result {
            Ok(depth) => {
                if mode == Mode::MetricsOnly {
                    self.inner.metrics.submissions_during_metrics_only_total.inc();
                }
                debug!(alert_id = %alert_id, queue_depth = depth, mode = %mode, "Alert queued");
                SubmitResponse {
                    alert_id,
                    accepted: true,
                    queued: true,
                    queue_depth: depth,
                    mode,
                    rejected_reason: None,
                }
            }
            Err(reason) => {
                self.inner
                    .metrics
                    .submissions_rejected_total
                    .with_label_values(&[reason.as_str()])
                    .inc();
                warn!(alert_id = %alert_id, reason = reason.as_str(), "Alert submission rejected");
                SubmitResponse {
                    alert_id,
                    accepted: false,
                    queued: false,
                    queue_depth: self.depth(),
                    mode,
                    rejected_reason: Some(reason),
                }
            }
        }
    }

    /// Enqueue a prepared job, applying the full-queue policy.
    ///
    /// Returns the queue depth after the push.
    pub async fn submit_job(&self, job: PublishJob) -> Result<usize, SubmitError> {
        match self.inner.config.full_policy {
            FullQueuePolicy::Reject => self.inner.try_push(job).map_err(|(_, e)| e),
            FullQueuePolicy::Block { timeout } => {
                let deadline = tokio::time::Instant::now() + timeout;
                let mut job = job;
                loop {
                    let space = self.inner.space.notified();
                    tokio::pin!(space);
                    space.as_mut().enable();

                    match self.inner.try_push(job) {
                        Ok(depth) => return Ok(depth),
                        Err((rejected, SubmitError::Backpressure)) => job = rejected,
                        Err((_, e)) => return Err(e),
                    }

                    if tokio::time::timeout_at(deadline, space).await.is_err() {
                        return Err(if self.inner.is_closed() {
                            SubmitError::Closed
                        } else {
                            SubmitError::Backpressure
                        });
                    }
                }
            }
        }
    }

    pub fn depth(&self) -> usize {
        self.inner.depth()
    }

    pub fn deferred_len(&self) -> usize {
        self.inner
            .deferred
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn capacity(&self) -> usize {
        self.inner.config.capacity
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Stop intake, let workers drain the queue for up to `drain_timeout`,
    /// then stop them and report whatever is left as abandoned.
    ///
    /// Returns the number of abandoned jobs.
    pub async fn shutdown(&self, drain_timeout: Duration) -> usize {
        self.inner.close();
        self.recovery
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let mut workers = std::mem::take(&mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner));
        let drained = tokio::time::timeout(drain_timeout, async {
            while workers.join_next().await.is_some() {}
        })
        .await
        .is_ok();

        if !drained {
            warn!(
                drain_timeout_ms = drain_timeout.as_millis() as u64,
                remaining = self.depth(),
                "Queue did not drain in time, stopping workers"
            );
            self.cancel.cancel();
            while workers.join_next().await.is_some() {}
        }
        self.cancel.cancel();

        let abandoned = self.inner.abandon_all();
        info!(abandoned, drained, "Publishing queue stopped");
        abandoned
    }
}

impl QueueInner {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn depth(&self) -> usize {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn close(&self) {
        {
            let _jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
            self.closed.store(true, Ordering::Release);
        }
        self.work.notify_waiters();
        self.space.notify_waiters();
    }

    fn try_push(&self, job: PublishJob) -> Result<usize, (PublishJob, SubmitError)> {
        let mut jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        if self.is_closed() {
            return Err((job, SubmitError::Closed));
        }
        if jobs.len() >= self.config.capacity {
            return Err((job, SubmitError::Backpressure));
        }
        jobs.push_back(job);
        let depth = jobs.len();
        drop(jobs);

        self.metrics.queue_depth.set(depth as i64);
        self.work.notify_one();
        Ok(depth)
    }

    /// Whether `Hold` applies right now: jobs stay queued while there is
    /// room. Called with the `jobs` lock held so the room check and the pop
    /// it guards are one step.
    fn hold_applies(&self) -> bool {
        self.config.metrics_only_policy == MetricsOnlyPolicy::Hold
            && self.mode.is_metrics_only()
            && !self.is_closed()
    }

    fn take(&self) -> Take {
        let mut jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        if jobs.is_empty() {
            return Take::Empty;
        }
        let hold = self.hold_applies();
        if hold && jobs.len() < self.config.capacity {
            return Take::Hold;
        }
        let Some(job) = jobs.pop_front() else {
            return Take::Empty;
        };
        let depth = jobs.len();
        drop(jobs);

        self.metrics.queue_depth.set(depth as i64);
        self.space.notify_one();
        Take::Job {
            job,
            released: hold,
        }
    }

    /// Put a job back at the head of the queue if `Hold` still applies and
    /// there is room for it.
    fn put_back(&self, job: PublishJob) -> Result<(), PublishJob> {
        let mut jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        if !self.hold_applies() || jobs.len() >= self.config.capacity {
            return Err(job);
        }
        jobs.push_front(job);
        let depth = jobs.len();
        drop(jobs);

        self.metrics.queue_depth.set(depth as i64);
        Ok(())
    }

    /// Next job, waiting for one if the queue is empty.
    async fn next_job(&self, cancel: &CancellationToken) -> Take {
        loop {
            let work = self.work.notified();
            tokio::pin!(work);
            work.as_mut().enable();

            match self.take() {
                Take::Empty => {}
                taken => return taken,
            }
            if self.is_closed() {
                return Take::Stop;
            }
            tokio::select! {
                () = cancel.cancelled() => return Take::Stop,
                () = work => {}
            }
        }
    }

    async fn worker(self: Arc<Self>, index: usize, cancel: CancellationToken) {
        debug!(worker = index, "Queue worker started");
        loop {
            if cancel.is_cancelled() {
                break;
            }

            let held = match self.next_job(&cancel).await {
                Take::Job { job, released } => self.process(job, released, &cancel).await,
                Take::Hold => true,
                Take::Empty | Take::Stop => break,
            };

            if held {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(self.config.metrics_only_backoff) => {}
                }
            }
        }
        debug!(worker = index, "Queue worker stopped");
    }

    /// Returns true when the job went back to the queue under `Hold`.
    ///
    /// `released` marks a job taken only because the queue was full in
    /// `MetricsOnly`; it is skipped rather than held again.
    async fn process(&self, job: PublishJob, released: bool, cancel: &CancellationToken) -> bool {
        if self.mode.is_metrics_only() {
            let job = if released {
                job
            } else {
                match self.put_back(job) {
                    Ok(()) => return true,
                    Err(job) => job,
                }
            };
            let outcome = PublishOutcome::skipped(&job.alert.id, job.attempt);
            self.skip(&job, outcome);
            return false;
        }

        match self.coordinator.publish(&job, cancel).await {
            // The target set emptied between the mode check and dispatch.
            Ok(outcome) if outcome.skipped_due_to_mode => self.skip(&job, outcome),
            Ok(outcome) => self.report(&job, Disposition::Dispatched, outcome, None),
            Err(e) => {
                warn!(alert_id = %job.alert.id, error = %e, "Job rejected by coordinator");
                let outcome = PublishOutcome::from_results(&job.alert.id, job.attempt, Vec::new());
                self.report(&job, Disposition::Rejected, outcome, Some(e.to_string()));
            }
        }
        false
    }

    fn skip(&self, job: &PublishJob, outcome: PublishOutcome) {
        self.metrics.jobs_skipped_total.inc();

        match self.config.skipped_job_policy {
            SkippedJobPolicy::Record => {
                debug!(alert_id = %job.alert.id, attempt = job.attempt, "Job skipped: MetricsOnly mode");
                self.report(job, Disposition::SkippedDueToMode, outcome, None);
            }
            SkippedJobPolicy::RequeueOnRecovery { max_deferred } => {
                let refused = {
                    let mut deferred = self.deferred.lock().unwrap_or_else(PoisonError::into_inner);
                    if self.is_closed() {
                        Some("queue closed".to_string())
                    } else if deferred.len() >= max_deferred {
                        Some(format!("deferred list full ({max_deferred})"))
                    } else {
                        deferred.push(job.clone());
                        None
                    }
                };
                match refused {
                    None => {
                        debug!(alert_id = %job.alert.id, attempt = job.attempt, "Job deferred until recovery");
                        // The recovery that would requeue this job may already
                        // have run. Re-evaluate so a stale skip either flips
                        // the mode or requeues now. Requeue only when targets
                        // resolve, or a job skipped for lack of targets would
                        // cycle while the mode is held through a discovery
                        // outage.
                        self.mode.check_mode_transition();
                        let recovered = !self.mode.is_metrics_only()
                            && !self.coordinator.resolve_targets().is_empty();
                        self.report(job, Disposition::Deferred, outcome, None);
                        if recovered {
                            self.requeue_deferred();
                        }
                    }
                    Some(reason) => self.report(job, Disposition::SkippedDueToMode, outcome, Some(reason)),
                }
            }
        }
    }

    /// Queue deferred jobs again as new attempts. Jobs that do not fit stay
    /// deferred for the next recovery.
    fn requeue_deferred(&self) {
        let parked = std::mem::take(&mut *self.deferred.lock().unwrap_or_else(PoisonError::into_inner));
        if parked.is_empty() {
            return;
        }

        let total = parked.len();
        let mut requeued = 0usize;
        let mut leftover = Vec::new();
        for job in parked {
            match self.try_push(job.retry()) {
                Ok(_) => requeued += 1,
                Err(_) => leftover.push(job),
            }
        }

        if !leftover.is_empty() {
            self.deferred
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .extend(leftover);
        }
        self.metrics.jobs_requeued_total.inc_by(requeued as u64);
        info!(requeued, total, "Re-queued deferred jobs after recovery");
    }

    fn abandon_all(&self) -> usize {
        let queued: Vec<PublishJob> = self
            .jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        let deferred: Vec<PublishJob> =
            std::mem::take(&mut *self.deferred.lock().unwrap_or_else(PoisonError::into_inner));
        self.metrics.queue_depth.set(0);

        let count = queued.len() + deferred.len();
        for job in queued.into_iter().chain(deferred) {
            let outcome = PublishOutcome::from_results(&job.alert.id, job.attempt, Vec::new());
            self.report(&job, Disposition::Abandoned, outcome, Some("queue shut down".to_string()));
        }
        count
    }

    fn report(
        &self,
        job: &PublishJob,
        disposition: Disposition,
        outcome: PublishOutcome,
        error: Option<String>,
    ) {
        self.sink.record(JobReport {
            alert_id: job.alert.id.clone(),
            attempt: job.attempt,
            disposition,
            outcome,
            error,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientRegistry;
    use crate::config::{CoordinatorConfig, ModeConfig};
    use crate::outcome::InMemoryOutcomeLog;
    use crate::target::Provider;
    use crate::testing::{Harness, ScriptedClient};

    struct Fixture {
        h: Harness,
        mode: Arc<ModeManager>,
        log: Arc<InMemoryOutcomeLog>,
        queue: PublishingQueue,
        client: Arc<ScriptedClient>,
    }

    impl Fixture {
        fn new(config: QueueConfig) -> Self {
            let client = ScriptedClient::new(Provider::Webhook);
            let h = Harness::new(ClientRegistry::new());
            let mode = Arc::new(ModeManager::new(
                Arc::clone(&h.discovery),
                Arc::clone(&h.health),
                ModeConfig::default(),
                Arc::clone(&h.metrics),
            ));
            let coordinator = Arc::new(PublishCoordinator::new(
                Arc::clone(&h.discovery),
                Arc::clone(&h.health),
                ClientRegistry::new().with(client.clone()),
                CoordinatorConfig::default(),
                Arc::clone(&h.metrics),
            ));
            let log = Arc::new(InMemoryOutcomeLog::new(256));
            let queue = PublishingQueue::new(
                config,
                Arc::clone(&mode),
                coordinator,
                Arc::clone(&log) as Arc<dyn OutcomeSink>,
                Arc::clone(&h.metrics),
            );
            Self {
                h,
                mode,
                log,
                queue,
                client,
            }
        }

        async fn go_normal(&self) {
            self.h.put("a", Provider::Webhook, true).await;
            self.h.probe("a", true);
            self.mode.check_mode_transition();
            assert_eq!(self.mode.current_mode(), Mode::Normal);
        }

        fn go_metrics_only(&self) {
            self.h.mark_unhealthy("a");
            self.mode.check_mode_transition();
            assert!(self.mode.is_metrics_only());
        }

        async fn submit(&self, id: &str) -> SubmitResponse {
            let payloads = RenderedPayloads::from([(Provider::Webhook, serde_json::json!({"text": id}))]);
            self.queue.submit_alert(Alert::new(id), payloads).await
        }

        async fn wait_for(&self, count: u64) {
            tokio::time::timeout(Duration::from_secs(5), self.log.wait_for_total(count))
                .await
                .unwrap();
        }
    }

    fn config(capacity: usize, workers: usize) -> QueueConfig {
        QueueConfig {
            capacity,
            workers,
            metrics_only_backoff: Duration::from_millis(10),
            ..QueueConfig::default()
        }
    }

    #[tokio::test]
    async fn test_full_queue_rejects_with_backpressure() {
        let f = Fixture::new(config(2, 1));
        // Workers not started: nothing drains.
        assert!(f.submit("a1").await.accepted);
        assert!(f.submit("a2").await.accepted);

        let rejected = f.submit("a3").await;
        assert!(!rejected.accepted);
        assert!(!rejected.queued);
        assert_eq!(rejected.rejected_reason, Some(SubmitError::Backpressure));
        assert_eq!(
            f.h.metrics
                .submissions_rejected_total
                .with_label_values(&["backpressure"])
                .get(),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_block_policy_waits_then_rejects() {
        let f = Fixture::new(QueueConfig {
            full_policy: FullQueuePolicy::Block {
                timeout: Duration::from_millis(200),
            },
            ..config(1, 1)
        });
        assert!(f.submit("a1").await.accepted);

        let started = tokio::time::Instant::now();
        let rejected = f.submit("a2").await;
        assert_eq!(rejected.rejected_reason, Some(SubmitError::Backpressure));
        assert!(started.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_block_policy_succeeds_when_space_frees() {
        let f = Fixture::new(QueueConfig {
            full_policy: FullQueuePolicy::Block {
                timeout: Duration::from_secs(5),
            },
            ..config(1, 1)
        });
        f.go_normal().await;
        assert!(f.submit("a1").await.accepted);

        let queue = &f.queue;
        let (second, ()) = tokio::join!(f.submit("a2"), async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            queue.start();
        });
        assert!(second.accepted);
        f.wait_for(2).await;
    }

    #[tokio::test]
    async fn test_metrics_only_accepts_and_records_skip() {
        let f = Fixture::new(QueueConfig {
            metrics_only_policy: MetricsOnlyPolicy::Skip,
            ..config(8, 2)
        });
        f.queue.start();

        let response = f.submit("a1").await;
        assert!(response.accepted);
        assert_eq!(response.mode, Mode::MetricsOnly);

        f.wait_for(1).await;
        let report = &f.log.for_alert("a1")[0];
        assert_eq!(report.disposition, Disposition::SkippedDueToMode);
        assert!(report.outcome.skipped_due_to_mode);
        assert_eq!(f.client.sends.load(Ordering::SeqCst), 0);
        assert_eq!(f.h.metrics.jobs_skipped_total.get(), 1);
        assert_eq!(f.h.metrics.submissions_during_metrics_only_total.get(), 1);
    }

    #[tokio::test]
    async fn test_hold_policy_keeps_jobs_until_recovery() {
        let f = Fixture::new(config(8, 2));
        f.h.put("a", Provider::Webhook, true).await;
        f.queue.start();

        assert!(f.submit("a1").await.accepted);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(f.queue.depth(), 1);
        assert_eq!(f.log.total(), 0);

        f.h.probe("a", true);
        f.mode.check_mode_transition();
        f.wait_for(1).await;

        let report = &f.log.for_alert("a1")[0];
        assert_eq!(report.disposition, Disposition::Dispatched);
        assert_eq!(report.outcome.succeeded, 1);
    }

    #[tokio::test]
    async fn test_hold_policy_skips_once_queue_is_full() {
        let f = Fixture::new(config(2, 1));
        f.queue.start();

        assert!(f.submit("a1").await.accepted);
        assert!(f.submit("a2").await.accepted);

        // Full: the oldest job is taken and skipped so intake keeps moving.
        f.wait_for(1).await;
        assert_eq!(f.log.recent(1)[0].alert_id, "a1");
        assert_eq!(f.log.recent(1)[0].disposition, Disposition::SkippedDueToMode);
        assert_eq!(f.queue.depth(), 1);
    }

    #[tokio::test]
    async fn test_idle_worker_holds_job_submitted_after_mode_drop() {
        let f = Fixture::new(config(8, 1));
        f.go_normal().await;
        f.queue.start();
        // The worker is parked waiting for work while the mode is Normal.
        tokio::time::sleep(Duration::from_millis(30)).await;
        f.go_metrics_only();

        assert!(f.submit("held").await.accepted);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(f.queue.depth(), 1);
        assert_eq!(f.log.total(), 0);

        f.h.probe("a", true);
        f.mode.check_mode_transition();
        f.wait_for(1).await;
        let report = &f.log.for_alert("held")[0];
        assert_eq!(report.disposition, Disposition::Dispatched);
        assert_eq!(report.attempt, 1);
    }

    #[tokio::test]
    async fn test_full_queue_under_hold_releases_one_job_at_a_time() {
        let f = Fixture::new(config(4, 3));
        for i in 0..4 {
            assert!(f.submit(&format!("a{i}")).await.accepted);
        }
        f.queue.start();

        f.wait_for(1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(f.log.total(), 1);
        assert_eq!(f.log.recent(1)[0].alert_id, "a0");
        assert_eq!(f.queue.depth(), 3);
    }

    #[tokio::test]
    async fn test_job_deferred_after_recovery_is_requeued() {
        let f = Fixture::new(QueueConfig {
            skipped_job_policy: SkippedJobPolicy::RequeueOnRecovery { max_deferred: 8 },
            ..config(8, 1)
        });
        f.go_normal().await;
        f.queue.start();

        // A worker that saw MetricsOnly parks its job only after the recovery
        // requeue has already run.
        let payloads = RenderedPayloads::from([(Provider::Webhook, serde_json::json!({"text": "late"}))]);
        let job = PublishJob::new(Alert::new("late"), payloads);
        f.queue.inner.skip(&job, PublishOutcome::skipped("late", job.attempt));

        f.wait_for(2).await;
        let reports = f.log.for_alert("late");
        assert_eq!(reports[0].disposition, Disposition::Deferred);
        assert_eq!(reports[1].disposition, Disposition::Dispatched);
        assert_eq!(reports[1].attempt, 2);
        assert_eq!(f.queue.deferred_len(), 0);
    }

    #[tokio::test]
    async fn test_stale_normal_mode_defers_and_reevaluates() {
        let f = Fixture::new(QueueConfig {
            skipped_job_policy: SkippedJobPolicy::RequeueOnRecovery { max_deferred: 8 },
            ..config(8, 1)
        });
        f.go_normal().await;
        // Unhealthy, but the manager has not re-evaluated yet.
        f.h.mark_unhealthy("a");
        f.queue.start();

        f.submit("a1").await;
        f.wait_for(1).await;
        assert_eq!(f.log.for_alert("a1")[0].disposition, Disposition::Deferred);
        assert!(f.mode.is_metrics_only());
        assert_eq!(f.queue.deferred_len(), 1);

        f.h.probe("a", true);
        f.mode.check_mode_transition();
        f.wait_for(2).await;
        let retried = &f.log.for_alert("a1")[1];
        assert_eq!(retried.disposition, Disposition::Dispatched);
        assert_eq!(retried.attempt, 2);
    }

    #[tokio::test]
    async fn test_requeue_on_recovery_policy() {
        let f = Fixture::new(QueueConfig {
            metrics_only_policy: MetricsOnlyPolicy::Skip,
            skipped_job_policy: SkippedJobPolicy::RequeueOnRecovery { max_deferred: 1 },
            ..config(8, 1)
        });
        f.h.put("a", Provider::Webhook, true).await;
        f.queue.start();

        f.submit("a1").await;
        f.submit("a2").await;
        f.wait_for(2).await;
        assert_eq!(f.queue.deferred_len(), 1);
        assert_eq!(f.log.for_alert("a1")[0].disposition, Disposition::Deferred);
        let overflow = &f.log.for_alert("a2")[0];
        assert_eq!(overflow.disposition, Disposition::SkippedDueToMode);
        assert!(overflow.error.is_some());

        f.h.probe("a", true);
        f.mode.check_mode_transition();
        f.wait_for(3).await;

        let retried = f.log.for_alert("a1");
        assert_eq!(retried.len(), 2);
        assert_eq!(retried[1].attempt, 2);
        assert_eq!(retried[1].disposition, Disposition::Dispatched);
        assert_eq!(f.h.metrics.jobs_requeued_total.get(), 1);
    }

    #[tokio::test]
    async fn test_normal_mode_dispatches() {
        let f = Fixture::new(config(8, 4));
        f.go_normal().await;
        f.queue.start();

        for i in 0..10 {
            assert!(f.submit(&format!("a{i}")).await.accepted);
        }
        f.wait_for(10).await;
        assert!(f
            .log
            .recent(10)
            .iter()
            .all(|r| r.disposition == Disposition::Dispatched));
        assert_eq!(f.client.sends.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn test_mode_flip_after_dequeue_still_reports_skip() {
        let f = Fixture::new(config(8, 1));
        f.go_normal().await;
        f.go_metrics_only();
        // Back to Normal in the manager's view, but the target is unhealthy
        // again by the time the coordinator resolves it.
        f.h.probe("a", true);
        f.mode.check_mode_transition();
        f.h.mark_unhealthy("a");

        f.queue.start();
        f.submit("a1").await;
        f.wait_for(1).await;
        assert!(f.log.for_alert("a1")[0].outcome.skipped_due_to_mode);
    }

    #[tokio::test]
    async fn test_shutdown_drains_held_jobs_as_skipped() {
        let f = Fixture::new(QueueConfig {
            skipped_job_policy: SkippedJobPolicy::RequeueOnRecovery { max_deferred: 8 },
            ..config(8, 1)
        });
        // Hold policy in MetricsOnly: jobs stay queued.
        f.queue.start();
        f.submit("a1").await;
        f.submit("a2").await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(f.queue.depth(), 2);

        // Closing turns Hold into skip; nothing is parked once closed.
        let abandoned = f.queue.shutdown(Duration::from_secs(2)).await;
        assert_eq!(abandoned, 0);
        assert_eq!(f.log.total(), 2);
        for id in ["a1", "a2"] {
            let report = &f.log.for_alert(id)[0];
            assert_eq!(report.disposition, Disposition::SkippedDueToMode);
            assert_eq!(report.error.as_deref(), Some("queue closed"));
        }

        let rejected = f.submit("a3").await;
        assert_eq!(rejected.rejected_reason, Some(SubmitError::Closed));
    }

    #[tokio::test]
    async fn test_shutdown_without_workers_abandons_queued_jobs() {
        let f = Fixture::new(config(8, 1));
        f.submit("a1").await;
        f.submit("a2").await;

        let abandoned = f.queue.shutdown(Duration::from_millis(10)).await;
        assert_eq!(abandoned, 2);
        assert!(f
            .log
            .recent(2)
            .iter()
            .all(|r| r.disposition == Disposition::Abandoned));
        assert_eq!(f.queue.depth(), 0);
    }

    #[tokio::test]
    async fn test_malformed_alert_rejected_at_intake() {
        let f = Fixture::new(config(8, 1));
        let response = f.submit("").await;
        assert_eq!(response.rejected_reason, Some(SubmitError::Malformed));
    }
}

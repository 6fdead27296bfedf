//! Where job reports go once a job leaves the queue.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use tokio::sync::Notify;

use crate::job::JobReport;

/// Receives one [`JobReport`] for every job that leaves the queue.
///
/// Implementations must not block; they are called from queue workers.
pub trait OutcomeSink: Send + Sync {
    fn record(&self, report: JobReport);
}

/// Bounded in-memory log of recent reports, oldest evicted first.
pub struct InMemoryOutcomeLog {
    capacity: usize,
    entries: Mutex<VecDeque<JobReport>>,
    total: AtomicU64,
    recorded: Notify,
}

impl InMemoryOutcomeLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(VecDeque::new()),
            total: AtomicU64::new(0),
            recorded: Notify::new(),
        }
    }

    /// Up to `limit` reports, newest first.
    pub fn recent(&self, limit: usize) -> Vec<JobReport> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    /// Retained reports for one alert, oldest first.
    pub fn for_alert(&self, alert_id: &str) -> Vec<JobReport> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|r| r.alert_id == alert_id)
            .cloned()
            .collect()
    }

    /// Reports recorded since startup, including evicted ones.
    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Acquire)
    }

    /// Wait until at least `count` reports have been recorded.
    pub async fn wait_for_total(&self, count: u64) {
        loop {
            let notified = self.recorded.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.total() >= count {
                return;
            }
            notified.await;
        }
    }
}

impl OutcomeSink for InMemoryOutcomeLog {
    fn record(&self, report: JobReport) {
        {
            let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            if entries.len() == self.capacity {
                entries.pop_front();
            }
            entries.push_back(report);
        }
        self.total.fetch_add(1, Ordering::AcqRel);
        self.recorded.notify_waiters();
    }
}

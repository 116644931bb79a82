//! Per-job progress for polling clients.
//!
//! Snapshots are appended to a [`ProgressStore`], never edited, so the last
//! record is what a client sees even after a restart or from another
//! instance. The tracker keeps the timing state (moving average per item)
//! of the jobs running here and writes a new snapshot on every change.

use crate::error::StoreError;
use crate::{chrono_duration, JobId, JobStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

const EMA_ALPHA: f64 = 0.3;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressRecord {
    pub job_id: JobId,
    pub percent_complete: f32,
    pub current_item: Option<String>,
    pub message: String,
    pub updated_at: DateTime<Utc>,
    pub eta_seconds: Option<u64>,
    pub total_items: usize,
    pub completed_items: usize,
    pub terminal: bool,
    pub expires_at: Option<DateTime<Utc>>,
}

impl ProgressRecord {
    fn new(job_id: JobId, total_items: usize, now: DateTime<Utc>) -> Self {
        ProgressRecord {
            job_id,
            percent_complete: 0.0,
            current_item: None,
            message: String::new(),
            updated_at: now,
            eta_seconds: None,
            total_items,
            completed_items: 0,
            terminal: false,
            expires_at: None,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.terminal && self.expires_at.map(|at| at <= now).unwrap_or(false)
    }
}

/// Where progress snapshots live.
#[async_trait]
pub trait ProgressStore: Send + Sync {
    async fn append(&self, record: &ProgressRecord) -> Result<(), StoreError>;

    /// The most recent snapshot of a job.
    async fn latest(&self, job_id: JobId) -> Result<Option<ProgressRecord>, StoreError>;

    /// Drops every snapshot of jobs whose terminal record has expired.
    /// Returns the number of jobs dropped.
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError>;
}

/// Keeps snapshots in process memory.
#[derive(Default)]
pub struct MemoryProgressStore {
    records: RwLock<HashMap<JobId, Vec<ProgressRecord>>>,
}

impl MemoryProgressStore {
    pub fn history(&self, job_id: JobId) -> Vec<ProgressRecord> {
        self.records.read().get(&job_id).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl ProgressStore for MemoryProgressStore {
    async fn append(&self, record: &ProgressRecord) -> Result<(), StoreError> {
        self.records
            .write()
            .entry(record.job_id)
            .or_default()
            .push(record.clone());
        Ok(())
    }

    async fn latest(&self, job_id: JobId) -> Result<Option<ProgressRecord>, StoreError> {
        Ok(self.records.read().get(&job_id).and_then(|h| h.last().cloned()))
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut records = self.records.write();
        let before = records.len();
        records.retain(|_, history| !history.last().map(|r| r.is_expired(now)).unwrap_or(false));
        Ok(before - records.len())
    }
}

#[derive(Debug, Clone)]
pub struct Retention {
    /// Completed and failed jobs.
    pub finished: Duration,
    pub cancelled: Duration,
}

impl Default for Retention {
    fn default() -> Self {
        Retention {
            finished: Duration::from_secs(24 * 60 * 60),
            cancelled: Duration::ZERO,
        }
    }
}

impl Retention {
    pub fn for_status(&self, status: JobStatus) -> Duration {
        match status {
            JobStatus::Cancelled => self.cancelled,
            _ => self.finished,
        }
    }
}

struct Entry {
    record: ProgressRecord,
    item_started: Instant,
    avg_item_secs: Option<f64>,
}

impl Entry {
    /// Picks up a job whose last snapshot was written elsewhere.
    fn resume(record: ProgressRecord) -> Self {
        let remaining = record.total_items.saturating_sub(record.completed_items);
        let avg_item_secs = match record.eta_seconds {
            Some(eta) if remaining > 0 => Some(eta as f64 / remaining as f64),
            _ => None,
        };
        Entry {
            record,
            item_started: Instant::now(),
            avg_item_secs,
        }
    }
}

pub struct ProgressTracker {
    store: Arc<dyn ProgressStore>,
    entries: Mutex<HashMap<JobId, Entry>>,
    retention: Retention,
}

impl Default for ProgressTracker {
    fn default() -> Self {
        ProgressTracker::new(Arc::new(MemoryProgressStore::default()), Retention::default())
    }
}

impl ProgressTracker {
    pub fn new(store: Arc<dyn ProgressStore>, retention: Retention) -> Self {
        ProgressTracker {
            store,
            entries: Mutex::default(),
            retention,
        }
    }

    pub fn retention(&self) -> &Retention {
        &self.retention
    }

    /// Applies `change` to the job's snapshot and appends the result. A job
    /// not tracked here is resumed from its last stored snapshot; with no
    /// snapshot at all it is created only when `create` carries a total.
    /// Progress is advisory, so store errors are logged and dropped.
    async fn update<F>(&self, job_id: JobId, create: Option<usize>, change: F)
    where
        F: FnOnce(&mut Entry, DateTime<Utc>) -> bool,
    {
        if !self.entries.lock().contains_key(&job_id) {
            let stored = match self.store.latest(job_id).await {
                Ok(stored) => stored,
                Err(err) => {
                    warn!(job_id = %job_id, error = %err, "Could not load progress");
                    None
                }
            };
            let entry = match (stored, create) {
                (Some(record), _) => Entry::resume(record),
                (None, Some(total)) => Entry {
                    record: ProgressRecord::new(job_id, total, Utc::now()),
                    item_started: Instant::now(),
                    avg_item_secs: None,
                },
                (None, None) => return,
            };
            self.entries.lock().entry(job_id).or_insert(entry);
        }

        let record = {
            let mut entries = self.entries.lock();
            let Some(entry) = entries.get_mut(&job_id) else {
                return;
            };
            let changed = change(entry, Utc::now());
            let record = entry.record.clone();
            if record.terminal {
                entries.remove(&job_id);
            }
            if !changed {
                return;
            }
            record
        };

        if let Err(err) = self.store.append(&record).await {
            warn!(job_id = %job_id, error = %err, "Could not record progress");
        }
    }

    /// Starts (or restarts, on a retry) tracking a job. A restarted job keeps
    /// the percentage it had already reported.
    pub async fn start(&self, job_id: JobId, total_items: usize) {
        self.update(job_id, Some(total_items), |entry, now| {
            let record = &mut entry.record;
            record.message = if record.completed_items > 0 || record.percent_complete > 0.0 {
                "Retrying analysis".to_string()
            } else {
                "Starting analysis".to_string()
            };
            record.total_items = total_items;
            record.completed_items = 0;
            record.current_item = None;
            record.terminal = false;
            record.expires_at = None;
            record.updated_at = now;
            record.eta_seconds = entry
                .avg_item_secs
                .map(|avg| (avg * total_items as f64).round() as u64);
            entry.item_started = Instant::now();
            true
        })
        .await
    }

    /// Marks `item_id` as the subject currently being analyzed.
    pub async fn begin_item(&self, job_id: JobId, item_id: &str) {
        self.update(job_id, None, |entry, now| {
            if entry.record.terminal {
                return false;
            }
            entry.record.current_item = Some(item_id.to_string());
            entry.record.message = format!("Analyzing {item_id}");
            entry.record.updated_at = now;
            entry.item_started = Instant::now();
            true
        })
        .await
    }

    /// Records that `item_id` finished (successfully or not).
    pub async fn advance(&self, job_id: JobId, item_id: &str, message: impl Into<String>) {
        let message = message.into();
        self.update(job_id, None, |entry, now| {
            if entry.record.terminal {
                return false;
            }

            let elapsed = entry.item_started.elapsed().as_secs_f64();
            let avg = match entry.avg_item_secs {
                Some(avg) => EMA_ALPHA * elapsed + (1.0 - EMA_ALPHA) * avg,
                None => elapsed,
            };
            entry.avg_item_secs = Some(avg);
            entry.item_started = Instant::now();

            let record = &mut entry.record;
            record.completed_items = (record.completed_items + 1).min(record.total_items);
            let percent = if record.total_items == 0 {
                100.0
            } else {
                record.completed_items as f32 / record.total_items as f32 * 100.0
            };
            record.percent_complete = record.percent_complete.max(percent);
            let remaining = record.total_items - record.completed_items;
            record.eta_seconds = Some((avg * remaining as f64).round() as u64);
            record.current_item = Some(item_id.to_string());
            record.message = message;
            record.updated_at = now;
            true
        })
        .await
    }

    pub async fn set_message(&self, job_id: JobId, message: impl Into<String>) {
        let message = message.into();
        self.update(job_id, None, |entry, now| {
            if entry.record.terminal {
                return false;
            }
            entry.record.message = message;
            entry.record.updated_at = now;
            true
        })
        .await
    }

    /// Marks the record terminal and schedules it for cleanup. Jobs that
    /// never started (a queued job cancelled or reclaimed into failure) get a
    /// record so the final state is still visible.
    pub async fn finish(&self, job_id: JobId, status: JobStatus, message: impl Into<String>) {
        let message = message.into();
        let retention = self.retention.for_status(status);
        self.update(job_id, Some(0), |entry, now| {
            let record = &mut entry.record;
            if status == JobStatus::Completed {
                record.percent_complete = 100.0;
            }
            record.terminal = true;
            record.eta_seconds = Some(0);
            record.message = message;
            record.updated_at = now;
            record.expires_at = Some(now + chrono_duration(retention));
            true
        })
        .await
    }

    pub async fn get_status(&self, job_id: JobId) -> Result<Option<ProgressRecord>, StoreError> {
        self.store.latest(job_id).await
    }

    /// Drops terminal records whose retention has passed.
    pub async fn purge_expired(&self) -> Result<usize, StoreError> {
        self.store.purge_expired(Utc::now()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    async fn percent(tracker: &ProgressTracker, job_id: JobId) -> f32 {
        tracker.get_status(job_id).await.unwrap().unwrap().percent_complete
    }

    #[tokio::test]
    async fn percent_tracks_completed_items() {
        let tracker = ProgressTracker::default();
        let job_id = Uuid::new_v4();
        tracker.start(job_id, 4).await;
        assert_eq!(percent(&tracker, job_id).await, 0.0);

        tracker.begin_item(job_id, "a").await;
        let status = tracker.get_status(job_id).await.unwrap().unwrap();
        assert_eq!(status.current_item.as_deref(), Some("a"));

        tracker.advance(job_id, "a", "a done").await;
        let status = tracker.get_status(job_id).await.unwrap().unwrap();
        assert_eq!(status.percent_complete, 25.0);
        assert_eq!(status.completed_items, 1);
        assert_eq!(status.message, "a done");
        assert!(status.eta_seconds.is_some());
    }

    #[tokio::test]
    async fn percent_never_decreases_across_a_retry() {
        let tracker = ProgressTracker::default();
        let job_id = Uuid::new_v4();
        tracker.start(job_id, 2).await;
        tracker.advance(job_id, "a", "a done").await;
        let mut last = percent(&tracker, job_id).await;

        tracker.start(job_id, 2).await;
        for item in ["a", "b"] {
            let now = percent(&tracker, job_id).await;
            assert!(now >= last);
            last = now;
            tracker.advance(job_id, item, "done").await;
        }
        assert_eq!(percent(&tracker, job_id).await, 100.0);
    }

    #[tokio::test]
    async fn eta_uses_moving_average() {
        let tracker = ProgressTracker::default();
        let job_id = Uuid::new_v4();
        tracker.start(job_id, 3).await;
        if let Some(entry) = tracker.entries.lock().get_mut(&job_id) {
            entry.item_started = Instant::now() - Duration::from_secs(10);
        }
        tracker.advance(job_id, "a", "a done").await;
        let eta = |r: Option<ProgressRecord>| r.and_then(|r| r.eta_seconds);
        assert_eq!(eta(tracker.get_status(job_id).await.unwrap()), Some(20));

        tracker.advance(job_id, "b", "b done").await;
        // 0.3 * ~0s + 0.7 * 10s, one item left
        assert_eq!(eta(tracker.get_status(job_id).await.unwrap()), Some(7));
    }

    #[tokio::test]
    async fn finished_records_expire_by_status() {
        let tracker = ProgressTracker::new(
            Arc::new(MemoryProgressStore::default()),
            Retention {
                finished: Duration::from_secs(3600),
                cancelled: Duration::ZERO,
            },
        );
        let done = Uuid::new_v4();
        let cancelled = Uuid::new_v4();
        tracker.start(done, 1).await;
        tracker.start(cancelled, 1).await;
        tracker.finish(done, JobStatus::Completed, "done").await;
        tracker.finish(cancelled, JobStatus::Cancelled, "cancelled").await;

        let status = tracker.get_status(done).await.unwrap().unwrap();
        assert!(status.terminal);
        assert_eq!(status.percent_complete, 100.0);
        assert_eq!(tracker.purge_expired().await.unwrap(), 1);
        assert!(tracker.get_status(cancelled).await.unwrap().is_none());
        assert!(tracker.get_status(done).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn advance_after_finish_is_ignored() {
        let tracker = ProgressTracker::default();
        let job_id = Uuid::new_v4();
        tracker.start(job_id, 2).await;
        tracker.finish(job_id, JobStatus::Failed, "failed").await;
        tracker.advance(job_id, "a", "late").await;
        let status = tracker.get_status(job_id).await.unwrap().unwrap();
        assert_eq!(status.message, "failed");
        assert_eq!(status.percent_complete, 0.0);
        assert!(tracker.entries.lock().is_empty());
    }

    #[tokio::test]
    async fn snapshots_are_appended_and_outlive_the_tracker() {
        let store = Arc::new(MemoryProgressStore::default());
        let job_id = Uuid::new_v4();
        {
            let tracker = ProgressTracker::new(store.clone(), Retention::default());
            tracker.start(job_id, 2).await;
            tracker.begin_item(job_id, "a").await;
            tracker.advance(job_id, "a", "a done").await;
        }

        let history = store.history(job_id);
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].percent_complete, 0.0);
        assert_eq!(history[2].percent_complete, 50.0);

        // Another instance picks the job up where the last snapshot left it.
        let tracker = ProgressTracker::new(store.clone(), Retention::default());
        let status = tracker.get_status(job_id).await.unwrap().unwrap();
        assert_eq!(status.completed_items, 1);
        tracker.start(job_id, 2).await;
        assert_eq!(percent(&tracker, job_id).await, 50.0);
        assert_eq!(store.history(job_id).len(), 4);
    }

    #[tokio::test]
    async fn updates_for_unknown_jobs_are_dropped() {
        let store = Arc::new(MemoryProgressStore::default());
        let tracker = ProgressTracker::new(store.clone(), Retention::default());
        let job_id = Uuid::new_v4();
        tracker.set_message(job_id, "Worker lost, retrying").await;
        assert!(tracker.get_status(job_id).await.unwrap().is_none());

        tracker.finish(job_id, JobStatus::Cancelled, "Cancelled").await;
        assert!(tracker.get_status(job_id).await.unwrap().unwrap().terminal);
    }
}

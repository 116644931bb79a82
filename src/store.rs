//! Job store: a priority queue of analysis jobs with leases.
//!
//! [`MemoryStore`] keeps everything behind one mutex. [`crate::db::PgStore`]
//! keeps the same records in PostgreSQL. Both share the transition rules in
//! this module so retries, reclaims and cancellation behave identically.

use crate::error::StoreError;
use crate::{chrono_duration, AnalysisJob, ErrorKind, JobId, JobRequest, JobStatus, SubjectType};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
    pub jitter: bool,
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff {
            base: Duration::from_secs(1),
            max: Duration::from_secs(60),
            jitter: true,
        }
    }
}

impl Backoff {
    /// Delay before the retry that follows failed attempt number `attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exp = attempt.saturating_sub(1).min(20) as i32;
        let delay_ms = (self.base.as_millis() as f64 * 2f64.powi(exp)).min(self.max.as_millis() as f64);
        let jitter_ms = if self.jitter {
            delay_ms * 0.25 * rand::random::<f64>()
        } else {
            0.0
        };
        Duration::from_millis((delay_ms + jitter_ms) as u64)
    }
}

#[derive(Debug, Clone)]
pub struct StoreSettings {
    pub lease_duration: Duration,
    pub default_max_attempts: u32,
    pub backoff: Backoff,
}

impl Default for StoreSettings {
    fn default() -> Self {
        StoreSettings {
            lease_duration: Duration::from_secs(60),
            default_max_attempts: 3,
            backoff: Backoff::default(),
        }
    }
}

/// Why an attempt ended without completing.
#[derive(Debug, Clone)]
pub struct JobFailure {
    pub kind: ErrorKind,
    pub message: String,
    pub retryable: bool,
    pub retry_after: Option<Duration>,
}

impl JobFailure {
    pub fn fatal(kind: ErrorKind, message: impl Into<String>) -> Self {
        JobFailure {
            kind,
            message: message.into(),
            retryable: false,
            retry_after: None,
        }
    }

    pub fn retryable(kind: ErrorKind, message: impl Into<String>) -> Self {
        JobFailure {
            kind,
            message: message.into(),
            retryable: true,
            retry_after: None,
        }
    }

    pub fn with_retry_after(mut self, retry_after: Option<Duration>) -> Self {
        self.retry_after = retry_after;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Lease {
    pub expires_at: DateTime<Utc>,
    pub cancel_requested: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReclaimOutcome {
    Requeued { attempt_count: i32 },
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reclaimed {
    pub job_id: JobId,
    pub outcome: ReclaimOutcome,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub queued: u64,
    pub in_progress: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
}

impl QueueStats {
    pub(crate) fn add(&mut self, status: JobStatus, count: u64) {
        match status {
            JobStatus::Queued => self.queued += count,
            JobStatus::InProgress => self.in_progress += count,
            JobStatus::Completed => self.completed += count,
            JobStatus::Failed => self.failed += count,
            JobStatus::Cancelled => self.cancelled += count,
        }
    }
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Returns the id of the active job for the request's dedup key, creating
    /// one only if none is queued or in progress.
    async fn enqueue(&self, request: JobRequest) -> Result<JobId, StoreError>;

    /// Leases the highest priority, oldest ready job to `owner`.
    async fn dequeue(&self, owner: &str) -> Result<Option<AnalysisJob>, StoreError>;

    async fn renew_lease(&self, job_id: JobId, owner: &str) -> Result<Lease, StoreError>;

    async fn complete(&self, job_id: JobId, owner: &str) -> Result<(), StoreError>;

    /// Returns the status the job ended up in: `Queued` when it will be
    /// retried, `Cancelled` when a retry was due but a cancel is pending,
    /// `Failed` otherwise.
    async fn fail(
        &self,
        job_id: JobId,
        owner: &str,
        failure: JobFailure,
    ) -> Result<JobStatus, StoreError>;

    async fn cancel(&self, job_id: JobId) -> Result<JobStatus, StoreError>;

    /// Called by the lease holder once it has observed a cancel request.
    async fn acknowledge_cancel(&self, job_id: JobId, owner: &str) -> Result<(), StoreError>;

    async fn reclaim_expired(&self) -> Result<Vec<Reclaimed>, StoreError>;

    async fn get(&self, job_id: JobId) -> Result<Option<AnalysisJob>, StoreError>;

    async fn stats(&self) -> Result<QueueStats, StoreError>;

    /// Drops terminal jobs whose `completed_at` is older than the retention.
    async fn purge_terminal(
        &self,
        finished_retention: Duration,
        cancelled_retention: Duration,
    ) -> Result<usize, StoreError>;
}

/// Upper bound on `max_attempts`, requested or configured.
pub const MAX_ATTEMPTS_LIMIT: u32 = 100;

pub(crate) fn validate(request: &JobRequest) -> Result<(), StoreError> {
    if let Some(max_attempts) = request.max_attempts {
        if !(1..=MAX_ATTEMPTS_LIMIT).contains(&max_attempts) {
            return Err(StoreError::Invalid(format!(
                "max_attempts must be between 1 and {MAX_ATTEMPTS_LIMIT}, got {max_attempts}"
            )));
        }
    }
    if request.dedup_key.trim().is_empty() {
        return Err(StoreError::Invalid("dedup_key must not be empty".into()));
    }
    if request.subject_ids.iter().any(|id| id.trim().is_empty()) {
        return Err(StoreError::Invalid("subject ids must not be empty".into()));
    }
    match (request.subject_type, request.subject_ids.len()) {
        (SubjectType::Song, 1) => Ok(()),
        (SubjectType::Song, n) => Err(StoreError::Invalid(format!(
            "a song job takes exactly one subject id, got {n}"
        ))),
        (SubjectType::Playlist, 0) => Err(StoreError::Invalid(
            "a playlist job needs at least one subject id".into(),
        )),
        (SubjectType::Playlist, _) => Ok(()),
    }
}

pub(crate) fn check_owner(job: &AnalysisJob, owner: &str) -> Result<(), StoreError> {
    if job.status == JobStatus::InProgress && job.lease_owner.as_deref() == Some(owner) {
        Ok(())
    } else {
        Err(StoreError::NotOwner {
            job_id: job.job_id,
            owner: owner.to_string(),
        })
    }
}

fn release_lease(job: &mut AnalysisJob) {
    job.lease_owner = None;
    job.lease_expires_at = None;
}

fn finish(job: &mut AnalysisJob, status: JobStatus, now: DateTime<Utc>) {
    release_lease(job);
    job.status = status;
    job.completed_at = Some(now);
}

pub(crate) fn apply_lease(
    job: &mut AnalysisJob,
    owner: &str,
    lease_duration: Duration,
    now: DateTime<Utc>,
) {
    job.status = JobStatus::InProgress;
    job.lease_owner = Some(owner.to_string());
    job.lease_expires_at = Some(now + chrono_duration(lease_duration));
    job.started_at.get_or_insert(now);
}

pub(crate) fn apply_complete(job: &mut AnalysisJob, now: DateTime<Utc>) {
    finish(job, JobStatus::Completed, now);
    job.error_kind = None;
    job.error_message = None;
}

/// Applies a failed attempt. Returns `true` when the job went back to the
/// queue. A retryable failure of a job with a pending cancel ends it as
/// `Cancelled` without charging the attempt.
pub(crate) fn apply_failure(
    job: &mut AnalysisJob,
    failure: &JobFailure,
    backoff: &Backoff,
    now: DateTime<Utc>,
) -> bool {
    job.error_kind = Some(failure.kind);
    job.error_message = Some(failure.message.clone());

    if !failure.retryable {
        finish(job, JobStatus::Failed, now);
        return false;
    }
    if job.cancel_requested {
        finish(job, JobStatus::Cancelled, now);
        return false;
    }

    job.attempt_count = (job.attempt_count + 1).min(job.max_attempts);
    if job.attempt_count >= job.max_attempts {
        finish(job, JobStatus::Failed, now);
        return false;
    }

    release_lease(job);
    let delay = backoff
        .delay_for(job.attempt_count as u32)
        .max(failure.retry_after.unwrap_or_default());
    job.status = JobStatus::Queued;
    job.run_at = now + chrono_duration(delay);
    true
}

pub(crate) fn apply_reclaim(
    job: &mut AnalysisJob,
    backoff: &Backoff,
    now: DateTime<Utc>,
) -> ReclaimOutcome {
    if job.cancel_requested {
        finish(job, JobStatus::Cancelled, now);
        return ReclaimOutcome::Cancelled;
    }
    let failure = JobFailure::retryable(ErrorKind::LeaseExpired, "lease expired before the job finished");
    if apply_failure(job, &failure, backoff, now) {
        ReclaimOutcome::Requeued {
            attempt_count: job.attempt_count,
        }
    } else {
        ReclaimOutcome::Failed
    }
}

pub(crate) fn apply_cancel(job: &mut AnalysisJob, now: DateTime<Utc>) -> Result<JobStatus, StoreError> {
    match job.status {
        JobStatus::Queued => {
            finish(job, JobStatus::Cancelled, now);
            Ok(JobStatus::Cancelled)
        }
        JobStatus::InProgress => {
            job.cancel_requested = true;
            Ok(JobStatus::InProgress)
        }
        status => Err(StoreError::InvalidState {
            job_id: job.job_id,
            action: "cancelled",
            status,
        }),
    }
}

pub(crate) fn apply_acknowledge_cancel(job: &mut AnalysisJob, now: DateTime<Utc>) -> Result<(), StoreError> {
    if !job.cancel_requested {
        return Err(StoreError::InvalidState {
            job_id: job.job_id,
            action: "acknowledged as cancelled",
            status: job.status,
        });
    }
    finish(job, JobStatus::Cancelled, now);
    Ok(())
}

pub(crate) fn is_purgeable(
    job: &AnalysisJob,
    finished_retention: Duration,
    cancelled_retention: Duration,
    now: DateTime<Utc>,
) -> bool {
    let retention = match job.status {
        JobStatus::Completed | JobStatus::Failed => finished_retention,
        JobStatus::Cancelled => cancelled_retention,
        JobStatus::Queued | JobStatus::InProgress => return false,
    };
    job.completed_at
        .map(|at| at + chrono_duration(retention) <= now)
        .unwrap_or(false)
}

/// Ready index key: priority rank, then insertion sequence.
type Slot = (u8, u64);

#[derive(Default)]
struct Inner {
    jobs: HashMap<JobId, AnalysisJob>,
    ready: BTreeMap<Slot, JobId>,
    slots: HashMap<JobId, Slot>,
    active_keys: HashMap<String, JobId>,
    next_seq: u64,
}

impl Inner {
    fn push_ready(&mut self, job_id: JobId, rank: u8) {
        let slot = (rank, self.next_seq);
        self.next_seq += 1;
        self.ready.insert(slot, job_id);
        self.slots.insert(job_id, slot);
    }

    fn remove_ready(&mut self, job_id: JobId) {
        if let Some(slot) = self.slots.remove(&job_id) {
            self.ready.remove(&slot);
        }
    }

    fn job_mut(&mut self, job_id: JobId) -> Result<&mut AnalysisJob, StoreError> {
        self.jobs.get_mut(&job_id).ok_or(StoreError::NotFound(job_id))
    }

    /// Keeps the ready index and dedup map in line with the job's status.
    fn settle(&mut self, job_id: JobId) {
        let Some(job) = self.jobs.get(&job_id) else {
            return;
        };
        let (status, rank, key) = (job.status, job.priority.rank(), job.dedup_key.clone());
        match status {
            JobStatus::Queued => {
                if !self.slots.contains_key(&job_id) {
                    self.push_ready(job_id, rank);
                }
            }
            JobStatus::InProgress => self.remove_ready(job_id),
            _ => {
                self.remove_ready(job_id);
                if self.active_keys.get(&key) == Some(&job_id) {
                    self.active_keys.remove(&key);
                }
            }
        }
    }
}

/// In-process job store. Every mutation happens under a single lock.
pub struct MemoryStore {
    inner: Mutex<Inner>,
    settings: StoreSettings,
}

impl MemoryStore {
    pub fn new(settings: StoreSettings) -> Self {
        MemoryStore {
            inner: Mutex::new(Inner::default()),
            settings,
        }
    }

    pub fn settings(&self) -> &StoreSettings {
        &self.settings
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(StoreSettings::default())
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn enqueue(&self, request: JobRequest) -> Result<JobId, StoreError> {
        validate(&request)?;
        let mut inner = self.inner.lock();

        if let Some(existing) = inner.active_keys.get(&request.dedup_key) {
            debug!(job_id = %existing, dedup_key = %request.dedup_key, "Duplicate enqueue");
            return Ok(*existing);
        }

        let job = AnalysisJob::from_request(request, self.settings.default_max_attempts);
        let job_id = job.job_id;
        let rank = job.priority.rank();
        inner.active_keys.insert(job.dedup_key.clone(), job_id);
        inner.jobs.insert(job_id, job);
        inner.push_ready(job_id, rank);
        Ok(job_id)
    }

    async fn dequeue(&self, owner: &str) -> Result<Option<AnalysisJob>, StoreError> {
        let now = Utc::now();
        let mut inner = self.inner.lock();

        let next = inner.ready.iter().find_map(|(slot, job_id)| {
            inner
                .jobs
                .get(job_id)
                .filter(|job| job.run_at <= now)
                .map(|_| (*slot, *job_id))
        });
        let Some((slot, job_id)) = next else {
            return Ok(None);
        };

        inner.ready.remove(&slot);
        inner.slots.remove(&job_id);
        let job = inner.job_mut(job_id)?;
        apply_lease(job, owner, self.settings.lease_duration, now);
        Ok(Some(job.clone()))
    }

    async fn renew_lease(&self, job_id: JobId, owner: &str) -> Result<Lease, StoreError> {
        let now = Utc::now();
        let mut inner = self.inner.lock();
        let job = inner.job_mut(job_id)?;
        check_owner(job, owner)?;
        let expires_at = now + chrono_duration(self.settings.lease_duration);
        job.lease_expires_at = Some(expires_at);
        Ok(Lease {
            expires_at,
            cancel_requested: job.cancel_requested,
        })
    }

    async fn complete(&self, job_id: JobId, owner: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        let job = inner.job_mut(job_id)?;
        check_owner(job, owner)?;
        apply_complete(job, Utc::now());
        inner.settle(job_id);
        Ok(())
    }

    async fn fail(
        &self,
        job_id: JobId,
        owner: &str,
        failure: JobFailure,
    ) -> Result<JobStatus, StoreError> {
        let mut inner = self.inner.lock();
        let job = inner.job_mut(job_id)?;
        check_owner(job, owner)?;
        apply_failure(job, &failure, &self.settings.backoff, Utc::now());
        let status = job.status;
        inner.settle(job_id);
        Ok(status)
    }

    async fn cancel(&self, job_id: JobId) -> Result<JobStatus, StoreError> {
        let mut inner = self.inner.lock();
        let job = inner.job_mut(job_id)?;
        let status = apply_cancel(job, Utc::now())?;
        inner.settle(job_id);
        Ok(status)
    }

    async fn acknowledge_cancel(&self, job_id: JobId, owner: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        let job = inner.job_mut(job_id)?;
        check_owner(job, owner)?;
        apply_acknowledge_cancel(job, Utc::now())?;
        inner.settle(job_id);
        Ok(())
    }

    async fn reclaim_expired(&self) -> Result<Vec<Reclaimed>, StoreError> {
        let now = Utc::now();
        let mut inner = self.inner.lock();

        let expired: Vec<JobId> = inner
            .jobs
            .values()
            .filter(|job| {
                job.status == JobStatus::InProgress
                    && job.lease_expires_at.map(|at| at <= now).unwrap_or(true)
            })
            .map(|job| job.job_id)
            .collect();

        let mut reclaimed = Vec::with_capacity(expired.len());
        for job_id in expired {
            let job = inner.job_mut(job_id)?;
            let outcome = apply_reclaim(job, &self.settings.backoff, now);
            inner.settle(job_id);
            reclaimed.push(Reclaimed { job_id, outcome });
        }
        Ok(reclaimed)
    }

    async fn get(&self, job_id: JobId) -> Result<Option<AnalysisJob>, StoreError> {
        Ok(self.inner.lock().jobs.get(&job_id).cloned())
    }

    async fn stats(&self) -> Result<QueueStats, StoreError> {
        let inner = self.inner.lock();
        let mut stats = QueueStats::default();
        for job in inner.jobs.values() {
            stats.add(job.status, 1);
        }
        Ok(stats)
    }

    async fn purge_terminal(
        &self,
        finished_retention: Duration,
        cancelled_retention: Duration,
    ) -> Result<usize, StoreError> {
        let now = Utc::now();
        let mut inner = self.inner.lock();
        let before = inner.jobs.len();
        inner
            .jobs
            .retain(|_, job| !is_purgeable(job, finished_retention, cancelled_retention, now));
        Ok(before - inner.jobs.len())
    }
}

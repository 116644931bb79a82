use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

pub mod analyzer;
pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod limiter;
pub mod progress;
pub mod server;
pub mod store;
pub mod telemetry;
pub mod worker;
pub mod writer;

pub type JobId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "analysis_subject_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SubjectType {
    Song,
    Playlist,
}

impl SubjectType {
    pub fn as_str(self) -> &'static str {
        match self {
            SubjectType::Song => "song",
            SubjectType::Playlist => "playlist",
        }
    }
}

/// Declaration order is dequeue order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "analysis_priority", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    High,
    Medium,
    Low,
}

impl Priority {
    /// Lower ranks are dequeued first.
    pub fn rank(self) -> u8 {
        match self {
            Priority::High => 0,
            Priority::Medium => 1,
            Priority::Low => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "analysis_job_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_active(self) -> bool {
        matches!(self, JobStatus::Queued | JobStatus::InProgress)
    }

    pub fn is_terminal(self) -> bool {
        !self.is_active()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "analysis_error_kind", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Transient,
    RateLimited,
    Timeout,
    Validation,
    LeaseExpired,
    ResultWrite,
}

/// A request to analyze one song or a playlist batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRequest {
    pub dedup_key: String,
    pub subject_type: SubjectType,
    pub subject_ids: Vec<String>,
    pub priority: Priority,
    pub max_attempts: Option<u32>,
}

impl JobRequest {
    pub fn new(subject_type: SubjectType, subject_ids: Vec<String>, priority: Priority) -> Self {
        let dedup_key = default_dedup_key(subject_type, &subject_ids);
        JobRequest {
            dedup_key,
            subject_type,
            subject_ids,
            priority,
            max_attempts: None,
        }
    }

    pub fn song(id: impl Into<String>, priority: Priority) -> Self {
        Self::new(SubjectType::Song, vec![id.into()], priority)
    }

    pub fn playlist<I, S>(ids: I, priority: Priority) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(
            SubjectType::Playlist,
            ids.into_iter().map(Into::into).collect(),
            priority,
        )
    }

    pub fn with_dedup_key(mut self, key: impl Into<String>) -> Self {
        self.dedup_key = key.into();
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }
}

/// `song:42:analysis`, `playlist:1,2,3:analysis`
pub fn default_dedup_key(subject_type: SubjectType, subject_ids: &[String]) -> String {
    format!("{}:{}:analysis", subject_type.as_str(), subject_ids.join(","))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct AnalysisJob {
    pub job_id: JobId,
    pub dedup_key: String,
    pub subject_type: SubjectType,
    pub subject_ids: Vec<String>,
    pub priority: Priority,
    pub status: JobStatus,
    pub attempt_count: i32,
    pub max_attempts: i32,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub cancel_requested: bool,
    pub run_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_kind: Option<ErrorKind>,
    pub error_message: Option<String>,
}

impl AnalysisJob {
    pub(crate) fn from_request(request: JobRequest, default_max_attempts: u32) -> Self {
        let now = Utc::now();
        let max_attempts = request
            .max_attempts
            .unwrap_or(default_max_attempts)
            .clamp(1, store::MAX_ATTEMPTS_LIMIT);
        AnalysisJob {
            job_id: Uuid::new_v4(),
            dedup_key: request.dedup_key,
            subject_type: request.subject_type,
            subject_ids: request.subject_ids,
            priority: request.priority,
            status: JobStatus::Queued,
            attempt_count: 0,
            max_attempts: max_attempts as i32,
            lease_owner: None,
            lease_expires_at: None,
            cancel_requested: false,
            run_at: now,
            created_at: now,
            started_at: None,
            completed_at: None,
            error_kind: None,
            error_message: None,
        }
    }
}

pub(crate) fn chrono_duration(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(3650))
}

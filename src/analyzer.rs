//! Client for the external analysis endpoint.

use crate::{ErrorKind, SubjectType};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, instrument};

/// What gets sent for analysis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subject {
    #[serde(skip)]
    pub id: String,
    pub title: String,
    pub artist: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub score: f64,
    pub verdict: String,
    #[serde(default)]
    pub themes: Vec<String>,
    #[serde(default)]
    pub concerns: Vec<String>,
    #[serde(default)]
    pub scripture_refs: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AnalyzeError {
    #[error("transient analyzer error: {0}")]
    Transient(String),

    #[error("analyzer rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    #[error("analyzer rejected request: {0}")]
    Validation(String),

    #[error("analyzer request timed out")]
    Timeout,
}

impl AnalyzeError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, AnalyzeError::Validation(_))
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            AnalyzeError::Transient(_) => ErrorKind::Transient,
            AnalyzeError::RateLimited { .. } => ErrorKind::RateLimited,
            AnalyzeError::Validation(_) => ErrorKind::Validation,
            AnalyzeError::Timeout => ErrorKind::Timeout,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            AnalyzeError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

#[async_trait]
pub trait Analyzer: Send + Sync {
    /// Identity of the endpoint, used to pick its rate limiter.
    fn endpoint(&self) -> &str;

    async fn analyze(&self, subject: &Subject) -> Result<AnalysisResult, AnalyzeError>;
}

/// Maps a non-success response to an error.
pub fn classify_status(status: StatusCode, headers: &HeaderMap) -> AnalyzeError {
    if status == StatusCode::TOO_MANY_REQUESTS {
        let retry_after = headers
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        AnalyzeError::RateLimited { retry_after }
    } else if status == StatusCode::GATEWAY_TIMEOUT {
        AnalyzeError::Timeout
    } else if status.is_server_error() {
        AnalyzeError::Transient(format!("endpoint returned {status}"))
    } else {
        AnalyzeError::Validation(format!("endpoint returned {status}"))
    }
}

fn classify_transport(err: &reqwest::Error) -> AnalyzeError {
    if err.is_timeout() {
        AnalyzeError::Timeout
    } else {
        AnalyzeError::Transient(err.to_string())
    }
}

/// HTTP analyzer, built once from settings and shared by every worker.
#[derive(Debug, Clone)]
pub struct HttpAnalyzer {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpAnalyzer {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(HttpAnalyzer {
            client,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl Analyzer for HttpAnalyzer {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    #[instrument(name = "analyzer.analyze", skip_all, fields(subject_id = %subject.id))]
    async fn analyze(&self, subject: &Subject) -> Result<AnalysisResult, AnalyzeError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(subject)
            .send()
            .await
            .map_err(|e| classify_transport(&e))?;

        let status = response.status();
        if !status.is_success() {
            let err = classify_status(status, response.headers());
            let body = response.text().await.unwrap_or_default();
            debug!(%status, body = %body, "Analyzer call failed");
            return Err(err);
        }

        response.json::<AnalysisResult>().await.map_err(|e| {
            if e.is_timeout() {
                AnalyzeError::Timeout
            } else {
                AnalyzeError::Transient(format!("malformed analyzer response: {e}"))
            }
        })
    }
}

/// Resolves subject ids into the title/artist/content the endpoint needs.
#[async_trait]
pub trait SubjectSource: Send + Sync {
    async fn resolve(&self, subject_type: SubjectType, id: &str) -> Result<Subject, AnalyzeError>;
}

/// Sends the id as the title with no content. Used when lyrics are resolved
/// by the endpoint itself.
#[derive(Debug, Clone, Default)]
pub struct PassthroughSubjects;

#[async_trait]
impl SubjectSource for PassthroughSubjects {
    async fn resolve(&self, _subject_type: SubjectType, id: &str) -> Result<Subject, AnalyzeError> {
        Ok(Subject {
            id: id.to_string(),
            title: id.to_string(),
            artist: String::new(),
            content: String::new(),
        })
    }
}

/// Fixed set of subjects; unknown ids fail validation.
#[derive(Debug, Clone, Default)]
pub struct StaticSubjects {
    subjects: HashMap<String, Subject>,
}

impl StaticSubjects {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, id: &str, title: &str, artist: &str, content: &str) -> Self {
        self.subjects.insert(
            id.to_string(),
            Subject {
                id: id.to_string(),
                title: title.to_string(),
                artist: artist.to_string(),
                content: content.to_string(),
            },
        );
        self
    }
}

#[async_trait]
impl SubjectSource for StaticSubjects {
    async fn resolve(&self, _subject_type: SubjectType, id: &str) -> Result<Subject, AnalyzeError> {
        self.subjects
            .get(id)
            .cloned()
            .ok_or_else(|| AnalyzeError::Validation(format!("unknown subject {id}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn too_many_requests_honours_retry_after() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("17"));
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, &headers),
            AnalyzeError::RateLimited {
                retry_after: Some(Duration::from_secs(17))
            }
        );

        // HTTP-date values are not understood and fall back to the default pause.
        headers.insert(
            RETRY_AFTER,
            HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"),
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, &headers),
            AnalyzeError::RateLimited { retry_after: None }
        );
    }

    #[test]
    fn status_codes_map_to_error_kinds() {
        let headers = HeaderMap::new();
        let kind = |code: u16| classify_status(StatusCode::from_u16(code).unwrap(), &headers).kind();
        assert_eq!(kind(500), ErrorKind::Transient);
        assert_eq!(kind(503), ErrorKind::Transient);
        assert_eq!(kind(504), ErrorKind::Timeout);
        assert_eq!(kind(400), ErrorKind::Validation);
        assert_eq!(kind(408), ErrorKind::Validation);
        assert_eq!(kind(422), ErrorKind::Validation);
        assert_eq!(kind(429), ErrorKind::RateLimited);
    }

    #[test]
    fn only_validation_is_fatal() {
        assert!(AnalyzeError::Transient("x".into()).is_retryable());
        assert!(AnalyzeError::Timeout.is_retryable());
        assert!(AnalyzeError::RateLimited { retry_after: None }.is_retryable());
        assert!(!AnalyzeError::Validation("x".into()).is_retryable());
    }

    #[tokio::test]
    async fn static_subjects_reject_unknown_ids() {
        let subjects = StaticSubjects::new().with("1", "Amazing Grace", "John Newton", "...");
        let subject = subjects.resolve(SubjectType::Song, "1").await.unwrap();
        assert_eq!(subject.artist, "John Newton");
        assert!(matches!(
            subjects.resolve(SubjectType::Song, "2").await,
            Err(AnalyzeError::Validation(_))
        ));
    }
}

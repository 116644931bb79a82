//! Where finished analyses end up.

use crate::analyzer::AnalysisResult;
use async_trait::async_trait;
use parking_lot::Mutex;
use sqlx::PgPool;
use std::collections::HashSet;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum WriteError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("could not encode result: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("result for {0} was rejected")]
    Rejected(String),
}

#[async_trait]
pub trait ResultWriter: Send + Sync {
    async fn save(&self, subject_id: &str, result: &AnalysisResult) -> Result<(), WriteError>;
}

/// Upserts results into `analysis_results`.
#[derive(Clone)]
pub struct PgResultWriter {
    pool: PgPool,
}

impl PgResultWriter {
    pub fn new(pool: PgPool) -> Self {
        PgResultWriter { pool }
    }
}

#[async_trait]
impl ResultWriter for PgResultWriter {
    async fn save(&self, subject_id: &str, result: &AnalysisResult) -> Result<(), WriteError> {
        let json = serde_json::to_value(result)?;
        sqlx::query(
            "INSERT INTO analysis_results (subject_id, result, saved_at) \
            VALUES ($1, $2, now()) \
            ON CONFLICT (subject_id) DO UPDATE \
                SET result = EXCLUDED.result, saved_at = EXCLUDED.saved_at",
        )
        .bind(subject_id)
        .bind(json)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Logs results without persisting them.
#[derive(Debug, Clone, Default)]
pub struct LogResultWriter;

#[async_trait]
impl ResultWriter for LogResultWriter {
    async fn save(&self, subject_id: &str, result: &AnalysisResult) -> Result<(), WriteError> {
        info!(
            subject_id,
            score = result.score,
            verdict = %result.verdict,
            concerns = result.concerns.len(),
            "Analysis result"
        );
        Ok(())
    }
}

/// Keeps every save in memory, in call order.
#[derive(Debug, Default)]
pub struct MemoryResultWriter {
    saved: Mutex<Vec<(String, AnalysisResult)>>,
    rejected: HashSet<String>,
    delay: Duration,
}

impl MemoryResultWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails every save for `subject_id`.
    pub fn rejecting(mut self, subject_id: impl Into<String>) -> Self {
        self.rejected.insert(subject_id.into());
        self
    }

    /// Takes `delay` for every save, like a slow database.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn saved(&self) -> Vec<(String, AnalysisResult)> {
        self.saved.lock().clone()
    }

    pub fn saves_for(&self, subject_id: &str) -> usize {
        self.saved.lock().iter().filter(|(id, _)| id == subject_id).count()
    }
}

#[async_trait]
impl ResultWriter for MemoryResultWriter {
    async fn save(&self, subject_id: &str, result: &AnalysisResult) -> Result<(), WriteError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.rejected.contains(subject_id) {
            return Err(WriteError::Rejected(subject_id.to_string()));
        }
        self.saved.lock().push((subject_id.to_string(), result.clone()));
        Ok(())
    }
}

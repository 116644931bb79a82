use crate::JobId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("job {0} not found")]
    NotFound(JobId),

    #[error("job {job_id} is not leased by {owner}")]
    NotOwner { job_id: JobId, owner: String },

    #[error("job {job_id} cannot be {action} while {status:?}")]
    InvalidState {
        job_id: JobId,
        action: &'static str,
        status: crate::JobStatus,
    },

    #[error("invalid job request: {0}")]
    Invalid(String),

    #[error("job store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn is_ownership(&self) -> bool {
        matches!(self, StoreError::NotOwner { .. })
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

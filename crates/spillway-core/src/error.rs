use thiserror::Error;

use crate::domain::{JobId, JobStatus, ParseJobStatusError};
use crate::estimate::EstimationError;
use crate::limiter::LimitError;
use crate::ports::{FetchError, PathSecurityError};
use crate::writer::WriteFailure;

#[derive(Debug, Error)]
pub enum SpillwayError {
    #[error(transparent)]
    Estimation(#[from] EstimationError),

    #[error(transparent)]
    Limit(#[from] LimitError),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Write(#[from] WriteFailure),

    #[error(transparent)]
    PathSecurity(#[from] PathSecurityError),

    #[error(transparent)]
    InvalidStatusFilter(#[from] ParseJobStatusError),

    #[error("job not found: {0}")]
    JobNotFound(JobId),

    #[error("invalid transition for {job_id}: {from} -> {to}")]
    InvalidTransition {
        job_id: JobId,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("job {job_id} is already {status}")]
    JobAlreadyTerminal { job_id: JobId, status: JobStatus },

    #[error("operation cancelled")]
    Cancelled,

    #[error("background worker is shutting down")]
    ShuttingDown,

    #[error("job intake queue is full")]
    QueueFull,

    #[error("configuration error: {0}")]
    Config(String),
}

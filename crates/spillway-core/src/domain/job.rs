//! Job record and its state machine.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::format::OutputFormat;
use super::ids::JobId;
use super::operation::FetchOperation;

/// Job status.
///
/// State transitions:
/// - Accepted -> Processing -> Completed
/// - Accepted -> Processing -> Failed
/// - Accepted | Processing -> Cancelled
///
/// Completed / Failed / Cancelled are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Accepted,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Is this a terminal state (no further transitions)?
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Accepted => "accepted",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a status filter names no known status.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown job status: {0:?}")]
pub struct ParseJobStatusError(pub String);

impl FromStr for JobStatus {
    type Err = ParseJobStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "accepted" => Ok(JobStatus::Accepted),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(ParseJobStatusError(other.to_string())),
        }
    }
}

/// Immutable snapshot of what the job was asked to do.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRequest {
    pub operation: FetchOperation,

    /// Resolved destination; already validated by the path resolver.
    pub destination: PathBuf,

    pub format: OutputFormat,

    /// Row estimate that led to job delegation, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_rows: Option<u64>,
}

/// Running counters of a job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobProgress {
    pub rows_fetched: u64,
    pub bytes_written: u64,
    pub pages_fetched: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_total: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percent_complete: Option<f64>,

    pub elapsed_ms: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update_time: Option<DateTime<Utc>>,
}

/// Progress report from the worker.
///
/// Counters are running totals, not increments; merging keeps the larger
/// value so a late or duplicated report never moves progress backwards.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgressUpdate {
    pub rows_fetched: u64,
    pub bytes_written: u64,
    pub pages_fetched: u64,
    pub estimated_total: Option<u64>,
}

impl JobProgress {
    fn merge(&mut self, update: ProgressUpdate, now: DateTime<Utc>) {
        self.rows_fetched = self.rows_fetched.max(update.rows_fetched);
        self.bytes_written = self.bytes_written.max(update.bytes_written);
        self.pages_fetched = self.pages_fetched.max(update.pages_fetched);
        if update.estimated_total.is_some() {
            self.estimated_total = update.estimated_total;
        }
        self.percent_complete = self.estimated_total.map(|total| {
            if total == 0 {
                100.0
            } else {
                (self.rows_fetched as f64 * 100.0 / total as f64).min(100.0)
            }
        });
        self.touch(now);
    }

    fn touch(&mut self, now: DateTime<Utc>) {
        if let Some(started) = self.started_at {
            self.elapsed_ms = (now - started).num_milliseconds().max(0) as u64;
        }
        self.last_update_time = Some(now);
    }
}

/// Set only on Completed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub location: PathBuf,
    pub rows_written: u64,
    pub bytes_written: u64,
    pub format: OutputFormat,
}

/// Classification of a job failure, as seen by a poller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobErrorKind {
    RateLimited,
    CircuitOpen,
    TransientFetch,
    PermanentFetch,
    WriteFailure,
    ShutdownInterrupted,
    DeadlineExceeded,
}

impl fmt::Display for JobErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobErrorKind::RateLimited => "rate_limited",
            JobErrorKind::CircuitOpen => "circuit_open",
            JobErrorKind::TransientFetch => "transient_fetch",
            JobErrorKind::PermanentFetch => "permanent_fetch",
            JobErrorKind::WriteFailure => "write_failure",
            JobErrorKind::ShutdownInterrupted => "shutdown_interrupted",
            JobErrorKind::DeadlineExceeded => "deadline_exceeded",
        };
        f.write_str(s)
    }
}

/// Set only on Failed (and, while Processing, as `last_error` for retries).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobError {
    pub kind: JobErrorKind,
    pub message: String,
    pub retry_count: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<DateTime<Utc>>,
}

impl JobError {
    pub fn new(kind: JobErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retry_count: 0,
            next_retry_at: None,
        }
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    pub fn with_next_retry_at(mut self, at: DateTime<Utc>) -> Self {
        self.next_retry_at = Some(at);
        self
    }
}

/// Why a transition was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionError {
    /// The job is Completed / Failed / Cancelled.
    AlreadyTerminal(JobStatus),
    /// The job is live but not in a state that allows this transition.
    Invalid { from: JobStatus, to: JobStatus },
}

/// A background job.
///
/// All state transitions go through methods; a refused transition leaves the
/// record untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub status: JobStatus,
    pub request: JobRequest,
    pub progress: JobProgress,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<JobResult>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,

    /// Retries performed so far across all pages.
    pub retry_count: u32,

    /// Most recent retryable failure, visible while the job is still running.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<JobError>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancel_reason: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(id: JobId, request: JobRequest, now: DateTime<Utc>) -> Self {
        let progress = JobProgress {
            estimated_total: request.estimated_rows,
            ..JobProgress::default()
        };
        Self {
            id,
            status: JobStatus::Accepted,
            request,
            progress,
            result: None,
            error: None,
            retry_count: 0,
            last_error: None,
            cancel_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    fn require(&self, allowed: &[JobStatus], to: JobStatus) -> Result<(), TransitionError> {
        if self.status.is_terminal() {
            return Err(TransitionError::AlreadyTerminal(self.status));
        }
        if !allowed.contains(&self.status) {
            return Err(TransitionError::Invalid {
                from: self.status,
                to,
            });
        }
        Ok(())
    }

    /// Accepted -> Processing.
    pub fn mark_processing(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.require(&[JobStatus::Accepted], JobStatus::Processing)?;
        self.status = JobStatus::Processing;
        self.progress.started_at = Some(now);
        self.progress.touch(now);
        self.updated_at = now;
        Ok(())
    }

    /// Merge a progress report (Processing only).
    pub fn apply_progress(
        &mut self,
        update: ProgressUpdate,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        self.require(&[JobStatus::Processing], JobStatus::Processing)?;
        self.progress.merge(update, now);
        self.updated_at = now;
        Ok(())
    }

    /// Record a scheduled retry (Processing only); status is unchanged.
    pub fn note_retry(&mut self, error: JobError, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.require(&[JobStatus::Processing], JobStatus::Processing)?;
        self.retry_count = error.retry_count;
        self.last_error = Some(error);
        self.progress.touch(now);
        self.updated_at = now;
        Ok(())
    }

    /// Processing -> Completed.
    pub fn complete(&mut self, result: JobResult, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.require(&[JobStatus::Processing], JobStatus::Completed)?;
        self.status = JobStatus::Completed;
        self.progress.rows_fetched = self.progress.rows_fetched.max(result.rows_written);
        self.progress.bytes_written = self.progress.bytes_written.max(result.bytes_written);
        self.progress.percent_complete = Some(100.0);
        self.progress.touch(now);
        self.result = Some(result);
        self.updated_at = now;
        Ok(())
    }

    /// Processing -> Failed.
    pub fn fail(&mut self, error: JobError, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.require(&[JobStatus::Processing], JobStatus::Failed)?;
        self.status = JobStatus::Failed;
        self.retry_count = self.retry_count.max(error.retry_count);
        self.progress.touch(now);
        self.error = Some(error);
        self.updated_at = now;
        Ok(())
    }

    /// Accepted | Processing -> Cancelled.
    pub fn cancel(
        &mut self,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        self.require(
            &[JobStatus::Accepted, JobStatus::Processing],
            JobStatus::Cancelled,
        )?;
        self.status = JobStatus::Cancelled;
        self.cancel_reason = reason;
        self.progress.touch(now);
        self.updated_at = now;
        Ok(())
    }
}

//! Domain model (IDs, jobs, verdicts, outcomes, ...).

pub mod attempt;
pub mod errors;
pub mod format;
pub mod ids;
pub mod job;
pub mod operation;
pub mod outcome;
pub mod verdict;

pub use attempt::AttemptOutcome;
pub use errors::ErrorClass;
pub use format::{OutputFormat, OutputMode};
pub use ids::{JobId, ParseJobIdError};
pub use job::{
    Job, JobError, JobErrorKind, JobProgress, JobRequest, JobResult, JobStatus,
    ParseJobStatusError, ProgressUpdate, TransitionError,
};
pub use operation::{FetchOperation, PageCursor};
pub use outcome::Outcome;
pub use verdict::{Classification, SizeVerdict, VerdictReason};

//! Outcome model: what the output router hands back to the caller.
//!
//! A closed set of variants; callers match it exhaustively instead of checking
//! mode strings.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::format::OutputFormat;
use super::ids::JobId;
use super::verdict::SizeVerdict;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "output_mode", rename_all = "lowercase")]
pub enum Outcome {
    /// Fully materialized payload, returned directly.
    Inline {
        records: Vec<serde_json::Value>,
        verdict: SizeVerdict,
    },

    /// Payload written synchronously to a file.
    File {
        location: PathBuf,
        rows_written: u64,
        bytes_written: u64,
        format: OutputFormat,
    },

    /// Payload will be produced by a background job; poll its status.
    Job {
        job_id: JobId,
        estimated_rows: u64,
        estimated_duration: Duration,
        location: PathBuf,
    },
}

impl Outcome {
    pub fn job_id(&self) -> Option<JobId> {
        match self {
            Outcome::Job { job_id, .. } => Some(*job_id),
            Outcome::Inline { .. } | Outcome::File { .. } => None,
        }
    }
}

//! Size verdict: the Inline / File / Job classification of a result.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Where a result should go.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Classification {
    Inline,
    File,
    Job,
}

/// Why the estimator picked a classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictReason {
    EmptyResult,
    WithinSafeLimit,
    ExceedsSafeLimit,
    ExceedsInlineRows,
    ExceedsJobRows,
    ExceedsJobDuration,
    /// Nothing to estimate from; fell back to File.
    EstimationFailed,
    /// One page of a result whose total is unknown; never Inline.
    IncompleteSample,
}

impl fmt::Display for VerdictReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            VerdictReason::EmptyResult => "result is empty",
            VerdictReason::WithinSafeLimit => "estimate fits within the safe limit",
            VerdictReason::ExceedsSafeLimit => "estimate exceeds the safe limit",
            VerdictReason::ExceedsInlineRows => "row count exceeds the inline row limit",
            VerdictReason::ExceedsJobRows => "row count exceeds the job row threshold",
            VerdictReason::ExceedsJobDuration => "predicted duration exceeds the job threshold",
            VerdictReason::EstimationFailed => "size could not be estimated",
            VerdictReason::IncompleteSample => "sample has more pages and no declared total",
        };
        f.write_str(s)
    }
}

/// Ephemeral decision record; recomputed per request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SizeVerdict {
    pub estimated_units: u64,
    pub estimated_rows: u64,
    pub estimated_duration: Duration,
    pub safe_limit: u64,
    pub classification: Classification,
    pub reason: VerdictReason,
}

impl SizeVerdict {
    /// Conservative verdict used when estimation is impossible.
    pub fn fallback(safe_limit: u64) -> Self {
        Self {
            estimated_units: 0,
            estimated_rows: 0,
            estimated_duration: Duration::ZERO,
            safe_limit,
            classification: Classification::File,
            reason: VerdictReason::EstimationFailed,
        }
    }
}

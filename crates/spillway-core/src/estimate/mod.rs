//! Size estimation: predicts the cost of a result before it is materialized.
//!
//! The estimate is linear: average cost of a small sample times the declared
//! (or predicted) row count. It never fetches anything on its own.

use std::io;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

use crate::config::OutputSettings;
use crate::domain::{Classification, SizeVerdict, VerdictReason};

/// Records beyond this many are not inspected.
pub const SAMPLE_LIMIT: usize = 200;

/// What the estimator gets to look at.
#[derive(Debug, Clone, Copy)]
pub enum EstimateInput<'a> {
    /// First records of the result, plus the provider's total when known.
    Sample {
        records: &'a [serde_json::Value],
        declared_total: Option<u64>,
        /// More pages follow the sample.
        has_more: bool,
    },
    /// Row count known in advance; per-record cost is the configured default.
    Count(u64),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EstimationError {
    #[error("empty sample and no declared row count")]
    NothingToEstimate,
}

/// `io::Write` sink that only counts bytes.
#[derive(Default)]
struct ByteCounter(u64);

impl io::Write for ByteCounter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0 += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct SizeEstimator {
    settings: OutputSettings,
}

impl SizeEstimator {
    pub fn new(settings: OutputSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &OutputSettings {
        &self.settings
    }

    /// Serialized size of one record, in units.
    pub fn record_units(&self, record: &serde_json::Value) -> u64 {
        let mut counter = ByteCounter::default();
        // writing into a counter cannot fail
        let _ = serde_json::to_writer(&mut counter, record);
        counter.0.div_ceil(self.settings.bytes_per_unit.max(1))
    }

    /// Total units of `records`.
    pub fn records_units(&self, records: &[serde_json::Value]) -> u64 {
        records.iter().map(|r| self.record_units(r)).sum()
    }

    /// Predicted time to pull `rows` rows from the provider.
    pub fn predict_duration(&self, rows: u64) -> Duration {
        Duration::from_secs_f64(rows as f64 / self.settings.rows_per_second)
    }

    /// Estimate and classify against the safe limit of `profile`.
    pub fn estimate(
        &self,
        input: EstimateInput<'_>,
        profile: Option<&str>,
    ) -> Result<SizeVerdict, EstimationError> {
        // 件数が下限でしかない（続きのページがあり total も無い）
        let mut open_ended = false;
        let (rows, units) = match input {
            EstimateInput::Count(rows) => (rows, rows.saturating_mul(self.settings.units_per_record)),
            EstimateInput::Sample {
                records,
                declared_total,
                has_more,
            } => {
                if records.is_empty() {
                    let rows = declared_total.ok_or(EstimationError::NothingToEstimate)?;
                    (rows, rows.saturating_mul(self.settings.units_per_record))
                } else {
                    let sample = &records[..records.len().min(SAMPLE_LIMIT)];
                    let per_record = self.records_units(sample) as f64 / sample.len() as f64;
                    let seen = records.len() as u64;
                    let rows = match declared_total {
                        Some(total) => total.max(seen),
                        None if has_more => {
                            open_ended = true;
                            seen + 1
                        }
                        None => seen,
                    };
                    (rows, (per_record * rows as f64).ceil() as u64)
                }
            }
        };

        let safe_limit = self.settings.safe_limit(profile);
        let duration = self.predict_duration(rows);
        let (classification, reason) = match self.classify(rows, units, duration, safe_limit) {
            (Classification::Inline, _) if open_ended => {
                (Classification::File, VerdictReason::IncompleteSample)
            }
            verdict => verdict,
        };

        debug!(
            rows,
            units,
            safe_limit,
            duration_ms = duration.as_millis() as u64,
            ?classification,
            %reason,
            "size verdict"
        );

        Ok(SizeVerdict {
            estimated_units: units,
            estimated_rows: rows,
            estimated_duration: duration,
            safe_limit,
            classification,
            reason,
        })
    }

    /// Like [`estimate`](Self::estimate) but never fails: an impossible
    /// estimate becomes a File verdict, never Inline.
    pub fn estimate_or_fallback(&self, input: EstimateInput<'_>, profile: Option<&str>) -> SizeVerdict {
        self.estimate(input, profile).unwrap_or_else(|err| {
            warn!(error = %err, "estimation failed; falling back to file output");
            SizeVerdict::fallback(self.settings.safe_limit(profile))
        })
    }

    fn classify(
        &self,
        rows: u64,
        units: u64,
        duration: Duration,
        safe_limit: u64,
    ) -> (Classification, VerdictReason) {
        let s = &self.settings;
        if rows == 0 {
            (Classification::Inline, VerdictReason::EmptyResult)
        } else if rows > s.job_row_threshold {
            (Classification::Job, VerdictReason::ExceedsJobRows)
        } else if duration > s.job_duration_threshold {
            (Classification::Job, VerdictReason::ExceedsJobDuration)
        } else if rows > s.inline_row_limit {
            (Classification::File, VerdictReason::ExceedsInlineRows)
        } else if units > safe_limit {
            (Classification::File, VerdictReason::ExceedsSafeLimit)
        } else {
            (Classification::Inline, VerdictReason::WithinSafeLimit)
        }
    }
}

//! Runtime settings.
//!
//! Every threshold here is an empirically chosen business value, so none of
//! them is hard-coded in the components: they receive these structs.
//! `Settings::from_env` reads an optional `.env` file and `SPILLWAY_*`
//! variables on top of the defaults.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::OutputFormat;
use crate::error::SpillwayError;

pub const DEFAULT_PROFILE: &str = "default";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub output: OutputSettings,
    pub rate_limit: RateLimitSettings,
    pub retry: RetrySettings,
    pub job: JobSettings,
    pub storage: StorageSettings,
}

/// Size estimation and routing thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputSettings {
    pub default_profile: String,

    /// Consumer profile name -> total capacity in units.
    pub profiles: BTreeMap<String, u64>,

    /// Share of the capacity assumed to be used by unrelated context.
    pub assumed_consumed_fraction: f64,

    pub inline_row_limit: u64,
    pub job_row_threshold: u64,
    pub job_duration_threshold: Duration,

    /// Fetch throughput used to predict how long a result takes to pull.
    pub rows_per_second: f64,

    /// Per-record cost assumed when only a row count is known.
    pub units_per_record: u64,

    /// Serialized bytes per unit.
    pub bytes_per_unit: u64,

    pub chunk_size: usize,
    pub default_format: OutputFormat,
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            default_profile: DEFAULT_PROFILE.to_string(),
            profiles: BTreeMap::from([(DEFAULT_PROFILE.to_string(), 200_000)]),
            assumed_consumed_fraction: 0.75,
            inline_row_limit: 1_000,
            job_row_threshold: 10_000,
            job_duration_threshold: Duration::from_secs(10),
            rows_per_second: 1_000.0,
            units_per_record: 25,
            bytes_per_unit: 4,
            chunk_size: 1_000,
            default_format: OutputFormat::Csv,
        }
    }
}

impl OutputSettings {
    /// Capacity of `profile`, falling back to the default profile.
    pub fn capacity(&self, profile: Option<&str>) -> u64 {
        profile
            .and_then(|p| self.profiles.get(p))
            .or_else(|| self.profiles.get(&self.default_profile))
            .copied()
            .unwrap_or(0)
    }

    /// `capacity × (1 − assumed_consumed_fraction)`.
    pub fn safe_limit(&self, profile: Option<&str>) -> u64 {
        let capacity = self.capacity(profile) as f64;
        (capacity * (1.0 - self.assumed_consumed_fraction)).floor() as u64
    }
}

/// Sliding window quota and circuit breaker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    pub window: Duration,
    pub max_permits: u32,
    pub failure_threshold: u32,
    pub cooldown: Duration,

    /// How long `acquire_wait` may block on a saturated window.
    pub acquire_wait: Duration,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            max_permits: 120,
            failure_threshold: 5,
            cooldown: Duration::from_secs(60),
            acquire_wait: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub base_delay: Duration,
    pub multiplier: f64,

    /// Relative jitter, applied as ±`jitter`.
    pub jitter: f64,

    pub max_delay: Duration,
    pub max_rate_limit_retries: u32,
    pub max_server_retries: u32,

    /// Timeout of one external call attempt.
    pub attempt_timeout: Duration,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
            jitter: 0.25,
            max_delay: Duration::from_secs(60),
            max_rate_limit_retries: 3,
            max_server_retries: 2,
            attempt_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobSettings {
    /// How long terminal jobs stay queryable.
    pub retention: Duration,
    pub workers: usize,
    pub queue_capacity: usize,

    /// Optional wall-clock ceiling per job.
    pub job_deadline: Option<Duration>,

    pub sweep_interval: Duration,
    pub shutdown_grace: Duration,
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(24 * 60 * 60),
            workers: 2,
            queue_capacity: 64,
            job_deadline: None,
            sweep_interval: Duration::from_secs(5 * 60),
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    pub root: PathBuf,
    pub default_project: String,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./spillway-data"),
            default_project: "default".to_string(),
        }
    }
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>, SpillwayError> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| SpillwayError::Config(format!("{key}: cannot parse {raw:?}"))),
    }
}

fn set<T>(slot: &mut T, value: Option<T>) {
    if let Some(v) = value {
        *slot = v;
    }
}

impl Settings {
    /// Load `.env` (if present) and apply `SPILLWAY_*` overrides.
    pub fn from_env() -> Result<Self, SpillwayError> {
        // a missing .env file is fine
        let _ = dotenvy::dotenv();
        let settings = Self::from_lookup(|key| std::env::var(key).ok())?;
        settings.validate()?;
        Ok(settings)
    }

    /// Apply overrides from an arbitrary key lookup on top of the defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, SpillwayError> {
        let mut s = Settings::default();
        let secs = |key: &str| parse_var::<u64>(&lookup, key).map(|v| v.map(Duration::from_secs));

        set(&mut s.storage.root, parse_var(&lookup, "SPILLWAY_STORAGE_ROOT")?);
        set(
            &mut s.storage.default_project,
            parse_var(&lookup, "SPILLWAY_DEFAULT_PROJECT")?,
        );

        let out = &mut s.output;
        set(
            &mut out.default_format,
            lookup("SPILLWAY_OUTPUT_FORMAT")
                .map(|raw| raw.parse().map_err(SpillwayError::Config))
                .transpose()?,
        );
        set(
            &mut out.default_profile,
            parse_var(&lookup, "SPILLWAY_DEFAULT_PROFILE")?,
        );
        if let Some(capacity) = parse_var::<u64>(&lookup, "SPILLWAY_CAPACITY")? {
            out.profiles.insert(out.default_profile.clone(), capacity);
        }
        set(
            &mut out.assumed_consumed_fraction,
            parse_var(&lookup, "SPILLWAY_ASSUMED_CONSUMED_FRACTION")?,
        );
        set(
            &mut out.inline_row_limit,
            parse_var(&lookup, "SPILLWAY_INLINE_ROW_LIMIT")?,
        );
        set(
            &mut out.job_row_threshold,
            parse_var(&lookup, "SPILLWAY_JOB_ROW_THRESHOLD")?,
        );
        set(
            &mut out.job_duration_threshold,
            secs("SPILLWAY_JOB_DURATION_SECS")?,
        );
        set(
            &mut out.rows_per_second,
            parse_var(&lookup, "SPILLWAY_ROWS_PER_SECOND")?,
        );
        set(&mut out.chunk_size, parse_var(&lookup, "SPILLWAY_CHUNK_SIZE")?);

        let rl = &mut s.rate_limit;
        set(&mut rl.window, secs("SPILLWAY_RATE_LIMIT_WINDOW_SECS")?);
        set(
            &mut rl.max_permits,
            parse_var(&lookup, "SPILLWAY_RATE_LIMIT_MAX_PERMITS")?,
        );
        set(
            &mut rl.failure_threshold,
            parse_var(&lookup, "SPILLWAY_CIRCUIT_FAILURE_THRESHOLD")?,
        );
        set(&mut rl.cooldown, secs("SPILLWAY_CIRCUIT_COOLDOWN_SECS")?);

        let retry = &mut s.retry;
        set(
            &mut retry.base_delay,
            parse_var::<u64>(&lookup, "SPILLWAY_RETRY_BASE_DELAY_MS")?.map(Duration::from_millis),
        );
        set(
            &mut retry.max_rate_limit_retries,
            parse_var(&lookup, "SPILLWAY_RETRY_MAX_RATE_LIMIT")?,
        );
        set(
            &mut retry.max_server_retries,
            parse_var(&lookup, "SPILLWAY_RETRY_MAX_SERVER")?,
        );
        set(
            &mut retry.attempt_timeout,
            secs("SPILLWAY_ATTEMPT_TIMEOUT_SECS")?,
        );

        let job = &mut s.job;
        set(
            &mut job.retention,
            parse_var::<u64>(&lookup, "SPILLWAY_RETENTION_HOURS")?
                .map(|h| {
                    h.checked_mul(60 * 60).map(Duration::from_secs).ok_or_else(|| {
                        SpillwayError::Config(format!("SPILLWAY_RETENTION_HOURS: {h} is too large"))
                    })
                })
                .transpose()?,
        );
        set(&mut job.workers, parse_var(&lookup, "SPILLWAY_WORKERS")?);
        set(
            &mut job.queue_capacity,
            parse_var(&lookup, "SPILLWAY_QUEUE_CAPACITY")?,
        );
        if let Some(deadline) = secs("SPILLWAY_JOB_DEADLINE_SECS")? {
            job.job_deadline = Some(deadline);
        }

        Ok(s)
    }

    /// Reject values the components cannot work with.
    pub fn validate(&self) -> Result<(), SpillwayError> {
        let bad = |msg: &str| Err(SpillwayError::Config(msg.to_string()));
        let out = &self.output;
        if !(0.0..=0.99).contains(&out.assumed_consumed_fraction) {
            return bad("assumed_consumed_fraction must be within [0, 0.99]");
        }
        if !out.profiles.contains_key(&out.default_profile) {
            return bad("default_profile must name a configured profile");
        }
        if out.chunk_size == 0 {
            return bad("chunk_size must be greater than 0");
        }
        if out.bytes_per_unit == 0 {
            return bad("bytes_per_unit must be greater than 0");
        }
        if out.rows_per_second <= 0.0 || !out.rows_per_second.is_finite() {
            return bad("rows_per_second must be a positive number");
        }
        if self.rate_limit.max_permits == 0 {
            return bad("max_permits must be greater than 0");
        }
        if self.rate_limit.window.is_zero() {
            return bad("rate limit window must be non-zero");
        }
        if self.rate_limit.failure_threshold == 0 {
            return bad("failure_threshold must be greater than 0");
        }
        if self.retry.multiplier < 1.0 {
            return bad("retry multiplier must be at least 1.0");
        }
        if !(0.0..1.0).contains(&self.retry.jitter) {
            return bad("retry jitter must be within [0, 1)");
        }
        if self.job.workers == 0 {
            return bad("workers must be greater than 0");
        }
        if self.job.queue_capacity == 0 {
            return bad("queue_capacity must be greater than 0");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn defaults_are_valid_and_conservative() {
        let s = Settings::default();
        s.validate().unwrap();
        assert_eq!(s.output.safe_limit(None), 50_000);
        assert_eq!(s.output.job_row_threshold, 10_000);
        assert_eq!(s.rate_limit.max_permits, 120);
        assert_eq!(s.rate_limit.window, Duration::from_secs(60));
        assert_eq!(s.rate_limit.failure_threshold, 5);
        assert_eq!(s.output.chunk_size, 1_000);
    }

    #[test]
    fn unknown_profile_falls_back_to_default() {
        let mut out = OutputSettings::default();
        out.profiles.insert("small".into(), 8_000);
        assert_eq!(out.safe_limit(Some("small")), 2_000);
        assert_eq!(out.safe_limit(Some("missing")), 50_000);
    }

    #[test]
    fn overrides_apply_on_top_of_defaults() {
        let s = Settings::from_lookup(lookup(&[
            ("SPILLWAY_JOB_ROW_THRESHOLD", "500"),
            ("SPILLWAY_ASSUMED_CONSUMED_FRACTION", "0.5"),
            ("SPILLWAY_RETENTION_HOURS", "1"),
            ("SPILLWAY_OUTPUT_FORMAT", "json"),
            ("SPILLWAY_STORAGE_ROOT", "/var/lib/spillway"),
        ]))
        .unwrap();

        assert_eq!(s.output.job_row_threshold, 500);
        assert_eq!(s.output.safe_limit(None), 100_000);
        assert_eq!(s.job.retention, Duration::from_secs(3_600));
        assert_eq!(s.output.default_format, OutputFormat::Json);
        assert_eq!(s.storage.root, PathBuf::from("/var/lib/spillway"));
        // untouched
        assert_eq!(s.rate_limit.max_permits, 120);
    }

    #[test]
    fn unparsable_value_is_a_config_error() {
        let err = Settings::from_lookup(lookup(&[("SPILLWAY_WORKERS", "many")])).unwrap_err();
        assert!(matches!(err, SpillwayError::Config(msg) if msg.contains("SPILLWAY_WORKERS")));
    }

    #[test]
    fn oversized_retention_is_a_config_error() {
        let err = Settings::from_lookup(lookup(&[(
            "SPILLWAY_RETENTION_HOURS",
            "18446744073709551615",
        )]))
        .unwrap_err();
        assert!(matches!(err, SpillwayError::Config(msg) if msg.contains("SPILLWAY_RETENTION_HOURS")));
    }

    #[test]
    fn validate_rejects_out_of_range_fraction() {
        let mut s = Settings::default();
        s.output.assumed_consumed_fraction = 1.0;
        assert!(s.validate().is_err());
    }
}

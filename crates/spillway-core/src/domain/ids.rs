//! Domain identifiers.
//!
//! # ULID ベースの JobId
//! JobId は ULID (Universally Unique Lexicographically Sortable Identifier) を包む newtype です。
//!
//! ## ULID の特性
//! - **時刻でソート可能**: timestamp が先頭にあるため、生成順序でソートできる
//! - **128-bit**: UUID と同じサイズ
//!
//! 外部（ステータス問い合わせなど）には `job-<ULID>` という文字列で公開し、
//! 同じ形式からパースし直せます。

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use ulid::Ulid;

const JOB_PREFIX: &str = "job-";

/// Identifier of a background job.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(Ulid);

impl JobId {
    /// ULID から JobId を作成
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self(ulid)
    }

    /// 内部の ULID を取得
    pub fn as_ulid(&self) -> Ulid {
        self.0
    }
}

impl From<Ulid> for JobId {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", JOB_PREFIX, self.0)
    }
}

/// Error returned when a string is not a valid `job-<ULID>` identifier.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid job id: {0:?}")]
pub struct ParseJobIdError(pub String);

impl FromStr for JobId {
    type Err = ParseJobIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s
            .strip_prefix(JOB_PREFIX)
            .ok_or_else(|| ParseJobIdError(s.to_string()))?;
        Ulid::from_string(raw)
            .map(Self)
            .map_err(|_| ParseJobIdError(s.to_string()))
    }
}

impl Serialize for JobId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for JobId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_has_job_prefix() {
        let ulid = Ulid::new();
        let id = JobId::from_ulid(ulid);
        assert_eq!(id.as_ulid(), ulid);
        assert!(id.to_string().starts_with("job-"));
    }

    #[test]
    fn parses_back_from_display() {
        let id = JobId::from_ulid(Ulid::new());
        let parsed: JobId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn rejects_missing_prefix_and_garbage() {
        let ulid = Ulid::new();
        assert!(ulid.to_string().parse::<JobId>().is_err());
        assert!("job-not-a-ulid".parse::<JobId>().is_err());
        assert!("".parse::<JobId>().is_err());
    }

    #[test]
    fn ulid_ids_are_sortable() {
        // ULID は時刻ベースなので、生成順序でソート可能
        let id1 = JobId::from_ulid(Ulid::new());
        std::thread::sleep(std::time::Duration::from_millis(2));
        let id2 = JobId::from_ulid(Ulid::new());
        assert!(id1 < id2);
    }

    #[test]
    fn serializes_as_prefixed_string() {
        let id = JobId::from_ulid(Ulid::new());
        let v = serde_json::to_value(id).unwrap();
        assert_eq!(v, serde_json::Value::String(id.to_string()));
        let back: JobId = serde_json::from_value(v).unwrap();
        assert_eq!(back, id);
    }
}

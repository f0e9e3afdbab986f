//! Fetch operation snapshot and page cursor.
//!
//! Both are opaque to the job machinery: only the fetcher interprets them.

use serde::{Deserialize, Serialize};

/// What to fetch from the external provider.
///
/// Kept as a name plus free-form parameters so it can be stored on a job and
/// replayed by the worker (fetches are idempotent).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchOperation {
    /// Provider operation, e.g. `series_observations`.
    pub name: String,

    #[serde(default)]
    pub params: serde_json::Value,
}

impl FetchOperation {
    pub fn new(name: impl Into<String>, params: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            params,
        }
    }
}

/// Opaque position of the next page.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PageCursor(pub String);

impl PageCursor {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

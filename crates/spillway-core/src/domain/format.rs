//! Output format and caller-selectable output mode.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// On-disk representation of written records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Tabular; nested structures are flattened into scalar columns.
    #[default]
    Csv,
    /// Hierarchical; records are kept as-is inside one JSON array.
    Json,
}

impl OutputFormat {
    pub fn extension(self) -> &'static str {
        match self {
            OutputFormat::Csv => "csv",
            OutputFormat::Json => "json",
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "csv" => Ok(OutputFormat::Csv),
            "json" => Ok(OutputFormat::Json),
            other => Err(format!("unsupported output format: {other}")),
        }
    }
}

/// Output mode requested by the caller.
///
/// `Auto` lets the size verdict decide; any other value overrides it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputMode {
    #[default]
    Auto,
    Inline,
    File,
    Job,
}

impl FromStr for OutputMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(OutputMode::Auto),
            // "screen" is accepted as an alias of inline
            "inline" | "screen" => Ok(OutputMode::Inline),
            "file" => Ok(OutputMode::File),
            "job" | "background" => Ok(OutputMode::Job),
            other => Err(format!("unsupported output mode: {other}")),
        }
    }
}

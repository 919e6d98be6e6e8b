//! Per-file pipeline state machine
//!
//! ```text
//! queued -> metadata_extracted -> split -> packaged -> organized
//! (any non-terminal state) -> error       [terminal retry exhaustion]
//! error -> queued                         [administrative retry]
//! ```
//!
//! The Status Store value is the single authoritative position of a file.
//! Topic messages only ask a stage to attempt work.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::Error;

/// Position of a file in the pipeline. Exactly one value at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    /// Copied into the queue directory, waiting for metadata extraction
    Queued,
    /// Tag JSON written
    MetadataExtracted,
    /// Stems written
    Split,
    /// Mixed and tagged output written
    Packaged,
    /// Copied into the organized library
    Organized,
    /// Retry budget exhausted (absorbing until an administrative retry)
    Error,
}

impl FileStatus {
    /// All statuses in pipeline order, `Error` last
    pub const ALL: [FileStatus; 6] = [
        FileStatus::Queued,
        FileStatus::MetadataExtracted,
        FileStatus::Split,
        FileStatus::Packaged,
        FileStatus::Organized,
        FileStatus::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FileStatus::Queued => "queued",
            FileStatus::MetadataExtracted => "metadata_extracted",
            FileStatus::Split => "split",
            FileStatus::Packaged => "packaged",
            FileStatus::Organized => "organized",
            FileStatus::Error => "error",
        }
    }

    /// Ordinal along the forward path; `None` for `Error`
    pub fn rank(&self) -> Option<u8> {
        match self {
            FileStatus::Queued => Some(0),
            FileStatus::MetadataExtracted => Some(1),
            FileStatus::Split => Some(2),
            FileStatus::Packaged => Some(3),
            FileStatus::Organized => Some(4),
            FileStatus::Error => None,
        }
    }

    /// Successor on the forward path
    pub fn next(&self) -> Option<FileStatus> {
        match self {
            FileStatus::Queued => Some(FileStatus::MetadataExtracted),
            FileStatus::MetadataExtracted => Some(FileStatus::Split),
            FileStatus::Split => Some(FileStatus::Packaged),
            FileStatus::Packaged => Some(FileStatus::Organized),
            FileStatus::Organized | FileStatus::Error => None,
        }
    }

    /// `organized` and `error` take no further automatic transitions
    pub fn is_terminal(&self) -> bool {
        matches!(self, FileStatus::Organized | FileStatus::Error)
    }

    /// Whether a stage may move a file from `self` to `target`.
    ///
    /// Exactly one forward step. `error` can be entered from any non-terminal
    /// state and is left only through an administrative reset.
    pub fn can_advance_to(&self, target: FileStatus) -> bool {
        if target == FileStatus::Error {
            return !self.is_terminal();
        }
        self.next() == Some(target)
    }
}

impl fmt::Display for FileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FileStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "queued" | "queue" => Ok(FileStatus::Queued),
            "metadata_extracted" => Ok(FileStatus::MetadataExtracted),
            "split" => Ok(FileStatus::Split),
            "packaged" => Ok(FileStatus::Packaged),
            "organized" => Ok(FileStatus::Organized),
            "error" => Ok(FileStatus::Error),
            other => Err(Error::InvalidInput(format!("Unknown file status: {}", other))),
        }
    }
}

/// Structured terminal failure kept for inspection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileError {
    pub timestamp: DateTime<Utc>,
    /// Stage whose retry budget was exhausted
    pub stage: String,
    pub message: String,
    /// Error source chain, outermost first
    pub trace: String,
}

impl FileError {
    pub fn new(stage: impl Into<String>, message: impl Into<String>, trace: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            stage: stage.into(),
            message: message.into(),
            trace: trace.into(),
        }
    }

    /// Build from any error, walking its `source()` chain for the trace
    pub fn from_error(stage: &str, err: &(dyn std::error::Error + 'static)) -> Self {
        let mut trace = String::new();
        let mut current: Option<&(dyn std::error::Error + 'static)> = Some(err);
        let mut depth = 0;
        while let Some(e) = current {
            if depth > 0 {
                trace.push('\n');
            }
            trace.push_str(&format!("{}: {}", depth, e));
            current = e.source();
            depth += 1;
        }
        Self::new(stage, err.to_string(), trace)
    }
}

/// Everything known about one file, keyed by filename
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub filename: String,
    pub status: FileStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<FileError>,
    /// Failed attempts per stage name
    pub retry_counters: BTreeMap<String, u32>,
    pub updated_at: DateTime<Utc>,
}

impl FileRecord {
    pub fn new(filename: impl Into<String>, status: FileStatus) -> Self {
        Self {
            filename: filename.into(),
            status,
            last_error: None,
            retry_counters: BTreeMap::new(),
            updated_at: Utc::now(),
        }
    }

    pub fn retries_for(&self, stage: &str) -> u32 {
        self.retry_counters.get(stage).copied().unwrap_or(0)
    }
}

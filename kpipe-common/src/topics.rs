//! Topic names and stage topology
//!
//! Each stage consumes the topic named after its input status and
//! publishes to the topic named after the status it produces.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::{Error, FileStatus};

pub const STREAM_QUEUED: &str = "stream:queued";
pub const STREAM_METADATA_EXTRACTED: &str = "stream:metadata_extracted";
pub const STREAM_SPLIT: &str = "stream:split";
pub const STREAM_PACKAGED: &str = "stream:packaged";
pub const STREAM_ORGANIZED: &str = "stream:organized";

/// Topic that announces files which just reached `status`
pub fn topic_for(status: FileStatus) -> Option<&'static str> {
    match status {
        FileStatus::Queued => Some(STREAM_QUEUED),
        FileStatus::MetadataExtracted => Some(STREAM_METADATA_EXTRACTED),
        FileStatus::Split => Some(STREAM_SPLIT),
        FileStatus::Packaged => Some(STREAM_PACKAGED),
        FileStatus::Organized => Some(STREAM_ORGANIZED),
        FileStatus::Error => None,
    }
}

/// The four stage workers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Metadata,
    Split,
    Package,
    Organize,
}

impl StageKind {
    pub const ALL: [StageKind; 4] = [
        StageKind::Metadata,
        StageKind::Split,
        StageKind::Package,
        StageKind::Organize,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StageKind::Metadata => "metadata",
            StageKind::Split => "split",
            StageKind::Package => "package",
            StageKind::Organize => "organize",
        }
    }

    /// Key under which failed attempts are counted
    pub fn retry_name(&self) -> &'static str {
        match self {
            StageKind::Metadata => "metadata",
            StageKind::Split => "splitter",
            StageKind::Package => "packager",
            StageKind::Organize => "organizer",
        }
    }

    pub fn default_group(&self) -> &'static str {
        match self {
            StageKind::Metadata => "metadata-group",
            StageKind::Split => "splitter-group",
            StageKind::Package => "packager-group",
            StageKind::Organize => "organizer-group",
        }
    }

    pub fn default_consumer(&self) -> &'static str {
        match self {
            StageKind::Metadata => "metadata-consumer",
            StageKind::Split => "splitter-consumer",
            StageKind::Package => "packager-consumer",
            StageKind::Organize => "organizer-consumer",
        }
    }

    /// Status a file must have reached for this stage to pick it up
    pub fn input_status(&self) -> FileStatus {
        match self {
            StageKind::Metadata => FileStatus::Queued,
            StageKind::Split => FileStatus::MetadataExtracted,
            StageKind::Package => FileStatus::Split,
            StageKind::Organize => FileStatus::Packaged,
        }
    }

    /// Status written on success
    pub fn target_status(&self) -> FileStatus {
        match self {
            StageKind::Metadata => FileStatus::MetadataExtracted,
            StageKind::Split => FileStatus::Split,
            StageKind::Package => FileStatus::Packaged,
            StageKind::Organize => FileStatus::Organized,
        }
    }

    pub fn input_topic(&self) -> &'static str {
        match self {
            StageKind::Metadata => STREAM_QUEUED,
            StageKind::Split => STREAM_METADATA_EXTRACTED,
            StageKind::Package => STREAM_SPLIT,
            StageKind::Organize => STREAM_PACKAGED,
        }
    }

    pub fn output_topic(&self) -> &'static str {
        match self {
            StageKind::Metadata => STREAM_METADATA_EXTRACTED,
            StageKind::Split => STREAM_SPLIT,
            StageKind::Package => STREAM_PACKAGED,
            StageKind::Organize => STREAM_ORGANIZED,
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StageKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s || k.retry_name() == s)
            .ok_or_else(|| Error::InvalidInput(format!("Unknown stage: {}", s)))
    }
}

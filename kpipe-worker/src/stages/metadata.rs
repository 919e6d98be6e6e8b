//! Metadata extraction
//!
//! Content that is not audio at all fails here, permanently, so no later
//! stage ever sees it. Audio whose tags cannot be read still passes with
//! "Unknown" values; an unreadable container is caught by the split stage.

use async_trait::async_trait;
use kpipe_common::StageKind;
use lofty::file::TaggedFileExt;
use lofty::prelude::*;
use lofty::probe::Probe;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::path::Path;
use tracing::{debug, info, warn};

use super::{blocking, write_atomic};
use crate::error::{StageError, StageResult};
use crate::layout::{clean_string, ArtifactLayout};
use crate::worker::StageOperation;

pub const UNKNOWN_TITLE: &str = "Unknown Title";
pub const UNKNOWN_ARTIST: &str = "Unknown Artist";
pub const UNKNOWN_ALBUM: &str = "Unknown Album";

/// Tag JSON written by this stage and read by the package stage.
/// Keys follow ID3v2 frame names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackMetadata {
    #[serde(rename = "TIT2")]
    pub title: String,
    #[serde(rename = "TPE1")]
    pub artist: String,
    #[serde(rename = "TALB")]
    pub album: String,
    #[serde(rename = "TRCK", default)]
    pub track: String,
}

impl Default for TrackMetadata {
    fn default() -> Self {
        Self {
            title: UNKNOWN_TITLE.to_string(),
            artist: UNKNOWN_ARTIST.to_string(),
            album: UNKNOWN_ALBUM.to_string(),
            track: String::new(),
        }
    }
}

impl TrackMetadata {
    /// Read the JSON artifact, falling back to defaults when missing or broken
    pub fn load_or_default(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                warn!(path = %path.display(), "Unreadable metadata JSON, using defaults: {}", e);
                Self::default()
            }),
            Err(e) => {
                warn!(path = %path.display(), "Metadata JSON unavailable, using defaults: {}", e);
                Self::default()
            }
        }
    }
}

/// Reject content whose magic bytes are not an audio type
pub fn ensure_audio(path: &Path) -> StageResult<()> {
    match infer::get_from_path(path)? {
        Some(kind) if kind.matcher_type() == infer::MatcherType::Audio => Ok(()),
        Some(kind) => Err(StageError::Malformed(format!(
            "{}: {} is not audio",
            path.display(),
            kind.mime_type()
        ))),
        None => Err(StageError::Malformed(format!(
            "{}: unrecognised content",
            path.display()
        ))),
    }
}

/// Read tags; any failure yields the Unknown defaults
pub fn read_tags(path: &Path) -> TrackMetadata {
    let tagged_file = match Probe::open(path).and_then(|probe| probe.read()) {
        Ok(file) => file,
        Err(e) => {
            warn!(path = %path.display(), "Could not read tags, using defaults: {}", e);
            return TrackMetadata::default();
        }
    };

    let Some(tag) = tagged_file.primary_tag().or_else(|| tagged_file.first_tag()) else {
        debug!(path = %path.display(), "No tags present");
        return TrackMetadata::default();
    };

    TrackMetadata {
        title: tag_text(tag.title(), UNKNOWN_TITLE),
        artist: tag_text(tag.artist(), UNKNOWN_ARTIST),
        album: tag_text(tag.album(), UNKNOWN_ALBUM),
        track: tag.track().map(|n| n.to_string()).unwrap_or_default(),
    }
}

fn tag_text(value: Option<Cow<'_, str>>, fallback: &str) -> String {
    value
        .map(|v| clean_string(&v))
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| fallback.to_string())
}

pub struct MetadataStage {
    layout: ArtifactLayout,
}

impl MetadataStage {
    pub fn new(layout: ArtifactLayout) -> Self {
        Self { layout }
    }
}

#[async_trait]
impl StageOperation for MetadataStage {
    fn kind(&self) -> StageKind {
        StageKind::Metadata
    }

    async fn operate(&self, filename: &str) -> StageResult<()> {
        let json_path = self.layout.metadata_json(filename);
        if json_path.is_file() {
            debug!(file = filename, "Metadata already extracted");
            return Ok(());
        }

        let source = self.layout.queued(filename);
        if !source.is_file() {
            return Err(StageError::MissingArtifact(source));
        }

        let metadata = blocking(move || {
            ensure_audio(&source)?;
            Ok(read_tags(&source))
        })
        .await?;

        let json = serde_json::to_vec_pretty(&metadata)
            .map_err(|e| StageError::Transient(format!("Could not encode metadata: {}", e)))?;
        write_atomic(&json_path, &json)?;

        info!(file = filename, title = %metadata.title, artist = %metadata.artist, "Extracted metadata");
        Ok(())
    }
}

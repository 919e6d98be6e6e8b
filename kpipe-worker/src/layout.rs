//! Where each stage reads and writes its artifacts

use kpipe_common::config::{PackageFormat, ResolvedPaths};
use std::path::{Path, PathBuf};

/// Stem file extensions a separator may produce, in preference order
pub const STEM_EXTENSIONS: [&str; 3] = ["wav", "flac", "mp3"];

/// Strip surrounding whitespace, control characters and path separators
pub fn clean_string(value: &str) -> String {
    value
        .trim()
        .chars()
        .filter(|c| !c.is_control() && *c != '/' && *c != '\\')
        .collect()
}

/// Filename without its extension, after cleaning
pub fn song_name(filename: &str) -> String {
    let cleaned = clean_string(filename);
    match Path::new(&cleaned).file_stem().and_then(|s| s.to_str()) {
        Some(stem) if !stem.is_empty() => stem.to_string(),
        _ => cleaned,
    }
}

#[derive(Debug, Clone)]
pub struct ArtifactLayout {
    pub queue_dir: PathBuf,
    pub meta_dir: PathBuf,
    pub stems_dir: PathBuf,
    pub output_dir: PathBuf,
    pub organized_dir: PathBuf,
}

impl From<&ResolvedPaths> for ArtifactLayout {
    fn from(paths: &ResolvedPaths) -> Self {
        Self {
            queue_dir: paths.queue.clone(),
            meta_dir: paths.meta.clone(),
            stems_dir: paths.stems.clone(),
            output_dir: paths.output.clone(),
            organized_dir: paths.organized.clone(),
        }
    }
}

impl ArtifactLayout {
    /// Everything under one directory (tests, single-folder installs)
    pub fn under(root: &Path) -> Self {
        Self {
            queue_dir: root.join("queue"),
            meta_dir: root.join("meta"),
            stems_dir: root.join("stems"),
            output_dir: root.join("output"),
            organized_dir: root.join("organized"),
        }
    }

    pub fn create_all(&self) -> std::io::Result<()> {
        for dir in [
            &self.queue_dir,
            &self.meta_dir,
            &self.stems_dir,
            &self.output_dir,
            &self.organized_dir,
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    pub fn queued(&self, filename: &str) -> PathBuf {
        self.queue_dir.join(clean_string(filename))
    }

    pub fn metadata_json(&self, filename: &str) -> PathBuf {
        self.meta_dir.join(format!("{}.json", song_name(filename)))
    }

    pub fn stem_dir(&self, filename: &str) -> PathBuf {
        self.stems_dir.join(song_name(filename))
    }

    /// Existing file for `stem` in any known extension
    pub fn find_stem(&self, filename: &str, stem: &str) -> Option<PathBuf> {
        let dir = self.stem_dir(filename);
        STEM_EXTENSIONS
            .iter()
            .map(|ext| dir.join(format!("{}.{}", stem, ext)))
            .find(|p| p.is_file())
    }

    pub fn package(&self, filename: &str, format: PackageFormat) -> PathBuf {
        self.output_dir
            .join(format!("{}.{}", song_name(filename), format.extension()))
    }

    pub fn organized(&self, filename: &str, format: PackageFormat) -> PathBuf {
        self.organized_dir
            .join(format!("{}.{}", song_name(filename), format.extension()))
    }
}

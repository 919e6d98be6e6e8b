//! Final placement of packaged tracks

use async_trait::async_trait;
use kpipe_common::config::PackageFormat;
use kpipe_common::StageKind;
use tracing::{debug, info};

use crate::error::{StageError, StageResult};
use crate::layout::ArtifactLayout;
use crate::worker::StageOperation;

pub struct OrganizeStage {
    layout: ArtifactLayout,
    format: PackageFormat,
}

impl OrganizeStage {
    pub fn new(layout: ArtifactLayout, format: PackageFormat) -> Self {
        Self { layout, format }
    }
}

#[async_trait]
impl StageOperation for OrganizeStage {
    fn kind(&self) -> StageKind {
        StageKind::Organize
    }

    async fn operate(&self, filename: &str) -> StageResult<()> {
        let source = self.layout.package(filename, self.format);
        let source_meta = match tokio::fs::metadata(&source).await {
            Ok(meta) if meta.is_file() => meta,
            _ => return Err(StageError::MissingArtifact(source)),
        };

        let dest = self.layout.organized(filename, self.format);
        if let Ok(existing) = tokio::fs::metadata(&dest).await {
            if existing.is_file() && existing.len() == source_meta.len() {
                debug!(file = filename, "Already organized");
                return Ok(());
            }
        }

        tokio::fs::create_dir_all(&self.layout.organized_dir).await?;
        let staging = dest.with_extension("partial");
        tokio::fs::copy(&source, &staging).await?;
        tokio::fs::rename(&staging, &dest).await?;

        info!(file = filename, destination = %dest.display(), bytes = source_meta.len(), "Organized package");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> (TempDir, ArtifactLayout, OrganizeStage) {
        let temp_dir = TempDir::new().unwrap();
        let layout = ArtifactLayout::under(temp_dir.path());
        layout.create_all().unwrap();
        let stage = OrganizeStage::new(layout.clone(), PackageFormat::Wav);
        (temp_dir, layout, stage)
    }

    #[tokio::test]
    async fn test_copies_package() {
        let (_dir, layout, stage) = setup();
        std::fs::write(layout.package("song.mp3", PackageFormat::Wav), b"RIFF....").unwrap();

        stage.operate("song.mp3").await.unwrap();
        assert_eq!(
            std::fs::read(layout.organized("song.mp3", PackageFormat::Wav)).unwrap(),
            b"RIFF...."
        );
        // The package stays where it was
        assert!(layout.package("song.mp3", PackageFormat::Wav).is_file());
    }

    #[tokio::test]
    async fn test_missing_package() {
        let (_dir, _layout, stage) = setup();
        assert!(matches!(
            stage.operate("song.mp3").await,
            Err(StageError::MissingArtifact(_))
        ));
    }

    #[tokio::test]
    async fn test_same_size_destination_is_kept_and_different_size_replaced() {
        let (_dir, layout, stage) = setup();
        let package = layout.package("song.mp3", PackageFormat::Wav);
        let dest = layout.organized("song.mp3", PackageFormat::Wav);
        std::fs::write(&package, b"abcd").unwrap();

        std::fs::write(&dest, b"wxyz").unwrap();
        stage.operate("song.mp3").await.unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"wxyz");

        std::fs::write(&dest, b"xy").unwrap();
        stage.operate("song.mp3").await.unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"abcd");
    }
}

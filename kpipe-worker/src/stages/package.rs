//! Karaoke packaging
//!
//! Mixes the configured stems into one track, writes it as WAV or hands a
//! temporary WAV to the MP3 encoder, then tags it from the metadata JSON.
//! Tagging is best-effort.

use async_trait::async_trait;
use kpipe_common::config::{PackageConfig, PackageFormat};
use kpipe_common::StageKind;
use lofty::config::WriteOptions;
use lofty::file::{AudioFile, TaggedFileExt};
use lofty::id3::v2::Id3v2Tag;
use lofty::tag::Accessor;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::metadata::TrackMetadata;
use super::{blocking, render_command, run_tool};
use crate::audio::{decode_file, mix, read_wav, write_wav, AudioBuffer};
use crate::error::{StageError, StageResult};
use crate::layout::{song_name, ArtifactLayout};
use crate::worker::StageOperation;

pub struct PackageStage {
    layout: ArtifactLayout,
    config: PackageConfig,
}

impl PackageStage {
    pub fn new(layout: ArtifactLayout, config: PackageConfig) -> Self {
        Self { layout, config }
    }

    pub fn format(&self) -> PackageFormat {
        self.config.format
    }

    /// Sibling path the package is built under before being renamed into place
    fn staging_path(&self, filename: &str) -> PathBuf {
        self.layout.output_dir.join(format!(
            "{}.partial.{}",
            song_name(filename),
            self.config.format.extension()
        ))
    }

    async fn encode_mp3(&self, mixed: AudioBuffer, staging: &Path) -> StageResult<()> {
        let scratch = tempfile::Builder::new().prefix("kpipe-package-").tempdir()?;
        let wav = scratch.path().join("mix.wav");
        let wav_path = wav.clone();
        blocking(move || write_wav(&wav_path, &mixed)).await?;

        let input_arg = wav.to_string_lossy();
        let output_arg = staging.to_string_lossy();
        let command = render_command(
            &self.config.encoder_command,
            &[("input", input_arg.as_ref()), ("output", output_arg.as_ref())],
        );
        run_tool(&command, None).await?;

        if !staging.is_file() {
            return Err(StageError::Transient(format!(
                "Encoder did not produce {}",
                staging.display()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl StageOperation for PackageStage {
    fn kind(&self) -> StageKind {
        StageKind::Package
    }

    async fn operate(&self, filename: &str) -> StageResult<()> {
        let dest = self.layout.package(filename, self.config.format);
        if dest.is_file() {
            debug!(file = filename, "Package already built");
            return Ok(());
        }

        let stems: Vec<PathBuf> = self
            .config
            .stems
            .iter()
            .filter_map(|stem| self.layout.find_stem(filename, stem))
            .collect();
        if stems.is_empty() {
            return Err(StageError::MissingArtifact(self.layout.stem_dir(filename)));
        }
        if stems.len() < self.config.stems.len() {
            warn!(file = filename, found = stems.len(), wanted = ?self.config.stems, "Some stems are missing, mixing what exists");
        }

        let metadata = TrackMetadata::load_or_default(&self.layout.metadata_json(filename));

        let mixed = blocking(move || {
            let buffers = stems.iter().map(|p| load(p)).collect::<StageResult<Vec<_>>>()?;
            mix(&buffers)
        })
        .await?;
        let duration_ms = mixed.duration_ms();

        let staging = self.staging_path(filename);
        match self.config.format {
            PackageFormat::Wav => {
                let path = staging.clone();
                blocking(move || write_wav(&path, &mixed)).await?;
            }
            PackageFormat::Mp3 => self.encode_mp3(mixed, &staging).await?,
        }

        let tagged = staging.clone();
        let tags = metadata.clone();
        blocking(move || {
            if let Err(e) = apply_tags(&tagged, &tags) {
                warn!(path = %tagged.display(), "Could not tag package: {}", e);
            }
            Ok(())
        })
        .await?;

        tokio::fs::rename(&staging, &dest).await?;

        info!(
            file = filename,
            title = %metadata.title,
            duration_ms,
            package = %dest.display(),
            "Packaged karaoke track"
        );
        Ok(())
    }
}

fn load(path: &Path) -> StageResult<AudioBuffer> {
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case("wav") => read_wav(path),
        _ => decode_file(path),
    }
}

fn apply_tags(path: &Path, metadata: &TrackMetadata) -> Result<(), lofty::error::LoftyError> {
    let mut tagged_file = lofty::probe::Probe::open(path)?.read()?;

    let mut tag = Id3v2Tag::default();
    tag.set_title(metadata.title.clone());
    tag.set_artist(metadata.artist.clone());
    tag.set_album(metadata.album.clone());
    // "3/12" style track fields keep only the number
    if let Some(track) = metadata
        .track
        .split('/')
        .next()
        .and_then(|n| n.trim().parse::<u32>().ok())
    {
        tag.set_track(track);
    }

    tagged_file.insert_tag(tag.into());
    tagged_file.save_to_path(path, WriteOptions::default())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::metadata::read_tags;
    use tempfile::TempDir;

    fn constant(level: f32, frames: usize) -> AudioBuffer {
        AudioBuffer {
            sample_rate: 8000,
            channels: 1,
            samples: vec![level; frames],
        }
    }

    fn setup(config: PackageConfig) -> (TempDir, ArtifactLayout, PackageStage) {
        let temp_dir = TempDir::new().unwrap();
        let layout = ArtifactLayout::under(temp_dir.path());
        layout.create_all().unwrap();
        let stage = PackageStage::new(layout.clone(), config);
        (temp_dir, layout, stage)
    }

    fn write_stem(layout: &ArtifactLayout, filename: &str, stem: &str, buffer: &AudioBuffer) {
        write_wav(&layout.stem_dir(filename).join(format!("{}.wav", stem)), buffer).unwrap();
    }

    #[tokio::test]
    async fn test_mixes_configured_stems_and_tags() {
        let (_dir, layout, stage) = setup(PackageConfig {
            stems: vec!["accompaniment".into(), "drums".into()],
            ..PackageConfig::default()
        });
        write_stem(&layout, "song.mp3", "accompaniment", &constant(0.25, 800));
        write_stem(&layout, "song.mp3", "drums", &constant(0.25, 400));
        write_stem(&layout, "song.mp3", "vocals", &constant(0.9, 800));
        std::fs::write(
            layout.metadata_json("song.mp3"),
            r#"{"TIT2":"Song","TPE1":"Band","TALB":"Record","TRCK":"3/12"}"#,
        )
        .unwrap();

        stage.operate("song.mp3").await.unwrap();

        let package = layout.package("song.mp3", PackageFormat::Wav);
        let mixed = read_wav(&package).unwrap();
        assert_eq!(mixed.frames(), 800);
        // Vocals are left out; the two stems overlap for the first half only
        assert!((mixed.samples[0] - 0.5).abs() < 0.01);
        assert!((mixed.samples[799] - 0.25).abs() < 0.01);
        assert!(!stage.staging_path("song.mp3").exists());

        let tags = read_tags(&package);
        assert_eq!(tags.title, "Song");
        assert_eq!(tags.artist, "Band");
        assert_eq!(tags.track, "3");
    }

    #[tokio::test]
    async fn test_missing_metadata_uses_defaults() {
        let (_dir, layout, stage) = setup(PackageConfig::default());
        write_stem(&layout, "song.wav", "accompaniment", &constant(0.1, 100));

        stage.operate("song.wav").await.unwrap();
        assert!(layout.package("song.wav", PackageFormat::Wav).is_file());
    }

    #[tokio::test]
    async fn test_no_stems_is_missing_artifact() {
        let (_dir, _layout, stage) = setup(PackageConfig::default());
        assert!(matches!(
            stage.operate("song.wav").await,
            Err(StageError::MissingArtifact(_))
        ));
    }

    #[tokio::test]
    async fn test_existing_package_short_circuits() {
        let (_dir, layout, stage) = setup(PackageConfig::default());
        std::fs::write(layout.package("song.wav", PackageFormat::Wav), b"done").unwrap();
        // No stems at all, yet nothing to do
        stage.operate("song.wav").await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_mp3_goes_through_encoder_and_survives_tag_failure() {
        let (_dir, layout, stage) = setup(PackageConfig {
            format: PackageFormat::Mp3,
            // Stand-in encoder writes junk, so tagging fails
            encoder_command: vec!["sh".into(), "-c".into(), "printf junk > {output}".into()],
            ..PackageConfig::default()
        });
        write_stem(&layout, "song.wav", "accompaniment", &constant(0.1, 100));

        stage.operate("song.wav").await.unwrap();
        let package = layout.package("song.wav", PackageFormat::Mp3);
        assert!(package.is_file());
        assert!(!layout.package("song.wav", PackageFormat::Wav).exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_encoder_failure_is_external() {
        let (_dir, layout, stage) = setup(PackageConfig {
            format: PackageFormat::Mp3,
            encoder_command: vec!["sh".into(), "-c".into(), "exit 1".into()],
            ..PackageConfig::default()
        });
        write_stem(&layout, "song.wav", "accompaniment", &constant(0.1, 100));

        assert!(matches!(
            stage.operate("song.wav").await,
            Err(StageError::External { .. })
        ));
        assert!(!layout.package("song.wav", PackageFormat::Mp3).exists());
    }
}

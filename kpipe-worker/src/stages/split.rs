//! Stem separation
//!
//! The separator itself is an external tool behind `StemSeparator`. With
//! chunking off, the whole queued file is handed to it and the produced
//! stems are copied as-is. With chunking on, the file is decoded and fed
//! through the adaptive chunker, one temporary WAV per piece.

use async_trait::async_trait;
use kpipe_common::config::{SeparatorKind, SplitConfig};
use kpipe_common::{Error, StageKind};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::{blocking, render_command, run_tool};
use crate::audio::{decode_file, probe_file, read_wav, write_wav, AudioBuffer};
use crate::chunker::{AdaptiveChunker, ChunkProcessor, ChunkingConfig, Parts};
use crate::error::{StageError, StageResult};
use crate::layout::{ArtifactLayout, STEM_EXTENSIONS};
use crate::worker::StageOperation;

/// Produced stem files by stem name
pub type StemFiles = BTreeMap<String, PathBuf>;

const SPLEETER_2: &[&str] = &["vocals", "accompaniment"];
const SPLEETER_4: &[&str] = &["vocals", "drums", "bass", "other"];
const SPLEETER_5: &[&str] = &["vocals", "drums", "bass", "piano", "other"];
const DEMUCS_2: &[&str] = &["vocals", "accompaniment"];
const DEMUCS_4: &[&str] = &["vocals", "drums", "bass", "other"];
const DEMUCS_6: &[&str] = &["vocals", "drums", "bass", "guitar", "piano", "other"];

/// Separator engine plus stem count
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeparatorModel {
    kind: SeparatorKind,
    stems: u32,
}

impl SeparatorModel {
    pub fn new(kind: SeparatorKind, stems: u32) -> kpipe_common::Result<Self> {
        let model = Self { kind, stems };
        if model.supported_stems().is_empty() {
            return Err(Error::Config(format!(
                "{:?} does not support a {}-stem model",
                kind, stems
            )));
        }
        Ok(model)
    }

    pub fn kind(&self) -> SeparatorKind {
        self.kind
    }

    pub fn stems(&self) -> u32 {
        self.stems
    }

    pub fn supported_stems(&self) -> &'static [&'static str] {
        match (self.kind, self.stems) {
            (SeparatorKind::Spleeter, 2) => SPLEETER_2,
            (SeparatorKind::Spleeter, 4) => SPLEETER_4,
            (SeparatorKind::Spleeter, 5) => SPLEETER_5,
            (SeparatorKind::Demucs, 2) => DEMUCS_2,
            (SeparatorKind::Demucs, 4) => DEMUCS_4,
            (SeparatorKind::Demucs, 6) => DEMUCS_6,
            _ => &[],
        }
    }

    /// File name (without extension) the tool uses for `stem`
    pub fn output_name<'a>(&self, stem: &'a str) -> &'a str {
        match (self.kind, self.stems, stem) {
            (SeparatorKind::Demucs, 2, "accompaniment") => "no_vocals",
            _ => stem,
        }
    }

    /// Model identifier passed to the tool
    pub fn model_name(&self) -> String {
        match (self.kind, self.stems) {
            (SeparatorKind::Spleeter, n) => format!("spleeter:{}stems", n),
            (SeparatorKind::Demucs, 6) => "htdemucs_6s".to_string(),
            (SeparatorKind::Demucs, _) => "htdemucs".to_string(),
        }
    }

    /// Built-in invocation; `{input}` and `{output}` are filled in per run
    pub fn default_command(&self) -> Vec<String> {
        let mut command: Vec<String> = match self.kind {
            SeparatorKind::Spleeter => vec!["spleeter", "separate", "-p", "{model}", "-o", "{output}"],
            SeparatorKind::Demucs => vec!["demucs", "-n", "{model}", "-o", "{output}"],
        }
        .into_iter()
        .map(String::from)
        .collect();

        if self.kind == SeparatorKind::Demucs && self.stems == 2 {
            command.push("--two-stems".to_string());
            command.push("vocals".to_string());
        }
        command.push("{input}".to_string());
        command
    }

    /// Configured selection restricted to what the model produces; all of
    /// them when nothing in the selection is supported
    pub fn select(&self, selection: &[String]) -> Vec<String> {
        let supported = self.supported_stems();
        let selected: Vec<String> = selection
            .iter()
            .map(|s| s.trim().to_ascii_lowercase())
            .filter(|s| supported.contains(&s.as_str()))
            .fold(Vec::new(), |mut acc, s| {
                if !acc.contains(&s) {
                    acc.push(s);
                }
                acc
            });

        if selected.is_empty() {
            warn!(
                ?selection,
                model = %self.model_name(),
                "No selected stem is supported by the model, exporting all"
            );
            return supported.iter().map(|s| s.to_string()).collect();
        }
        selected
    }
}

#[async_trait]
pub trait StemSeparator: Send + Sync {
    /// Separate `input`, writing results somewhere under `out_dir`
    async fn separate(&self, input: &Path, out_dir: &Path) -> StageResult<StemFiles>;
}

/// Runs spleeter, demucs or a configured replacement as a child process
pub struct CommandSeparator {
    model: SeparatorModel,
    command: Vec<String>,
}

impl CommandSeparator {
    pub fn new(model: SeparatorModel, command: Option<Vec<String>>) -> Self {
        Self {
            command: command.unwrap_or_else(|| model.default_command()),
            model,
        }
    }

    pub fn model(&self) -> SeparatorModel {
        self.model
    }

    /// Tools nest their output (`<out>/<song>/` or `<out>/<model>/<song>/`),
    /// so search the whole tree
    fn collect_outputs(&self, out_dir: &Path) -> StemFiles {
        let mut found = StemFiles::new();
        for entry in WalkDir::new(out_dir).into_iter().filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            let (Some(name), Some(ext)) = (
                path.file_stem().and_then(|s| s.to_str()),
                path.extension().and_then(|s| s.to_str()),
            ) else {
                continue;
            };
            if !STEM_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()) {
                continue;
            }
            for stem in self.model.supported_stems() {
                if self.model.output_name(stem) == name {
                    found.entry(stem.to_string()).or_insert_with(|| path.to_path_buf());
                }
            }
        }
        found
    }
}

#[async_trait]
impl StemSeparator for CommandSeparator {
    async fn separate(&self, input: &Path, out_dir: &Path) -> StageResult<StemFiles> {
        tokio::fs::create_dir_all(out_dir).await?;

        let input_arg = input.to_string_lossy();
        let output_arg = out_dir.to_string_lossy();
        let stems_arg = self.model.stems().to_string();
        let model_arg = self.model.model_name();
        let command = render_command(
            &self.command,
            &[
                ("input", input_arg.as_ref()),
                ("output", output_arg.as_ref()),
                ("stems", stems_arg.as_str()),
                ("model", model_arg.as_str()),
            ],
        );

        run_tool(&command, None).await?;

        let found = self.collect_outputs(out_dir);
        if found.is_empty() {
            return Err(StageError::Transient(format!(
                "Separator produced no stems under {}",
                out_dir.display()
            )));
        }
        debug!(stems = ?found.keys().collect::<Vec<_>>(), "Separator finished");
        Ok(found)
    }
}

pub struct SplitStage {
    layout: ArtifactLayout,
    separator: Arc<dyn StemSeparator>,
    stems: Vec<String>,
    chunker: AdaptiveChunker,
}

impl SplitStage {
    pub fn new(
        layout: ArtifactLayout,
        separator: Arc<dyn StemSeparator>,
        stems: Vec<String>,
        chunking: ChunkingConfig,
    ) -> Self {
        Self {
            layout,
            separator,
            stems,
            chunker: AdaptiveChunker::new(chunking),
        }
    }

    /// Command-line separator chosen by `[split]`
    pub fn from_config(layout: ArtifactLayout, config: &SplitConfig) -> kpipe_common::Result<Self> {
        let model = SeparatorModel::new(config.separator, config.stems)?;
        let stems = model.select(&config.stem_selection);
        let separator = CommandSeparator::new(model, config.separator_command.clone());
        info!(model = %model.model_name(), ?stems, chunking = config.chunking_enabled, "Split stage configured");
        Ok(Self::new(layout, Arc::new(separator), stems, ChunkingConfig::from(config)))
    }

    pub fn selected_stems(&self) -> &[String] {
        &self.stems
    }

    async fn split_whole(&self, filename: &str, source: &Path, scratch: &Path) -> StageResult<usize> {
        let files = self.separator.separate(source, &scratch.join("whole")).await?;

        let stem_dir = self.layout.stem_dir(filename);
        let exports: Vec<(String, PathBuf)> = self
            .stems
            .iter()
            .filter_map(|stem| files.get(stem).map(|path| (stem.clone(), path.clone())))
            .collect();
        if exports.is_empty() {
            return Err(StageError::Transient(format!(
                "Separator produced none of the selected stems {:?}",
                self.stems
            )));
        }

        blocking(move || {
            std::fs::create_dir_all(&stem_dir)?;
            let mut staged = Vec::with_capacity(exports.len());
            for (stem, path) in &exports {
                let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("wav");
                let dest = stem_dir.join(format!("{}.{}", stem, ext.to_ascii_lowercase()));
                let tmp = dest.with_extension("partial");
                std::fs::copy(path, &tmp)?;
                staged.push((tmp, dest));
            }
            for (tmp, dest) in &staged {
                std::fs::rename(tmp, dest)?;
            }
            Ok(staged.len())
        })
        .await
    }

    async fn split_chunked(&self, filename: &str, source: &Path, scratch: &Path) -> StageResult<usize> {
        let source = source.to_path_buf();
        let audio = blocking(move || decode_file(&source)).await?;

        let processor = SeparatingProcessor {
            separator: self.separator.as_ref(),
            scratch,
            stems: &self.stems,
        };
        let run = self.chunker.run(&audio, &processor).await?;
        drop(audio);

        if run.parts.is_empty() {
            return Err(StageError::Transient("Every separated stem was empty".to_string()));
        }
        info!(
            file = filename,
            passes = run.passes,
            chunk_length_ms = run.chunk_length_ms,
            "Chunked separation complete"
        );

        let stem_dir = self.layout.stem_dir(filename);
        blocking(move || {
            let mut staged = Vec::with_capacity(run.parts.len());
            for (stem, buffer) in &run.parts {
                let dest = stem_dir.join(format!("{}.wav", stem));
                let tmp = dest.with_extension("partial");
                write_wav(&tmp, buffer)?;
                staged.push((tmp, dest));
            }
            for (tmp, dest) in &staged {
                std::fs::rename(tmp, dest)?;
            }
            Ok(staged.len())
        })
        .await
    }
}

#[async_trait]
impl StageOperation for SplitStage {
    fn kind(&self) -> StageKind {
        StageKind::Split
    }

    async fn operate(&self, filename: &str) -> StageResult<()> {
        if let Some(existing) = self.stems.iter().find_map(|stem| self.layout.find_stem(filename, stem)) {
            debug!(file = filename, stem = %existing.display(), "Stems already present");
            return Ok(());
        }

        let source = self.layout.queued(filename);
        if !source.is_file() {
            return Err(StageError::MissingArtifact(source));
        }

        let probe_path = source.clone();
        blocking(move || probe_file(&probe_path)).await?;

        let scratch = tempfile::Builder::new().prefix("kpipe-split-").tempdir()?;
        let written = if self.chunker.config().enabled {
            self.split_chunked(filename, &source, scratch.path()).await?
        } else {
            self.split_whole(filename, &source, scratch.path()).await?
        };

        info!(file = filename, stems = written, "Split into stems");
        Ok(())
    }
}

/// Separates one piece through a temporary WAV
struct SeparatingProcessor<'a> {
    separator: &'a dyn StemSeparator,
    scratch: &'a Path,
    stems: &'a [String],
}

#[async_trait]
impl<'a> ChunkProcessor for SeparatingProcessor<'a> {
    async fn process(&self, chunk: &AudioBuffer, index: usize) -> StageResult<Parts> {
        let dir = self.scratch.join(format!("chunk-{:05}", index));
        let input = dir.join("input.wav");

        let (scratch_dir, wav_path, audio) = (dir.clone(), input.clone(), chunk.clone());
        blocking(move || {
            // Left over from a failed pass at a different length
            if scratch_dir.exists() {
                std::fs::remove_dir_all(&scratch_dir)?;
            }
            write_wav(&wav_path, &audio)
        })
        .await?;

        let files = self.separator.separate(&input, &dir.join("stems")).await?;

        let stems = self.stems.to_vec();
        let parts = blocking(move || {
            let mut parts = Parts::new();
            for stem in stems {
                if let Some(path) = files.get(&stem) {
                    let audio = load_stem(path)?;
                    parts.insert(stem, audio);
                }
            }
            if let Err(e) = std::fs::remove_dir_all(&dir) {
                debug!(dir = %dir.display(), "Could not remove chunk scratch: {}", e);
            }
            Ok(parts)
        })
        .await?;

        if parts.is_empty() {
            return Err(StageError::Transient(format!(
                "Separator produced none of the selected stems for chunk {}",
                index
            )));
        }
        Ok(parts)
    }
}

fn load_stem(path: &Path) -> StageResult<AudioBuffer> {
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case("wav") => read_wav(path),
        _ => decode_file(path),
    }
}

//! Pipeline configuration
//!
//! Resolution order for every setting:
//! 1. Command-line argument (highest priority, applied by the binary)
//! 2. Environment variable
//! 3. TOML config file
//! 4. Compiled default (fallback)
//!
//! A missing config file is not an error: defaults are used and a warning
//! is logged.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

use crate::{Error, Result, StageKind};

/// Overrides the root folder (below the CLI flag)
pub const ROOT_FOLDER_ENV: &str = "KPIPE_ROOT_FOLDER";
/// Overrides the config file location
pub const CONFIG_FILE_ENV: &str = "KPIPE_CONFIG";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Base for every relative path below; `None` means the platform default
    pub root_folder: Option<PathBuf>,
    /// SQLite file shared by all workers
    pub database: PathBuf,
    pub paths: PathsConfig,
    pub stages: StagesConfig,
    pub split: SplitConfig,
    pub package: PackageConfig,
    pub notify: NotifyConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            root_folder: None,
            database: PathBuf::from("pipeline.db"),
            paths: PathsConfig::default(),
            stages: StagesConfig::default(),
            split: SplitConfig::default(),
            package: PackageConfig::default(),
            notify: NotifyConfig::default(),
            server: ServerConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Artifact directories; relative entries resolve under the root folder
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub input: PathBuf,
    pub queue: PathBuf,
    pub meta: PathBuf,
    pub stems: PathBuf,
    pub output: PathBuf,
    pub organized: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            input: PathBuf::from("input"),
            queue: PathBuf::from("queue"),
            meta: PathBuf::from("meta"),
            stems: PathBuf::from("stems"),
            output: PathBuf::from("output"),
            organized: PathBuf::from("organized"),
        }
    }
}

/// Absolute artifact directories after root folder resolution
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedPaths {
    pub root: PathBuf,
    pub database: PathBuf,
    pub input: PathBuf,
    pub queue: PathBuf,
    pub meta: PathBuf,
    pub stems: PathBuf,
    pub output: PathBuf,
    pub organized: PathBuf,
}

impl ResolvedPaths {
    /// Create every artifact directory (the database file is created on open)
    pub fn create_all(&self) -> Result<()> {
        for dir in [&self.input, &self.queue, &self.meta, &self.stems, &self.output, &self.organized] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

/// Per-stage worker settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageSettings {
    /// Attempts per file before it is marked `error`
    pub max_retries: u32,
    /// Fixed delay between attempts
    pub retry_delay_ms: u64,
    /// Consumer group; empty means the stage's default group
    pub group: String,
    /// Consumer name within the group; empty means the stage's default
    pub consumer: String,
    pub block_timeout_ms: u64,
    pub batch_size: usize,
}

impl Default for StageSettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_ms: 10_000,
            group: String::new(),
            consumer: String::new(),
            block_timeout_ms: 5_000,
            batch_size: 1,
        }
    }
}

impl StageSettings {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn block_timeout(&self) -> Duration {
        Duration::from_millis(self.block_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StagesConfig {
    pub metadata: StageSettings,
    pub split: StageSettings,
    pub package: StageSettings,
    pub organize: StageSettings,
}

impl Default for StagesConfig {
    fn default() -> Self {
        Self {
            metadata: StageSettings {
                retry_delay_ms: 5_000,
                ..StageSettings::default()
            },
            split: StageSettings::default(),
            package: StageSettings::default(),
            organize: StageSettings::default(),
        }
    }
}

impl StagesConfig {
    pub fn get(&self, kind: StageKind) -> &StageSettings {
        match kind {
            StageKind::Metadata => &self.metadata,
            StageKind::Split => &self.split,
            StageKind::Package => &self.package,
            StageKind::Organize => &self.organize,
        }
    }

    pub fn get_mut(&mut self, kind: StageKind) -> &mut StageSettings {
        match kind {
            StageKind::Metadata => &mut self.metadata,
            StageKind::Split => &mut self.split,
            StageKind::Package => &mut self.package,
            StageKind::Organize => &mut self.organize,
        }
    }
}

/// Source separation engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SeparatorKind {
    Spleeter,
    Demucs,
}

impl std::str::FromStr for SeparatorKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "SPLEETER" => Ok(SeparatorKind::Spleeter),
            "DEMUCS" => Ok(SeparatorKind::Demucs),
            other => Err(Error::Config(format!("Unknown separator: {}", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SplitConfig {
    pub chunking_enabled: bool,
    pub chunk_length_ms: u64,
    /// `None` means half of `chunk_length_ms`
    pub min_chunk_length_ms: Option<u64>,
    /// Chunk passes per attempt, independent of the stage retry budget
    pub chunk_max_attempts: u32,
    pub separator: SeparatorKind,
    pub stems: u32,
    /// Stems to export; intersected with what the model supports
    pub stem_selection: Vec<String>,
    /// Replaces the built-in separator invocation. `{input}`, `{output}`,
    /// `{stems}` and `{model}` are substituted.
    pub separator_command: Option<Vec<String>>,
}

impl Default for SplitConfig {
    fn default() -> Self {
        Self {
            chunking_enabled: false,
            chunk_length_ms: 240_000,
            min_chunk_length_ms: None,
            chunk_max_attempts: 3,
            separator: SeparatorKind::Spleeter,
            stems: 2,
            stem_selection: vec!["vocals".to_string(), "accompaniment".to_string()],
            separator_command: None,
        }
    }
}

impl SplitConfig {
    pub fn min_chunk_length_ms(&self) -> u64 {
        self.min_chunk_length_ms.unwrap_or(self.chunk_length_ms / 2)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageFormat {
    Wav,
    Mp3,
}

impl PackageFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            PackageFormat::Wav => "wav",
            PackageFormat::Mp3 => "mp3",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PackageConfig {
    pub format: PackageFormat,
    /// Stems mixed into the package
    pub stems: Vec<String>,
    /// MP3 encoder invocation; `{input}` and `{output}` are substituted
    pub encoder_command: Vec<String>,
}

impl Default for PackageConfig {
    fn default() -> Self {
        Self {
            format: PackageFormat::Wav,
            stems: vec!["accompaniment".to_string()],
            encoder_command: [
                "ffmpeg", "-y", "-loglevel", "error", "-i", "{input}", "-codec:a", "libmp3lame", "-q:a", "2",
                "{output}",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    /// JSON `{title, message}` is POSTed to each URL
    pub webhooks: Vec<String>,
    pub timeout_ms: u64,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            webhooks: Vec::new(),
            timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Enables `POST /reset` (development only)
    pub allow_reset: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5000,
            allow_reset: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl PipelineConfig {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(format!("Invalid config file: {}", e)))
    }

    /// Load from `path`, or from the platform config location when `None`.
    ///
    /// An explicitly named file must exist; a missing default file falls
    /// back to compiled defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let explicit = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var(CONFIG_FILE_ENV).ok().map(PathBuf::from));

        let config_path = match explicit {
            Some(path) => {
                if !path.exists() {
                    return Err(Error::Config(format!("Config file not found: {}", path.display())));
                }
                path
            }
            None => match default_config_file() {
                Some(path) => path,
                None => {
                    warn!("No config file found, using compiled defaults");
                    return Ok(Self::default());
                }
            },
        };

        debug!("Loading config from {}", config_path.display());
        let content = std::fs::read_to_string(&config_path)?;
        Self::from_toml_str(&content)
    }

    /// Apply `KPIPE_*` environment overrides
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    /// Apply overrides from any variable source
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(root) = lookup(ROOT_FOLDER_ENV) {
            self.root_folder = Some(PathBuf::from(root));
        }

        // Retry settings apply to every stage, matching per-service env vars
        if let Some(v) = lookup("KPIPE_MAX_RETRIES") {
            let max_retries = parse_env("KPIPE_MAX_RETRIES", &v)?;
            for kind in StageKind::ALL {
                self.stages.get_mut(kind).max_retries = max_retries;
            }
        }
        if let Some(v) = lookup("KPIPE_RETRY_DELAY_MS") {
            let delay = parse_env("KPIPE_RETRY_DELAY_MS", &v)?;
            for kind in StageKind::ALL {
                self.stages.get_mut(kind).retry_delay_ms = delay;
            }
        }

        if let Some(v) = lookup("KPIPE_CHUNKING_ENABLED") {
            self.split.chunking_enabled = parse_bool("KPIPE_CHUNKING_ENABLED", &v)?;
        }
        if let Some(v) = lookup("KPIPE_CHUNK_LENGTH_MS") {
            self.split.chunk_length_ms = parse_env("KPIPE_CHUNK_LENGTH_MS", &v)?;
        }
        if let Some(v) = lookup("KPIPE_MIN_CHUNK_LENGTH_MS") {
            self.split.min_chunk_length_ms = Some(parse_env("KPIPE_MIN_CHUNK_LENGTH_MS", &v)?);
        }
        if let Some(v) = lookup("KPIPE_CHUNK_MAX_ATTEMPTS") {
            self.split.chunk_max_attempts = parse_env("KPIPE_CHUNK_MAX_ATTEMPTS", &v)?;
        }
        if let Some(v) = lookup("KPIPE_SPLITTER_TYPE") {
            self.split.separator = v.parse()?;
        }
        if let Some(v) = lookup("KPIPE_STEMS") {
            self.split.stems = parse_env("KPIPE_STEMS", &v)?;
        }
        if let Some(v) = lookup("KPIPE_STEM_TYPE") {
            self.split.stem_selection = split_list(&v);
        }
        if let Some(v) = lookup("KPIPE_LOG_LEVEL") {
            self.logging.level = v;
        }
        if let Some(v) = lookup("KPIPE_NOTIFY_WEBHOOKS") {
            self.notify.webhooks = split_list(&v);
        }

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        for kind in StageKind::ALL {
            let stage = self.stages.get(kind);
            if stage.max_retries == 0 {
                return Err(Error::Config(format!("stages.{}.max_retries must be at least 1", kind)));
            }
            if stage.batch_size == 0 {
                return Err(Error::Config(format!("stages.{}.batch_size must be at least 1", kind)));
            }
        }

        let split = &self.split;
        if split.chunk_length_ms == 0 {
            return Err(Error::Config("split.chunk_length_ms must be positive".to_string()));
        }
        if split.min_chunk_length_ms() == 0 {
            return Err(Error::Config("split.min_chunk_length_ms must be positive".to_string()));
        }
        if split.min_chunk_length_ms() > split.chunk_length_ms {
            return Err(Error::Config(format!(
                "split.min_chunk_length_ms ({}) exceeds split.chunk_length_ms ({})",
                split.min_chunk_length_ms(),
                split.chunk_length_ms
            )));
        }
        if split.chunk_max_attempts == 0 {
            return Err(Error::Config("split.chunk_max_attempts must be at least 1".to_string()));
        }
        if split.stem_selection.is_empty() {
            return Err(Error::Config("split.stem_selection must name at least one stem".to_string()));
        }
        if matches!(&split.separator_command, Some(cmd) if cmd.is_empty()) {
            return Err(Error::Config("split.separator_command must not be empty".to_string()));
        }

        if self.package.stems.is_empty() {
            return Err(Error::Config("package.stems must name at least one stem".to_string()));
        }
        if self.package.format == PackageFormat::Mp3 && self.package.encoder_command.is_empty() {
            return Err(Error::Config("package.encoder_command is required for mp3 output".to_string()));
        }

        Ok(())
    }

    /// Consumer group for `kind`, falling back to the stage default
    pub fn group_for(&self, kind: StageKind) -> String {
        non_empty_or(&self.stages.get(kind).group, kind.default_group())
    }

    /// Consumer name for `kind`, falling back to the stage default
    pub fn consumer_for(&self, kind: StageKind) -> String {
        non_empty_or(&self.stages.get(kind).consumer, kind.default_consumer())
    }

    /// Root folder: CLI argument, then config/env value, then platform default
    pub fn resolve_root_folder(&self, cli_arg: Option<&Path>) -> PathBuf {
        cli_arg
            .map(Path::to_path_buf)
            .or_else(|| self.root_folder.clone())
            .unwrap_or_else(default_root_folder)
    }

    /// Artifact directories and database file under `root`
    pub fn resolve_paths(&self, root: &Path) -> ResolvedPaths {
        let under_root = |p: &Path| if p.is_absolute() { p.to_path_buf() } else { root.join(p) };
        ResolvedPaths {
            root: root.to_path_buf(),
            database: under_root(&self.database),
            input: under_root(&self.paths.input),
            queue: under_root(&self.paths.queue),
            meta: under_root(&self.paths.meta),
            stems: under_root(&self.paths.stems),
            output: under_root(&self.paths.output),
            organized: under_root(&self.paths.organized),
        }
    }
}

fn non_empty_or(value: &str, fallback: &str) -> String {
    if value.trim().is_empty() {
        fallback.to_string()
    } else {
        value.to_string()
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| Error::Config(format!("{}={:?}: {}", name, value, e)))
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(Error::Config(format!("{}={:?}: expected a boolean", name, value))),
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

/// First existing platform config file, if any
fn default_config_file() -> Option<PathBuf> {
    let user_config = dirs::config_dir().map(|d| d.join("kpipe").join("config.toml"));
    if let Some(path) = user_config {
        if path.exists() {
            return Some(path);
        }
    }

    if cfg!(target_os = "linux") {
        let system_config = PathBuf::from("/etc/kpipe/config.toml");
        if system_config.exists() {
            return Some(system_config);
        }
    }

    None
}

/// OS-dependent default root folder
pub fn default_root_folder() -> PathBuf {
    if cfg!(target_os = "linux") {
        // ~/.local/share/kpipe (or /var/lib/kpipe for system-wide)
        dirs::data_local_dir()
            .map(|d| d.join("kpipe"))
            .unwrap_or_else(|| PathBuf::from("/var/lib/kpipe"))
    } else if cfg!(target_os = "macos") {
        dirs::data_dir()
            .map(|d| d.join("kpipe"))
            .unwrap_or_else(|| PathBuf::from("/Library/Application Support/kpipe"))
    } else if cfg!(target_os = "windows") {
        dirs::data_local_dir()
            .map(|d| d.join("kpipe"))
            .unwrap_or_else(|| PathBuf::from("C:\\ProgramData\\kpipe"))
    } else {
        PathBuf::from("./kpipe_data")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_defaults_validate() {
        let config = PipelineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.split.min_chunk_length_ms(), 120_000);
        assert_eq!(config.stages.metadata.retry_delay_ms, 5_000);
        assert_eq!(config.stages.split.retry_delay_ms, 10_000);
        assert_eq!(config.group_for(StageKind::Split), "splitter-group");
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = PipelineConfig::from_toml_str(
            r#"
            root_folder = "/srv/karaoke"

            [stages.split]
            max_retries = 5
            group = "split-workers"

            [split]
            chunking_enabled = true
            separator = "DEMUCS"
            "#,
        )
        .unwrap();

        assert_eq!(config.root_folder, Some(PathBuf::from("/srv/karaoke")));
        assert_eq!(config.stages.split.max_retries, 5);
        assert_eq!(config.stages.split.batch_size, 1);
        assert_eq!(config.group_for(StageKind::Split), "split-workers");
        assert_eq!(config.consumer_for(StageKind::Split), "splitter-consumer");
        assert!(config.split.chunking_enabled);
        assert_eq!(config.split.separator, SeparatorKind::Demucs);
        assert_eq!(config.split.chunk_length_ms, 240_000);
        assert_eq!(config.package.format, PackageFormat::Wav);
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        let err = PipelineConfig::from_toml_str("stages = 3").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_overrides() {
        let mut config = PipelineConfig::default();
        config
            .apply_overrides(lookup(&[
                ("KPIPE_MAX_RETRIES", "7"),
                ("KPIPE_RETRY_DELAY_MS", "0"),
                ("KPIPE_CHUNKING_ENABLED", "true"),
                ("KPIPE_CHUNK_LENGTH_MS", "60000"),
                ("KPIPE_SPLITTER_TYPE", "demucs"),
                ("KPIPE_STEMS", "4"),
                ("KPIPE_STEM_TYPE", " vocals, drums ,"),
                ("KPIPE_NOTIFY_WEBHOOKS", "http://a/hook,http://b/hook"),
            ]))
            .unwrap();

        for kind in StageKind::ALL {
            assert_eq!(config.stages.get(kind).max_retries, 7);
            assert_eq!(config.stages.get(kind).retry_delay_ms, 0);
        }
        assert!(config.split.chunking_enabled);
        assert_eq!(config.split.min_chunk_length_ms(), 30_000);
        assert_eq!(config.split.separator, SeparatorKind::Demucs);
        assert_eq!(config.split.stems, 4);
        assert_eq!(config.split.stem_selection, vec!["vocals", "drums"]);
        assert_eq!(config.notify.webhooks.len(), 2);
        config.validate().unwrap();
    }

    #[test]
    fn test_bad_override_values_rejected() {
        let mut config = PipelineConfig::default();
        assert!(config.apply_overrides(lookup(&[("KPIPE_MAX_RETRIES", "many")])).is_err());
        assert!(config.apply_overrides(lookup(&[("KPIPE_CHUNKING_ENABLED", "maybe")])).is_err());
        assert!(config.apply_overrides(lookup(&[("KPIPE_SPLITTER_TYPE", "magic")])).is_err());
    }

    #[test]
    fn test_validate_rejects() {
        let mut config = PipelineConfig::default();
        config.stages.package.max_retries = 0;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.split.min_chunk_length_ms = Some(300_000);
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.split.chunk_max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.split.stem_selection.clear();
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.stages.organize.batch_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_resolve_paths() {
        let mut config = PipelineConfig::default();
        config.paths.organized = PathBuf::from("/mnt/library");
        let paths = config.resolve_paths(Path::new("/srv/karaoke"));

        assert_eq!(paths.database, PathBuf::from("/srv/karaoke/pipeline.db"));
        assert_eq!(paths.queue, PathBuf::from("/srv/karaoke/queue"));
        assert_eq!(paths.organized, PathBuf::from("/mnt/library"));
    }

    #[test]
    fn test_root_folder_priority() {
        let mut config = PipelineConfig::default();
        assert_eq!(config.resolve_root_folder(None), default_root_folder());

        config.root_folder = Some(PathBuf::from("/from/config"));
        assert_eq!(config.resolve_root_folder(None), PathBuf::from("/from/config"));
        assert_eq!(
            config.resolve_root_folder(Some(Path::new("/from/cli"))),
            PathBuf::from("/from/cli")
        );
    }
}

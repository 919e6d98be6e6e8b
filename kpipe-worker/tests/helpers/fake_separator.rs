//! Stand-in for spleeter/demucs

use async_trait::async_trait;
use kpipe_worker::audio::{read_wav, write_wav, AudioBuffer};
use kpipe_worker::stages::split::StemFiles;
use kpipe_worker::stages::StemSeparator;
use kpipe_worker::{StageError, StageResult};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

/// "vocals" is the input itself, "accompaniment" the input at half volume.
/// Inputs longer than `limit_ms` fail like an out-of-memory separator.
pub struct FakeSeparator {
    limit_ms: u64,
    calls: AtomicUsize,
}

impl FakeSeparator {
    pub fn new() -> Self {
        Self::with_limit(u64::MAX)
    }

    pub fn with_limit(limit_ms: u64) -> Self {
        Self {
            limit_ms,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StemSeparator for FakeSeparator {
    async fn separate(&self, input: &Path, out_dir: &Path) -> StageResult<StemFiles> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let audio = read_wav(input)?;
        if audio.duration_ms() > self.limit_ms {
            return Err(StageError::Transient("separator killed: out of memory".to_string()));
        }

        let accompaniment = AudioBuffer {
            samples: audio.samples.iter().map(|s| s * 0.5).collect(),
            ..audio.clone()
        };

        let mut files = StemFiles::new();
        for (stem, buffer) in [("vocals", &audio), ("accompaniment", &accompaniment)] {
            let path = out_dir.join("input").join(format!("{}.wav", stem));
            write_wav(&path, buffer)?;
            files.insert(stem.to_string(), path);
        }
        Ok(files)
    }
}

//! Audio test fixture generator

use std::path::{Path, PathBuf};

/// Configuration for generated audio
#[derive(Debug, Clone)]
pub struct AudioConfig {
    pub duration_seconds: f64,
    pub sample_rate: u32,
    pub channels: u16,
    pub frequency: f32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        // Small enough to keep the whole pipeline fast
        Self {
            duration_seconds: 1.0,
            sample_rate: 8000,
            channels: 2,
            frequency: 440.0,
        }
    }
}

/// Write a 16-bit sine tone WAV
pub fn generate_test_wav(path: &Path, config: &AudioConfig) -> anyhow::Result<PathBuf> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let spec = hound::WavSpec {
        channels: config.channels,
        sample_rate: config.sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut writer = hound::WavWriter::create(path, spec)?;
    let total_frames = (config.duration_seconds * config.sample_rate as f64) as usize;
    for i in 0..total_frames {
        let t = i as f32 / config.sample_rate as f32;
        let sample = (2.0 * std::f32::consts::PI * config.frequency * t).sin() * 0.5;
        let sample_i16 = (sample * 32767.0) as i16;
        for _ in 0..config.channels {
            writer.write_sample(sample_i16)?;
        }
    }
    writer.finalize()?;

    Ok(path.to_path_buf())
}

/// An MP3-named file whose ID3 header promises data that is not there
pub fn write_corrupted_mp3(path: &Path) -> anyhow::Result<PathBuf> {
    let mut bytes = b"ID3\x03\x00\x00\x00\x00\x00\x0a".to_vec();
    bytes.extend_from_slice(&[0u8; 256]);
    std::fs::write(path, bytes)?;
    Ok(path.to_path_buf())
}

/// Plain text with an audio extension
pub fn write_text_as_mp3(path: &Path) -> anyhow::Result<PathBuf> {
    std::fs::write(path, "These are the liner notes, not a song.\n")?;
    Ok(path.to_path_buf())
}

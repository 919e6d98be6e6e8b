//! PCM audio buffers
//!
//! Decoding of arbitrary containers goes through symphonia; stems and
//! packages are read and written as WAV with hound. Samples are kept as
//! interleaved f32 in [-1.0, 1.0].

use std::path::Path;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

use crate::error::{StageError, StageResult};

#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    pub sample_rate: u32,
    pub channels: u16,
    /// Interleaved samples, `channels` per frame
    pub samples: Vec<f32>,
}

impl AudioBuffer {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
            samples: Vec::new(),
        }
    }

    pub fn frames(&self) -> usize {
        if self.channels == 0 {
            0
        } else {
            self.samples.len() / self.channels as usize
        }
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn duration_ms(&self) -> u64 {
        if self.sample_rate == 0 {
            return 0;
        }
        self.frames() as u64 * 1000 / self.sample_rate as u64
    }

    /// Consecutive pieces of at most `chunk_ms` each; the last may be shorter
    pub fn chunks(&self, chunk_ms: u64) -> Vec<AudioBuffer> {
        let frames_per_chunk = ((self.sample_rate as u64 * chunk_ms) / 1000).max(1) as usize;
        let samples_per_chunk = frames_per_chunk * self.channels.max(1) as usize;

        self.samples
            .chunks(samples_per_chunk)
            .map(|piece| AudioBuffer {
                sample_rate: self.sample_rate,
                channels: self.channels,
                samples: piece.to_vec(),
            })
            .collect()
    }

    /// Concatenate `other` onto the end. An empty buffer adopts `other`'s format.
    pub fn append(&mut self, other: &AudioBuffer) -> StageResult<()> {
        if self.is_empty() {
            self.sample_rate = other.sample_rate;
            self.channels = other.channels;
        } else if self.sample_rate != other.sample_rate || self.channels != other.channels {
            return Err(StageError::Transient(format!(
                "Cannot join {} Hz/{} ch audio onto {} Hz/{} ch",
                other.sample_rate, other.channels, self.sample_rate, self.channels
            )));
        }
        self.samples.extend_from_slice(&other.samples);
        Ok(())
    }
}

/// Sample-wise sum of `buffers`, clipped to [-1.0, 1.0].
/// Shorter inputs are treated as silence past their end.
pub fn mix(buffers: &[AudioBuffer]) -> StageResult<AudioBuffer> {
    let Some(first) = buffers.first() else {
        return Err(StageError::Transient("Nothing to mix".to_string()));
    };

    let mut out = AudioBuffer::new(first.sample_rate, first.channels);
    for buffer in buffers {
        if buffer.sample_rate != out.sample_rate || buffer.channels != out.channels {
            return Err(StageError::Transient(format!(
                "Stem format mismatch: {} Hz/{} ch vs {} Hz/{} ch",
                buffer.sample_rate, buffer.channels, out.sample_rate, out.channels
            )));
        }
        if buffer.samples.len() > out.samples.len() {
            out.samples.resize(buffer.samples.len(), 0.0);
        }
        for (acc, s) in out.samples.iter_mut().zip(&buffer.samples) {
            *acc += s;
        }
    }

    for s in out.samples.iter_mut() {
        *s = s.clamp(-1.0, 1.0);
    }
    Ok(out)
}

fn open_format(path: &Path) -> StageResult<Box<dyn FormatReader>> {
    let file = std::fs::File::open(path)?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(extension) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(extension);
    }

    let probed = symphonia::default::get_probe()
        .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
        .map_err(|e| StageError::Malformed(format!("{}: unreadable container: {}", path.display(), e)))?;

    Ok(probed.format)
}

/// Check that `path` is a decodable audio container without decoding it
pub fn probe_file(path: &Path) -> StageResult<()> {
    let format = open_format(path)?;
    let has_audio = format
        .tracks()
        .iter()
        .any(|t| t.codec_params.codec != CODEC_TYPE_NULL);

    if !has_audio {
        return Err(StageError::Malformed(format!("{}: no audio track", path.display())));
    }
    Ok(())
}

/// Decode the default audio track of any supported container
pub fn decode_file(path: &Path) -> StageResult<AudioBuffer> {
    tracing::debug!(path = %path.display(), "Decoding audio file");

    let mut format = open_format(path)?;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| StageError::Malformed(format!("{}: no audio track", path.display())))?;
    let track_id = track.id;
    let sample_rate = track
        .codec_params
        .sample_rate
        .ok_or_else(|| StageError::Malformed(format!("{}: sample rate unknown", path.display())))?;

    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|e| StageError::Malformed(format!("{}: unsupported codec: {}", path.display(), e)))?;

    let mut buffer = AudioBuffer::new(sample_rate, 0);
    let mut sample_buf: Option<(usize, SampleBuffer<f32>)> = None;

    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(SymphoniaError::ResetRequired) => break,
            Err(e) => {
                return Err(StageError::Malformed(format!("{}: error reading packet: {}", path.display(), e)));
            }
        };

        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => decoded,
            // A damaged packet is skipped, not fatal
            Err(SymphoniaError::DecodeError(e)) => {
                tracing::debug!(path = %path.display(), "Skipping undecodable packet: {}", e);
                continue;
            }
            Err(e) => {
                return Err(StageError::Malformed(format!("{}: decode failed: {}", path.display(), e)));
            }
        };

        if buffer.channels == 0 {
            buffer.channels = decoded.spec().channels.count() as u16;
        }

        // Reallocate only when a packet is larger than any seen so far
        let frames = decoded.capacity();
        if sample_buf.as_ref().map_or(true, |(cap, _)| *cap < frames) {
            sample_buf = Some((frames, SampleBuffer::<f32>::new(frames as u64, *decoded.spec())));
        }
        if let Some((_, sb)) = sample_buf.as_mut() {
            sb.copy_interleaved_ref(decoded);
            buffer.samples.extend_from_slice(sb.samples());
        }
    }

    if buffer.channels == 0 || buffer.is_empty() {
        return Err(StageError::Malformed(format!("{}: no decodable audio", path.display())));
    }

    tracing::debug!(
        path = %path.display(),
        frames = buffer.frames(),
        duration_ms = buffer.duration_ms(),
        "Audio decoding complete"
    );
    Ok(buffer)
}

/// Read a WAV file (integer or float samples)
pub fn read_wav(path: &Path) -> StageResult<AudioBuffer> {
    let mut reader = hound::WavReader::open(path).map_err(|e| wav_error(path, e))?;
    let spec = reader.spec();

    let samples: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<Result<_, _>>()
            .map_err(|e| wav_error(path, e))?,
        hound::SampleFormat::Int => {
            let scale = (1i64 << (spec.bits_per_sample.max(1) - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<Result<_, _>>()
                .map_err(|e| wav_error(path, e))?
        }
    };

    Ok(AudioBuffer {
        sample_rate: spec.sample_rate,
        channels: spec.channels,
        samples,
    })
}

/// Write 16-bit PCM WAV
pub fn write_wav(path: &Path, buffer: &AudioBuffer) -> StageResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let spec = hound::WavSpec {
        channels: buffer.channels,
        sample_rate: buffer.sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec).map_err(|e| wav_error(path, e))?;
    for &s in &buffer.samples {
        let v = (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
        writer.write_sample(v).map_err(|e| wav_error(path, e))?;
    }
    writer.finalize().map_err(|e| wav_error(path, e))?;
    Ok(())
}

fn wav_error(path: &Path, err: hound::Error) -> StageError {
    match err {
        hound::Error::IoError(e) => StageError::Io(e),
        other => StageError::Transient(format!("{}: {}", path.display(), other)),
    }
}

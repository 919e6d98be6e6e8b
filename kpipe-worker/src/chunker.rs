//! Adaptive Chunker
//!
//! Runs a constrained transformation over a long input in fixed-length
//! pieces. A failed pass throws away its partial merge, halves the chunk
//! length (never below the minimum) and starts again from the first piece.
//! A pass that fails at the minimum length gets exactly one more pass at
//! the minimum. The number of passes is bounded independently of the
//! stage retry budget.

use async_trait::async_trait;
use kpipe_common::config::SplitConfig;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

use crate::audio::AudioBuffer;
use crate::error::{StageError, StageResult};

/// Named outputs of one processed piece (stem name -> audio)
pub type Parts = BTreeMap<String, AudioBuffer>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkingConfig {
    pub enabled: bool,
    pub chunk_length_ms: u64,
    pub min_chunk_length_ms: u64,
    /// Passes allowed per call of `AdaptiveChunker::run`
    pub max_attempts: u32,
}

impl From<&SplitConfig> for ChunkingConfig {
    fn from(config: &SplitConfig) -> Self {
        Self {
            enabled: config.chunking_enabled,
            chunk_length_ms: config.chunk_length_ms,
            min_chunk_length_ms: config.min_chunk_length_ms(),
            max_attempts: config.chunk_max_attempts,
        }
    }
}

#[async_trait]
pub trait ChunkProcessor: Send + Sync {
    /// Transform one piece; `index` counts from 0 within a pass
    async fn process(&self, chunk: &AudioBuffer, index: usize) -> StageResult<Parts>;
}

/// Result of a successful run
#[derive(Debug)]
pub struct ChunkRun {
    /// Only parts that received audio
    pub parts: Parts,
    /// Passes used, including the successful one
    pub passes: u32,
    /// Chunk length of the successful pass (the whole input when disabled)
    pub chunk_length_ms: u64,
}

#[derive(Debug, Clone)]
pub struct AdaptiveChunker {
    config: ChunkingConfig,
}

impl AdaptiveChunker {
    pub fn new(config: ChunkingConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ChunkingConfig {
        &self.config
    }

    pub async fn run<P>(&self, input: &AudioBuffer, processor: &P) -> StageResult<ChunkRun>
    where
        P: ChunkProcessor + ?Sized,
    {
        if !self.config.enabled {
            // One whole-input attempt; a failure is the caller's to retry
            let parts = processor.process(input, 0).await?;
            return Ok(ChunkRun {
                parts: non_empty(parts),
                passes: 1,
                chunk_length_ms: input.duration_ms(),
            });
        }

        let min = self.config.min_chunk_length_ms.max(1);
        let mut length = self.config.chunk_length_ms.max(min);
        let max_attempts = self.config.max_attempts.max(1);
        let mut retried_at_min = false;
        let mut passes = 0;

        loop {
            passes += 1;
            debug!(pass = passes, chunk_length_ms = length, "Starting chunk pass");

            let err = match self.pass(input, length, processor).await {
                Ok(parts) => {
                    return Ok(ChunkRun {
                        parts: non_empty(parts),
                        passes,
                        chunk_length_ms: length,
                    });
                }
                Err(err) => err,
            };

            if err.is_permanent() {
                return Err(err);
            }
            warn!(pass = passes, chunk_length_ms = length, "Chunk pass failed: {}", err);

            if passes >= max_attempts {
                return Err(StageError::Chunking {
                    attempts: passes,
                    last: Box::new(err),
                });
            }

            if length > min {
                length = (length / 2).max(min);
                info!(chunk_length_ms = length, "Reducing chunk length");
            } else if !retried_at_min {
                retried_at_min = true;
                warn!(chunk_length_ms = length, "Chunk pass failed at minimum length, retrying at minimum");
            } else {
                return Err(StageError::Chunking {
                    attempts: passes,
                    last: Box::new(err),
                });
            }
        }
    }

    /// One full pass; any failing piece abandons the whole merge
    async fn pass<P>(&self, input: &AudioBuffer, length_ms: u64, processor: &P) -> StageResult<Parts>
    where
        P: ChunkProcessor + ?Sized,
    {
        let mut merged = Parts::new();
        for (index, chunk) in input.chunks(length_ms).iter().enumerate() {
            let parts = processor.process(chunk, index).await?;
            for (name, audio) in parts {
                merged
                    .entry(name)
                    .or_insert_with(|| AudioBuffer::new(audio.sample_rate, audio.channels))
                    .append(&audio)?;
            }
        }
        Ok(merged)
    }
}

fn non_empty(parts: Parts) -> Parts {
    parts.into_iter().filter(|(_, audio)| !audio.is_empty()).collect()
}

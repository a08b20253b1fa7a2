// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Chunk descriptors and chunking parameters.

use crate::analysis::FileFormat;
use crate::memory::MemoryPressure;
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const MB: u64 = 1024 * 1024;

/// Smallest chunk the adaptive strategy will produce
pub const MIN_ADAPTIVE_CHUNK_SIZE: u64 = 8 * MB;
/// Largest chunk the adaptive strategy will produce
pub const MAX_ADAPTIVE_CHUNK_SIZE: u64 = 256 * MB;
/// Chunk size used under memory pressure
pub const MEMORY_CONSTRAINED_CHUNK_SIZE: u64 = 16 * MB;

/// How a file is split into chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ChunkStrategy {
    FixedSize,
    AdaptiveSize,
    FormatAware,
    MemoryConstrained,
}

impl ChunkStrategy {
    pub fn name(self) -> &'static str {
        match self {
            ChunkStrategy::FixedSize => "fixed_size",
            ChunkStrategy::AdaptiveSize => "adaptive_size",
            ChunkStrategy::FormatAware => "format_aware",
            ChunkStrategy::MemoryConstrained => "memory_constrained",
        }
    }
}

impl fmt::Display for ChunkStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ChunkStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "fixed_size" | "fixed" => Ok(ChunkStrategy::FixedSize),
            "adaptive_size" | "adaptive" => Ok(ChunkStrategy::AdaptiveSize),
            "format_aware" => Ok(ChunkStrategy::FormatAware),
            "memory_constrained" => Ok(ChunkStrategy::MemoryConstrained),
            other => Err(format!("unknown chunk strategy '{}'", other)),
        }
    }
}

/// A contiguous byte range of the source file handled by one worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileChunk {
    pub id: usize,
    pub path: PathBuf,
    pub byte_start: u64,
    pub byte_size: u64,
    /// Index of the first record in this chunk
    pub record_start: u64,
    pub record_count: u64,
    pub strategy: ChunkStrategy,
    pub format: FileFormat,
}

impl FileChunk {
    /// One past the last byte.
    #[inline]
    pub fn byte_end(&self) -> u64 {
        self.byte_start + self.byte_size
    }

    /// One past the last record index.
    #[inline]
    pub fn record_end(&self) -> u64 {
        self.record_start + self.record_count
    }
}

/// Immutable chunking parameters.
///
/// Every adjustment returns a new value; nothing is mutated in place.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ChunkingParameters {
    pub strategy: ChunkStrategy,
    pub chunk_size: u64,
    pub max_concurrent_chunks: usize,
    pub memory_adaptive: bool,
    /// Desired wall time for parsing one chunk
    pub target_chunk_duration: Duration,
}

impl ChunkingParameters {
    pub fn new(strategy: ChunkStrategy, chunk_size: u64, max_concurrent_chunks: usize) -> Self {
        Self {
            strategy,
            chunk_size: chunk_size.max(1),
            max_concurrent_chunks: max_concurrent_chunks.max(1),
            memory_adaptive: matches!(
                strategy,
                ChunkStrategy::AdaptiveSize | ChunkStrategy::MemoryConstrained
            ),
            target_chunk_duration: Duration::from_secs(2),
        }
    }

    pub fn with_strategy(self, strategy: ChunkStrategy) -> Self {
        Self { strategy, ..self }
    }

    pub fn with_chunk_size(self, chunk_size: u64) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            ..self
        }
    }

    pub fn with_max_concurrent_chunks(self, max_concurrent_chunks: usize) -> Self {
        Self {
            max_concurrent_chunks: max_concurrent_chunks.max(1),
            ..self
        }
    }

    /// Scale the chunk size by the pressure multiplier, clamped to the
    /// adaptive range.
    pub fn scaled_for_pressure(self, pressure: MemoryPressure) -> Self {
        let scaled = (self.chunk_size as f64 * pressure.chunk_multiplier()) as u64;
        Self {
            chunk_size: scaled.clamp(MIN_ADAPTIVE_CHUNK_SIZE, MAX_ADAPTIVE_CHUNK_SIZE),
            memory_adaptive: true,
            ..self
        }
    }

    /// Small fixed chunks and half the concurrency.
    pub fn memory_constrained(self) -> Self {
        Self {
            strategy: ChunkStrategy::MemoryConstrained,
            chunk_size: MEMORY_CONSTRAINED_CHUNK_SIZE,
            max_concurrent_chunks: (self.max_concurrent_chunks / 2).max(1),
            memory_adaptive: true,
            ..self
        }
    }
}

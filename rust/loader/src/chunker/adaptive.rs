// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Adaptive chunking: strategy selection, delegation and validation.
//!
//! A chunking pass takes one memory snapshot up front and derives every
//! decision from it, so a plan is reproducible for a given file and
//! snapshot. The actual splitting is delegated to the fixed-record chunker
//! or to the boundary splitter registered for the file's format.

use super::boundary::{AsciiStlSeeker, BoundarySeeker, BoundarySplitter, LineSeeker};
use super::fixed::FixedSizeChunker;
use crate::analysis::{FileAnalysis, FileFormat};
use crate::cancellation::CancellationToken;
use crate::chunk::{ChunkStrategy, ChunkingParameters, FileChunk, MB};
use crate::config::LoaderConfig;
use crate::error::{LoadError, Result};
use crate::memory::{MemoryMonitor, MemorySnapshot};
use rustc_hash::FxHashMap;
use serde::Serialize;
use std::sync::Arc;

/// Outcome of the post-split consistency check.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ChunkValidation {
    pub chunk_count: usize,
    pub total_bytes: u64,
    /// Bytes the chunks should cover (file size minus header)
    pub expected_bytes: u64,
    pub total_records: u64,
    /// Recoverable drift, already logged
    pub warnings: Vec<String>,
}

/// Everything decided during one chunking pass.
#[derive(Debug, Clone)]
pub struct ChunkPlan {
    pub parameters: ChunkingParameters,
    pub chunks: Vec<FileChunk>,
    /// Memory snapshot all decisions were based on
    pub memory: MemorySnapshot,
    pub validation: ChunkValidation,
}

impl ChunkPlan {
    pub fn total_records(&self) -> u64 {
        self.validation.total_records
    }

    /// Largest single chunk in bytes.
    pub fn max_chunk_bytes(&self) -> u64 {
        self.chunks.iter().map(|c| c.byte_size).max().unwrap_or(0)
    }
}

/// Chooses a strategy and produces a validated chunk list.
pub struct AdaptiveChunker {
    fixed: FixedSizeChunker,
    base_chunk_size: u64,
    worker_threads: usize,
    low_memory_threshold: u64,
    forced_strategy: Option<ChunkStrategy>,
    memory: Arc<dyn MemoryMonitor>,
    seekers: FxHashMap<FileFormat, Arc<dyn BoundarySeeker>>,
}

impl AdaptiveChunker {
    pub fn new(config: &LoaderConfig, memory: Arc<dyn MemoryMonitor>) -> Self {
        let mut seekers: FxHashMap<FileFormat, Arc<dyn BoundarySeeker>> = FxHashMap::default();
        seekers.insert(FileFormat::AsciiStl, Arc::new(AsciiStlSeeker));
        seekers.insert(FileFormat::Obj, Arc::new(LineSeeker));

        Self {
            fixed: FixedSizeChunker::new(),
            base_chunk_size: config.base_chunk_size.max(1),
            worker_threads: config.worker_threads.max(1),
            low_memory_threshold: config.low_memory_threshold,
            forced_strategy: config.forced_strategy,
            memory,
            seekers,
        }
    }

    /// Use `seeker` for files of `format`, replacing any built-in one.
    pub fn register_seeker(mut self, format: FileFormat, seeker: Arc<dyn BoundarySeeker>) -> Self {
        self.seekers.insert(format, seeker);
        self
    }

    pub fn with_fixed_chunker(mut self, fixed: FixedSizeChunker) -> Self {
        self.fixed = fixed;
        self
    }

    /// Strategy rule, first match wins.
    pub fn select_strategy(&self, analysis: &FileAnalysis, memory: &MemorySnapshot) -> ChunkStrategy {
        if let Some(strategy) = self.forced_strategy {
            return strategy;
        }
        if memory.total_bytes < self.low_memory_threshold {
            return ChunkStrategy::MemoryConstrained;
        }
        analysis.recommended_strategy
    }

    /// Chunking parameters for `strategy` under `memory`.
    pub fn parameters_for(&self, strategy: ChunkStrategy, memory: &MemorySnapshot) -> ChunkingParameters {
        let base = ChunkingParameters::new(strategy, self.base_chunk_size, self.worker_threads);
        match strategy {
            ChunkStrategy::FixedSize | ChunkStrategy::FormatAware => base,
            ChunkStrategy::AdaptiveSize => base.scaled_for_pressure(memory.pressure()),
            ChunkStrategy::MemoryConstrained => base.memory_constrained(),
        }
    }

    /// Run one chunking pass over an analyzed file.
    pub fn plan(&self, analysis: &FileAnalysis, token: &CancellationToken) -> Result<ChunkPlan> {
        if token.is_cancelled() {
            return Err(LoadError::Cancelled);
        }

        let memory = self.memory.snapshot();
        let strategy = self.select_strategy(analysis, &memory);
        let parameters = self.parameters_for(strategy, &memory);

        tracing::info!(
            path = %analysis.path.display(),
            format = analysis.format.name(),
            strategy = %strategy,
            chunk_size_mb = parameters.chunk_size / MB,
            pressure = ?memory.pressure(),
            "Chunking file"
        );

        let chunks = self.split(analysis, &parameters, token)?;
        let validation = validate_chunks(&chunks, analysis)?;

        Ok(ChunkPlan {
            parameters,
            chunks,
            memory,
            validation,
        })
    }

    fn split(
        &self,
        analysis: &FileAnalysis,
        parameters: &ChunkingParameters,
        token: &CancellationToken,
    ) -> Result<Vec<FileChunk>> {
        if analysis.format.is_fixed_record() || parameters.strategy == ChunkStrategy::FixedSize {
            return self.fixed.split(analysis, parameters.chunk_size, parameters.strategy);
        }

        let seeker = self.seekers.get(&analysis.format).ok_or_else(|| {
            LoadError::UnsupportedFormat(format!(
                "no record boundary rule for {} files",
                analysis.format.name()
            ))
        })?;
        BoundarySplitter::new(seeker.as_ref()).split(
            analysis,
            parameters.chunk_size,
            parameters.strategy,
            token,
        )
    }
}

/// Check a chunk list against the file it was cut from.
///
/// Byte drift is tolerated with a warning. Record ranges must partition
/// `[0, total)` exactly and ids must follow offset order.
pub fn validate_chunks(chunks: &[FileChunk], analysis: &FileAnalysis) -> Result<ChunkValidation> {
    let mut sorted: Vec<&FileChunk> = chunks.iter().collect();
    sorted.sort_by_key(|c| c.byte_start);

    let expected_bytes = analysis.body_size();
    let mut validation = ChunkValidation {
        chunk_count: chunks.len(),
        expected_bytes,
        ..Default::default()
    };

    let mut next_byte = analysis.header_size;
    let mut next_record = 0u64;
    for (position, chunk) in sorted.iter().enumerate() {
        if chunk.id != position {
            return Err(LoadError::InvalidInput(format!(
                "chunk id {} at position {} breaks offset order",
                chunk.id, position
            )));
        }
        if chunk.record_start != next_record {
            return Err(LoadError::InvalidInput(format!(
                "chunk {} starts at record {} but {} was expected",
                chunk.id, chunk.record_start, next_record
            )));
        }
        if chunk.byte_start != next_byte {
            let kind = if chunk.byte_start > next_byte { "gap" } else { "overlap" };
            validation.warnings.push(format!(
                "byte {} before chunk {} ({} vs {})",
                kind, chunk.id, chunk.byte_start, next_byte
            ));
        }
        validation.total_bytes += chunk.byte_size;
        next_byte = chunk.byte_end();
        next_record = chunk.record_end();
    }
    validation.total_records = next_record;

    if validation.total_bytes != expected_bytes {
        validation.warnings.push(format!(
            "chunks cover {} bytes, file body is {} bytes",
            validation.total_bytes, expected_bytes
        ));
    }
    for warning in &validation.warnings {
        tracing::warn!(path = %analysis.path.display(), "{}", warning);
    }

    Ok(validation)
}

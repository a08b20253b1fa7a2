// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Record-aligned splitting of fixed-record binary files.

use crate::analysis::FileAnalysis;
use crate::chunk::{ChunkStrategy, FileChunk, MB};
use crate::error::{LoadError, Result};

/// Hard cap on the number of chunks per file
pub const MAX_FIXED_CHUNKS: usize = 16;
/// Hard cap on the bytes one worker reads
pub const MAX_CHUNK_BYTES: u64 = 200 * MB;

/// Splits fixed-record files into record-aligned chunks.
#[derive(Debug, Clone, Copy)]
pub struct FixedSizeChunker {
    max_chunks: usize,
    max_chunk_bytes: u64,
}

impl Default for FixedSizeChunker {
    fn default() -> Self {
        Self::new()
    }
}

impl FixedSizeChunker {
    pub fn new() -> Self {
        Self {
            max_chunks: MAX_FIXED_CHUNKS,
            max_chunk_bytes: MAX_CHUNK_BYTES,
        }
    }

    pub fn with_limits(max_chunks: usize, max_chunk_bytes: u64) -> Self {
        Self {
            max_chunks: max_chunks.max(1),
            max_chunk_bytes: max_chunk_bytes.max(1),
        }
    }

    /// Split `analysis.path` into chunks of roughly `target_chunk_size` bytes.
    ///
    /// Every chunk holds a whole number of records and the final chunk absorbs
    /// the remainder.
    pub fn split(
        &self,
        analysis: &FileAnalysis,
        target_chunk_size: u64,
        strategy: ChunkStrategy,
    ) -> Result<Vec<FileChunk>> {
        if !analysis.path.exists() {
            return Err(LoadError::NotFound(analysis.path.clone()));
        }
        if analysis.file_size == 0 {
            return Err(LoadError::InvalidInput(format!(
                "{} is empty",
                analysis.path.display()
            )));
        }
        let record_size = match analysis.record_size {
            Some(size) if analysis.format.is_fixed_record() => size,
            _ => {
                return Err(LoadError::UnsupportedFormat(format!(
                    "{} does not use fixed-size records",
                    analysis.format.name()
                )))
            }
        };

        let body = analysis.body_size();
        if analysis.file_size < analysis.header_size || body % record_size != 0 {
            return Err(LoadError::InvalidInput(format!(
                "{} bytes of record data is not a multiple of the {}-byte record size",
                body, record_size
            )));
        }
        let total_records = body / record_size;
        if let Some(declared) = analysis.declared_records {
            if declared != total_records {
                return Err(LoadError::InvalidInput(format!(
                    "header declares {} records but the file holds {}",
                    declared, total_records
                )));
            }
        }
        if total_records == 0 {
            return Err(LoadError::InvalidInput(format!(
                "{} contains no records",
                analysis.path.display()
            )));
        }

        let per_chunk_cap = (self.max_chunk_bytes / record_size).max(1);
        let mut records_per_chunk = (target_chunk_size / record_size).clamp(1, per_chunk_cap);
        let mut chunk_count = total_records.div_ceil(records_per_chunk);

        if chunk_count > self.max_chunks as u64 {
            chunk_count = self.max_chunks as u64;
            records_per_chunk = total_records / chunk_count;
            let largest = (total_records - records_per_chunk * (chunk_count - 1)) * record_size;
            if largest > self.max_chunk_bytes {
                tracing::warn!(
                    chunk_count,
                    largest_chunk_mb = largest / MB,
                    limit_mb = self.max_chunk_bytes / MB,
                    "Chunk count cap forces chunks above the per-chunk byte limit"
                );
            }
        }

        let chunks = (0..chunk_count)
            .map(|i| {
                let record_start = i * records_per_chunk;
                let record_count = if i + 1 == chunk_count {
                    total_records - record_start
                } else {
                    records_per_chunk
                };
                FileChunk {
                    id: i as usize,
                    path: analysis.path.clone(),
                    byte_start: analysis.header_size + record_start * record_size,
                    byte_size: record_count * record_size,
                    record_start,
                    record_count,
                    strategy,
                    format: analysis.format,
                }
            })
            .collect::<Vec<_>>();

        tracing::debug!(
            chunks = chunks.len(),
            records_per_chunk,
            total_records,
            target_chunk_size,
            "Fixed-size split complete"
        );

        Ok(chunks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::{analyze_file, FileFormat, STL_HEADER_SIZE, STL_RECORD_SIZE};
    use crate::cancellation::CancellationToken;
    use std::io::Write;
    use std::path::Path;

    fn write_stl(path: &Path, declared: u32, actual: u64) {
        let mut f = std::fs::File::create(path).unwrap();
        let mut header = vec![0u8; 80];
        header.extend_from_slice(&declared.to_le_bytes());
        f.write_all(&header).unwrap();
        f.set_len(STL_HEADER_SIZE + actual * STL_RECORD_SIZE).unwrap();
    }

    fn analyze(path: &Path) -> FileAnalysis {
        analyze_file(path, &CancellationToken::new()).unwrap()
    }

    #[test]
    fn test_chunks_are_contiguous_and_aligned() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.stl");
        write_stl(&path, 1001, 1001);

        let chunks = FixedSizeChunker::new()
            .split(&analyze(&path), 100 * STL_RECORD_SIZE, ChunkStrategy::FixedSize)
            .unwrap();

        assert_eq!(chunks.len(), 11);
        let mut expected_offset = STL_HEADER_SIZE;
        let mut expected_record = 0;
        for chunk in &chunks {
            assert_eq!(chunk.byte_start, expected_offset);
            assert_eq!(chunk.record_start, expected_record);
            assert_eq!(chunk.byte_size % STL_RECORD_SIZE, 0);
            expected_offset = chunk.byte_end();
            expected_record = chunk.record_end();
        }
        assert_eq!(expected_record, 1001);
        assert_eq!(chunks.last().unwrap().record_count, 1);
    }

    #[test]
    fn test_target_smaller_than_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("b.stl");
        write_stl(&path, 3, 3);

        let chunks = FixedSizeChunker::new()
            .split(&analyze(&path), 1, ChunkStrategy::FixedSize)
            .unwrap();
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.record_count == 1));
    }

    #[test]
    fn test_chunk_count_cap_absorbs_remainder() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.stl");
        write_stl(&path, 1000, 1000);

        let chunks = FixedSizeChunker::new()
            .split(&analyze(&path), STL_RECORD_SIZE, ChunkStrategy::FixedSize)
            .unwrap();
        assert_eq!(chunks.len(), MAX_FIXED_CHUNKS);
        // 1000 / 16 = 62, last chunk takes 1000 - 15 * 62 = 70
        assert!(chunks[..15].iter().all(|c| c.record_count == 62));
        assert_eq!(chunks[15].record_count, 70);
        assert_eq!(chunks.iter().map(|c| c.record_count).sum::<u64>(), 1000);
    }

    #[test]
    fn test_per_chunk_byte_cap() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("d.stl");
        write_stl(&path, 100, 100);

        let chunker = FixedSizeChunker::with_limits(64, 10 * STL_RECORD_SIZE);
        let chunks = chunker
            .split(&analyze(&path), 1000 * STL_RECORD_SIZE, ChunkStrategy::FixedSize)
            .unwrap();
        assert_eq!(chunks.len(), 10);
        assert!(chunks.iter().all(|c| c.byte_size <= 10 * STL_RECORD_SIZE));
    }

    #[test]
    fn test_declared_count_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("e.stl");
        write_stl(&path, 7, 5);

        let analysis = analyze(&path);
        assert_eq!(analysis.format, FileFormat::BinaryStl);
        let err = FixedSizeChunker::new()
            .split(&analysis, MB, ChunkStrategy::FixedSize)
            .unwrap_err();
        assert!(matches!(err, LoadError::InvalidInput(_)));
        assert!(err.to_string().contains("declares 7"));
    }

    #[test]
    fn test_rejects_variable_formats() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.obj");
        std::fs::write(&path, "v 0 0 0\n").unwrap();

        let err = FixedSizeChunker::new()
            .split(&analyze(&path), MB, ChunkStrategy::FixedSize)
            .unwrap_err();
        assert!(matches!(err, LoadError::UnsupportedFormat(_)));
    }

    #[test]
    fn test_missing_file_after_analysis() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("g.stl");
        write_stl(&path, 4, 4);
        let analysis = analyze(&path);
        std::fs::remove_file(&path).unwrap();

        let err = FixedSizeChunker::new()
            .split(&analysis, MB, ChunkStrategy::FixedSize)
            .unwrap_err();
        assert!(matches!(err, LoadError::NotFound(_)));
    }

    #[test]
    fn test_header_only_file_has_no_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("h.stl");
        write_stl(&path, 0, 0);

        let err = FixedSizeChunker::new()
            .split(&analyze(&path), MB, ChunkStrategy::FixedSize)
            .unwrap_err();
        assert!(matches!(err, LoadError::InvalidInput(_)));
    }
}

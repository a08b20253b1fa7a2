// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Boundary-seeking splitter for variable-length record formats.
//!
//! From each byte-size target the splitter scans forward to the end of the
//! next record terminator, so no chunk ends mid-record. Records inside each
//! chunk are counted as the chunk is laid out, which gives every chunk an
//! exact `record_start`/`record_count` even though the format has no index.

use crate::analysis::{FileAnalysis, FileFormat};
use crate::cancellation::CancellationToken;
use crate::chunk::{ChunkStrategy, FileChunk};
use crate::error::{LoadError, Result};
use memchr::memmem::Finder;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};

const SCAN_BLOCK_SIZE: usize = 256 * 1024;

/// Describes where records end in a text-like format.
pub trait BoundarySeeker: Send + Sync {
    /// Byte sequence that terminates one record.
    fn delimiter(&self) -> &[u8];

    /// Extend every boundary through the end of the delimiter's line.
    fn through_line_end(&self) -> bool {
        false
    }

    /// Bytes after the last delimiter count as one more record.
    fn counts_unterminated_tail(&self) -> bool {
        false
    }
}

/// One record per line (OBJ and similar).
#[derive(Debug, Clone, Copy, Default)]
pub struct LineSeeker;

impl BoundarySeeker for LineSeeker {
    fn delimiter(&self) -> &[u8] {
        b"\n"
    }

    fn counts_unterminated_tail(&self) -> bool {
        true
    }
}

/// One record per `facet ... endfacet` block.
#[derive(Debug, Clone, Copy, Default)]
pub struct AsciiStlSeeker;

impl BoundarySeeker for AsciiStlSeeker {
    fn delimiter(&self) -> &[u8] {
        b"endfacet"
    }

    fn through_line_end(&self) -> bool {
        true
    }
}

/// Built-in seeker for a format, if there is one.
pub fn default_seeker(format: FileFormat) -> Option<&'static dyn BoundarySeeker> {
    match format {
        FileFormat::AsciiStl => Some(&AsciiStlSeeker),
        FileFormat::Obj => Some(&LineSeeker),
        FileFormat::BinaryStl | FileFormat::Unknown => None,
    }
}

/// Splits variable-length record files at delimiter boundaries.
pub struct BoundarySplitter<'a> {
    seeker: &'a dyn BoundarySeeker,
}

impl<'a> BoundarySplitter<'a> {
    pub fn new(seeker: &'a dyn BoundarySeeker) -> Self {
        Self { seeker }
    }

    /// Split the whole file into chunks of at least `target_chunk_size`
    /// bytes (the last one may be shorter).
    pub fn split(
        &self,
        analysis: &FileAnalysis,
        target_chunk_size: u64,
        strategy: ChunkStrategy,
        token: &CancellationToken,
    ) -> Result<Vec<FileChunk>> {
        if self.seeker.delimiter().is_empty() {
            return Err(LoadError::InvalidInput("record delimiter must not be empty".into()));
        }
        let mut file = File::open(&analysis.path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => LoadError::NotFound(analysis.path.clone()),
            _ => LoadError::Io(e),
        })?;
        let file_size = file.metadata()?.len();
        if file_size == 0 {
            return Err(LoadError::InvalidInput(format!(
                "{} is empty",
                analysis.path.display()
            )));
        }

        let target = target_chunk_size.max(1);
        let mut chunks = Vec::new();
        let mut start = analysis.header_size.min(file_size);
        let mut record_start = 0u64;

        while start < file_size {
            if token.is_cancelled() {
                return Err(LoadError::Cancelled);
            }
            let end = if start + target >= file_size {
                file_size
            } else {
                self.next_boundary(&mut file, start + target, file_size)?
            };

            let mut record_count = self.count_records(&mut file, start, end, token)?;
            if end == file_size && self.seeker.counts_unterminated_tail() && !self.ends_with_delimiter(&mut file, start, end)? {
                record_count += 1;
            }

            chunks.push(FileChunk {
                id: chunks.len(),
                path: analysis.path.clone(),
                byte_start: start,
                byte_size: end - start,
                record_start,
                record_count,
                strategy,
                format: analysis.format,
            });
            record_start += record_count;
            start = end;
        }

        tracing::debug!(
            chunks = chunks.len(),
            total_records = record_start,
            target_chunk_size = target,
            "Boundary split complete"
        );

        Ok(chunks)
    }

    /// Offset just past the first record terminator at or after `from`, or
    /// `file_size` if none follows.
    fn next_boundary(&self, file: &mut File, from: u64, file_size: u64) -> Result<u64> {
        let delimiter = self.seeker.delimiter();
        let finder = Finder::new(delimiter);
        let overlap = delimiter.len() - 1;

        file.seek(SeekFrom::Start(from))?;
        let mut window: Vec<u8> = Vec::with_capacity(SCAN_BLOCK_SIZE + overlap);
        let mut window_offset = from;
        let mut block = vec![0u8; SCAN_BLOCK_SIZE];

        let delimiter_end = loop {
            let n = file.read(&mut block)?;
            if n == 0 {
                return Ok(file_size);
            }
            window.extend_from_slice(&block[..n]);
            if let Some(pos) = finder.find(&window) {
                break window_offset + (pos + delimiter.len()) as u64;
            }
            let keep = overlap.min(window.len());
            let drop = window.len() - keep;
            window.drain(..drop);
            window_offset += drop as u64;
        };

        if !self.seeker.through_line_end() {
            return Ok(delimiter_end);
        }
        self.line_end(file, delimiter_end, file_size)
    }

    fn line_end(&self, file: &mut File, from: u64, file_size: u64) -> Result<u64> {
        file.seek(SeekFrom::Start(from))?;
        let mut block = vec![0u8; SCAN_BLOCK_SIZE];
        let mut offset = from;
        loop {
            let n = file.read(&mut block)?;
            if n == 0 {
                return Ok(file_size);
            }
            if let Some(pos) = memchr::memchr(b'\n', &block[..n]) {
                return Ok(offset + pos as u64 + 1);
            }
            offset += n as u64;
        }
    }

    fn count_records(&self, file: &mut File, start: u64, end: u64, token: &CancellationToken) -> Result<u64> {
        let delimiter = self.seeker.delimiter();
        let finder = Finder::new(delimiter);
        let overlap = delimiter.len() - 1;

        file.seek(SeekFrom::Start(start))?;
        let mut remaining = end - start;
        let mut carry: Vec<u8> = Vec::with_capacity(overlap);
        let mut buf = vec![0u8; SCAN_BLOCK_SIZE];
        let mut count = 0u64;

        while remaining > 0 {
            if token.is_cancelled() {
                return Err(LoadError::Cancelled);
            }
            let want = remaining.min(SCAN_BLOCK_SIZE as u64) as usize;
            file.read_exact(&mut buf[..want])?;
            remaining -= want as u64;

            // Any match in carry + block must include a byte from the block,
            // so nothing is counted twice.
            let mut window = std::mem::take(&mut carry);
            window.extend_from_slice(&buf[..want]);
            count += finder.find_iter(&window).count() as u64;

            let keep = overlap.min(window.len());
            carry = window.split_off(window.len() - keep);
        }
        Ok(count)
    }

    fn ends_with_delimiter(&self, file: &mut File, start: u64, end: u64) -> Result<bool> {
        let delimiter = self.seeker.delimiter();
        let len = (delimiter.len() as u64).min(end - start);
        if len < delimiter.len() as u64 {
            return Ok(false);
        }
        file.seek(SeekFrom::Start(end - len))?;
        let mut tail = vec![0u8; len as usize];
        file.read_exact(&mut tail)?;
        Ok(tail == delimiter)
    }
}

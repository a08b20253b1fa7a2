// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! File and format analysis.
//!
//! Classifies a file from a bounded header prefix and estimates its record
//! count without reading the body, except for formats where no cheaper
//! estimate exists. The result drives strategy selection in the adaptive
//! chunker.

use crate::cancellation::CancellationToken;
use crate::chunk::{ChunkStrategy, MB};
use crate::error::{LoadError, Result};
use serde::Serialize;
use std::fs::File;
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};

/// Binary STL: 80-byte header followed by a little-endian u32 triangle count
pub const STL_HEADER_SIZE: u64 = 84;
/// Binary STL: normal + 3 vertices (12 f32) + u16 attribute
pub const STL_RECORD_SIZE: u64 = 50;
const STL_COUNT_OFFSET: usize = 80;

/// Bytes read to classify a file
const PREFIX_LEN: usize = 512;
/// Typical size of one `facet ... endfacet` block in ASCII STL
const ASCII_FACET_BYTES_ESTIMATE: u64 = 250;
/// Block size for full scans
const SCAN_BLOCK_SIZE: usize = 4 * MB as usize;

/// Files above this size always get the adaptive strategy
pub const LARGE_FILE_THRESHOLD: u64 = 1024 * MB;
const COMPLEXITY_SIZE_SCALE: f64 = 4.0 * 1024.0 * 1024.0 * 1024.0;

/// Detected file format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum FileFormat {
    BinaryStl,
    AsciiStl,
    Obj,
    Unknown,
}

impl FileFormat {
    /// Fixed-size records that can be split by arithmetic alone.
    pub fn is_fixed_record(self) -> bool {
        matches!(self, FileFormat::BinaryStl)
    }

    pub fn record_size(self) -> Option<u64> {
        match self {
            FileFormat::BinaryStl => Some(STL_RECORD_SIZE),
            _ => None,
        }
    }

    pub fn header_size(self) -> u64 {
        match self {
            FileFormat::BinaryStl => STL_HEADER_SIZE,
            _ => 0,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            FileFormat::BinaryStl => "binary STL",
            FileFormat::AsciiStl => "ASCII STL",
            FileFormat::Obj => "OBJ",
            FileFormat::Unknown => "unknown",
        }
    }
}

/// Read-only result of analyzing one file.
#[derive(Debug, Clone, Serialize)]
pub struct FileAnalysis {
    pub path: PathBuf,
    pub format: FileFormat,
    pub file_size: u64,
    pub header_size: u64,
    pub record_size: Option<u64>,
    /// Record count stored in the header, if the format has one
    pub declared_records: Option<u64>,
    pub estimated_records: u64,
    /// 0.0 (trivial) to 1.0 (hardest)
    pub complexity: f64,
    pub variable_records: bool,
    pub recommended_strategy: ChunkStrategy,
}

impl FileAnalysis {
    /// Bytes that belong to records.
    pub fn body_size(&self) -> u64 {
        self.file_size.saturating_sub(self.header_size)
    }
}

/// Analyze a file. Only the OBJ path reads past the header, checking `token`
/// between blocks.
pub fn analyze_file(path: &Path, token: &CancellationToken) -> Result<FileAnalysis> {
    let (file_size, prefix) = read_prefix(path)?;
    let declared_records = read_declared_count(&prefix);
    let format = detect_format(path, &prefix, file_size, declared_records);

    let (estimated_records, complexity) = match format {
        FileFormat::BinaryStl => {
            let records = file_size.saturating_sub(STL_HEADER_SIZE) / STL_RECORD_SIZE;
            let size_factor = (file_size as f64 / COMPLEXITY_SIZE_SCALE * 0.3).min(0.3);
            (records, 0.1 + size_factor)
        }
        FileFormat::AsciiStl => ((file_size / ASCII_FACET_BYTES_ESTIMATE).max(1), 0.6),
        FileFormat::Obj => (count_lines(path, token)?, 0.7),
        FileFormat::Unknown => (0, 1.0),
    };

    let variable_records = !format.is_fixed_record();
    let recommended_strategy = recommend_strategy(file_size, variable_records, complexity);

    tracing::debug!(
        path = %path.display(),
        format = format.name(),
        file_size,
        estimated_records,
        complexity,
        strategy = %recommended_strategy,
        "File analysis complete"
    );

    Ok(FileAnalysis {
        path: path.to_path_buf(),
        format,
        file_size,
        header_size: format.header_size(),
        record_size: format.record_size(),
        declared_records: if format == FileFormat::BinaryStl {
            declared_records
        } else {
            None
        },
        estimated_records,
        complexity,
        variable_records,
        recommended_strategy,
    })
}

/// Format of `path`, from its size and header prefix alone.
pub fn detect_file_format(path: &Path) -> Result<FileFormat> {
    let (file_size, prefix) = read_prefix(path)?;
    Ok(detect_format(path, &prefix, file_size, read_declared_count(&prefix)))
}

fn read_prefix(path: &Path) -> Result<(u64, Vec<u8>)> {
    let metadata = std::fs::metadata(path).map_err(|e| match e.kind() {
        ErrorKind::NotFound => LoadError::NotFound(path.to_path_buf()),
        _ => LoadError::Io(e),
    })?;
    if !metadata.is_file() {
        return Err(LoadError::InvalidInput(format!(
            "{} is not a regular file",
            path.display()
        )));
    }
    let file_size = metadata.len();
    if file_size == 0 {
        return Err(LoadError::InvalidInput(format!("{} is empty", path.display())));
    }

    let mut file = File::open(path)?;
    let mut prefix = Vec::with_capacity(PREFIX_LEN);
    (&mut file).take(PREFIX_LEN as u64).read_to_end(&mut prefix)?;
    Ok((file_size, prefix))
}

/// Resource-independent part of the strategy rule.
pub fn recommend_strategy(file_size: u64, variable_records: bool, complexity: f64) -> ChunkStrategy {
    if file_size > LARGE_FILE_THRESHOLD {
        ChunkStrategy::AdaptiveSize
    } else if variable_records || complexity > 0.5 {
        ChunkStrategy::FormatAware
    } else {
        ChunkStrategy::AdaptiveSize
    }
}

fn read_declared_count(prefix: &[u8]) -> Option<u64> {
    let bytes = prefix.get(STL_COUNT_OFFSET..STL_COUNT_OFFSET + 4)?;
    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as u64)
}

fn detect_format(path: &Path, prefix: &[u8], file_size: u64, declared: Option<u64>) -> FileFormat {
    // The size identity is the only reliable binary signature: some exporters
    // write "solid" into the binary header too.
    if let Some(count) = declared {
        if STL_HEADER_SIZE + count * STL_RECORD_SIZE == file_size {
            return FileFormat::BinaryStl;
        }
    }

    let trimmed = trim_ascii_start(prefix);
    if trimmed.starts_with(b"solid") && is_text(prefix) {
        return FileFormat::AsciiStl;
    }

    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());

    match extension.as_deref() {
        Some("obj") => FileFormat::Obj,
        // Binary by extension; a bad count is reported by the chunker.
        Some("stl") if file_size >= STL_HEADER_SIZE => FileFormat::BinaryStl,
        _ if is_text(prefix) && looks_like_obj(trimmed) => FileFormat::Obj,
        _ => FileFormat::Unknown,
    }
}

fn trim_ascii_start(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    &bytes[start..]
}

/// UTF-8 without control bytes. The prefix may cut the last character short.
fn is_text(prefix: &[u8]) -> bool {
    let valid = match std::str::from_utf8(prefix) {
        Ok(_) => prefix,
        Err(e) if e.error_len().is_none() => &prefix[..e.valid_up_to()],
        Err(_) => return false,
    };
    valid
        .iter()
        .all(|&b| !b.is_ascii_control() || b.is_ascii_whitespace())
}

fn looks_like_obj(text: &[u8]) -> bool {
    const KEYWORDS: &[&[u8]] = &[b"v ", b"vn ", b"vt ", b"f ", b"o ", b"g ", b"mtllib ", b"#"];
    KEYWORDS.iter().any(|k| text.starts_with(k))
}

/// Count newline-terminated lines (plus a trailing unterminated one).
fn count_lines(path: &Path, token: &CancellationToken) -> Result<u64> {
    let mut file = File::open(path)?;
    let mut buf = vec![0u8; SCAN_BLOCK_SIZE];
    let mut lines = 0u64;
    let mut last = b'\n';

    loop {
        if token.is_cancelled() {
            return Err(LoadError::Cancelled);
        }
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        lines += memchr::memchr_iter(b'\n', &buf[..n]).count() as u64;
        last = buf[n - 1];
    }

    if last != b'\n' {
        lines += 1;
    }
    Ok(lines)
}

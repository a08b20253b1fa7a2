// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-chunk record parsing.
//!
//! Workers parse their byte range into plain [`WireTriangle`] values; richer
//! mesh buffers are only built once every chunk has been merged.

use crate::analysis::{FileFormat, STL_RECORD_SIZE};
use crate::chunk::FileChunk;
use crate::error::ChunkError;
use serde::{Deserialize, Serialize};

const RECORD_LEN: usize = STL_RECORD_SIZE as usize;

/// One triangle as stored on disk.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct WireTriangle {
    pub normal: [f32; 3],
    pub vertices: [[f32; 3]; 3],
    /// Attribute byte count (often used for colour)
    pub attribute: u16,
}

impl WireTriangle {
    /// Decode a 50-byte binary STL record.
    pub fn from_stl_record(bytes: &[u8; RECORD_LEN]) -> Self {
        let f = |i: usize| {
            let o = i * 4;
            f32::from_le_bytes([bytes[o], bytes[o + 1], bytes[o + 2], bytes[o + 3]])
        };
        Self {
            normal: [f(0), f(1), f(2)],
            vertices: [[f(3), f(4), f(5)], [f(6), f(7), f(8)], [f(9), f(10), f(11)]],
            attribute: u16::from_le_bytes([bytes[48], bytes[49]]),
        }
    }

    /// Encode as a 50-byte binary STL record.
    pub fn to_stl_record(&self) -> [u8; RECORD_LEN] {
        let mut out = [0u8; RECORD_LEN];
        let floats = self
            .normal
            .iter()
            .chain(self.vertices.iter().flatten());
        for (i, value) in floats.enumerate() {
            out[i * 4..i * 4 + 4].copy_from_slice(&value.to_le_bytes());
        }
        out[48..50].copy_from_slice(&self.attribute.to_le_bytes());
        out
    }
}

/// Parses the bytes of one chunk into records.
///
/// Implementations run on worker threads and must not touch shared mutable
/// state. A panic is caught by the coordinator and reported as that chunk's
/// failure.
pub trait ChunkParser: Send + Sync + 'static {
    type Record: Send + 'static;

    fn parse_chunk(&self, chunk: &FileChunk, bytes: &[u8]) -> Result<Vec<Self::Record>, ChunkError>;

    /// Whether chunks of `format` can be parsed at all. Checked before any
    /// file is chunked.
    fn supports(&self, _format: FileFormat) -> bool {
        true
    }
}

/// Binary and ASCII STL.
#[derive(Debug, Clone, Copy, Default)]
pub struct StlChunkParser;

impl ChunkParser for StlChunkParser {
    type Record = WireTriangle;

    fn supports(&self, format: FileFormat) -> bool {
        matches!(format, FileFormat::BinaryStl | FileFormat::AsciiStl)
    }

    fn parse_chunk(&self, chunk: &FileChunk, bytes: &[u8]) -> Result<Vec<WireTriangle>, ChunkError> {
        match chunk.format {
            FileFormat::BinaryStl => parse_binary(bytes),
            FileFormat::AsciiStl => parse_ascii(bytes),
            other => Err(ChunkError::Parse(format!(
                "{} chunks are not handled by the STL parser",
                other.name()
            ))),
        }
    }
}

fn parse_binary(bytes: &[u8]) -> Result<Vec<WireTriangle>, ChunkError> {
    if bytes.len() % RECORD_LEN != 0 {
        return Err(ChunkError::Parse(format!(
            "{} bytes is not a whole number of {}-byte records",
            bytes.len(),
            RECORD_LEN
        )));
    }
    Ok(bytes
        .chunks_exact(RECORD_LEN)
        .map(|record| {
            let mut buf = [0u8; RECORD_LEN];
            buf.copy_from_slice(record);
            WireTriangle::from_stl_record(&buf)
        })
        .collect())
}

fn parse_ascii(bytes: &[u8]) -> Result<Vec<WireTriangle>, ChunkError> {
    let text = std::str::from_utf8(bytes).map_err(|e| ChunkError::Parse(e.to_string()))?;

    let mut triangles = Vec::new();
    let mut current = WireTriangle::default();
    let mut vertex_count = 0usize;

    for (line_no, line) in text.lines().enumerate() {
        let mut tokens = line.split_ascii_whitespace();
        match tokens.next() {
            Some("facet") => {
                // facet normal nx ny nz
                tokens.next();
                current = WireTriangle {
                    normal: parse_vec3(&mut tokens, line_no)?,
                    ..Default::default()
                };
                vertex_count = 0;
            }
            Some("vertex") => {
                if vertex_count == 3 {
                    return Err(ChunkError::Parse(format!(
                        "line {}: more than three vertices in facet",
                        line_no + 1
                    )));
                }
                current.vertices[vertex_count] = parse_vec3(&mut tokens, line_no)?;
                vertex_count += 1;
            }
            Some("endfacet") => {
                if vertex_count != 3 {
                    return Err(ChunkError::Parse(format!(
                        "line {}: facet has {} vertices",
                        line_no + 1,
                        vertex_count
                    )));
                }
                triangles.push(current);
                vertex_count = 0;
            }
            _ => {}
        }
    }

    Ok(triangles)
}

fn parse_vec3<'a>(tokens: &mut impl Iterator<Item = &'a str>, line_no: usize) -> Result<[f32; 3], ChunkError> {
    let mut out = [0f32; 3];
    for value in &mut out {
        let token = tokens
            .next()
            .ok_or_else(|| ChunkError::Parse(format!("line {}: expected 3 coordinates", line_no + 1)))?;
        *value = fast_float::parse(token)
            .map_err(|_| ChunkError::Parse(format!("line {}: invalid number '{}'", line_no + 1, token)))?;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::ChunkStrategy;
    use approx::assert_relative_eq;
    use std::path::PathBuf;

    fn chunk(format: FileFormat, byte_size: u64, record_count: u64) -> FileChunk {
        FileChunk {
            id: 0,
            path: PathBuf::from("mem"),
            byte_start: 0,
            byte_size,
            record_start: 0,
            record_count,
            strategy: ChunkStrategy::FormatAware,
            format,
        }
    }

    #[test]
    fn test_binary_record_layout() {
        let tri = WireTriangle {
            normal: [0.0, 0.0, 1.0],
            vertices: [[1.0, 2.0, 3.0], [4.0, 5.0, 6.0], [7.0, 8.0, 9.0]],
            attribute: 0x7c1f,
        };
        let bytes = tri.to_stl_record();
        assert_eq!(&bytes[8..12], &1.0f32.to_le_bytes());
        assert_eq!(&bytes[48..50], &[0x1f, 0x7c]);

        let mut two = bytes.to_vec();
        two.extend_from_slice(&WireTriangle::default().to_stl_record());
        let parsed = StlChunkParser
            .parse_chunk(&chunk(FileFormat::BinaryStl, 100, 2), &two)
            .unwrap();
        assert_eq!(parsed, vec![tri, WireTriangle::default()]);
    }

    #[test]
    fn test_binary_rejects_partial_record() {
        let err = StlChunkParser
            .parse_chunk(&chunk(FileFormat::BinaryStl, 49, 1), &[0u8; 49])
            .unwrap_err();
        assert!(matches!(err, ChunkError::Parse(_)));
    }

    #[test]
    fn test_ascii_facets() {
        let text = "solid part\n  facet normal 0 0 -1\n    outer loop\n      vertex 0 0 0\n      vertex 1.5e0 0 0\n      vertex 0 2.25 0\n    endloop\n  endfacet\nendsolid part\n";
        let parsed = StlChunkParser
            .parse_chunk(&chunk(FileFormat::AsciiStl, text.len() as u64, 1), text.as_bytes())
            .unwrap();
        assert_eq!(parsed.len(), 1);
        assert_relative_eq!(parsed[0].normal[2], -1.0);
        assert_relative_eq!(parsed[0].vertices[1][0], 1.5);
        assert_relative_eq!(parsed[0].vertices[2][1], 2.25);
    }

    #[test]
    fn test_ascii_bad_number() {
        let text = "facet normal 0 0 1\nvertex 0 0 zero\n";
        let err = StlChunkParser
            .parse_chunk(&chunk(FileFormat::AsciiStl, text.len() as u64, 0), text.as_bytes())
            .unwrap_err();
        assert!(err.to_string().contains("line 2"));
    }

    #[test]
    fn test_ascii_short_facet() {
        let text = "facet normal 0 0 1\nvertex 0 0 0\nendfacet\n";
        assert!(StlChunkParser
            .parse_chunk(&chunk(FileFormat::AsciiStl, text.len() as u64, 1), text.as_bytes())
            .is_err());
    }

    #[test]
    fn test_other_formats_rejected() {
        assert!(StlChunkParser
            .parse_chunk(&chunk(FileFormat::Obj, 0, 0), b"")
            .is_err());
        assert!(StlChunkParser.supports(FileFormat::BinaryStl));
        assert!(StlChunkParser.supports(FileFormat::AsciiStl));
        assert!(!StlChunkParser.supports(FileFormat::Obj));
        assert!(!StlChunkParser.supports(FileFormat::Unknown));
    }
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Error types for chunked loading.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type for loader operations
pub type Result<T> = std::result::Result<T, LoadError>;

/// Errors that can end a load request.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("File not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Loading cancelled")]
    Cancelled,

    #[error("{} of {total} chunks failed: {}", .failures.len(), format_failures(.failures))]
    ParseFailed {
        total: usize,
        failures: Vec<ChunkFailure>,
    },

    #[error("Insufficient memory: estimated {required_mb} MB exceeds memory limit of {limit_mb} MB")]
    MemoryLimitExceeded { required_mb: u64, limit_mb: u64 },

    #[error("Too many concurrent loading jobs (limit {limit})")]
    CapacityExceeded { limit: usize },

    #[error("Worker pool error: {0}")]
    WorkerPool(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl LoadError {
    /// Stable machine-readable code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            LoadError::NotFound(_) => "NOT_FOUND",
            LoadError::InvalidInput(_) => "INVALID_INPUT",
            LoadError::UnsupportedFormat(_) => "UNSUPPORTED_FORMAT",
            LoadError::Cancelled => "CANCELLED",
            LoadError::ParseFailed { .. } => "PARSE_FAILED",
            LoadError::MemoryLimitExceeded { .. } => "MEMORY_LIMIT_EXCEEDED",
            LoadError::CapacityExceeded { .. } => "CAPACITY_EXCEEDED",
            LoadError::WorkerPool(_) => "WORKER_POOL_ERROR",
            LoadError::Io(_) => "IO_ERROR",
        }
    }

    /// True for the user-initiated terminal outcome.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, LoadError::Cancelled)
    }

    /// Advisory recovery text for this error.
    pub fn suggestions(&self) -> &'static [&'static str] {
        recovery_suggestions(&self.to_string())
    }
}

/// Failure of a single chunk inside a worker.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ChunkError {
    #[error("read failed: {0}")]
    Io(String),

    #[error("parse failed: {0}")]
    Parse(String),

    #[error("worker panicked: {0}")]
    Panicked(String),

    #[error("timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("expected {expected} records, parsed {actual}")]
    RecordCountMismatch { expected: usize, actual: usize },
}

/// A chunk id paired with the reason it failed.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkFailure {
    pub chunk_id: usize,
    pub error: ChunkError,
}

fn format_failures(failures: &[ChunkFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("chunk {}: {}", f.chunk_id, f.error))
        .collect::<Vec<_>>()
        .join("; ")
}

const MEMORY_SUGGESTIONS: &[&str] = &[
    "Close other applications to free memory",
    "Lower LOADER_CHUNK_SIZE_MB so each worker holds less data",
    "Reduce LOADER_WORKER_THREADS to process fewer chunks at once",
    "Split the model into smaller files",
];

const WORKER_POOL_SUGGESTIONS: &[&str] = &[
    "Retry the load; worker start-up failures are often transient",
    "Reduce LOADER_WORKER_THREADS",
    "Check system limits on threads and open files",
];

const PERMISSION_SUGGESTIONS: &[&str] = &[
    "Check that the file is readable by the current user",
    "Copy the file to a local directory and retry",
    "Make sure no other program holds an exclusive lock on the file",
];

const TIMEOUT_SUGGESTIONS: &[&str] = &[
    "Retry when the disk is less busy",
    "Move the file to faster local storage",
    "Raise LOADER_CHUNK_TIMEOUT_SECS for very slow storage",
];

const GENERIC_SUGGESTIONS: &[&str] = &[
    "Verify that the file is a valid, complete mesh file",
    "Retry the load",
    "Run with RUST_LOG=debug for more detail",
];

/// Map an error message to advisory recovery text.
///
/// Matching is case-insensitive on substrings and checked in a fixed order;
/// the first category that matches wins.
pub fn recovery_suggestions(message: &str) -> &'static [&'static str] {
    let message = message.to_lowercase();
    if message.contains("memory") {
        MEMORY_SUGGESTIONS
    } else if message.contains("worker") || message.contains("pool") {
        WORKER_POOL_SUGGESTIONS
    } else if message.contains("permission") || message.contains("access denied") {
        PERMISSION_SUGGESTIONS
    } else if message.contains("timeout") || message.contains("timed out") {
        TIMEOUT_SUGGESTIONS
    } else {
        GENERIC_SUGGESTIONS
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_failed_lists_every_chunk() {
        let err = LoadError::ParseFailed {
            total: 3,
            failures: vec![
                ChunkFailure {
                    chunk_id: 1,
                    error: ChunkError::Parse("bad facet".into()),
                },
                ChunkFailure {
                    chunk_id: 2,
                    error: ChunkError::Timeout(Duration::from_secs(30)),
                },
            ],
        };
        let msg = err.to_string();
        assert!(msg.starts_with("2 of 3 chunks failed"));
        assert!(msg.contains("chunk 1: parse failed: bad facet"));
        assert!(msg.contains("chunk 2: timed out after 30s"));
        assert_eq!(err.code(), "PARSE_FAILED");
    }

    #[test]
    fn test_single_timeout_is_parse_failure() {
        let err = LoadError::ParseFailed {
            total: 8,
            failures: vec![ChunkFailure {
                chunk_id: 4,
                error: ChunkError::Timeout(Duration::from_secs(30)),
            }],
        };
        assert_eq!(err.to_string(), "1 of 8 chunks failed: chunk 4: timed out after 30s");
        assert_eq!(err.suggestions(), TIMEOUT_SUGGESTIONS);
    }

    #[test]
    fn test_recovery_suggestion_categories() {
        assert_eq!(
            recovery_suggestions("Insufficient memory: estimated 900 MB"),
            MEMORY_SUGGESTIONS
        );
        assert_eq!(
            recovery_suggestions("Worker pool error: spawn failed"),
            WORKER_POOL_SUGGESTIONS
        );
        assert_eq!(
            recovery_suggestions("Permission denied (os error 13)"),
            PERMISSION_SUGGESTIONS
        );
        assert_eq!(
            recovery_suggestions("Chunk 3 timed out after 30s"),
            TIMEOUT_SUGGESTIONS
        );
        assert_eq!(recovery_suggestions("something odd"), GENERIC_SUGGESTIONS);
    }

    #[test]
    fn test_memory_wins_over_timeout() {
        // Order matters: the first matching category is returned.
        assert_eq!(
            recovery_suggestions("memory pressure caused a timeout"),
            MEMORY_SUGGESTIONS
        );
    }

    #[test]
    fn test_cancelled_is_not_failure() {
        assert!(LoadError::Cancelled.is_cancelled());
        assert_eq!(LoadError::Cancelled.code(), "CANCELLED");
    }
}

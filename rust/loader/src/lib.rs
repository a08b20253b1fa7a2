// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! # IFC-Lite Loader
//!
//! Chunked, cancellable background loading of large triangle-soup files
//! (binary and ASCII STL out of the box).
//!
//! ## Overview
//!
//! - **Analysis**: header-based format detection and record estimates
//! - **Chunking**: record-aligned byte ranges, with the strategy picked from
//!   file size, format and system memory
//! - **Coordination**: isolated worker threads per chunk, bounded waits,
//!   chunk-id ordered aggregation
//! - **Jobs**: a background job table with forward-only states, progress
//!   callbacks and sub-second cancellation
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use ifc_lite_loader::{BackgroundLoader, LoaderConfig};
//!
//! let loader = BackgroundLoader::new(LoaderConfig::from_env());
//! let job = loader.submit(
//!     "bridge.stl",
//!     |percent, message| println!("{percent}% {message}"),
//!     |id, model, error| match (model, error) {
//!         (Some(model), _) => println!("{id}: {} triangles", model.triangle_count()),
//!         (_, Some(error)) => eprintln!("{id}: {error}"),
//!         _ => {}
//!     },
//! )?;
//!
//! // Later, from any thread:
//! loader.cancel(job);
//! ```
//!
//! ## Custom formats
//!
//! Fixed-record binaries are split arithmetically. Any other format needs a
//! [`BoundarySeeker`] registered on the [`AdaptiveChunker`] and a
//! [`ChunkParser`] that turns a chunk's bytes into records.

pub mod analysis;
pub mod cancellation;
pub mod chunk;
pub mod chunker;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod manager;
pub mod memory;
pub mod model;
pub mod record;

pub use analysis::{analyze_file, detect_file_format, FileAnalysis, FileFormat};
pub use cancellation::{CallbackId, CancellationToken};
pub use chunk::{ChunkStrategy, ChunkingParameters, FileChunk};
pub use chunker::{AdaptiveChunker, BoundarySeeker, ChunkPlan, FixedSizeChunker};
pub use config::LoaderConfig;
pub use coordinator::{ChunkCoordinator, WorkerResult};
pub use error::{recovery_suggestions, ChunkError, ChunkFailure, LoadError, Result};
pub use manager::{BackgroundLoader, JobId, JobState, JobStatus};
pub use memory::{FixedMemoryMonitor, MemoryMonitor, MemoryPressure, MemorySnapshot, SystemMemoryMonitor};
pub use model::{LoadStats, LoadedModel, ModelBounds};
pub use record::{ChunkParser, StlChunkParser, WireTriangle};

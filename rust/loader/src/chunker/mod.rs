// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Splitting files into record-aligned chunks.

pub mod adaptive;
pub mod boundary;
pub mod fixed;

pub use adaptive::{validate_chunks, AdaptiveChunker, ChunkPlan, ChunkValidation};
pub use boundary::{default_seeker, AsciiStlSeeker, BoundarySeeker, BoundarySplitter, LineSeeker};
pub use fixed::{FixedSizeChunker, MAX_CHUNK_BYTES, MAX_FIXED_CHUNKS};

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Loaded model: merged mesh buffers, bounds and load statistics.
//!
//! Built once from the chunk-ordered triangle list after every chunk has
//! been merged, so bounds and counts always describe the whole file.

use crate::chunk::ChunkStrategy;
use crate::record::WireTriangle;
use rayon::prelude::*;
use serde::Serialize;

/// Approximate bytes held per triangle while loading: the wire record plus
/// the position, normal and index buffers built from it.
pub const LOADED_BYTES_PER_TRIANGLE: u64 = 50 + 36 + 36 + 12 + 2;

/// Model bounds in f64 precision
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ModelBounds {
    pub min: [f64; 3],
    pub max: [f64; 3],
    /// Number of points added
    pub sample_count: usize,
}

impl ModelBounds {
    /// Create new bounds initialized to invalid state
    pub fn new() -> Self {
        Self {
            min: [f64::MAX; 3],
            max: [f64::MIN; 3],
            sample_count: 0,
        }
    }

    /// Check if bounds are valid (at least one point added)
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.sample_count > 0
    }

    /// Expand bounds to include a point
    #[inline]
    pub fn expand(&mut self, point: [f64; 3]) {
        for axis in 0..3 {
            self.min[axis] = self.min[axis].min(point[axis]);
            self.max[axis] = self.max[axis].max(point[axis]);
        }
        self.sample_count += 1;
    }

    pub fn merge(mut self, other: &ModelBounds) -> Self {
        if other.is_valid() {
            for axis in 0..3 {
                self.min[axis] = self.min[axis].min(other.min[axis]);
                self.max[axis] = self.max[axis].max(other.max[axis]);
            }
            self.sample_count += other.sample_count;
        }
        self
    }

    /// Get centroid (center of bounding box)
    #[inline]
    pub fn centroid(&self) -> [f64; 3] {
        if !self.is_valid() {
            return [0.0; 3];
        }
        [
            (self.min[0] + self.max[0]) / 2.0,
            (self.min[1] + self.max[1]) / 2.0,
            (self.min[2] + self.max[2]) / 2.0,
        ]
    }

    pub fn size(&self) -> [f64; 3] {
        if !self.is_valid() {
            return [0.0; 3];
        }
        [
            self.max[0] - self.min[0],
            self.max[1] - self.min[1],
            self.max[2] - self.min[2],
        ]
    }
}

impl Default for ModelBounds {
    fn default() -> Self {
        Self::new()
    }
}

/// Statistics for one completed load.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LoadStats {
    /// Total number of triangles.
    pub total_triangles: usize,
    /// Total number of vertices.
    pub total_vertices: usize,
    pub chunk_count: usize,
    pub strategy: Option<ChunkStrategy>,
    pub file_size: u64,
    /// Time spent analyzing and chunking (ms).
    pub chunking_time_ms: u64,
    /// Time spent in workers (ms).
    pub parse_time_ms: u64,
    /// Time spent building buffers (ms).
    pub aggregate_time_ms: u64,
    /// Total processing time (ms).
    pub total_time_ms: u64,
}

/// Merged triangle soup ready for rendering.
#[derive(Debug, Clone, Serialize)]
pub struct LoadedModel {
    /// Vertex positions (x, y, z)
    pub positions: Vec<f32>,
    /// Vertex normals (nx, ny, nz)
    pub normals: Vec<f32>,
    /// Triangle indices (i0, i1, i2)
    pub indices: Vec<u32>,
    /// Per-triangle attribute words
    pub attributes: Vec<u16>,
    pub bounds: ModelBounds,
    pub stats: LoadStats,
}

impl LoadedModel {
    /// Build flat buffers from chunk-ordered triangles.
    ///
    /// Vertices are not shared between triangles. Zero normals are replaced
    /// by the face normal computed from the winding.
    pub fn from_triangles(triangles: &[WireTriangle]) -> Self {
        let positions: Vec<f32> = triangles
            .par_iter()
            .flat_map_iter(|t| t.vertices.iter().flatten().copied())
            .collect();

        let normals: Vec<f32> = triangles
            .par_iter()
            .flat_map_iter(|t| {
                let n = face_normal(t);
                [n, n, n].into_iter().flatten()
            })
            .collect();

        let bounds = triangles
            .par_iter()
            .fold(ModelBounds::new, |mut bounds, t| {
                for v in &t.vertices {
                    bounds.expand([v[0] as f64, v[1] as f64, v[2] as f64]);
                }
                bounds
            })
            .reduce(ModelBounds::new, |a, b| a.merge(&b));

        let vertex_count = triangles.len() * 3;
        let indices: Vec<u32> = (0..vertex_count as u32).collect();
        let attributes = triangles.iter().map(|t| t.attribute).collect();

        Self {
            positions,
            normals,
            indices,
            attributes,
            bounds,
            stats: LoadStats {
                total_triangles: triangles.len(),
                total_vertices: vertex_count,
                ..Default::default()
            },
        }
    }

    #[inline]
    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }

    #[inline]
    pub fn vertex_count(&self) -> usize {
        self.positions.len() / 3
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

fn face_normal(t: &WireTriangle) -> [f32; 3] {
    let [nx, ny, nz] = t.normal;
    let len_sq = nx * nx + ny * ny + nz * nz;
    if len_sq > f32::EPSILON && len_sq.is_finite() {
        return t.normal;
    }

    let [a, b, c] = t.vertices;
    let e1 = [b[0] - a[0], b[1] - a[1], b[2] - a[2]];
    let e2 = [c[0] - a[0], c[1] - a[1], c[2] - a[2]];
    let cross = [
        e1[1] * e2[2] - e1[2] * e2[1],
        e1[2] * e2[0] - e1[0] * e2[2],
        e1[0] * e2[1] - e1[1] * e2[0],
    ];
    let len = (cross[0] * cross[0] + cross[1] * cross[1] + cross[2] * cross[2]).sqrt();
    if len > f32::EPSILON {
        [cross[0] / len, cross[1] / len, cross[2] / len]
    } else {
        // Degenerate
        [0.0, 0.0, 1.0]
    }
}

//! Exposed-face extraction and triangulation of voxel fields.
//!
//! A face is emitted for every solid voxel side that touches an empty
//! voxel. Faces of the same type that follow each other along the first
//! in-plane axis are merged into one quad.

use crate::generation::VoxelField;
use crate::{CHUNK_SIZE, WorldSeed};

/// A merged quad on the boundary between a solid and an empty voxel.
///
/// `u` and `v` are the in-plane axes and `p` the plane coordinate along the
/// face normal: for `x` faces `(u, v) = (y, z)`, for `y` faces `(z, x)`, for
/// `z` faces `(x, y)`. Upper bounds are exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Face {
    pub u0: u32,
    pub v0: u32,
    pub u1: u32,
    pub v1: u32,
    pub p: u32,
    /// `axis * 2`, plus one when the face looks towards positive `axis`.
    pub side: u8,
    /// Voxel type.
    pub value: u8,
}

impl Face {
    pub fn axis(&self) -> u8 {
        self.side >> 1
    }

    pub fn is_positive(&self) -> bool {
        self.side & 1 != 0
    }
}

fn cell(axis: u8, p: i32, u: i32, v: i32) -> (i32, i32, i32) {
    match axis {
        0 => (p, u, v),
        1 => (v, p, u),
        _ => (u, v, p),
    }
}

/// Extract the merged exposed faces of the chunk interior.
pub fn extract_faces(field: &VoxelField) -> Vec<Face> {
    let size = CHUNK_SIZE as i32;
    let y_range = field.min_y as i32..field.max_y as i32 + 1;
    let mut faces = Vec::new();

    for side in 0..6u8 {
        let axis = side >> 1;
        let step = if side & 1 == 0 { -1 } else { 1 };
        let (p_range, u_range, v_range) = match axis {
            0 => (0..size, y_range.clone(), 0..size),
            1 => (y_range.clone(), 0..size, 0..size),
            _ => (0..size, 0..size, y_range.clone()),
        };

        for p in p_range {
            let plane = if step > 0 { p + 1 } else { p };
            for v in v_range.clone() {
                let mut run: Option<(i32, u8)> = None;
                for u in u_range.clone() {
                    let (x, y, z) = cell(axis, p, u, v);
                    let (nx, ny, nz) = cell(axis, p + step, u, v);
                    let value = field.get(x, y, z);
                    let exposed = value != 0 && !field.is_solid(nx, ny, nz);

                    match run {
                        Some((_, run_value)) if exposed && run_value == value => {}
                        Some((start, run_value)) => {
                            faces.push(face(start, u, v, plane, side, run_value));
                            run = exposed.then_some((u, value));
                        }
                        None => run = exposed.then_some((u, value)),
                    }
                }
                if let Some((start, run_value)) = run {
                    faces.push(face(start, u_range.end, v, plane, side, run_value));
                }
            }
        }
    }
    faces
}

fn face(u0: i32, u1: i32, v: i32, p: i32, side: u8, value: u8) -> Face {
    Face {
        u0: u0 as u32,
        v0: v as u32,
        u1: u1 as u32,
        v1: v as u32 + 1,
        p: p as u32,
        side,
        value,
    }
}

/// Packed vertices and indices of a chunk.
///
/// A vertex is `x | y << 8 | z << 16 | type << 24`, read by the builder as
/// `R8G8B8_UNORM` with a stride of four bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChunkMesh {
    pub positions: Vec<u32>,
    pub indices: Vec<u32>,
}

impl ChunkMesh {
    /// Four vertices and six indices per face.
    pub fn triangulate(faces: &[Face]) -> Self {
        let mut mesh = Self {
            positions: Vec::with_capacity(faces.len() * 4),
            indices: Vec::with_capacity(faces.len() * 6),
        };
        for (i, face) in faces.iter().enumerate() {
            mesh.push_positions(face);
            let base = i as u32 * 4;
            let order: [u32; 6] = if face.is_positive() {
                [3, 2, 1, 2, 0, 1]
            } else {
                [3, 1, 2, 1, 0, 2]
            };
            mesh.indices.extend(order.map(|o| base + o));
        }
        mesh
    }

    /// Generate and mesh one chunk.
    pub fn generate(generator: &crate::TerrainGenerator, cx: i32, cz: i32) -> Self {
        Self::triangulate(&extract_faces(&generator.generate_field(cx, cz)))
    }

    pub fn num_faces(&self) -> usize {
        self.positions.len() / 4
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    fn push_positions(&mut self, f: &Face) {
        let t = u32::from(f.value) << 24;
        let corners = [(f.u0, f.v0), (f.u1, f.v0), (f.u0, f.v1), (f.u1, f.v1)];
        for (u, v) in corners {
            let (x, y, z) = match f.axis() {
                0 => (f.p, u, v),
                1 => (v, f.p, u),
                _ => (u, v, f.p),
            };
            self.positions.push(x | (y << 8) | (z << 16) | t);
        }
    }
}

/// Unpack a vertex into its coordinates and voxel type.
pub fn unpack(vertex: u32) -> ([u32; 3], u8) {
    (
        [vertex & 0xFF, (vertex >> 8) & 0xFF, (vertex >> 16) & 0xFF],
        (vertex >> 24) as u8,
    )
}

/// Mesh a square grid of chunks around the origin in parallel.
///
/// Returns `(cx, cz)` and the mesh of every chunk, `cx` major.
pub fn generate_grid(seed: WorldSeed, radius: i32) -> Vec<((i32, i32), ChunkMesh)> {
    use rayon::prelude::*;

    let generator = crate::TerrainGenerator::with_seed(seed);
    let positions: Vec<(i32, i32)> = (-radius..=radius)
        .flat_map(|cx| (-radius..=radius).map(move |cz| (cx, cz)))
        .collect();
    let meshes: Vec<_> = positions
        .par_iter()
        .map(|&(cx, cz)| ((cx, cz), ChunkMesh::generate(&generator, cx, cz)))
        .collect();

    let faces: usize = meshes.iter().map(|(_, m)| m.num_faces()).sum();
    tracing::info!("Generated {} chunks with {} faces", meshes.len(), faces);
    meshes
}

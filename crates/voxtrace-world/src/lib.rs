//! Procedural voxel terrain and demo geometry for voxtrace.
//!
//! Everything here is CPU-side: height fields, voxel fields, face meshes
//! and the byte layouts the acceleration structure builders consume.

pub mod generation;
pub mod mesh;
pub mod shapes;

pub use generation::{TerrainConfig, TerrainGenerator, VoxelField};
pub use mesh::{extract_faces, generate_grid, unpack, ChunkMesh, Face};
pub use shapes::{palette, single_triangle, terrain_columns, Aabb, Triangle};

/// World seed for procedural generation.
pub type WorldSeed = u64;

/// Width and depth of a chunk in voxels.
pub const CHUNK_SIZE: u32 = 32;

/// Height of a chunk in voxels.
pub const CHUNK_HEIGHT: u32 = 256;

/// Voxel type of the top voxel of a column.
pub const SURFACE: u8 = 1;

/// Voxel type below the surface.
pub const GROUND: u8 = 2;

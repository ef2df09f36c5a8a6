//! Hardware ray tracing acceleration structures.
//!
//! This crate builds the structures traced by `VK_KHR_ray_query` shaders:
//! - single-geometry BLASes for AABB and triangle scenes
//! - batched, compacted BLASes sharing one buffer, one per terrain chunk
//! - the TLAS over BLAS instances
//!
//! All of it runs against the [`voxtrace_gpu::Device`] trait, releasing
//! build inputs through the deferred queue.

pub mod blas;
pub mod chunk;
pub mod compaction;
pub mod geometry;
pub mod structure;
pub mod tlas;

pub use blas::build_blas;
pub use chunk::{build_chunk_blases, chunk_instances, geometry_table, Chunk};
pub use compaction::{build_compacted_blases, BatchLayout, BlasRequest};
pub use geometry::{aabb_geometry, triangle_geometry, upload_input, AabbPositions, TriangleLayout};
pub use structure::AccelerationStructure;
pub use tlas::{build_tlas, InstanceRecord, TlasInstance};

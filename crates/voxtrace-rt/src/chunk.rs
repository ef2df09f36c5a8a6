//! Terrain chunks on the GPU: geometry buffers, batched BLASes and the
//! tables the shaders read.

use crate::compaction::{build_compacted_blases, BlasRequest};
use crate::geometry::{triangle_geometry, TriangleLayout, GEOMETRY_INPUT_USAGE};
use crate::structure::AccelerationStructure;
use crate::tlas::TlasInstance;
use ash::vk;
use glam::{Mat4, Vec3};
use voxtrace_gpu::{
    create_buffer, create_buffer_with, BufferRequest, DeferredQueue, Device, GeometryDesc,
    GpuBuffer, GpuError, MemoryBarrier, Result,
};

/// Vertices per quad face.
pub const VERTICES_PER_FACE: u32 = 4;
/// Indices per quad face, two triangles.
pub const INDICES_PER_FACE: u32 = 6;

/// Positions are `R8G8B8_UNORM` with the voxel type in the fourth byte;
/// instance transforms scale them back by 256.
pub const POSITION_SCALE: f32 = 256.0;

/// Geometry buffers must allow 8-byte device address loads.
const GEOMETRY_ALIGNMENT: u64 = 8;

/// One terrain tile and its bottom-level structure.
#[derive(Debug)]
pub struct Chunk {
    pub cx: i32,
    pub cz: i32,
    positions: GpuBuffer,
    indices: GpuBuffer,
    num_faces: u32,
    blas: Option<AccelerationStructure>,
}

impl Chunk {
    /// Upload packed positions and indices of `num_faces` quads.
    pub fn upload<D: Device>(
        device: &mut D,
        deferred: &mut DeferredQueue,
        (cx, cz): (i32, i32),
        positions: &[u32],
        indices: &[u32],
    ) -> Result<Self> {
        let num_faces = u32::try_from(positions.len() / VERTICES_PER_FACE as usize)
            .map_err(|_| GpuError::InvalidState("chunk has too many faces".to_string()))?;
        if num_faces == 0
            || positions.len() != (num_faces * VERTICES_PER_FACE) as usize
            || indices.len() != (num_faces * INDICES_PER_FACE) as usize
        {
            return Err(GpuError::InvalidState(format!(
                "chunk ({cx}, {cz}) has {} positions and {} indices",
                positions.len(),
                indices.len()
            )));
        }

        let positions = create_buffer(
            device,
            deferred,
            &BufferRequest::with_data("chunk positions", GEOMETRY_INPUT_USAGE, bytemuck::cast_slice(positions))
                .aligned(GEOMETRY_ALIGNMENT),
        )?;
        let indices = match create_buffer_with(
            device,
            deferred,
            &BufferRequest::with_data("chunk indices", GEOMETRY_INPUT_USAGE, bytemuck::cast_slice(indices))
                .aligned(GEOMETRY_ALIGNMENT),
            |device, cmd| {
                device.cmd_memory_barrier(cmd, &MemoryBarrier::TRANSFER_TO_BUILD);
                Ok(())
            },
        ) {
            Ok(buffer) => buffer,
            Err(e) => {
                device.wait_idle()?;
                device.free_buffer(positions)?;
                return Err(e);
            }
        };

        Ok(Self {
            cx,
            cz,
            positions,
            indices,
            num_faces,
            blas: None,
        })
    }

    pub fn num_faces(&self) -> u32 {
        self.num_faces
    }

    pub fn primitive_count(&self) -> u32 {
        self.num_faces * 2
    }

    pub fn positions(&self) -> &GpuBuffer {
        &self.positions
    }

    pub fn indices(&self) -> &GpuBuffer {
        &self.indices
    }

    pub fn geometry(&self) -> GeometryDesc {
        triangle_geometry(
            &self.positions,
            &self.indices,
            &TriangleLayout {
                vertex_format: vk::Format::R8G8B8_UNORM,
                vertex_stride: 4,
                vertex_count: self.num_faces * VERTICES_PER_FACE,
                index_type: vk::IndexType::UINT32,
            },
        )
    }

    pub fn blas(&self) -> Option<&AccelerationStructure> {
        self.blas.as_ref()
    }

    /// Object-to-world transform of this chunk's instance.
    pub fn transform(&self, chunk_size: u32) -> Mat4 {
        let size = chunk_size as f32;
        Mat4::from_translation(Vec3::new(self.cx as f32 * size, 0.0, self.cz as f32 * size))
            * Mat4::from_scale(Vec3::splat(POSITION_SCALE))
    }

    /// Free the geometry buffers and the BLAS. The device must be idle.
    pub fn destroy<D: Device>(self, device: &mut D) -> Result<()> {
        device.free_buffer(self.positions)?;
        device.free_buffer(self.indices)?;
        if let Some(blas) = self.blas {
            blas.destroy(device)?;
        }
        Ok(())
    }
}

/// Build and compact the BLAS of every chunk in one batch.
pub fn build_chunk_blases<D: Device>(
    device: &mut D,
    deferred: &mut DeferredQueue,
    chunks: &mut [Chunk],
) -> Result<()> {
    if chunks.iter().any(|c| c.blas.is_some()) {
        return Err(GpuError::InvalidState("chunk BLASes are already built".to_string()));
    }
    let requests: Vec<BlasRequest> = chunks
        .iter()
        .map(|c| BlasRequest {
            geometry: c.geometry(),
            primitive_count: c.primitive_count(),
        })
        .collect();

    let blases = build_compacted_blases(device, deferred, &requests)?;
    for (chunk, blas) in chunks.iter_mut().zip(blases) {
        chunk.blas = Some(blas);
    }
    Ok(())
}

/// One TLAS instance per chunk, with the chunk's index as custom index.
pub fn chunk_instances(chunks: &[Chunk], chunk_size: u32) -> Result<Vec<TlasInstance>> {
    chunks
        .iter()
        .enumerate()
        .map(|(i, chunk)| {
            let blas = chunk.blas().ok_or_else(|| {
                GpuError::InvalidState(format!("chunk ({}, {}) has no BLAS", chunk.cx, chunk.cz))
            })?;
            Ok(TlasInstance::new(blas, chunk.transform(chunk_size), i as u32))
        })
        .collect()
}

/// Upload the `(positions, indices)` device address pair of every chunk.
///
/// Shaders index it with the instance custom index.
pub fn geometry_table<D: Device>(
    device: &mut D,
    deferred: &mut DeferredQueue,
    chunks: &[Chunk],
) -> Result<GpuBuffer> {
    let addresses: Vec<u64> = chunks
        .iter()
        .flat_map(|c| [c.positions.device_address, c.indices.device_address])
        .collect();
    if let Some(&address) = addresses.iter().find(|&&a| a % GEOMETRY_ALIGNMENT != 0) {
        return Err(GpuError::Alignment {
            what: "geometry address",
            address,
            alignment: GEOMETRY_ALIGNMENT,
        });
    }

    create_buffer(
        device,
        deferred,
        &BufferRequest::with_data(
            "chunk geometry table",
            vk::BufferUsageFlags::STORAGE_BUFFER,
            bytemuck::cast_slice(&addresses),
        )
        .aligned(GEOMETRY_ALIGNMENT),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use voxtrace_gpu::testing::FakeDevice;

    fn quad_mesh(faces: u32) -> (Vec<u32>, Vec<u32>) {
        let positions = (0..faces * VERTICES_PER_FACE).collect();
        let indices = (0..faces)
            .flat_map(|i| {
                let b = i * 4;
                [b + 3, b + 1, b + 2, b + 1, b, b + 2]
            })
            .collect();
        (positions, indices)
    }

    fn grid(device: &mut FakeDevice, deferred: &mut DeferredQueue) -> Vec<Chunk> {
        let mut chunks = Vec::new();
        for cx in -2i32..=2 {
            for cz in -2..=2 {
                let faces = 8 + (cx + 2 * cz).unsigned_abs();
                let (positions, indices) = quad_mesh(faces);
                chunks.push(Chunk::upload(device, deferred, (cx, cz), &positions, &indices).unwrap());
            }
        }
        chunks
    }

    #[test]
    fn five_by_five_grid_compacts_into_one_buffer() {
        let mut device = FakeDevice::new();
        let mut deferred = DeferredQueue::new();
        let mut chunks = grid(&mut device, &mut deferred);
        let uploads = device.submission_count();
        assert_eq!(uploads, 50);

        build_chunk_blases(&mut device, &mut deferred, &mut chunks).unwrap();
        assert_eq!(device.submission_count() - uploads, 2);

        let shared = chunks[0].blas().unwrap().storage().clone();
        assert_eq!(shared.count(), 25);
        assert!(chunks.iter().all(|c| c.blas().unwrap().storage().ptr_eq(&shared)));

        let instances = chunk_instances(&chunks, 32).unwrap();
        assert_eq!(instances.len(), 25);
        assert_eq!(instances[0].custom_index, 0);
        assert_eq!(instances[24].custom_index, 24);
        let origin = instances[0].transform.transform_point3(Vec3::ZERO);
        assert_eq!(origin, Vec3::new(-64.0, 0.0, -64.0));
        let corner = instances[24].transform.transform_point3(Vec3::ONE);
        assert_eq!(corner, Vec3::new(64.0 + 256.0, 256.0, 64.0 + 256.0));

        deferred.poll_completed(&mut device).unwrap();
        for chunk in chunks {
            chunk.destroy(&mut device).unwrap();
        }
        drop(shared);
        assert_eq!(device.live_buffer_count(), 0);
        assert_eq!(device.live_structure_count(), 0);
        assert_eq!(device.double_free_count(), 0);
    }

    #[test]
    fn chunk_geometry_describes_packed_triangles() {
        let mut device = FakeDevice::new();
        let mut deferred = DeferredQueue::new();
        let (positions, indices) = quad_mesh(3);
        let chunk = Chunk::upload(&mut device, &mut deferred, (1, -1), &positions, &indices).unwrap();

        assert_eq!(chunk.primitive_count(), 6);
        let GeometryDesc::Triangles {
            vertex_format,
            vertex_stride,
            max_vertex,
            index_type,
            ..
        } = chunk.geometry()
        else {
            panic!("chunk geometry is not triangles");
        };
        assert_eq!(vertex_format, vk::Format::R8G8B8_UNORM);
        assert_eq!(vertex_stride, 4);
        assert_eq!(max_vertex, 11);
        assert_eq!(index_type, vk::IndexType::UINT32);

        chunk.destroy(&mut device).unwrap();
    }

    #[test]
    fn geometry_table_holds_address_pairs() {
        let mut device = FakeDevice::new();
        let mut deferred = DeferredQueue::new();
        let (positions, indices) = quad_mesh(2);
        let chunks: Vec<_> = (0..3)
            .map(|i| Chunk::upload(&mut device, &mut deferred, (i, 0), &positions, &indices).unwrap())
            .collect();

        let table = geometry_table(&mut device, &mut deferred, &chunks).unwrap();
        let contents = device.buffer_contents(table.buffer);
        let addresses: Vec<u64> = contents
            .chunks_exact(8)
            .map(|b| u64::from_ne_bytes(b.try_into().unwrap()))
            .collect();
        assert_eq!(addresses.len(), 6);
        assert_eq!(addresses[2], chunks[1].positions().device_address);
        assert_eq!(addresses[5], chunks[2].indices().device_address);
    }

    #[test]
    fn mismatched_mesh_is_rejected() {
        let mut device = FakeDevice::new();
        let mut deferred = DeferredQueue::new();
        let (positions, _) = quad_mesh(2);
        assert!(Chunk::upload(&mut device, &mut deferred, (0, 0), &positions, &[0, 1, 2]).is_err());
        assert!(Chunk::upload(&mut device, &mut deferred, (0, 0), &[], &[]).is_err());
        assert_eq!(device.live_buffer_count(), 0);
    }

    #[test]
    fn instances_need_built_blases() {
        let mut device = FakeDevice::new();
        let mut deferred = DeferredQueue::new();
        let (positions, indices) = quad_mesh(1);
        let chunk = Chunk::upload(&mut device, &mut deferred, (0, 0), &positions, &indices).unwrap();
        assert!(chunk_instances(std::slice::from_ref(&chunk), 32).is_err());
        chunk.destroy(&mut device).unwrap();
    }
}

//! Build inputs: AABBs, indexed triangles and their upload.

use ash::vk;
use glam::Vec3;
use voxtrace_gpu::{create_buffer, BufferRequest, DeferredQueue, Device, GeometryDesc, GpuBuffer, Result};

/// Usage of buffers read by acceleration structure builds and shaders.
pub const GEOMETRY_INPUT_USAGE: vk::BufferUsageFlags = vk::BufferUsageFlags::from_raw(
    vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR.as_raw()
        | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS.as_raw()
        | vk::BufferUsageFlags::STORAGE_BUFFER.as_raw(),
);

/// AABB positions for procedural geometry (24 bytes).
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct AabbPositions {
    pub min_x: f32,
    pub min_y: f32,
    pub min_z: f32,
    pub max_x: f32,
    pub max_y: f32,
    pub max_z: f32,
}

impl AabbPositions {
    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self {
            min_x: min.x,
            min_y: min.y,
            min_z: min.z,
            max_x: max.x,
            max_y: max.y,
            max_z: max.z,
        }
    }

    /// The box `[0,0,0]-[1,1,1]`.
    pub fn unit() -> Self {
        Self::new(Vec3::ZERO, Vec3::ONE)
    }

    pub fn min(&self) -> Vec3 {
        Vec3::new(self.min_x, self.min_y, self.min_z)
    }

    pub fn max(&self) -> Vec3 {
        Vec3::new(self.max_x, self.max_y, self.max_z)
    }
}

/// Upload build input data into a device-local buffer.
pub fn upload_input<D: Device>(
    device: &mut D,
    deferred: &mut DeferredQueue,
    name: &str,
    data: &[u8],
    alignment: u64,
) -> Result<GpuBuffer> {
    create_buffer(
        device,
        deferred,
        &BufferRequest::with_data(name, GEOMETRY_INPUT_USAGE, data).aligned(alignment),
    )
}

/// Opaque AABB geometry over a buffer of [`AabbPositions`].
pub fn aabb_geometry(aabbs: &GpuBuffer) -> GeometryDesc {
    GeometryDesc::Aabbs {
        data: aabbs.device_address,
        stride: std::mem::size_of::<AabbPositions>() as u64,
        flags: vk::GeometryFlagsKHR::OPAQUE,
    }
}

/// Layout of an indexed triangle mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriangleLayout {
    pub vertex_format: vk::Format,
    pub vertex_stride: u64,
    pub vertex_count: u32,
    pub index_type: vk::IndexType,
}

/// Opaque triangle geometry over a vertex and an index buffer.
pub fn triangle_geometry(
    vertices: &GpuBuffer,
    indices: &GpuBuffer,
    layout: &TriangleLayout,
) -> GeometryDesc {
    GeometryDesc::Triangles {
        vertex_format: layout.vertex_format,
        vertex_data: vertices.device_address,
        vertex_stride: layout.vertex_stride,
        max_vertex: layout.vertex_count.saturating_sub(1),
        index_type: layout.index_type,
        index_data: indices.device_address,
        flags: vk::GeometryFlagsKHR::OPAQUE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aabb_layout_is_six_floats() {
        assert_eq!(std::mem::size_of::<AabbPositions>(), 24);
        let unit = AabbPositions::unit();
        let bytes = bytemuck::bytes_of(&unit);
        assert_eq!(&bytes[12..16], &1.0f32.to_ne_bytes());
    }
}

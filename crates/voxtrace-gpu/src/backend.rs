//! The device seam.
//!
//! Everything above this module (uploads, deferred cleanup, acceleration
//! structure builds, the frame lifecycle) talks to the GPU through the
//! [`Device`] and [`Presenter`] traits. [`crate::VulkanDevice`] implements
//! them on top of `ash`; the `testing` feature adds an in-memory fake.

use crate::descriptors::DescriptorWrite;
use crate::error::Result;
use crate::memory::{BufferDesc, GpuBuffer};
use crate::swapchain::{Swapchain, SwapchainRequest};
use ash::vk;

/// Which command pool a command buffer is allocated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandPoolKind {
    /// Short-lived, one-time-submit command buffers for uploads and builds.
    Transient,
    /// Long-lived per-swapchain-image command buffers.
    Frame,
}

/// A global memory dependency between two pipeline stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryBarrier {
    pub src_stage: vk::PipelineStageFlags2,
    pub src_access: vk::AccessFlags2,
    pub dst_stage: vk::PipelineStageFlags2,
    pub dst_access: vk::AccessFlags2,
}

impl MemoryBarrier {
    /// Uploaded geometry becomes visible to acceleration structure builds.
    pub const TRANSFER_TO_BUILD: Self = Self {
        src_stage: vk::PipelineStageFlags2::TRANSFER,
        src_access: vk::AccessFlags2::TRANSFER_WRITE,
        dst_stage: vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR,
        dst_access: vk::AccessFlags2::ACCELERATION_STRUCTURE_READ_KHR,
    };

    /// Built structures become readable by later builds, copies and queries.
    pub const BUILD_TO_BUILD: Self = Self {
        src_stage: vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR,
        src_access: vk::AccessFlags2::ACCELERATION_STRUCTURE_WRITE_KHR,
        dst_stage: vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR,
        dst_access: vk::AccessFlags2::ACCELERATION_STRUCTURE_READ_KHR,
    };

    /// Uploaded shader binding table records become readable by trace calls.
    pub const TRANSFER_TO_RAY_TRACING: Self = Self {
        src_stage: vk::PipelineStageFlags2::TRANSFER,
        src_access: vk::AccessFlags2::TRANSFER_WRITE,
        dst_stage: vk::PipelineStageFlags2::RAY_TRACING_SHADER_KHR,
        dst_access: vk::AccessFlags2::SHADER_READ,
    };

    /// Built structures become readable by ray tracing and compute shaders.
    pub const BUILD_TO_SHADER: Self = Self {
        src_stage: vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR,
        src_access: vk::AccessFlags2::ACCELERATION_STRUCTURE_WRITE_KHR,
        dst_stage: vk::PipelineStageFlags2::from_raw(
            vk::PipelineStageFlags2::RAY_TRACING_SHADER_KHR.as_raw()
                | vk::PipelineStageFlags2::COMPUTE_SHADER.as_raw(),
        ),
        dst_access: vk::AccessFlags2::ACCELERATION_STRUCTURE_READ_KHR,
    };
}

/// One queue submission of a single command buffer.
#[derive(Debug, Clone, Copy)]
pub struct Submission<'a> {
    pub command_buffer: vk::CommandBuffer,
    pub wait: &'a [(vk::Semaphore, vk::PipelineStageFlags)],
    pub signal: &'a [vk::Semaphore],
    pub fence: vk::Fence,
}

/// Geometry fed to an acceleration structure size query or build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeometryDesc {
    Triangles {
        vertex_format: vk::Format,
        vertex_data: vk::DeviceAddress,
        vertex_stride: u64,
        max_vertex: u32,
        index_type: vk::IndexType,
        index_data: vk::DeviceAddress,
        flags: vk::GeometryFlagsKHR,
    },
    Aabbs {
        data: vk::DeviceAddress,
        stride: u64,
        flags: vk::GeometryFlagsKHR,
    },
    Instances {
        data: vk::DeviceAddress,
    },
}

impl GeometryDesc {
    /// The acceleration structure level this geometry builds.
    pub fn level(&self) -> vk::AccelerationStructureTypeKHR {
        match self {
            Self::Triangles { .. } | Self::Aabbs { .. } => {
                vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL
            }
            Self::Instances { .. } => vk::AccelerationStructureTypeKHR::TOP_LEVEL,
        }
    }
}

/// Sizes reported by an acceleration structure build size query.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuildSizes {
    pub acceleration_structure_size: u64,
    pub build_scratch_size: u64,
    pub update_scratch_size: u64,
}

/// One entry of a batched acceleration structure build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildCommand {
    pub geometry: GeometryDesc,
    pub flags: vk::BuildAccelerationStructureFlagsKHR,
    pub primitive_count: u32,
    pub dst: vk::AccelerationStructureKHR,
    pub scratch_address: vk::DeviceAddress,
}

/// Device limits the acceleration structure and shader binding table code
/// depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceLimits {
    pub min_acceleration_structure_scratch_offset_alignment: u64,
    pub shader_group_base_alignment: u64,
    pub shader_group_handle_size: u32,
    pub shader_group_handle_alignment: u32,
    pub max_primitive_count: u64,
    pub max_instance_count: u64,
    pub non_coherent_atom_size: u64,
}

impl Default for DeviceLimits {
    fn default() -> Self {
        Self {
            min_acceleration_structure_scratch_offset_alignment: 128,
            shader_group_base_alignment: 64,
            shader_group_handle_size: 32,
            shader_group_handle_alignment: 32,
            max_primitive_count: (1 << 29) - 1,
            max_instance_count: (1 << 24) - 1,
            non_coherent_atom_size: 64,
        }
    }
}

/// GPU operations used by the resource and frame lifecycle code.
///
/// Handles are plain Vulkan handles; ownership rules are those of Vulkan:
/// every `create_*` must be paired with exactly one `destroy_*`/`free_*`.
pub trait Device {
    /// Device limits relevant to acceleration structures.
    fn limits(&self) -> &DeviceLimits;

    // Memory

    fn create_buffer(&mut self, desc: &BufferDesc<'_>) -> Result<GpuBuffer>;
    fn free_buffer(&mut self, buffer: GpuBuffer) -> Result<()>;
    /// Copy bytes into a host-visible buffer.
    fn write_buffer(&mut self, buffer: &GpuBuffer, offset: u64, data: &[u8]) -> Result<()>;
    /// Make host writes visible to the device for non-coherent memory.
    fn flush_buffer(&mut self, buffer: &GpuBuffer, offset: u64, size: u64) -> Result<()>;

    // Commands

    fn allocate_command_buffers(
        &mut self,
        pool: CommandPoolKind,
        count: u32,
    ) -> Result<Vec<vk::CommandBuffer>>;
    fn free_command_buffers(&mut self, pool: CommandPoolKind, command_buffers: &[vk::CommandBuffer]);
    fn begin_command_buffer(
        &mut self,
        cmd: vk::CommandBuffer,
        flags: vk::CommandBufferUsageFlags,
    ) -> Result<()>;
    fn end_command_buffer(&mut self, cmd: vk::CommandBuffer) -> Result<()>;
    fn cmd_copy_buffer(&mut self, cmd: vk::CommandBuffer, src: &GpuBuffer, dst: &GpuBuffer, size: u64);
    fn cmd_memory_barrier(&mut self, cmd: vk::CommandBuffer, barrier: &MemoryBarrier);

    // Synchronization

    fn create_fence(&mut self, signaled: bool) -> Result<vk::Fence>;
    fn destroy_fence(&mut self, fence: vk::Fence);
    fn fence_signaled(&mut self, fence: vk::Fence) -> Result<bool>;
    fn wait_for_fence(&mut self, fence: vk::Fence, timeout_ns: u64) -> Result<()>;
    fn reset_fence(&mut self, fence: vk::Fence) -> Result<()>;
    fn create_semaphore(&mut self) -> Result<vk::Semaphore>;
    fn destroy_semaphore(&mut self, semaphore: vk::Semaphore);
    fn submit(&mut self, submission: &Submission<'_>) -> Result<()>;
    fn wait_idle(&mut self) -> Result<()>;

    // Acceleration structures

    fn acceleration_structure_build_sizes(
        &mut self,
        geometry: &GeometryDesc,
        primitive_count: u32,
        flags: vk::BuildAccelerationStructureFlagsKHR,
    ) -> BuildSizes;
    fn create_acceleration_structure(
        &mut self,
        level: vk::AccelerationStructureTypeKHR,
        buffer: vk::Buffer,
        offset: u64,
        size: u64,
    ) -> Result<vk::AccelerationStructureKHR>;
    fn destroy_acceleration_structure(&mut self, handle: vk::AccelerationStructureKHR);
    fn acceleration_structure_address(
        &mut self,
        handle: vk::AccelerationStructureKHR,
    ) -> vk::DeviceAddress;
    /// Record every build in one command.
    fn cmd_build_acceleration_structures(&mut self, cmd: vk::CommandBuffer, builds: &[BuildCommand]);
    fn cmd_copy_acceleration_structure(
        &mut self,
        cmd: vk::CommandBuffer,
        src: vk::AccelerationStructureKHR,
        dst: vk::AccelerationStructureKHR,
        mode: vk::CopyAccelerationStructureModeKHR,
    );

    // Queries

    /// Create a pool of `count` compacted-size queries.
    fn create_query_pool(&mut self, count: u32) -> Result<vk::QueryPool>;
    fn destroy_query_pool(&mut self, pool: vk::QueryPool);
    fn cmd_reset_query_pool(&mut self, cmd: vk::CommandBuffer, pool: vk::QueryPool, first: u32, count: u32);
    fn cmd_write_compacted_sizes(
        &mut self,
        cmd: vk::CommandBuffer,
        structures: &[vk::AccelerationStructureKHR],
        pool: vk::QueryPool,
        first: u32,
    );
    /// Read back 64-bit results, waiting for their availability.
    fn compacted_sizes(&mut self, pool: vk::QueryPool, first: u32, count: u32) -> Result<Vec<u64>>;

    // Descriptors

    /// Create a pool sized for `sets` and allocate and write one set per entry.
    fn create_descriptor_sets(
        &mut self,
        layout: vk::DescriptorSetLayout,
        sets: &[Vec<DescriptorWrite>],
    ) -> Result<(vk::DescriptorPool, Vec<vk::DescriptorSet>)>;
    fn destroy_descriptor_pool(&mut self, pool: vk::DescriptorPool);
}

/// Result of acquiring a swapchain image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    Acquired { index: u32, suboptimal: bool },
    OutOfDate,
}

/// Result of presenting a swapchain image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentOutcome {
    Presented,
    Suboptimal,
    OutOfDate,
}

/// Swapchain operations of a device bound to a window surface.
pub trait Presenter: Device {
    /// Create a swapchain, passing `old` to the driver for resource reuse.
    ///
    /// The old swapchain stays alive; the caller destroys it afterwards.
    fn create_swapchain(
        &mut self,
        request: &SwapchainRequest,
        old: Option<&Swapchain>,
    ) -> Result<Swapchain>;
    /// Destroy a swapchain and its image views.
    fn destroy_swapchain(&mut self, swapchain: Swapchain);
    fn acquire_next_image(
        &mut self,
        swapchain: &Swapchain,
        semaphore: vk::Semaphore,
        timeout_ns: u64,
    ) -> Result<AcquireOutcome>;
    fn present(
        &mut self,
        swapchain: &Swapchain,
        image_index: u32,
        wait: vk::Semaphore,
    ) -> Result<PresentOutcome>;
}

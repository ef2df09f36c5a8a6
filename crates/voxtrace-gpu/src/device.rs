//! The Vulkan implementation of the device seam.

use crate::allocator::GpuAllocator;
use crate::backend::{
    AcquireOutcome, BuildCommand, BuildSizes, CommandPoolKind, Device, DeviceLimits,
    GeometryDesc, MemoryBarrier, PresentOutcome, Presenter, Submission,
};
use crate::command::CommandPool;
use crate::context::GpuContext;
use crate::descriptors::{pool_sizes, DescriptorResource, DescriptorWrite};
use crate::error::{GpuError, Result};
use crate::memory::{BufferDesc, GpuBuffer};
use crate::surface::SurfaceContext;
use crate::swapchain::{Swapchain, SwapchainRequest};
use ash::vk;

/// A Vulkan device with its allocator, command pools and swapchain loader.
///
/// Everything created through it must be released through it before it is
/// dropped; dropping it waits for the device and tears down in reverse.
pub struct VulkanDevice {
    allocator: GpuAllocator,
    transient_pool: CommandPool,
    frame_pool: CommandPool,
    acceleration: ash::khr::acceleration_structure::Device,
    ray_tracing: Option<ash::khr::ray_tracing_pipeline::Device>,
    presentation: SurfaceContext,
    limits: DeviceLimits,
    // Dropped last: owns the device the fields above were created from.
    context: GpuContext,
}

impl VulkanDevice {
    pub fn new(context: GpuContext) -> Result<Self> {
        let device = context.device.clone();
        let allocator =
            unsafe { GpuAllocator::new(&context.instance, device.clone(), context.physical_device) }?;

        let transient_pool = unsafe {
            CommandPool::new(
                &device,
                context.queue_family,
                vk::CommandPoolCreateFlags::TRANSIENT,
            )
        }?;
        let frame_pool = match unsafe {
            CommandPool::new(
                &device,
                context.queue_family,
                vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
            )
        } {
            Ok(pool) => pool,
            Err(e) => {
                unsafe { transient_pool.destroy(&device) };
                return Err(e);
            }
        };

        let acceleration = ash::khr::acceleration_structure::Device::new(&context.instance, &device);
        let ray_tracing = context
            .capabilities
            .supports_ray_tracing_pipeline
            .then(|| ash::khr::ray_tracing_pipeline::Device::new(&context.instance, &device));
        let presentation = SurfaceContext::new(&context);
        let limits = context.capabilities.limits;

        tracing::debug!("Device limits: {limits:?}");

        Ok(Self {
            allocator,
            transient_pool,
            frame_pool,
            acceleration,
            ray_tracing,
            presentation,
            limits,
            context,
        })
    }

    pub fn context(&self) -> &GpuContext {
        &self.context
    }

    /// The raw device, for recording commands outside the [`Device`] trait.
    pub fn raw(&self) -> &ash::Device {
        &self.context.device
    }

    /// The ray tracing pipeline loader, present when the device supports it.
    pub fn ray_tracing(&self) -> Option<&ash::khr::ray_tracing_pipeline::Device> {
        self.ray_tracing.as_ref()
    }

    /// Handles of the first `group_count` shader groups of `pipeline`,
    /// `shader_group_handle_size` bytes each, in group order.
    pub fn shader_group_handles(&self, pipeline: vk::Pipeline, group_count: u32) -> Result<Vec<u8>> {
        let loader = self
            .ray_tracing
            .as_ref()
            .ok_or_else(|| GpuError::FeatureNotSupported("rayTracingPipeline".to_string()))?;
        let size = self.limits.shader_group_handle_size as usize * group_count as usize;
        let handles =
            unsafe { loader.get_ray_tracing_shader_group_handles(pipeline, 0, group_count, size) }?;
        Ok(handles)
    }

    fn pool(&self, kind: CommandPoolKind) -> &CommandPool {
        match kind {
            CommandPoolKind::Transient => &self.transient_pool,
            CommandPoolKind::Frame => &self.frame_pool,
        }
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        unsafe {
            let device = &self.context.device;
            let _ = device.device_wait_idle();
            self.transient_pool.destroy(device);
            self.frame_pool.destroy(device);
        }
        self.allocator.shutdown();
    }
}

fn vk_geometry(geometry: &GeometryDesc) -> vk::AccelerationStructureGeometryKHR<'static> {
    match *geometry {
        GeometryDesc::Triangles {
            vertex_format,
            vertex_data,
            vertex_stride,
            max_vertex,
            index_type,
            index_data,
            flags,
        } => vk::AccelerationStructureGeometryKHR::default()
            .geometry_type(vk::GeometryTypeKHR::TRIANGLES)
            .flags(flags)
            .geometry(vk::AccelerationStructureGeometryDataKHR {
                triangles: vk::AccelerationStructureGeometryTrianglesDataKHR::default()
                    .vertex_format(vertex_format)
                    .vertex_data(vk::DeviceOrHostAddressConstKHR {
                        device_address: vertex_data,
                    })
                    .vertex_stride(vertex_stride)
                    .max_vertex(max_vertex)
                    .index_type(index_type)
                    .index_data(vk::DeviceOrHostAddressConstKHR {
                        device_address: index_data,
                    }),
            }),
        GeometryDesc::Aabbs {
            data,
            stride,
            flags,
        } => vk::AccelerationStructureGeometryKHR::default()
            .geometry_type(vk::GeometryTypeKHR::AABBS)
            .flags(flags)
            .geometry(vk::AccelerationStructureGeometryDataKHR {
                aabbs: vk::AccelerationStructureGeometryAabbsDataKHR::default()
                    .data(vk::DeviceOrHostAddressConstKHR {
                        device_address: data,
                    })
                    .stride(stride),
            }),
        GeometryDesc::Instances { data } => vk::AccelerationStructureGeometryKHR::default()
            .geometry_type(vk::GeometryTypeKHR::INSTANCES)
            .geometry(vk::AccelerationStructureGeometryDataKHR {
                instances: vk::AccelerationStructureGeometryInstancesDataKHR::default()
                    .array_of_pointers(false)
                    .data(vk::DeviceOrHostAddressConstKHR {
                        device_address: data,
                    }),
            }),
    }
}

impl Device for VulkanDevice {
    fn limits(&self) -> &DeviceLimits {
        &self.limits
    }

    fn create_buffer(&mut self, desc: &BufferDesc<'_>) -> Result<GpuBuffer> {
        self.allocator.create_buffer(desc)
    }

    fn free_buffer(&mut self, buffer: GpuBuffer) -> Result<()> {
        self.allocator.free_buffer(buffer)
    }

    fn write_buffer(&mut self, buffer: &GpuBuffer, offset: u64, data: &[u8]) -> Result<()> {
        self.allocator.write(buffer, offset, data)
    }

    fn flush_buffer(&mut self, buffer: &GpuBuffer, offset: u64, size: u64) -> Result<()> {
        self.allocator
            .flush(buffer, offset, size, self.limits.non_coherent_atom_size)
    }

    fn allocate_command_buffers(
        &mut self,
        pool: CommandPoolKind,
        count: u32,
    ) -> Result<Vec<vk::CommandBuffer>> {
        unsafe { self.pool(pool).allocate(&self.context.device, count) }
    }

    fn free_command_buffers(&mut self, pool: CommandPoolKind, command_buffers: &[vk::CommandBuffer]) {
        unsafe { self.pool(pool).free(&self.context.device, command_buffers) };
    }

    fn begin_command_buffer(
        &mut self,
        cmd: vk::CommandBuffer,
        flags: vk::CommandBufferUsageFlags,
    ) -> Result<()> {
        let begin_info = vk::CommandBufferBeginInfo::default().flags(flags);
        unsafe { self.context.device.begin_command_buffer(cmd, &begin_info)? };
        Ok(())
    }

    fn end_command_buffer(&mut self, cmd: vk::CommandBuffer) -> Result<()> {
        unsafe { self.context.device.end_command_buffer(cmd)? };
        Ok(())
    }

    fn cmd_copy_buffer(&mut self, cmd: vk::CommandBuffer, src: &GpuBuffer, dst: &GpuBuffer, size: u64) {
        let region = vk::BufferCopy::default().size(size);
        unsafe {
            self.context
                .device
                .cmd_copy_buffer(cmd, src.buffer, dst.buffer, std::slice::from_ref(&region));
        }
    }

    fn cmd_memory_barrier(&mut self, cmd: vk::CommandBuffer, barrier: &MemoryBarrier) {
        let memory_barrier = vk::MemoryBarrier2::default()
            .src_stage_mask(barrier.src_stage)
            .src_access_mask(barrier.src_access)
            .dst_stage_mask(barrier.dst_stage)
            .dst_access_mask(barrier.dst_access);
        let dependency =
            vk::DependencyInfo::default().memory_barriers(std::slice::from_ref(&memory_barrier));
        unsafe { self.context.device.cmd_pipeline_barrier2(cmd, &dependency) };
    }

    fn create_fence(&mut self, signaled: bool) -> Result<vk::Fence> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let create_info = vk::FenceCreateInfo::default().flags(flags);
        Ok(unsafe { self.context.device.create_fence(&create_info, None)? })
    }

    fn destroy_fence(&mut self, fence: vk::Fence) {
        unsafe { self.context.device.destroy_fence(fence, None) };
    }

    fn fence_signaled(&mut self, fence: vk::Fence) -> Result<bool> {
        Ok(unsafe { self.context.device.get_fence_status(fence)? })
    }

    fn wait_for_fence(&mut self, fence: vk::Fence, timeout_ns: u64) -> Result<()> {
        unsafe { self.context.device.wait_for_fences(&[fence], true, timeout_ns)? };
        Ok(())
    }

    fn reset_fence(&mut self, fence: vk::Fence) -> Result<()> {
        unsafe { self.context.device.reset_fences(&[fence])? };
        Ok(())
    }

    fn create_semaphore(&mut self) -> Result<vk::Semaphore> {
        let create_info = vk::SemaphoreCreateInfo::default();
        Ok(unsafe { self.context.device.create_semaphore(&create_info, None)? })
    }

    fn destroy_semaphore(&mut self, semaphore: vk::Semaphore) {
        unsafe { self.context.device.destroy_semaphore(semaphore, None) };
    }

    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    fn submit(&mut self, submission: &Submission<'_>) -> Result<()> {
        let wait_semaphores: Vec<_> = submission.wait.iter().map(|(s, _)| *s).collect();
        let wait_stages: Vec<_> = submission.wait.iter().map(|(_, stage)| *stage).collect();
        let command_buffers = [submission.command_buffer];

        let submit_info = vk::SubmitInfo::default()
            .command_buffers(&command_buffers)
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .signal_semaphores(submission.signal);

        unsafe {
            self.context
                .device
                .queue_submit(self.context.queue, &[submit_info], submission.fence)?;
        }
        Ok(())
    }

    fn wait_idle(&mut self) -> Result<()> {
        self.context.wait_idle()
    }

    fn acceleration_structure_build_sizes(
        &mut self,
        geometry: &GeometryDesc,
        primitive_count: u32,
        flags: vk::BuildAccelerationStructureFlagsKHR,
    ) -> BuildSizes {
        let geometries = [vk_geometry(geometry)];
        let build_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
            .ty(geometry.level())
            .flags(flags)
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
            .geometries(&geometries);

        let mut sizes = vk::AccelerationStructureBuildSizesInfoKHR::default();
        unsafe {
            self.acceleration.get_acceleration_structure_build_sizes(
                vk::AccelerationStructureBuildTypeKHR::DEVICE,
                &build_info,
                &[primitive_count],
                &mut sizes,
            );
        }

        BuildSizes {
            acceleration_structure_size: sizes.acceleration_structure_size,
            build_scratch_size: sizes.build_scratch_size,
            update_scratch_size: sizes.update_scratch_size,
        }
    }

    fn create_acceleration_structure(
        &mut self,
        level: vk::AccelerationStructureTypeKHR,
        buffer: vk::Buffer,
        offset: u64,
        size: u64,
    ) -> Result<vk::AccelerationStructureKHR> {
        let create_info = vk::AccelerationStructureCreateInfoKHR::default()
            .buffer(buffer)
            .offset(offset)
            .size(size)
            .ty(level);
        Ok(unsafe {
            self.acceleration
                .create_acceleration_structure(&create_info, None)?
        })
    }

    fn destroy_acceleration_structure(&mut self, handle: vk::AccelerationStructureKHR) {
        unsafe { self.acceleration.destroy_acceleration_structure(handle, None) };
    }

    fn acceleration_structure_address(
        &mut self,
        handle: vk::AccelerationStructureKHR,
    ) -> vk::DeviceAddress {
        let info =
            vk::AccelerationStructureDeviceAddressInfoKHR::default().acceleration_structure(handle);
        unsafe { self.acceleration.get_acceleration_structure_device_address(&info) }
    }

    fn cmd_build_acceleration_structures(&mut self, cmd: vk::CommandBuffer, builds: &[BuildCommand]) {
        if builds.is_empty() {
            return;
        }

        let geometries: Vec<_> = builds.iter().map(|b| vk_geometry(&b.geometry)).collect();
        let infos: Vec<_> = builds
            .iter()
            .zip(&geometries)
            .map(|(build, geometry)| {
                vk::AccelerationStructureBuildGeometryInfoKHR::default()
                    .ty(build.geometry.level())
                    .flags(build.flags)
                    .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
                    .dst_acceleration_structure(build.dst)
                    .geometries(std::slice::from_ref(geometry))
                    .scratch_data(vk::DeviceOrHostAddressKHR {
                        device_address: build.scratch_address,
                    })
            })
            .collect();
        let ranges: Vec<_> = builds
            .iter()
            .map(|build| {
                [vk::AccelerationStructureBuildRangeInfoKHR::default()
                    .primitive_count(build.primitive_count)
                    .primitive_offset(0)
                    .first_vertex(0)
                    .transform_offset(0)]
            })
            .collect();
        let range_refs: Vec<&[vk::AccelerationStructureBuildRangeInfoKHR]> =
            ranges.iter().map(|range| range.as_slice()).collect();

        unsafe {
            self.acceleration
                .cmd_build_acceleration_structures(cmd, &infos, &range_refs);
        }
    }

    fn cmd_copy_acceleration_structure(
        &mut self,
        cmd: vk::CommandBuffer,
        src: vk::AccelerationStructureKHR,
        dst: vk::AccelerationStructureKHR,
        mode: vk::CopyAccelerationStructureModeKHR,
    ) {
        let info = vk::CopyAccelerationStructureInfoKHR::default()
            .src(src)
            .dst(dst)
            .mode(mode);
        unsafe { self.acceleration.cmd_copy_acceleration_structure(cmd, &info) };
    }

    fn create_query_pool(&mut self, count: u32) -> Result<vk::QueryPool> {
        let create_info = vk::QueryPoolCreateInfo::default()
            .query_type(vk::QueryType::ACCELERATION_STRUCTURE_COMPACTED_SIZE_KHR)
            .query_count(count);
        Ok(unsafe { self.context.device.create_query_pool(&create_info, None)? })
    }

    fn destroy_query_pool(&mut self, pool: vk::QueryPool) {
        unsafe { self.context.device.destroy_query_pool(pool, None) };
    }

    fn cmd_reset_query_pool(&mut self, cmd: vk::CommandBuffer, pool: vk::QueryPool, first: u32, count: u32) {
        unsafe { self.context.device.cmd_reset_query_pool(cmd, pool, first, count) };
    }

    fn cmd_write_compacted_sizes(
        &mut self,
        cmd: vk::CommandBuffer,
        structures: &[vk::AccelerationStructureKHR],
        pool: vk::QueryPool,
        first: u32,
    ) {
        unsafe {
            self.acceleration.cmd_write_acceleration_structures_properties(
                cmd,
                structures,
                vk::QueryType::ACCELERATION_STRUCTURE_COMPACTED_SIZE_KHR,
                pool,
                first,
            );
        }
    }

    fn compacted_sizes(&mut self, pool: vk::QueryPool, first: u32, count: u32) -> Result<Vec<u64>> {
        let mut sizes = vec![0u64; count as usize];
        unsafe {
            self.context.device.get_query_pool_results(
                pool,
                first,
                &mut sizes,
                vk::QueryResultFlags::TYPE_64 | vk::QueryResultFlags::WAIT,
            )?;
        }
        Ok(sizes)
    }

    fn create_descriptor_sets(
        &mut self,
        layout: vk::DescriptorSetLayout,
        sets: &[Vec<DescriptorWrite>],
    ) -> Result<(vk::DescriptorPool, Vec<vk::DescriptorSet>)> {
        let device = &self.context.device;
        let sizes = pool_sizes(sets);
        let max_sets = u32::try_from(sets.len())
            .map_err(|_| GpuError::InvalidState("too many descriptor sets".to_string()))?;
        let create_info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(max_sets.max(1))
            .pool_sizes(&sizes);
        let pool = unsafe { device.create_descriptor_pool(&create_info, None)? };

        let layouts = vec![layout; sets.len()];
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(pool)
            .set_layouts(&layouts);
        let descriptor_sets = match unsafe { device.allocate_descriptor_sets(&alloc_info) } {
            Ok(descriptor_sets) => descriptor_sets,
            Err(e) => {
                unsafe { device.destroy_descriptor_pool(pool, None) };
                return Err(e.into());
            }
        };

        for (&set, writes) in descriptor_sets.iter().zip(sets) {
            write_descriptor_set(device, set, writes);
        }

        Ok((pool, descriptor_sets))
    }

    fn destroy_descriptor_pool(&mut self, pool: vk::DescriptorPool) {
        unsafe { self.context.device.destroy_descriptor_pool(pool, None) };
    }
}

/// Write every descriptor of one set in a single update.
fn write_descriptor_set(device: &ash::Device, set: vk::DescriptorSet, writes: &[DescriptorWrite]) {
    // Pointed-to info structs must outlive the update call.
    let mut structures = Vec::new();
    let mut images = Vec::new();
    let mut buffers = Vec::new();
    for write in writes {
        match write.resource {
            DescriptorResource::AccelerationStructure(handle) => structures.push([handle]),
            DescriptorResource::StorageImage(view) => images.push([vk::DescriptorImageInfo::default()
                .image_view(view)
                .image_layout(vk::ImageLayout::GENERAL)]),
            DescriptorResource::UniformBuffer { buffer, range }
            | DescriptorResource::StorageBuffer { buffer, range } => {
                buffers.push([vk::DescriptorBufferInfo::default()
                    .buffer(buffer)
                    .offset(0)
                    .range(range)]);
            }
        }
    }

    let mut structure_infos: Vec<_> = structures
        .iter()
        .map(|handle| {
            vk::WriteDescriptorSetAccelerationStructureKHR::default().acceleration_structures(handle)
        })
        .collect();

    let mut structure_infos = structure_infos.iter_mut();
    let mut images = images.iter();
    let mut buffers = buffers.iter();
    let mut vk_writes = Vec::with_capacity(writes.len());
    for write in writes {
        let base = vk::WriteDescriptorSet::default()
            .dst_set(set)
            .dst_binding(write.binding)
            .dst_array_element(0)
            .descriptor_type(write.resource.descriptor_type());
        // Each iterator yields exactly one entry per write of its kind.
        let vk_write = match write.resource {
            DescriptorResource::AccelerationStructure(_) => structure_infos
                .next()
                .map(|info| base.descriptor_count(1).push_next(info)),
            DescriptorResource::StorageImage(_) => images.next().map(|info| base.image_info(info)),
            DescriptorResource::UniformBuffer { .. } | DescriptorResource::StorageBuffer { .. } => {
                buffers.next().map(|info| base.buffer_info(info))
            }
        };
        vk_writes.extend(vk_write);
    }

    unsafe { device.update_descriptor_sets(&vk_writes, &[]) };
}

impl Presenter for VulkanDevice {
    fn create_swapchain(
        &mut self,
        request: &SwapchainRequest,
        old: Option<&Swapchain>,
    ) -> Result<Swapchain> {
        unsafe {
            self.presentation
                .create_swapchain(&self.context, request, old)
        }
    }

    fn destroy_swapchain(&mut self, swapchain: Swapchain) {
        unsafe { self.presentation.destroy_swapchain(&self.context, swapchain) };
    }

    fn acquire_next_image(
        &mut self,
        swapchain: &Swapchain,
        semaphore: vk::Semaphore,
        timeout_ns: u64,
    ) -> Result<AcquireOutcome> {
        unsafe {
            self.presentation
                .acquire_next_image(swapchain, semaphore, timeout_ns)
        }
    }

    fn present(
        &mut self,
        swapchain: &Swapchain,
        image_index: u32,
        wait: vk::Semaphore,
    ) -> Result<PresentOutcome> {
        unsafe {
            self.presentation
                .present(self.context.queue, swapchain, image_index, wait)
        }
    }
}

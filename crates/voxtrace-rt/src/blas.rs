//! Single-geometry acceleration structure builds.

use crate::structure::{AccelerationStructure, STRUCTURE_ALIGNMENT};
use ash::vk;
use voxtrace_gpu::memory::allocate_transient;
use voxtrace_gpu::{
    create_buffer, BufferRequest, BuildCommand, Cleanup, DeferredQueue, Device, GeometryDesc,
    GpuBuffer, GpuError, MemoryBarrier, RcBuffer, Result,
};

/// Usage of buffers holding acceleration structures.
pub const STORAGE_USAGE: vk::BufferUsageFlags = vk::BufferUsageFlags::from_raw(
    vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR.as_raw()
        | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS.as_raw(),
);

/// Usage of build scratch buffers.
pub const SCRATCH_USAGE: vk::BufferUsageFlags = vk::BufferUsageFlags::from_raw(
    vk::BufferUsageFlags::STORAGE_BUFFER.as_raw() | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS.as_raw(),
);

/// One structure built from one geometry in its own submission.
pub(crate) struct SingleBuild<'a> {
    pub geometry: GeometryDesc,
    pub primitive_count: u32,
    pub flags: vk::BuildAccelerationStructureFlagsKHR,
    pub name: &'a str,
    /// Barriers recorded before the build.
    pub before: &'a [MemoryBarrier],
    /// Barrier recorded after the build.
    pub after: Option<MemoryBarrier>,
}

/// Build one bottom-level structure over `geometry`.
///
/// `retired` are buffers the structure no longer needs once built, such as
/// its input geometry; they are freed together with the scratch buffer when
/// the build completes.
pub fn build_blas<D: Device>(
    device: &mut D,
    deferred: &mut DeferredQueue,
    geometry: &GeometryDesc,
    primitive_count: u32,
    retired: Vec<GpuBuffer>,
) -> Result<AccelerationStructure> {
    if geometry.level() != vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL {
        return Err(GpuError::InvalidState(
            "instance geometry cannot build a bottom-level structure".to_string(),
        ));
    }
    let limit = device.limits().max_primitive_count;
    if u64::from(primitive_count) > limit {
        return Err(GpuError::LimitExceeded {
            what: "primitive count",
            requested: u64::from(primitive_count),
            limit,
        });
    }

    let build = SingleBuild {
        geometry: *geometry,
        primitive_count,
        flags: vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE,
        name: "blas",
        before: &[MemoryBarrier::TRANSFER_TO_BUILD],
        after: None,
    };
    build_single(device, deferred, &build, retired)
}

#[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
pub(crate) fn build_single<D: Device>(
    device: &mut D,
    deferred: &mut DeferredQueue,
    build: &SingleBuild<'_>,
    retired: Vec<GpuBuffer>,
) -> Result<AccelerationStructure> {
    let sizes = device.acceleration_structure_build_sizes(&build.geometry, build.primitive_count, build.flags);
    tracing::debug!(
        "{}: {} primitives, {} bytes, {} scratch bytes",
        build.name,
        build.primitive_count,
        sizes.acceleration_structure_size,
        sizes.build_scratch_size
    );

    let scratch_alignment = device.limits().min_acceleration_structure_scratch_offset_alignment;
    let storage = match create_buffer(
        device,
        deferred,
        &BufferRequest::new(
            build.name,
            STORAGE_USAGE,
            voxtrace_gpu::round_up_to_multiple(sizes.acceleration_structure_size, STRUCTURE_ALIGNMENT),
        )
        .aligned(STRUCTURE_ALIGNMENT),
    ) {
        Ok(buffer) => RcBuffer::new(buffer),
        Err(e) => return fail(device, retired, e),
    };
    let scratch = match create_buffer(
        device,
        deferred,
        &BufferRequest::new("scratch", SCRATCH_USAGE, sizes.build_scratch_size.max(1))
            .aligned(scratch_alignment),
    ) {
        Ok(buffer) => buffer,
        Err(e) => {
            storage.free_unused(device)?;
            return fail(device, retired, e);
        }
    };

    let structure = match AccelerationStructure::new(
        device,
        build.geometry.level(),
        &storage,
        0,
        sizes.acceleration_structure_size,
    ) {
        Ok(structure) => structure,
        Err(e) => {
            storage.free_unused(device)?;
            device.free_buffer(scratch)?;
            return fail(device, retired, e);
        }
    };

    let cmd = match record_build(device, build, &structure, &scratch) {
        Ok(cmd) => cmd,
        Err(e) => {
            structure.destroy(device)?;
            device.free_buffer(scratch)?;
            return fail(device, retired, e);
        }
    };

    let mut cleanup = Vec::with_capacity(retired.len() + 2);
    cleanup.push(Cleanup::FreeCommandBuffer(cmd));
    cleanup.push(Cleanup::FreeBuffer(scratch));
    cleanup.extend(retired.into_iter().map(Cleanup::FreeBuffer));
    if let Err(e) = deferred.submit(device, cmd, true, cleanup) {
        structure.destroy(device)?;
        return Err(e);
    }
    Ok(structure)
}

fn record_build<D: Device>(
    device: &mut D,
    build: &SingleBuild<'_>,
    structure: &AccelerationStructure,
    scratch: &GpuBuffer,
) -> Result<vk::CommandBuffer> {
    let cmd = allocate_transient(device)?;
    if let Err(e) = device.begin_command_buffer(cmd, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT) {
        device.free_command_buffers(voxtrace_gpu::CommandPoolKind::Transient, &[cmd]);
        return Err(e);
    }
    for barrier in build.before {
        device.cmd_memory_barrier(cmd, barrier);
    }
    device.cmd_build_acceleration_structures(
        cmd,
        &[BuildCommand {
            geometry: build.geometry,
            flags: build.flags,
            primitive_count: build.primitive_count,
            dst: structure.handle(),
            scratch_address: scratch.device_address,
        }],
    );
    if let Some(barrier) = &build.after {
        device.cmd_memory_barrier(cmd, barrier);
    }
    Ok(cmd)
}

// Inputs handed over may still be read by pending uploads.
fn fail<D: Device, T>(device: &mut D, retired: Vec<GpuBuffer>, error: GpuError) -> Result<T> {
    if !retired.is_empty() {
        device.wait_idle()?;
        for buffer in retired {
            device.free_buffer(buffer)?;
        }
    }
    Err(error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{aabb_geometry, upload_input, AabbPositions};
    use voxtrace_gpu::testing::{self, FakeDevice, RecordedCommand};

    #[test]
    fn unit_aabb_blas_storage_is_rounded_query_size() {
        let mut device = FakeDevice::new();
        device.set_auto_complete(false);
        let mut deferred = DeferredQueue::new();

        let aabbs = upload_input(
            &mut device,
            &mut deferred,
            "aabbs",
            bytemuck::bytes_of(&AabbPositions::unit()),
            8,
        )
        .unwrap();
        let geometry = aabb_geometry(&aabbs);
        let blas = build_blas(&mut device, &mut deferred, &geometry, 1, Vec::new()).unwrap();

        assert_ne!(blas.handle(), vk::AccelerationStructureKHR::null());
        assert_ne!(blas.device_address(), 0);
        assert_eq!(blas.size(), testing::structure_size(1));
        assert_eq!(blas.storage().size(), round_up(testing::structure_size(1)));
        assert_eq!(blas.storage().count(), 1);

        let build_cmd = device.submissions().last().unwrap().command_buffer;
        let commands = device.recorded(build_cmd);
        assert_eq!(commands[0], RecordedCommand::Barrier(MemoryBarrier::TRANSFER_TO_BUILD));
        assert!(matches!(
            &commands[1],
            RecordedCommand::BuildAccelerationStructures(builds) if builds.len() == 1
        ));

        // Scratch and staging are gone once both submissions complete.
        device.complete_all();
        deferred.poll_completed(&mut device).unwrap();
        assert_eq!(device.live_buffer_count(), 2);
        assert!(device.is_buffer_live(blas.storage().buffer()));

        blas.destroy(&mut device).unwrap();
        device.free_buffer(aabbs).unwrap();
        assert_eq!(device.live_buffer_count(), 0);
        assert_eq!(device.live_structure_count(), 0);
    }

    #[test]
    fn retired_inputs_are_freed_after_the_build() {
        let mut device = FakeDevice::new();
        device.set_auto_complete(false);
        let mut deferred = DeferredQueue::new();

        let aabbs = upload_input(
            &mut device,
            &mut deferred,
            "aabbs",
            bytemuck::bytes_of(&AabbPositions::unit()),
            8,
        )
        .unwrap();
        let handle = aabbs.buffer;
        let geometry = aabb_geometry(&aabbs);
        let blas = build_blas(&mut device, &mut deferred, &geometry, 1, vec![aabbs]).unwrap();

        assert!(device.is_buffer_live(handle));
        device.complete_all();
        deferred.poll_completed(&mut device).unwrap();
        assert!(!device.is_buffer_live(handle));
        assert_eq!(device.live_buffer_count(), 1);

        blas.destroy(&mut device).unwrap();
    }

    #[test]
    fn failed_build_submit_waits_for_pending_uploads() {
        let mut device = FakeDevice::new();
        device.set_auto_complete(false);
        let mut deferred = DeferredQueue::new();

        let aabbs = upload_input(
            &mut device,
            &mut deferred,
            "aabbs",
            bytemuck::bytes_of(&AabbPositions::unit()),
            8,
        )
        .unwrap();
        let handle = aabbs.buffer;
        let upload_fence = device.submissions()[0].fence;
        let geometry = aabb_geometry(&aabbs);

        device.fail_next_submit(vk::Result::ERROR_DEVICE_LOST);
        let err = build_blas(&mut device, &mut deferred, &geometry, 1, vec![aabbs]).unwrap_err();

        assert!(matches!(err, GpuError::Vulkan(vk::Result::ERROR_DEVICE_LOST)));
        assert_eq!(device.idle_wait_count(), 1);
        assert!(device.fence_signaled(upload_fence).unwrap());
        assert!(!device.is_buffer_live(handle));
        assert_eq!(device.live_structure_count(), 0);

        deferred.poll_completed(&mut device).unwrap();
        assert_eq!(device.live_buffer_count(), 0);
        assert_eq!(device.live_command_buffer_count(), 0);
        assert_eq!(device.double_free_count(), 0);
    }

    #[test]
    fn primitive_limit_is_enforced_before_allocating() {
        let mut device = FakeDevice::new();
        device.limits_mut().max_primitive_count = 4;
        let mut deferred = DeferredQueue::new();

        let geometry = GeometryDesc::Aabbs {
            data: 0x1000,
            stride: 24,
            flags: vk::GeometryFlagsKHR::OPAQUE,
        };
        let err = build_blas(&mut device, &mut deferred, &geometry, 5, Vec::new()).unwrap_err();
        assert!(matches!(
            err,
            GpuError::LimitExceeded {
                requested: 5,
                limit: 4,
                ..
            }
        ));
        assert_eq!(device.live_buffer_count(), 0);
    }

    fn round_up(size: u64) -> u64 {
        voxtrace_gpu::round_up_to_multiple(size, STRUCTURE_ALIGNMENT)
    }
}

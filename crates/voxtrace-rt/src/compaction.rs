//! Batched bottom-level builds followed by compaction.
//!
//! All structures of a batch are built by one command into one shared
//! buffer, their compacted sizes are read back through a query pool, and
//! they are then copied into a second, smaller shared buffer. The batch
//! costs exactly two submissions, the first of which is waited on.

use crate::blas::{SCRATCH_USAGE, STORAGE_USAGE};
use crate::structure::{AccelerationStructure, STRUCTURE_ALIGNMENT};
use ash::vk;
use voxtrace_gpu::memory::allocate_transient;
use voxtrace_gpu::{
    create_buffer, round_up_to_multiple, BufferRequest, BuildCommand, BuildSizes, Cleanup,
    CommandPoolKind, DeferredQueue, Device, DeviceLimits, GeometryDesc, GpuBuffer, GpuError,
    MemoryBarrier, RcBuffer, Result,
};

/// Build flags of compacted bottom-level structures.
pub const COMPACTED_BUILD_FLAGS: vk::BuildAccelerationStructureFlagsKHR =
    vk::BuildAccelerationStructureFlagsKHR::from_raw(
        vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE.as_raw()
            | vk::BuildAccelerationStructureFlagsKHR::ALLOW_COMPACTION.as_raw(),
    );

/// One geometry of a batched build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlasRequest {
    pub geometry: GeometryDesc,
    pub primitive_count: u32,
}

/// Placement of a batch of structures inside shared buffers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchLayout {
    /// Byte offset of each structure, a multiple of 256.
    pub offsets: Vec<u64>,
    pub sizes: Vec<u64>,
    /// Byte offset of each build's scratch region.
    pub scratch_offsets: Vec<u64>,
    pub total_size: u64,
    pub total_scratch_size: u64,
}

impl BatchLayout {
    /// Place structures and scratch regions back to back.
    pub fn plan(sizes: &[BuildSizes], scratch_alignment: u64) -> Self {
        let mut layout = Self::pack(sizes.iter().map(|s| s.acceleration_structure_size));
        for size in sizes {
            layout.scratch_offsets.push(layout.total_scratch_size);
            layout.total_scratch_size +=
                round_up_to_multiple(size.build_scratch_size, scratch_alignment);
        }
        layout
    }

    /// Place structures of the given sizes back to back, without scratch.
    pub fn pack(sizes: impl IntoIterator<Item = u64>) -> Self {
        let mut layout = Self::default();
        for size in sizes {
            layout.offsets.push(layout.total_size);
            layout.sizes.push(size);
            layout.total_size += round_up_to_multiple(size, STRUCTURE_ALIGNMENT);
        }
        layout
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }
}

/// Fail when the batch exceeds the device's primitive limit.
pub fn check_primitive_budget(limits: &DeviceLimits, requests: &[BlasRequest]) -> Result<()> {
    let total: u64 = requests.iter().map(|r| u64::from(r.primitive_count)).sum();
    if total > limits.max_primitive_count {
        return Err(GpuError::LimitExceeded {
            what: "primitive count",
            requested: total,
            limit: limits.max_primitive_count,
        });
    }
    Ok(())
}

/// Build and compact one bottom-level structure per request.
///
/// The returned structures share one buffer, each holding one reference on
/// it. Blocks until the first submission has completed.
#[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
pub fn build_compacted_blases<D: Device>(
    device: &mut D,
    deferred: &mut DeferredQueue,
    requests: &[BlasRequest],
) -> Result<Vec<AccelerationStructure>> {
    if requests.is_empty() {
        return Ok(Vec::new());
    }
    check_primitive_budget(device.limits(), requests)?;

    let sizes: Vec<BuildSizes> = requests
        .iter()
        .map(|r| device.acceleration_structure_build_sizes(&r.geometry, r.primitive_count, COMPACTED_BUILD_FLAGS))
        .collect();
    let scratch_alignment = device.limits().min_acceleration_structure_scratch_offset_alignment;
    let layout = BatchLayout::plan(&sizes, scratch_alignment);
    tracing::debug!(
        "Batch of {} BLASes needs {} bytes and {} scratch bytes",
        layout.len(),
        layout.total_size,
        layout.total_scratch_size
    );

    let storage = RcBuffer::new(create_buffer(
        device,
        deferred,
        &BufferRequest::new("blas batch", STORAGE_USAGE, layout.total_size).aligned(STRUCTURE_ALIGNMENT),
    )?);
    let scratch = match create_buffer(
        device,
        deferred,
        &BufferRequest::new("blas batch scratch", SCRATCH_USAGE, layout.total_scratch_size)
            .aligned(scratch_alignment),
    ) {
        Ok(buffer) => buffer,
        Err(e) => {
            storage.free_unused(device)?;
            return Err(e);
        }
    };

    let uncompacted = match place_structures(device, &storage, &layout) {
        Ok(structures) => structures,
        Err(e) => {
            storage.free_unused(device)?;
            device.free_buffer(scratch)?;
            return Err(e);
        }
    };

    let compacted_sizes = match build_and_query(device, deferred, requests, &uncompacted, &scratch, &layout) {
        Ok(sizes) => sizes,
        Err(e) => {
            discard(device, uncompacted)?;
            device.free_buffer(scratch)?;
            return Err(e);
        }
    };

    let compacted_layout = BatchLayout::pack(compacted_sizes);
    tracing::info!(
        "Compacting {} BLASes from {} to {} bytes",
        compacted_layout.len(),
        layout.total_size,
        compacted_layout.total_size
    );

    let compacted_storage = match create_buffer(
        device,
        deferred,
        &BufferRequest::new("blas compacted", STORAGE_USAGE, compacted_layout.total_size)
            .aligned(STRUCTURE_ALIGNMENT),
    ) {
        Ok(buffer) => RcBuffer::new(buffer),
        Err(e) => {
            discard(device, uncompacted)?;
            device.free_buffer(scratch)?;
            return Err(e);
        }
    };
    let compacted = match place_structures(device, &compacted_storage, &compacted_layout) {
        Ok(structures) => structures,
        Err(e) => {
            compacted_storage.free_unused(device)?;
            discard(device, uncompacted)?;
            device.free_buffer(scratch)?;
            return Err(e);
        }
    };

    let cmd = match record_compaction(device, &uncompacted, &compacted) {
        Ok(cmd) => cmd,
        Err(e) => {
            discard(device, compacted)?;
            discard(device, uncompacted)?;
            device.free_buffer(scratch)?;
            return Err(e);
        }
    };

    // Releasing the last uncompacted structure frees the batch buffer.
    let mut cleanup = Vec::with_capacity(2 * uncompacted.len() + 2);
    cleanup.push(Cleanup::FreeCommandBuffer(cmd));
    cleanup.push(Cleanup::FreeBuffer(scratch));
    for structure in uncompacted {
        cleanup.extend(structure.into_cleanup());
    }
    if let Err(e) = deferred.submit(device, cmd, true, cleanup) {
        discard(device, compacted)?;
        return Err(e);
    }

    Ok(compacted)
}

fn place_structures<D: Device>(
    device: &mut D,
    storage: &RcBuffer,
    layout: &BatchLayout,
) -> Result<Vec<AccelerationStructure>> {
    let mut structures = Vec::with_capacity(layout.len());
    for (&offset, &size) in layout.offsets.iter().zip(&layout.sizes) {
        match AccelerationStructure::new(
            device,
            vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
            storage,
            offset,
            size,
        ) {
            Ok(structure) => structures.push(structure),
            Err(e) => {
                for structure in structures {
                    structure.destroy(device)?;
                }
                return Err(e);
            }
        }
    }
    Ok(structures)
}

fn build_and_query<D: Device>(
    device: &mut D,
    deferred: &mut DeferredQueue,
    requests: &[BlasRequest],
    structures: &[AccelerationStructure],
    scratch: &GpuBuffer,
    layout: &BatchLayout,
) -> Result<Vec<u64>> {
    let count = u32::try_from(structures.len())
        .map_err(|_| GpuError::InvalidState("too many structures in one batch".to_string()))?;
    let pool = device.create_query_pool(count)?;
    let result = build_and_wait(device, deferred, requests, structures, scratch, layout, pool)
        .and_then(|()| device.compacted_sizes(pool, 0, count));
    device.destroy_query_pool(pool);
    result
}

fn build_and_wait<D: Device>(
    device: &mut D,
    deferred: &mut DeferredQueue,
    requests: &[BlasRequest],
    structures: &[AccelerationStructure],
    scratch: &GpuBuffer,
    layout: &BatchLayout,
    pool: vk::QueryPool,
) -> Result<()> {
    let builds: Vec<BuildCommand> = requests
        .iter()
        .zip(structures)
        .zip(&layout.scratch_offsets)
        .map(|((request, structure), &scratch_offset)| BuildCommand {
            geometry: request.geometry,
            flags: COMPACTED_BUILD_FLAGS,
            primitive_count: request.primitive_count,
            dst: structure.handle(),
            scratch_address: scratch.device_address + scratch_offset,
        })
        .collect();
    let handles: Vec<_> = structures.iter().map(AccelerationStructure::handle).collect();
    let count = handles.len() as u32;

    let cmd = allocate_transient(device)?;
    let result = device
        .begin_command_buffer(cmd, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)
        .and_then(|()| {
            device.cmd_memory_barrier(cmd, &MemoryBarrier::TRANSFER_TO_BUILD);
            device.cmd_build_acceleration_structures(cmd, &builds);
            device.cmd_memory_barrier(cmd, &MemoryBarrier::BUILD_TO_BUILD);
            device.cmd_reset_query_pool(cmd, pool, 0, count);
            device.cmd_write_compacted_sizes(cmd, &handles, pool, 0);
            deferred.submit_and_wait(device, cmd, true)
        });
    device.free_command_buffers(CommandPoolKind::Transient, &[cmd]);
    result
}

fn record_compaction<D: Device>(
    device: &mut D,
    sources: &[AccelerationStructure],
    targets: &[AccelerationStructure],
) -> Result<vk::CommandBuffer> {
    let cmd = allocate_transient(device)?;
    if let Err(e) = device.begin_command_buffer(cmd, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT) {
        device.free_command_buffers(CommandPoolKind::Transient, &[cmd]);
        return Err(e);
    }
    for (src, dst) in sources.iter().zip(targets) {
        device.cmd_copy_acceleration_structure(
            cmd,
            src.handle(),
            dst.handle(),
            vk::CopyAccelerationStructureModeKHR::COMPACT,
        );
    }
    Ok(cmd)
}

// Only reached on setup failure; the device may still read the structures.
fn discard<D: Device>(device: &mut D, structures: Vec<AccelerationStructure>) -> Result<()> {
    device.wait_idle()?;
    for structure in structures {
        structure.destroy(device)?;
    }
    Ok(())
}

//! An in-memory [`Device`] and [`Presenter`] for tests.
//!
//! Handles are minted from a counter. Fences move through
//! unsignaled, pending and signaled states the way a real queue would drive
//! them; [`FakeDevice::set_auto_complete`] controls whether submissions
//! finish immediately. Misuse that a driver would reject or that validation
//! would flag panics.

use crate::backend::{
    AcquireOutcome, BuildCommand, BuildSizes, CommandPoolKind, Device, DeviceLimits,
    GeometryDesc, MemoryBarrier, PresentOutcome, Presenter, Submission,
};
use crate::descriptors::DescriptorWrite;
use crate::error::{GpuError, Result};
use crate::memory::{round_up_to_multiple, BufferDesc, GpuBuffer};
use crate::swapchain::{calculate_extent, select_image_count, Swapchain, SwapchainRequest};
use ash::vk::{self, Handle};
use gpu_allocator::MemoryLocation;
use hashbrown::{HashMap, HashSet};
use std::collections::VecDeque;

/// A command recorded into a fake command buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordedCommand {
    CopyBuffer {
        src: vk::Buffer,
        dst: vk::Buffer,
        size: u64,
    },
    Barrier(MemoryBarrier),
    BuildAccelerationStructures(Vec<BuildCommand>),
    CopyAccelerationStructure {
        src: vk::AccelerationStructureKHR,
        dst: vk::AccelerationStructureKHR,
        mode: vk::CopyAccelerationStructureModeKHR,
    },
    ResetQueryPool {
        pool: vk::QueryPool,
        first: u32,
        count: u32,
    },
    WriteCompactedSizes {
        pool: vk::QueryPool,
        first: u32,
        structures: Vec<vk::AccelerationStructureKHR>,
    },
    /// Free-form marker recorded by test passes.
    Marker(String),
}

/// A submission as seen by the fake queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionRecord {
    pub command_buffer: vk::CommandBuffer,
    pub wait: Vec<vk::Semaphore>,
    pub signal: Vec<vk::Semaphore>,
    pub fence: vk::Fence,
}

/// A live fake acceleration structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FakeStructure {
    pub level: vk::AccelerationStructureTypeKHR,
    pub buffer: vk::Buffer,
    pub offset: u64,
    pub size: u64,
    pub address: vk::DeviceAddress,
}

#[derive(Debug)]
struct FakeBuffer {
    size: u64,
    usage: vk::BufferUsageFlags,
    location: MemoryLocation,
    device_address: vk::DeviceAddress,
    contents: Vec<u8>,
}

#[derive(Debug)]
struct FakeCommandBuffer {
    pool: CommandPoolKind,
    recording: bool,
    commands: Vec<RecordedCommand>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FenceState {
    Unsignaled,
    Pending,
    Signaled,
}

/// Size the fake reports for an acceleration structure of `primitives`.
pub const fn structure_size(primitives: u32) -> u64 {
    1000 + 64 * primitives as u64
}

/// Scratch size the fake reports for a build of `primitives`.
pub const fn scratch_size(primitives: u32) -> u64 {
    500 + 32 * primitives as u64
}

/// Compacted size the fake reports for a structure of `size` bytes.
pub const fn compacted_size(size: u64) -> u64 {
    size / 2 + 10
}

/// In-memory device. See the module documentation.
pub struct FakeDevice {
    next_handle: u64,
    next_address: u64,
    limits: DeviceLimits,
    host_coherent: bool,
    auto_complete: bool,
    misalign_next: bool,
    fail_next_submit: Option<vk::Result>,

    buffers: HashMap<vk::Buffer, FakeBuffer>,
    double_frees: usize,
    flushes: usize,

    command_buffers: HashMap<vk::CommandBuffer, FakeCommandBuffer>,
    retired_commands: HashMap<vk::CommandBuffer, Vec<RecordedCommand>>,

    fences: HashMap<vk::Fence, FenceState>,
    semaphores: HashSet<vk::Semaphore>,
    submissions: Vec<SubmissionRecord>,
    max_pending: usize,
    idle_waits: usize,

    structures: HashMap<vk::AccelerationStructureKHR, FakeStructure>,
    destroyed_structures: Vec<vk::AccelerationStructureKHR>,
    query_pools: HashMap<vk::QueryPool, Vec<Option<u64>>>,
    descriptor_pools: HashMap<vk::DescriptorPool, Vec<vk::DescriptorSet>>,
    descriptor_writes: HashMap<vk::DescriptorSet, Vec<DescriptorWrite>>,

    surface: vk::SurfaceCapabilitiesKHR,
    swapchains: HashMap<vk::SwapchainKHR, u32>,
    image_views: HashSet<vk::ImageView>,
    destroyed_image_views: Vec<vk::ImageView>,
    swapchain_requests: Vec<(SwapchainRequest, Option<vk::SwapchainKHR>)>,
    acquire_script: VecDeque<AcquireOutcome>,
    present_script: VecDeque<PresentOutcome>,
    acquired_images: Vec<u32>,
}

impl Default for FakeDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeDevice {
    pub fn new() -> Self {
        Self {
            next_handle: 1,
            next_address: 0x10_0000,
            limits: DeviceLimits::default(),
            host_coherent: true,
            auto_complete: true,
            misalign_next: false,
            fail_next_submit: None,
            buffers: HashMap::new(),
            double_frees: 0,
            flushes: 0,
            command_buffers: HashMap::new(),
            retired_commands: HashMap::new(),
            fences: HashMap::new(),
            semaphores: HashSet::new(),
            submissions: Vec::new(),
            max_pending: 0,
            idle_waits: 0,
            structures: HashMap::new(),
            destroyed_structures: Vec::new(),
            query_pools: HashMap::new(),
            descriptor_pools: HashMap::new(),
            descriptor_writes: HashMap::new(),
            surface: vk::SurfaceCapabilitiesKHR {
                min_image_count: 2,
                max_image_count: 8,
                current_extent: vk::Extent2D {
                    width: u32::MAX,
                    height: u32::MAX,
                },
                min_image_extent: vk::Extent2D {
                    width: 1,
                    height: 1,
                },
                max_image_extent: vk::Extent2D {
                    width: 16384,
                    height: 16384,
                },
                ..Default::default()
            },
            swapchains: HashMap::new(),
            image_views: HashSet::new(),
            destroyed_image_views: Vec::new(),
            swapchain_requests: Vec::new(),
            acquire_script: VecDeque::new(),
            present_script: VecDeque::new(),
            acquired_images: Vec::new(),
        }
    }

    fn mint<H: Handle>(&mut self) -> H {
        let raw = self.next_handle;
        self.next_handle += 1;
        H::from_raw(raw)
    }

    fn record(&mut self, cmd: vk::CommandBuffer, command: RecordedCommand) {
        let buffer = self
            .command_buffers
            .get_mut(&cmd)
            .unwrap_or_else(|| panic!("recording into unknown command buffer {cmd:?}"));
        assert!(buffer.recording, "recording into {cmd:?} outside begin/end");
        buffer.commands.push(command);
    }

    fn pending_count(&self) -> usize {
        self.fences
            .values()
            .filter(|state| **state == FenceState::Pending)
            .count()
    }

    // Configuration

    pub fn limits_mut(&mut self) -> &mut DeviceLimits {
        &mut self.limits
    }

    /// Whether new host-visible buffers report coherent memory.
    pub fn set_host_coherent(&mut self, coherent: bool) {
        self.host_coherent = coherent;
    }

    /// Whether submissions complete as soon as they are made.
    pub fn set_auto_complete(&mut self, auto_complete: bool) {
        self.auto_complete = auto_complete;
    }

    /// Give the next buffer an address and offset off any alignment.
    pub fn misalign_next_buffer(&mut self) {
        self.misalign_next = true;
    }

    pub fn fail_next_submit(&mut self, result: vk::Result) {
        self.fail_next_submit = Some(result);
    }

    pub fn set_surface_image_counts(&mut self, min: u32, max: u32) {
        self.surface.min_image_count = min;
        self.surface.max_image_count = max;
    }

    /// Script the result of the next acquire.
    pub fn queue_acquire(&mut self, outcome: AcquireOutcome) {
        self.acquire_script.push_back(outcome);
    }

    /// Script the result of the next present.
    pub fn queue_present(&mut self, outcome: PresentOutcome) {
        self.present_script.push_back(outcome);
    }

    // Simulated GPU progress

    /// Finish the submission guarded by `fence`.
    pub fn signal_fence(&mut self, fence: vk::Fence) {
        let state = self
            .fences
            .get_mut(&fence)
            .unwrap_or_else(|| panic!("signaling unknown fence {fence:?}"));
        *state = FenceState::Signaled;
    }

    /// Finish every pending submission.
    pub fn complete_all(&mut self) {
        for state in self.fences.values_mut() {
            if *state == FenceState::Pending {
                *state = FenceState::Signaled;
            }
        }
    }

    // Inspection

    pub fn live_buffer_count(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_buffer_live(&self, buffer: vk::Buffer) -> bool {
        self.buffers.contains_key(&buffer)
    }

    pub fn buffer_usage(&self, buffer: vk::Buffer) -> vk::BufferUsageFlags {
        self.buffers
            .get(&buffer)
            .map_or(vk::BufferUsageFlags::empty(), |b| b.usage)
    }

    pub fn buffer_size(&self, buffer: vk::Buffer) -> Option<u64> {
        self.buffers.get(&buffer).map(|b| b.size)
    }

    pub fn buffer_contents(&self, buffer: vk::Buffer) -> Vec<u8> {
        self.buffers
            .get(&buffer)
            .map(|b| b.contents.clone())
            .unwrap_or_default()
    }

    /// Frees of buffers, command buffers or pools that were not live.
    pub fn double_free_count(&self) -> usize {
        self.double_frees
    }

    pub fn flush_count(&self) -> usize {
        self.flushes
    }

    pub fn live_command_buffer_count(&self) -> usize {
        self.command_buffers.len()
    }

    /// Commands recorded into `cmd`, including freed command buffers.
    pub fn recorded(&self, cmd: vk::CommandBuffer) -> Vec<RecordedCommand> {
        self.command_buffers
            .get(&cmd)
            .map(|b| b.commands.clone())
            .or_else(|| self.retired_commands.get(&cmd).cloned())
            .unwrap_or_default()
    }

    pub fn live_fence_count(&self) -> usize {
        self.fences.len()
    }

    pub fn live_semaphore_count(&self) -> usize {
        self.semaphores.len()
    }

    pub fn submission_count(&self) -> usize {
        self.submissions.len()
    }

    pub fn submissions(&self) -> &[SubmissionRecord] {
        &self.submissions
    }

    /// Most submissions that were in flight at the same time.
    pub fn max_pending_submissions(&self) -> usize {
        self.max_pending
    }

    pub fn idle_wait_count(&self) -> usize {
        self.idle_waits
    }

    pub fn live_structure_count(&self) -> usize {
        self.structures.len()
    }

    pub fn structure(&self, handle: vk::AccelerationStructureKHR) -> Option<FakeStructure> {
        self.structures.get(&handle).copied()
    }

    pub fn destroyed_structures(&self) -> &[vk::AccelerationStructureKHR] {
        &self.destroyed_structures
    }

    pub fn live_query_pool_count(&self) -> usize {
        self.query_pools.len()
    }

    pub fn live_descriptor_pool_count(&self) -> usize {
        self.descriptor_pools.len()
    }

    pub fn descriptor_writes(&self, set: vk::DescriptorSet) -> &[DescriptorWrite] {
        self.descriptor_writes.get(&set).map_or(&[], Vec::as_slice)
    }

    pub fn live_swapchain_count(&self) -> usize {
        self.swapchains.len()
    }

    pub fn live_image_view_count(&self) -> usize {
        self.image_views.len()
    }

    pub fn destroyed_image_views(&self) -> &[vk::ImageView] {
        &self.destroyed_image_views
    }

    /// Every swapchain request with the old swapchain handed along.
    pub fn swapchain_requests(&self) -> &[(SwapchainRequest, Option<vk::SwapchainKHR>)] {
        &self.swapchain_requests
    }

    /// Image indices returned by successful acquires, in order.
    pub fn acquired_images(&self) -> &[u32] {
        &self.acquired_images
    }
}

impl Device for FakeDevice {
    fn limits(&self) -> &DeviceLimits {
        &self.limits
    }

    fn create_buffer(&mut self, desc: &BufferDesc<'_>) -> Result<GpuBuffer> {
        if desc.size == 0 {
            return Err(GpuError::AllocationFailed(format!("{}: zero-sized buffer", desc.name)));
        }
        let buffer: vk::Buffer = self.mint();

        let alignment = desc.alignment.max(16);
        let mut address = round_up_to_multiple(self.next_address, alignment);
        if std::mem::take(&mut self.misalign_next) {
            address += 4;
        }
        self.next_address = address + round_up_to_multiple(desc.size, 16);

        let device_address = if desc.usage.contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS) {
            address
        } else {
            0
        };
        let host_visible = desc.location != MemoryLocation::GpuOnly;
        let contents_len = usize::try_from(desc.size)
            .map_err(|_| GpuError::AllocationFailed("buffer too large".to_string()))?;

        self.buffers.insert(
            buffer,
            FakeBuffer {
                size: desc.size,
                usage: desc.usage,
                location: desc.location,
                device_address,
                contents: vec![0; contents_len],
            },
        );

        Ok(GpuBuffer {
            buffer,
            size: desc.size,
            device_address,
            offset: address - 0x10_0000,
            host_coherent: !host_visible || self.host_coherent,
            mapped: host_visible,
        })
    }

    fn free_buffer(&mut self, buffer: GpuBuffer) -> Result<()> {
        if self.buffers.remove(&buffer.buffer).is_none() {
            self.double_frees += 1;
            return Err(GpuError::InvalidState(format!("double free of {:?}", buffer.buffer)));
        }
        Ok(())
    }

    fn write_buffer(&mut self, buffer: &GpuBuffer, offset: u64, data: &[u8]) -> Result<()> {
        let fake = self
            .buffers
            .get_mut(&buffer.buffer)
            .ok_or_else(|| GpuError::InvalidState("write to freed buffer".to_string()))?;
        if fake.location == MemoryLocation::GpuOnly {
            return Err(GpuError::InvalidState("buffer is not host visible".to_string()));
        }
        let start = offset as usize;
        let end = start + data.len();
        if end > fake.contents.len() {
            return Err(GpuError::InvalidState("write out of bounds".to_string()));
        }
        fake.contents[start..end].copy_from_slice(data);
        Ok(())
    }

    fn flush_buffer(&mut self, buffer: &GpuBuffer, _offset: u64, _size: u64) -> Result<()> {
        if !self.buffers.contains_key(&buffer.buffer) {
            return Err(GpuError::InvalidState("flush of freed buffer".to_string()));
        }
        self.flushes += 1;
        Ok(())
    }

    fn allocate_command_buffers(
        &mut self,
        pool: CommandPoolKind,
        count: u32,
    ) -> Result<Vec<vk::CommandBuffer>> {
        let mut buffers = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let cmd: vk::CommandBuffer = self.mint();
            self.command_buffers.insert(
                cmd,
                FakeCommandBuffer {
                    pool,
                    recording: false,
                    commands: Vec::new(),
                },
            );
            buffers.push(cmd);
        }
        Ok(buffers)
    }

    fn free_command_buffers(&mut self, pool: CommandPoolKind, command_buffers: &[vk::CommandBuffer]) {
        for cmd in command_buffers {
            match self.command_buffers.remove(cmd) {
                Some(buffer) => {
                    assert_eq!(buffer.pool, pool, "{cmd:?} freed into the wrong pool");
                    self.retired_commands.insert(*cmd, buffer.commands);
                }
                None => self.double_frees += 1,
            }
        }
    }

    fn begin_command_buffer(
        &mut self,
        cmd: vk::CommandBuffer,
        _flags: vk::CommandBufferUsageFlags,
    ) -> Result<()> {
        let buffer = self
            .command_buffers
            .get_mut(&cmd)
            .ok_or_else(|| GpuError::InvalidState(format!("unknown command buffer {cmd:?}")))?;
        buffer.recording = true;
        buffer.commands.clear();
        Ok(())
    }

    fn end_command_buffer(&mut self, cmd: vk::CommandBuffer) -> Result<()> {
        let buffer = self
            .command_buffers
            .get_mut(&cmd)
            .ok_or_else(|| GpuError::InvalidState(format!("unknown command buffer {cmd:?}")))?;
        if !buffer.recording {
            return Err(GpuError::InvalidState(format!("{cmd:?} is not recording")));
        }
        buffer.recording = false;
        Ok(())
    }

    fn cmd_copy_buffer(&mut self, cmd: vk::CommandBuffer, src: &GpuBuffer, dst: &GpuBuffer, size: u64) {
        let data = self.buffers.get(&src.buffer).map(|b| b.contents.clone());
        if let (Some(data), Some(target)) = (data, self.buffers.get_mut(&dst.buffer)) {
            let len = size as usize;
            target.contents[..len].copy_from_slice(&data[..len]);
        }
        self.record(
            cmd,
            RecordedCommand::CopyBuffer {
                src: src.buffer,
                dst: dst.buffer,
                size,
            },
        );
    }

    fn cmd_memory_barrier(&mut self, cmd: vk::CommandBuffer, barrier: &MemoryBarrier) {
        self.record(cmd, RecordedCommand::Barrier(*barrier));
    }

    fn create_fence(&mut self, signaled: bool) -> Result<vk::Fence> {
        let fence: vk::Fence = self.mint();
        let state = if signaled {
            FenceState::Signaled
        } else {
            FenceState::Unsignaled
        };
        self.fences.insert(fence, state);
        Ok(fence)
    }

    fn destroy_fence(&mut self, fence: vk::Fence) {
        let state = self.fences.remove(&fence);
        assert!(state.is_some(), "destroying unknown fence {fence:?}");
        assert_ne!(state, Some(FenceState::Pending), "destroying pending fence {fence:?}");
    }

    fn fence_signaled(&mut self, fence: vk::Fence) -> Result<bool> {
        match self.fences.get(&fence) {
            Some(state) => Ok(*state == FenceState::Signaled),
            None => Err(GpuError::InvalidState(format!("unknown fence {fence:?}"))),
        }
    }

    fn wait_for_fence(&mut self, fence: vk::Fence, _timeout_ns: u64) -> Result<()> {
        let state = self
            .fences
            .get_mut(&fence)
            .ok_or_else(|| GpuError::InvalidState(format!("unknown fence {fence:?}")))?;
        match *state {
            FenceState::Signaled => Ok(()),
            FenceState::Pending => {
                *state = FenceState::Signaled;
                Ok(())
            }
            FenceState::Unsignaled => Err(GpuError::InvalidState(format!(
                "waiting on {fence:?} which was never submitted"
            ))),
        }
    }

    fn reset_fence(&mut self, fence: vk::Fence) -> Result<()> {
        let state = self
            .fences
            .get_mut(&fence)
            .ok_or_else(|| GpuError::InvalidState(format!("unknown fence {fence:?}")))?;
        if *state == FenceState::Pending {
            return Err(GpuError::InvalidState(format!("resetting pending fence {fence:?}")));
        }
        *state = FenceState::Unsignaled;
        Ok(())
    }

    fn create_semaphore(&mut self) -> Result<vk::Semaphore> {
        let semaphore: vk::Semaphore = self.mint();
        self.semaphores.insert(semaphore);
        Ok(semaphore)
    }

    fn destroy_semaphore(&mut self, semaphore: vk::Semaphore) {
        assert!(
            self.semaphores.remove(&semaphore),
            "destroying unknown semaphore {semaphore:?}"
        );
    }

    fn submit(&mut self, submission: &Submission<'_>) -> Result<()> {
        if let Some(result) = self.fail_next_submit.take() {
            return Err(result.into());
        }
        let cmd = self
            .command_buffers
            .get(&submission.command_buffer)
            .ok_or_else(|| GpuError::InvalidState("submitting unknown command buffer".to_string()))?;
        if cmd.recording {
            return Err(GpuError::InvalidState("submitting a recording command buffer".to_string()));
        }
        for (semaphore, _) in submission.wait {
            assert!(self.semaphores.contains(semaphore), "waiting on unknown semaphore");
        }

        if submission.fence != vk::Fence::null() {
            let auto_complete = self.auto_complete;
            let state = self
                .fences
                .get_mut(&submission.fence)
                .ok_or_else(|| GpuError::InvalidState("submitting with unknown fence".to_string()))?;
            if *state != FenceState::Unsignaled {
                return Err(GpuError::InvalidState(format!(
                    "{:?} submitted without being reset",
                    submission.fence
                )));
            }
            *state = if auto_complete {
                FenceState::Signaled
            } else {
                FenceState::Pending
            };
        }

        self.submissions.push(SubmissionRecord {
            command_buffer: submission.command_buffer,
            wait: submission.wait.iter().map(|(s, _)| *s).collect(),
            signal: submission.signal.to_vec(),
            fence: submission.fence,
        });
        self.max_pending = self.max_pending.max(self.pending_count());
        Ok(())
    }

    fn wait_idle(&mut self) -> Result<()> {
        self.idle_waits += 1;
        self.complete_all();
        Ok(())
    }

    fn acceleration_structure_build_sizes(
        &mut self,
        _geometry: &GeometryDesc,
        primitive_count: u32,
        _flags: vk::BuildAccelerationStructureFlagsKHR,
    ) -> BuildSizes {
        BuildSizes {
            acceleration_structure_size: structure_size(primitive_count),
            build_scratch_size: scratch_size(primitive_count),
            update_scratch_size: 0,
        }
    }

    fn create_acceleration_structure(
        &mut self,
        level: vk::AccelerationStructureTypeKHR,
        buffer: vk::Buffer,
        offset: u64,
        size: u64,
    ) -> Result<vk::AccelerationStructureKHR> {
        let backing = self
            .buffers
            .get(&buffer)
            .ok_or_else(|| GpuError::InvalidState("structure on freed buffer".to_string()))?;
        if offset % 256 != 0 {
            return Err(GpuError::Alignment {
                what: "structure offset",
                address: offset,
                alignment: 256,
            });
        }
        if offset + size > backing.size {
            return Err(GpuError::InvalidState(format!(
                "structure [{offset}, {}) exceeds {} byte buffer",
                offset + size,
                backing.size
            )));
        }
        let address = backing.device_address + offset;
        let handle: vk::AccelerationStructureKHR = self.mint();
        self.structures.insert(
            handle,
            FakeStructure {
                level,
                buffer,
                offset,
                size,
                address,
            },
        );
        Ok(handle)
    }

    fn destroy_acceleration_structure(&mut self, handle: vk::AccelerationStructureKHR) {
        assert!(
            self.structures.remove(&handle).is_some(),
            "destroying unknown structure {handle:?}"
        );
        self.destroyed_structures.push(handle);
    }

    fn acceleration_structure_address(
        &mut self,
        handle: vk::AccelerationStructureKHR,
    ) -> vk::DeviceAddress {
        self.structures.get(&handle).map_or(0, |s| s.address)
    }

    fn cmd_build_acceleration_structures(&mut self, cmd: vk::CommandBuffer, builds: &[BuildCommand]) {
        for build in builds {
            assert!(
                self.structures.contains_key(&build.dst),
                "building into unknown structure"
            );
        }
        self.record(cmd, RecordedCommand::BuildAccelerationStructures(builds.to_vec()));
    }

    fn cmd_copy_acceleration_structure(
        &mut self,
        cmd: vk::CommandBuffer,
        src: vk::AccelerationStructureKHR,
        dst: vk::AccelerationStructureKHR,
        mode: vk::CopyAccelerationStructureModeKHR,
    ) {
        assert!(self.structures.contains_key(&src), "copy from unknown structure");
        assert!(self.structures.contains_key(&dst), "copy into unknown structure");
        self.record(cmd, RecordedCommand::CopyAccelerationStructure { src, dst, mode });
    }

    fn create_query_pool(&mut self, count: u32) -> Result<vk::QueryPool> {
        let pool: vk::QueryPool = self.mint();
        self.query_pools.insert(pool, vec![None; count as usize]);
        Ok(pool)
    }

    fn destroy_query_pool(&mut self, pool: vk::QueryPool) {
        assert!(self.query_pools.remove(&pool).is_some(), "destroying unknown query pool");
    }

    fn cmd_reset_query_pool(&mut self, cmd: vk::CommandBuffer, pool: vk::QueryPool, first: u32, count: u32) {
        let slots = self
            .query_pools
            .get_mut(&pool)
            .unwrap_or_else(|| panic!("resetting unknown query pool {pool:?}"));
        for slot in &mut slots[first as usize..(first + count) as usize] {
            *slot = None;
        }
        self.record(cmd, RecordedCommand::ResetQueryPool { pool, first, count });
    }

    fn cmd_write_compacted_sizes(
        &mut self,
        cmd: vk::CommandBuffer,
        structures: &[vk::AccelerationStructureKHR],
        pool: vk::QueryPool,
        first: u32,
    ) {
        let sizes: Vec<u64> = structures
            .iter()
            .map(|handle| {
                self.structures
                    .get(handle)
                    .map(|s| compacted_size(s.size))
                    .unwrap_or_else(|| panic!("querying unknown structure {handle:?}"))
            })
            .collect();
        let slots = self
            .query_pools
            .get_mut(&pool)
            .unwrap_or_else(|| panic!("writing into unknown query pool {pool:?}"));
        for (i, size) in sizes.into_iter().enumerate() {
            slots[first as usize + i] = Some(size);
        }
        self.record(
            cmd,
            RecordedCommand::WriteCompactedSizes {
                pool,
                first,
                structures: structures.to_vec(),
            },
        );
    }

    fn compacted_sizes(&mut self, pool: vk::QueryPool, first: u32, count: u32) -> Result<Vec<u64>> {
        let slots = self
            .query_pools
            .get(&pool)
            .ok_or_else(|| GpuError::InvalidState("unknown query pool".to_string()))?;
        slots[first as usize..(first + count) as usize]
            .iter()
            .map(|slot| slot.ok_or(GpuError::Vulkan(vk::Result::NOT_READY)))
            .collect()
    }

    fn create_descriptor_sets(
        &mut self,
        _layout: vk::DescriptorSetLayout,
        sets: &[Vec<DescriptorWrite>],
    ) -> Result<(vk::DescriptorPool, Vec<vk::DescriptorSet>)> {
        let pool: vk::DescriptorPool = self.mint();
        let mut handles = Vec::with_capacity(sets.len());
        for writes in sets {
            let set: vk::DescriptorSet = self.mint();
            self.descriptor_writes.insert(set, writes.clone());
            handles.push(set);
        }
        self.descriptor_pools.insert(pool, handles.clone());
        Ok((pool, handles))
    }

    fn destroy_descriptor_pool(&mut self, pool: vk::DescriptorPool) {
        match self.descriptor_pools.remove(&pool) {
            Some(sets) => {
                for set in sets {
                    self.descriptor_writes.remove(&set);
                }
            }
            None => self.double_frees += 1,
        }
    }
}

impl Presenter for FakeDevice {
    fn create_swapchain(
        &mut self,
        request: &SwapchainRequest,
        old: Option<&Swapchain>,
    ) -> Result<Swapchain> {
        if let Some(old) = old {
            assert!(
                self.swapchains.contains_key(&old.swapchain),
                "old swapchain already destroyed"
            );
        }
        self.swapchain_requests
            .push((*request, old.map(|old| old.swapchain)));

        let image_count = select_image_count(&self.surface, request.preferred_image_count);
        let extent = calculate_extent(&self.surface, request.width, request.height);
        let swapchain: vk::SwapchainKHR = self.mint();
        let images: Vec<vk::Image> = (0..image_count).map(|_| self.mint()).collect();
        let image_views: Vec<vk::ImageView> = (0..image_count).map(|_| self.mint()).collect();
        self.image_views.extend(image_views.iter().copied());
        self.swapchains.insert(swapchain, 0);

        Ok(Swapchain {
            swapchain,
            images,
            image_views,
            format: vk::Format::B8G8R8A8_UNORM,
            extent,
        })
    }

    fn destroy_swapchain(&mut self, swapchain: Swapchain) {
        assert!(
            self.swapchains.remove(&swapchain.swapchain).is_some(),
            "destroying unknown swapchain"
        );
        for view in swapchain.image_views {
            assert!(self.image_views.remove(&view), "destroying unknown image view");
            self.destroyed_image_views.push(view);
        }
    }

    fn acquire_next_image(
        &mut self,
        swapchain: &Swapchain,
        semaphore: vk::Semaphore,
        _timeout_ns: u64,
    ) -> Result<AcquireOutcome> {
        assert!(self.semaphores.contains(&semaphore), "acquire with unknown semaphore");
        let image_count = u32::try_from(swapchain.image_count())
            .map_err(|_| GpuError::InvalidState("too many images".to_string()))?;
        let next = self
            .swapchains
            .get_mut(&swapchain.swapchain)
            .ok_or_else(|| GpuError::InvalidState("acquire from destroyed swapchain".to_string()))?;

        let outcome = self.acquire_script.pop_front().unwrap_or_else(|| {
            let index = *next;
            *next = (index + 1) % image_count;
            AcquireOutcome::Acquired {
                index,
                suboptimal: false,
            }
        });
        if let AcquireOutcome::Acquired { index, .. } = outcome {
            self.acquired_images.push(index);
        }
        Ok(outcome)
    }

    fn present(
        &mut self,
        swapchain: &Swapchain,
        image_index: u32,
        wait: vk::Semaphore,
    ) -> Result<PresentOutcome> {
        assert!(self.swapchains.contains_key(&swapchain.swapchain), "present to destroyed swapchain");
        assert!((image_index as usize) < swapchain.image_count(), "present of invalid image");
        assert!(self.semaphores.contains(&wait), "present waits on unknown semaphore");
        Ok(self.present_script.pop_front().unwrap_or(PresentOutcome::Presented))
    }
}

impl FakeDevice {
    /// Record a marker, standing in for the commands of a test pass.
    pub fn record_marker(&mut self, cmd: vk::CommandBuffer, marker: impl Into<String>) {
        self.record(cmd, RecordedCommand::Marker(marker.into()));
    }
}

//! GPU buffer allocation, staged uploads and per-image uniform buffers.

use crate::backend::{CommandPoolKind, Device};
use crate::deferred::{Cleanup, DeferredQueue};
use crate::error::{GpuError, Result};
use ash::vk;
use gpu_allocator::MemoryLocation;

/// Parameters of a raw device buffer allocation.
#[derive(Debug, Clone, Copy)]
pub struct BufferDesc<'a> {
    pub size: u64,
    pub usage: vk::BufferUsageFlags,
    pub location: MemoryLocation,
    /// Minimum alignment of the allocation, on top of the driver's requirements.
    pub alignment: u64,
    pub name: &'a str,
}

/// A device buffer and the facts about its backing allocation.
///
/// Not `Clone`: a buffer is freed exactly once, by handing it back to
/// [`Device::free_buffer`] or to a deferred [`Cleanup`].
#[derive(Debug, PartialEq, Eq)]
pub struct GpuBuffer {
    pub buffer: vk::Buffer,
    pub size: u64,
    /// Zero unless created with `SHADER_DEVICE_ADDRESS` usage.
    pub device_address: vk::DeviceAddress,
    /// Offset of the buffer inside its memory block.
    pub offset: u64,
    pub host_coherent: bool,
    pub mapped: bool,
}

/// Parameters of [`create_buffer`].
#[derive(Debug, Clone, Copy)]
pub struct BufferRequest<'a> {
    pub usage: vk::BufferUsageFlags,
    pub size: u64,
    /// Initial contents, uploaded through a staging buffer.
    pub data: Option<&'a [u8]>,
    pub alignment: u64,
    pub name: &'a str,
}

impl<'a> BufferRequest<'a> {
    /// A buffer without initial contents.
    pub fn new(name: &'a str, usage: vk::BufferUsageFlags, size: u64) -> Self {
        Self {
            usage,
            size,
            data: None,
            alignment: 1,
            name,
        }
    }

    /// A buffer sized to and filled with `data`.
    pub fn with_data(name: &'a str, usage: vk::BufferUsageFlags, data: &'a [u8]) -> Self {
        Self {
            usage,
            size: data.len() as u64,
            data: Some(data),
            alignment: 1,
            name,
        }
    }

    #[must_use]
    pub fn aligned(mut self, alignment: u64) -> Self {
        self.alignment = alignment;
        self
    }
}

/// Round `value` up to the next multiple of `factor`.
pub const fn round_up_to_multiple(value: u64, factor: u64) -> u64 {
    if factor <= 1 {
        return value;
    }
    value + factor - 1 - (value + factor - 1) % factor
}

/// Check the alignment a buffer was requested with.
///
/// Buffers with a device address are checked by address, everything else
/// by allocation offset.
pub fn check_alignment(buffer: &GpuBuffer, usage: vk::BufferUsageFlags, alignment: u64) -> Result<()> {
    if alignment <= 1 {
        return Ok(());
    }
    let (what, address) = if usage.contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS) {
        ("device address", buffer.device_address)
    } else {
        ("allocation offset", buffer.offset)
    };
    if address % alignment == 0 {
        Ok(())
    } else {
        Err(GpuError::Alignment {
            what,
            address,
            alignment,
        })
    }
}

/// Create a device-local buffer, optionally filled with initial data.
pub fn create_buffer<D: Device>(
    device: &mut D,
    deferred: &mut DeferredQueue,
    request: &BufferRequest<'_>,
) -> Result<GpuBuffer> {
    create_buffer_with(device, deferred, request, |_, _| Ok(()))
}

/// Like [`create_buffer`], running `before_submit` on the upload command
/// buffer after the copy has been recorded.
///
/// The upload is asynchronous. The staging buffer and the command buffer
/// are released by `deferred` once the copy has completed.
pub fn create_buffer_with<D, F>(
    device: &mut D,
    deferred: &mut DeferredQueue,
    request: &BufferRequest<'_>,
    before_submit: F,
) -> Result<GpuBuffer>
where
    D: Device,
    F: FnOnce(&mut D, vk::CommandBuffer) -> Result<()>,
{
    let usage = if request.data.is_some() {
        request.usage | vk::BufferUsageFlags::TRANSFER_DST
    } else {
        request.usage
    };

    let buffer = device.create_buffer(&BufferDesc {
        size: request.size,
        usage,
        location: MemoryLocation::GpuOnly,
        alignment: request.alignment,
        name: request.name,
    })?;

    if let Err(e) = check_alignment(&buffer, usage, request.alignment) {
        device.free_buffer(buffer)?;
        return Err(e);
    }

    let Some(data) = request.data else {
        return Ok(buffer);
    };

    match upload(device, deferred, &buffer, data, before_submit) {
        Ok(()) => Ok(buffer),
        Err(e) => {
            device.free_buffer(buffer)?;
            Err(e)
        }
    }
}

fn upload<D, F>(
    device: &mut D,
    deferred: &mut DeferredQueue,
    dst: &GpuBuffer,
    data: &[u8],
    before_submit: F,
) -> Result<()>
where
    D: Device,
    F: FnOnce(&mut D, vk::CommandBuffer) -> Result<()>,
{
    let size = data.len() as u64;
    let staging = device.create_buffer(&BufferDesc {
        size,
        usage: vk::BufferUsageFlags::TRANSFER_SRC,
        location: MemoryLocation::CpuToGpu,
        alignment: 1,
        name: "staging",
    })?;

    let cmd = match record_upload(device, &staging, dst, data, before_submit) {
        Ok(cmd) => cmd,
        Err(e) => {
            device.free_buffer(staging)?;
            return Err(e);
        }
    };

    deferred.submit(
        device,
        cmd,
        true,
        vec![Cleanup::FreeCommandBuffer(cmd), Cleanup::FreeBuffer(staging)],
    )?;
    Ok(())
}

fn record_upload<D, F>(
    device: &mut D,
    staging: &GpuBuffer,
    dst: &GpuBuffer,
    data: &[u8],
    before_submit: F,
) -> Result<vk::CommandBuffer>
where
    D: Device,
    F: FnOnce(&mut D, vk::CommandBuffer) -> Result<()>,
{
    device.write_buffer(staging, 0, data)?;
    if !staging.host_coherent {
        device.flush_buffer(staging, 0, vk::WHOLE_SIZE)?;
    }

    let cmd = allocate_transient(device)?;
    let recorded = device
        .begin_command_buffer(cmd, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)
        .and_then(|()| {
            device.cmd_copy_buffer(cmd, staging, dst, data.len() as u64);
            before_submit(device, cmd)
        });
    if let Err(e) = recorded {
        device.free_command_buffers(CommandPoolKind::Transient, &[cmd]);
        return Err(e);
    }
    Ok(cmd)
}

/// Allocate a single transient command buffer.
pub fn allocate_transient<D: Device>(device: &mut D) -> Result<vk::CommandBuffer> {
    device
        .allocate_command_buffers(CommandPoolKind::Transient, 1)?
        .pop()
        .ok_or_else(|| GpuError::InvalidState("no command buffer allocated".to_string()))
}

/// Persistently mapped uniform buffers, one per swapchain image.
#[derive(Debug)]
pub struct UniformBuffers {
    buffers: Vec<GpuBuffer>,
    size: u64,
}

impl UniformBuffers {
    /// Create `count` host-visible uniform buffers of `size` bytes.
    pub fn new<D: Device>(device: &mut D, count: usize, size: u64) -> Result<Self> {
        let mut buffers = Vec::with_capacity(count);
        for _ in 0..count {
            let desc = BufferDesc {
                size,
                usage: vk::BufferUsageFlags::UNIFORM_BUFFER,
                location: MemoryLocation::CpuToGpu,
                alignment: 1,
                name: "uniforms",
            };
            match device.create_buffer(&desc) {
                Ok(buffer) => buffers.push(buffer),
                Err(e) => {
                    for buffer in buffers {
                        device.free_buffer(buffer)?;
                    }
                    return Err(e);
                }
            }
        }
        Ok(Self { buffers, size })
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Size of each buffer in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn get(&self, index: usize) -> Option<&GpuBuffer> {
        self.buffers.get(index)
    }

    /// Write the uniforms of one image, flushing non-coherent memory.
    pub fn write<D: Device>(&self, device: &mut D, index: usize, data: &[u8]) -> Result<()> {
        let buffer = self.buffers.get(index).ok_or_else(|| {
            GpuError::InvalidState(format!("no uniform buffer for image {index}"))
        })?;
        if data.len() as u64 > self.size {
            return Err(GpuError::InvalidState(format!(
                "uniform data of {} bytes does not fit {} byte buffer",
                data.len(),
                self.size
            )));
        }
        device.write_buffer(buffer, 0, data)?;
        if !buffer.host_coherent {
            device.flush_buffer(buffer, 0, vk::WHOLE_SIZE)?;
        }
        Ok(())
    }

    /// Free every buffer. The device must no longer use them.
    pub fn destroy<D: Device>(self, device: &mut D) -> Result<()> {
        for buffer in self.buffers {
            device.free_buffer(buffer)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeDevice, RecordedCommand};

    #[test]
    fn round_up_matches_multiples() {
        assert_eq!(round_up_to_multiple(0, 256), 0);
        assert_eq!(round_up_to_multiple(1, 256), 256);
        assert_eq!(round_up_to_multiple(256, 256), 256);
        assert_eq!(round_up_to_multiple(257, 256), 512);
        assert_eq!(round_up_to_multiple(1000, 128), 1024);
        assert_eq!(round_up_to_multiple(17, 1), 17);
    }

    #[test]
    fn buffer_without_data_is_not_uploaded() {
        let mut device = FakeDevice::new();
        let mut deferred = DeferredQueue::new();

        let request = BufferRequest::new(
            "scratch",
            vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            4096,
        )
        .aligned(256);
        let buffer = create_buffer(&mut device, &mut deferred, &request).unwrap();

        assert_eq!(buffer.size, 4096);
        assert_eq!(buffer.device_address % 256, 0);
        assert_eq!(device.submission_count(), 0);
        assert_eq!(deferred.pending_count(), 0);
        assert_eq!(device.live_buffer_count(), 1);
    }

    #[test]
    fn upload_uses_one_staging_buffer_and_one_deferred_entry() {
        let mut device = FakeDevice::new();
        device.set_auto_complete(false);
        let mut deferred = DeferredQueue::new();
        let data = [7u8; 96];

        let request = BufferRequest::with_data("positions", vk::BufferUsageFlags::STORAGE_BUFFER, &data);
        let buffer = create_buffer(&mut device, &mut deferred, &request).unwrap();

        assert_eq!(device.live_buffer_count(), 2);
        assert_eq!(deferred.pending_count(), 1);
        assert_eq!(device.submission_count(), 1);
        assert!(device.buffer_usage(buffer.buffer).contains(vk::BufferUsageFlags::TRANSFER_DST));

        device.complete_all();
        deferred.poll_completed(&mut device).unwrap();
        assert_eq!(device.live_buffer_count(), 1);
        assert_eq!(device.live_command_buffer_count(), 0);
        assert_eq!(device.buffer_contents(buffer.buffer), data.to_vec());
    }

    #[test]
    fn pre_submit_hook_records_after_copy() {
        let mut device = FakeDevice::new();
        let mut deferred = DeferredQueue::new();
        let data = [1u8; 16];

        let request = BufferRequest::with_data("indices", vk::BufferUsageFlags::INDEX_BUFFER, &data);
        let mut hook_cmd = None;
        create_buffer_with(&mut device, &mut deferred, &request, |d, cmd| {
            hook_cmd = Some(cmd);
            d.cmd_memory_barrier(cmd, &crate::MemoryBarrier::TRANSFER_TO_BUILD);
            Ok(())
        })
        .unwrap();

        let commands = device.recorded(hook_cmd.unwrap());
        assert!(matches!(commands[0], RecordedCommand::CopyBuffer { size: 16, .. }));
        assert_eq!(
            commands[1],
            RecordedCommand::Barrier(crate::MemoryBarrier::TRANSFER_TO_BUILD)
        );
    }

    #[test]
    fn failing_hook_releases_everything() {
        let mut device = FakeDevice::new();
        let mut deferred = DeferredQueue::new();
        let data = [3u8; 32];

        let request = BufferRequest::with_data("indices", vk::BufferUsageFlags::INDEX_BUFFER, &data);
        let err = create_buffer_with(&mut device, &mut deferred, &request, |_, _| {
            Err(GpuError::InvalidState("hook".to_string()))
        })
        .unwrap_err();

        assert!(matches!(err, GpuError::InvalidState(_)));
        assert_eq!(device.live_buffer_count(), 0);
        assert_eq!(device.live_command_buffer_count(), 0);
        assert_eq!(device.submission_count(), 0);
        assert_eq!(deferred.pending_count(), 0);
    }

    #[test]
    fn placement_honors_every_alignment() {
        let usages = [
            vk::BufferUsageFlags::VERTEX_BUFFER,
            vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
        ];
        for usage in usages {
            for shift in 0..=12 {
                let alignment = 1u64 << shift;
                for size in [1u64, 24, 100, 256, 4097] {
                    for misalign in [false, true] {
                        let mut device = FakeDevice::new();
                        let mut deferred = DeferredQueue::new();
                        // Pushes the next placement off its natural alignment.
                        create_buffer(&mut device, &mut deferred, &BufferRequest::new("pad", usage, 40)).unwrap();
                        if misalign {
                            device.misalign_next_buffer();
                        }

                        let request = BufferRequest::new("placed", usage, size).aligned(alignment);
                        match create_buffer(&mut device, &mut deferred, &request) {
                            Ok(buffer) => {
                                let placement = if usage.contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS) {
                                    buffer.device_address
                                } else {
                                    buffer.offset
                                };
                                assert_eq!(placement % alignment, 0, "{usage:?} size {size} alignment {alignment}");
                            }
                            Err(GpuError::Alignment { alignment: reported, address, .. }) => {
                                assert_eq!(reported, alignment);
                                assert_ne!(address % alignment, 0);
                                assert_eq!(device.live_buffer_count(), 1);
                            }
                            Err(e) => panic!("unexpected error {e}"),
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn misaligned_address_is_rejected_and_freed() {
        let mut device = FakeDevice::new();
        device.misalign_next_buffer();
        let mut deferred = DeferredQueue::new();

        let request = BufferRequest::new(
            "structure",
            vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            1024,
        )
        .aligned(256);
        let err = create_buffer(&mut device, &mut deferred, &request).unwrap_err();

        assert!(matches!(
            err,
            GpuError::Alignment {
                what: "device address",
                alignment: 256,
                ..
            }
        ));
        assert_eq!(device.live_buffer_count(), 0);
    }

    #[test]
    fn misaligned_offset_is_checked_without_device_address() {
        let mut device = FakeDevice::new();
        device.misalign_next_buffer();
        let mut deferred = DeferredQueue::new();

        let request = BufferRequest::new("vertices", vk::BufferUsageFlags::VERTEX_BUFFER, 64).aligned(16);
        let err = create_buffer(&mut device, &mut deferred, &request).unwrap_err();

        assert!(matches!(
            err,
            GpuError::Alignment {
                what: "allocation offset",
                ..
            }
        ));
    }

    #[test]
    fn uniform_writes_flush_only_non_coherent_memory() {
        let mut device = FakeDevice::new();
        let coherent = UniformBuffers::new(&mut device, 3, 128).unwrap();
        coherent.write(&mut device, 1, &[0u8; 128]).unwrap();
        assert_eq!(device.flush_count(), 0);

        device.set_host_coherent(false);
        let non_coherent = UniformBuffers::new(&mut device, 2, 128).unwrap();
        non_coherent.write(&mut device, 0, &[0u8; 64]).unwrap();
        assert_eq!(device.flush_count(), 1);

        assert!(coherent.write(&mut device, 0, &[0u8; 129]).is_err());
        assert!(coherent.write(&mut device, 3, &[0u8; 4]).is_err());

        coherent.destroy(&mut device).unwrap();
        non_coherent.destroy(&mut device).unwrap();
        assert_eq!(device.live_buffer_count(), 0);
    }
}

//! Shader binding table for the ray tracing pipeline.
//!
//! Groups are laid out in pipeline order: one ray generation group, then the
//! miss groups, then the hit groups. Callable shaders are not used.

use crate::backend::{Device, DeviceLimits, MemoryBarrier};
use crate::deferred::DeferredQueue;
use crate::error::{GpuError, Result};
use crate::memory::{create_buffer_with, round_up_to_multiple, BufferRequest, GpuBuffer};
use ash::vk;

/// One region of the table, relative to its start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SbtRegion {
    pub offset: u64,
    pub stride: u64,
    pub size: u64,
}

/// Placement of the group handles inside the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SbtLayout {
    pub handle_size: u32,
    pub miss_count: u32,
    pub hit_count: u32,
    pub raygen: SbtRegion,
    pub miss: SbtRegion,
    pub hit: SbtRegion,
    /// Every region starts at a multiple of this.
    pub base_alignment: u64,
    pub size: u64,
}

impl SbtLayout {
    pub fn new(limits: &DeviceLimits, miss_count: u32, hit_count: u32) -> Result<Self> {
        let handle_size = limits.shader_group_handle_size;
        if handle_size == 0 {
            return Err(GpuError::FeatureNotSupported("rayTracingPipeline".to_string()));
        }
        let handle_alignment = u64::from(limits.shader_group_handle_alignment);
        let base_alignment = limits.shader_group_base_alignment;
        for (what, alignment) in [
            ("shaderGroupHandleAlignment", handle_alignment),
            ("shaderGroupBaseAlignment", base_alignment),
        ] {
            if !alignment.is_power_of_two() {
                return Err(GpuError::InvalidState(format!(
                    "{what} {alignment} is not a power of two"
                )));
            }
        }

        let stride = round_up_to_multiple(u64::from(handle_size), handle_alignment);
        // A ray generation region holds exactly one record.
        let raygen = SbtRegion {
            offset: 0,
            stride,
            size: stride,
        };
        let miss = SbtRegion {
            offset: round_up_to_multiple(raygen.offset + raygen.size, base_alignment),
            stride,
            size: stride * u64::from(miss_count),
        };
        let hit = SbtRegion {
            offset: round_up_to_multiple(miss.offset + miss.size, base_alignment),
            stride,
            size: stride * u64::from(hit_count),
        };

        Ok(Self {
            handle_size,
            miss_count,
            hit_count,
            raygen,
            miss,
            hit,
            base_alignment,
            size: hit.offset + hit.size,
        })
    }

    pub fn group_count(&self) -> u32 {
        1 + self.miss_count + self.hit_count
    }

    /// Table contents for `handles`, as returned by
    /// `vkGetRayTracingShaderGroupHandlesKHR` for all groups.
    pub fn table(&self, handles: &[u8]) -> Result<Vec<u8>> {
        let handle_size = self.handle_size as usize;
        let expected = handle_size * self.group_count() as usize;
        if handles.len() != expected {
            return Err(GpuError::InvalidState(format!(
                "expected {expected} bytes of shader group handles, got {}",
                handles.len()
            )));
        }

        let slots = std::iter::once(self.raygen.offset)
            .chain((0..u64::from(self.miss_count)).map(|i| self.miss.offset + i * self.miss.stride))
            .chain((0..u64::from(self.hit_count)).map(|i| self.hit.offset + i * self.hit.stride));

        let mut table = vec![0; self.size as usize];
        for (handle, offset) in handles.chunks_exact(handle_size).zip(slots) {
            let offset = offset as usize;
            table[offset..offset + handle_size].copy_from_slice(handle);
        }
        Ok(table)
    }
}

/// A device-local shader binding table and the regions handed to
/// `vkCmdTraceRaysKHR`.
pub struct ShaderBindingTable {
    buffer: GpuBuffer,
    pub layout: SbtLayout,
    pub raygen: vk::StridedDeviceAddressRegionKHR,
    pub miss: vk::StridedDeviceAddressRegionKHR,
    pub hit: vk::StridedDeviceAddressRegionKHR,
    /// Always empty.
    pub callable: vk::StridedDeviceAddressRegionKHR,
}

impl ShaderBindingTable {
    /// Lay out and upload the group handles of a pipeline with one ray
    /// generation group, `miss_count` miss groups and `hit_count` hit groups.
    ///
    /// The table is placed at the device's shader group base alignment. The
    /// upload is asynchronous and ends with a barrier to the ray tracing
    /// stage, so later trace calls on the queue see the records.
    pub fn new<D: Device>(
        device: &mut D,
        deferred: &mut DeferredQueue,
        handles: &[u8],
        miss_count: u32,
        hit_count: u32,
    ) -> Result<Self> {
        let layout = SbtLayout::new(device.limits(), miss_count, hit_count)?;
        let table = layout.table(handles)?;

        let request = BufferRequest::with_data(
            "shader binding table",
            vk::BufferUsageFlags::SHADER_BINDING_TABLE_KHR | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            &table,
        )
        .aligned(layout.base_alignment);
        let buffer = create_buffer_with(device, deferred, &request, |device, cmd| {
            device.cmd_memory_barrier(cmd, &MemoryBarrier::TRANSFER_TO_RAY_TRACING);
            Ok(())
        })?;

        let address = buffer.device_address;
        let region = |region: SbtRegion| {
            if region.size == 0 {
                vk::StridedDeviceAddressRegionKHR::default()
            } else {
                vk::StridedDeviceAddressRegionKHR {
                    device_address: address + region.offset,
                    stride: region.stride,
                    size: region.size,
                }
            }
        };

        tracing::debug!(
            "Shader binding table: {} groups, {} bytes at {address:#x}",
            layout.group_count(),
            layout.size
        );

        Ok(Self {
            raygen: region(layout.raygen),
            miss: region(layout.miss),
            hit: region(layout.hit),
            callable: vk::StridedDeviceAddressRegionKHR::default(),
            layout,
            buffer,
        })
    }

    pub fn buffer(&self) -> &GpuBuffer {
        &self.buffer
    }

    /// Free the table. It must not be in use by pending work.
    pub fn destroy<D: Device>(self, device: &mut D) -> Result<()> {
        device.free_buffer(self.buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeDevice, RecordedCommand};

    fn limits(handle_size: u32, handle_alignment: u32, base_alignment: u64) -> DeviceLimits {
        DeviceLimits {
            shader_group_handle_size: handle_size,
            shader_group_handle_alignment: handle_alignment,
            shader_group_base_alignment: base_alignment,
            ..DeviceLimits::default()
        }
    }

    /// Handle `i` is filled with `i + 1`.
    fn handles(handle_size: u32, groups: u32) -> Vec<u8> {
        (0..groups)
            .flat_map(|group| std::iter::repeat(group as u8 + 1).take(handle_size as usize))
            .collect()
    }

    #[test]
    fn regions_start_at_the_base_alignment() {
        let layout = SbtLayout::new(&limits(32, 32, 64), 1, 1).unwrap();
        assert_eq!(
            layout.raygen,
            SbtRegion {
                offset: 0,
                stride: 32,
                size: 32
            }
        );
        assert_eq!(
            layout.miss,
            SbtRegion {
                offset: 64,
                stride: 32,
                size: 32
            }
        );
        assert_eq!(
            layout.hit,
            SbtRegion {
                offset: 128,
                stride: 32,
                size: 32
            }
        );
        assert_eq!(layout.size, 160);
        assert_eq!(layout.group_count(), 3);
    }

    #[test]
    fn stride_is_the_handle_size_rounded_to_the_handle_alignment() {
        let layout = SbtLayout::new(&limits(48, 32, 128), 2, 2).unwrap();
        assert_eq!(layout.raygen.stride, 64);
        assert_eq!(layout.raygen.size, 64);
        assert_eq!(layout.miss.offset, 128);
        assert_eq!(layout.miss.size, 128);
        assert_eq!(layout.hit.offset, 256);
        assert_eq!(layout.size, 384);

        for base in [32, 64, 128, 256] {
            for handle_size in [16, 32, 48] {
                let layout = SbtLayout::new(&limits(handle_size, 16, base), 3, 2).unwrap();
                for region in [layout.raygen, layout.miss, layout.hit] {
                    assert_eq!(region.offset % base, 0);
                    assert!(region.stride >= u64::from(handle_size));
                }
                assert!(layout.miss.offset >= layout.raygen.size);
                assert!(layout.hit.offset >= layout.miss.offset + layout.miss.size);
            }
        }
    }

    #[test]
    fn table_places_each_handle_in_its_record() {
        let layout = SbtLayout::new(&limits(32, 32, 64), 2, 1).unwrap();
        let table = layout.table(&handles(32, 4)).unwrap();
        assert_eq!(table.len(), layout.size as usize);

        let record = |offset: u64| &table[offset as usize..offset as usize + 32];
        assert!(record(layout.raygen.offset).iter().all(|&b| b == 1));
        assert!(record(layout.miss.offset).iter().all(|&b| b == 2));
        assert!(record(layout.miss.offset + 32).iter().all(|&b| b == 3));
        assert!(record(layout.hit.offset).iter().all(|&b| b == 4));
        // Padding between the ray generation record and the miss region.
        assert!(table[32..64].iter().all(|&b| b == 0));
    }

    #[test]
    fn bad_limits_and_handle_data_are_rejected() {
        assert!(matches!(
            SbtLayout::new(&limits(0, 32, 64), 1, 1),
            Err(GpuError::FeatureNotSupported(_))
        ));
        assert!(matches!(
            SbtLayout::new(&limits(32, 32, 48), 1, 1),
            Err(GpuError::InvalidState(_))
        ));
        assert!(matches!(
            SbtLayout::new(&limits(32, 0, 64), 1, 1),
            Err(GpuError::InvalidState(_))
        ));

        let layout = SbtLayout::new(&limits(32, 32, 64), 1, 1).unwrap();
        assert!(layout.table(&handles(32, 2)).is_err());
    }

    #[test]
    fn table_is_uploaded_at_the_base_alignment() {
        let mut device = FakeDevice::new();
        *device.limits_mut() = limits(32, 32, 256);
        let mut deferred = DeferredQueue::new();

        // Push the next allocation off a 256-byte boundary.
        let pad = device
            .create_buffer(&crate::memory::BufferDesc {
                size: 40,
                usage: vk::BufferUsageFlags::STORAGE_BUFFER,
                location: gpu_allocator::MemoryLocation::GpuOnly,
                alignment: 1,
                name: "pad",
            })
            .unwrap();

        let sbt = ShaderBindingTable::new(&mut device, &mut deferred, &handles(32, 3), 1, 1).unwrap();

        let usage = device.buffer_usage(sbt.buffer().buffer);
        assert!(usage.contains(vk::BufferUsageFlags::SHADER_BINDING_TABLE_KHR));
        assert!(usage.contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS));
        for region in [sbt.raygen, sbt.miss, sbt.hit] {
            assert_eq!(region.device_address % 256, 0);
            assert_eq!(region.stride, 32);
        }
        assert_eq!(sbt.raygen.size, sbt.raygen.stride);
        assert_eq!(sbt.miss.device_address, sbt.raygen.device_address + 256);
        let empty = vk::StridedDeviceAddressRegionKHR::default();
        assert_eq!(
            (sbt.callable.device_address, sbt.callable.stride, sbt.callable.size),
            (empty.device_address, empty.stride, empty.size)
        );

        let contents = device.buffer_contents(sbt.buffer().buffer);
        assert_eq!(contents[..32], [1u8; 32]);
        assert_eq!(contents[256..288], [2u8; 32]);
        assert_eq!(contents[512..544], [3u8; 32]);

        let upload = device.submissions()[0].command_buffer;
        assert_eq!(
            device.recorded(upload).last(),
            Some(&RecordedCommand::Barrier(MemoryBarrier::TRANSFER_TO_RAY_TRACING))
        );

        deferred.flush(&mut device).unwrap();
        sbt.destroy(&mut device).unwrap();
        device.free_buffer(pad).unwrap();
        assert_eq!(device.live_buffer_count(), 0);
    }

    #[test]
    fn misplaced_table_is_rejected_and_freed() {
        let mut device = FakeDevice::new();
        *device.limits_mut() = limits(32, 32, 64);
        let mut deferred = DeferredQueue::new();
        device.misalign_next_buffer();

        let result = ShaderBindingTable::new(&mut device, &mut deferred, &handles(32, 3), 1, 1);

        assert!(matches!(
            result,
            Err(GpuError::Alignment { alignment: 64, .. })
        ));
        assert_eq!(device.live_buffer_count(), 0);
        assert_eq!(device.submission_count(), 0);
    }
}

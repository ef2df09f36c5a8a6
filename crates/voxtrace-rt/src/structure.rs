//! Acceleration structures placed inside shared buffers.

use ash::vk;
use voxtrace_gpu::{Cleanup, Device, GpuError, RcBuffer, Result};

/// Offset alignment of an acceleration structure inside its buffer.
pub const STRUCTURE_ALIGNMENT: u64 = 256;

/// Device address alignment of TLAS instance data.
pub const INSTANCE_ALIGNMENT: u64 = 16;

/// An acceleration structure and the region of the buffer it lives in.
///
/// Holds one reference on its storage for as long as it exists.
#[derive(Debug)]
pub struct AccelerationStructure {
    handle: vk::AccelerationStructureKHR,
    device_address: vk::DeviceAddress,
    level: vk::AccelerationStructureTypeKHR,
    storage: RcBuffer,
    offset: u64,
    size: u64,
}

impl AccelerationStructure {
    /// Create a structure of `size` bytes at `offset` inside `storage`.
    pub fn new<D: Device>(
        device: &mut D,
        level: vk::AccelerationStructureTypeKHR,
        storage: &RcBuffer,
        offset: u64,
        size: u64,
    ) -> Result<Self> {
        if offset % STRUCTURE_ALIGNMENT != 0 {
            return Err(GpuError::Alignment {
                what: "acceleration structure offset",
                address: offset,
                alignment: STRUCTURE_ALIGNMENT,
            });
        }
        if offset + size > storage.size() {
            return Err(GpuError::InvalidState(format!(
                "acceleration structure [{offset}, {}) does not fit {} byte buffer",
                offset + size,
                storage.size()
            )));
        }

        let handle = device.create_acceleration_structure(level, storage.buffer(), offset, size)?;
        let device_address = device.acceleration_structure_address(handle);

        Ok(Self {
            handle,
            device_address,
            level,
            storage: storage.acquire(),
            offset,
            size,
        })
    }

    pub fn handle(&self) -> vk::AccelerationStructureKHR {
        self.handle
    }

    pub fn device_address(&self) -> vk::DeviceAddress {
        self.device_address
    }

    pub fn level(&self) -> vk::AccelerationStructureTypeKHR {
        self.level
    }

    pub fn storage(&self) -> &RcBuffer {
        &self.storage
    }

    /// Byte offset inside the storage buffer.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Destroy the structure now and release its storage.
    ///
    /// The device must no longer use it.
    pub fn destroy<D: Device>(self, device: &mut D) -> Result<()> {
        device.destroy_acceleration_structure(self.handle);
        self.storage.release(device).map(|_| ())
    }

    /// The cleanups destroying this structure once a submission completes.
    pub fn into_cleanup(self) -> [Cleanup; 2] {
        [
            Cleanup::DestroyAccelerationStructure(self.handle),
            Cleanup::Release(self.storage),
        ]
    }
}

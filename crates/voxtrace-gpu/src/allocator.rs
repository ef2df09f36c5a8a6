//! Buffer memory allocation through gpu-allocator.

use crate::error::{GpuError, Result};
use crate::memory::{BufferDesc, GpuBuffer};
use ash::vk;
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
use hashbrown::HashMap;
use std::sync::Arc;

/// GPU memory allocator owning every live buffer allocation.
pub struct GpuAllocator {
    allocator: Option<Allocator>,
    allocations: HashMap<vk::Buffer, Allocation>,
    device: Arc<ash::Device>,
}

impl GpuAllocator {
    /// Create a new allocator.
    ///
    /// # Safety
    /// The instance, device, and physical device must be valid.
    pub unsafe fn new(
        instance: &ash::Instance,
        device: Arc<ash::Device>,
        physical_device: vk::PhysicalDevice,
    ) -> Result<Self> {
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: (*device).clone(),
            physical_device,
            debug_settings: gpu_allocator::AllocatorDebugSettings {
                log_memory_information: cfg!(debug_assertions),
                log_leaks_on_shutdown: true,
                store_stack_traces: false,
                log_allocations: false,
                log_frees: false,
                log_stack_traces: false,
            },
            buffer_device_address: true,
            allocation_sizes: Default::default(),
        })
        .map_err(|e| GpuError::AllocationFailed(e.to_string()))?;

        Ok(Self {
            allocator: Some(allocator),
            allocations: HashMap::new(),
            device,
        })
    }

    fn allocator(&mut self) -> Result<&mut Allocator> {
        self.allocator
            .as_mut()
            .ok_or_else(|| GpuError::InvalidState("Allocator not initialized".to_string()))
    }

    /// Create and bind a buffer.
    pub fn create_buffer(&mut self, desc: &BufferDesc<'_>) -> Result<GpuBuffer> {
        let buffer_info = vk::BufferCreateInfo::default()
            .size(desc.size)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { self.device.create_buffer(&buffer_info, None)? };

        let mut requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };
        requirements.alignment = requirements.alignment.max(desc.alignment);

        let allocation = self.allocator().and_then(|allocator| {
            allocator
                .allocate(&AllocationCreateDesc {
                    name: desc.name,
                    requirements,
                    location: desc.location,
                    linear: true,
                    allocation_scheme: AllocationScheme::GpuAllocatorManaged,
                })
                .map_err(|e| GpuError::AllocationFailed(e.to_string()))
        });
        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.device.destroy_buffer(buffer, None) };
                return Err(e);
            }
        };

        let bound = unsafe {
            self.device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        };
        if let Err(e) = bound {
            unsafe { self.device.destroy_buffer(buffer, None) };
            self.allocator()?
                .free(allocation)
                .map_err(|e| GpuError::AllocationFailed(e.to_string()))?;
            return Err(e.into());
        }

        let device_address = if desc.usage.contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS) {
            let info = vk::BufferDeviceAddressInfo::default().buffer(buffer);
            unsafe { self.device.get_buffer_device_address(&info) }
        } else {
            0
        };

        let gpu_buffer = GpuBuffer {
            buffer,
            size: desc.size,
            device_address,
            offset: allocation.offset(),
            host_coherent: allocation
                .memory_properties()
                .contains(vk::MemoryPropertyFlags::HOST_COHERENT),
            mapped: allocation.mapped_ptr().is_some(),
        };
        self.allocations.insert(buffer, allocation);
        Ok(gpu_buffer)
    }

    /// Destroy a buffer and free its allocation.
    pub fn free_buffer(&mut self, buffer: GpuBuffer) -> Result<()> {
        let allocation = self.allocations.remove(&buffer.buffer).ok_or_else(|| {
            GpuError::InvalidState(format!("buffer {:?} is not owned by this allocator", buffer.buffer))
        })?;

        unsafe {
            self.device.destroy_buffer(buffer.buffer, None);
        }
        self.allocator()?
            .free(allocation)
            .map_err(|e| GpuError::AllocationFailed(e.to_string()))
    }

    /// Copy `data` into a mapped buffer at `offset`.
    pub fn write(&mut self, buffer: &GpuBuffer, offset: u64, data: &[u8]) -> Result<()> {
        let allocation = self.allocations.get_mut(&buffer.buffer).ok_or_else(|| {
            GpuError::InvalidState(format!("buffer {:?} is not owned by this allocator", buffer.buffer))
        })?;
        let slice = allocation
            .mapped_slice_mut()
            .ok_or_else(|| GpuError::InvalidState("buffer is not host visible".to_string()))?;

        let start = usize::try_from(offset)
            .map_err(|_| GpuError::InvalidState(format!("write offset {offset} out of range")))?;
        let end = start + data.len();
        if end > slice.len() {
            return Err(GpuError::InvalidState(format!(
                "write of {} bytes at {start} overflows {} byte buffer",
                data.len(),
                slice.len()
            )));
        }
        slice[start..end].copy_from_slice(data);
        Ok(())
    }

    /// Flush host writes of a non-coherent buffer, rounded out to `atom_size`.
    pub fn flush(&self, buffer: &GpuBuffer, offset: u64, size: u64, atom_size: u64) -> Result<()> {
        let allocation = self.allocations.get(&buffer.buffer).ok_or_else(|| {
            GpuError::InvalidState(format!("buffer {:?} is not owned by this allocator", buffer.buffer))
        })?;

        let atom = atom_size.max(1);
        let start = allocation.offset() + offset;
        let aligned_start = start - start % atom;
        let size = if size == vk::WHOLE_SIZE {
            vk::WHOLE_SIZE
        } else {
            let end = crate::memory::round_up_to_multiple(start + size, atom);
            end - aligned_start
        };

        let range = vk::MappedMemoryRange::default()
            .memory(unsafe { allocation.memory() })
            .offset(aligned_start)
            .size(size);
        unsafe { self.device.flush_mapped_memory_ranges(std::slice::from_ref(&range))? };
        Ok(())
    }

    /// Number of buffers still allocated.
    pub fn live_buffers(&self) -> usize {
        self.allocations.len()
    }

    /// Shutdown the allocator, freeing all GPU memory.
    ///
    /// This must be called before the Vulkan device is destroyed.
    pub fn shutdown(&mut self) {
        if !self.allocations.is_empty() {
            tracing::warn!("{} buffers still allocated at shutdown", self.allocations.len());
        }
        let leaked: Vec<_> = self.allocations.drain().collect();
        if let Some(allocator) = self.allocator.as_mut() {
            for (buffer, allocation) in leaked {
                unsafe { self.device.destroy_buffer(buffer, None) };
                let _ = allocator.free(allocation);
            }
        }
        self.allocator = None;
    }
}

impl Drop for GpuAllocator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

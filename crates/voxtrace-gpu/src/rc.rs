//! Reference-counted GPU buffers.
//!
//! Several acceleration structures can live inside one buffer. The buffer
//! is freed when the last of them releases it.

use crate::backend::Device;
use crate::error::{GpuError, Result};
use crate::memory::GpuBuffer;
use ash::vk;
use std::cell::Cell;
use std::fmt;
use std::rc::Rc;

struct Shared {
    buffer: Cell<Option<GpuBuffer>>,
    handle: vk::Buffer,
    device_address: vk::DeviceAddress,
    size: u64,
    count: Cell<usize>,
}

/// A GPU buffer shared by several owners.
///
/// The count starts at zero. Every [`acquire`](Self::acquire) must be
/// paired with one [`release`](Self::release); the release that brings the
/// count back to zero frees the buffer. Render-thread only.
#[derive(Clone)]
pub struct RcBuffer {
    shared: Rc<Shared>,
}

impl RcBuffer {
    pub fn new(buffer: GpuBuffer) -> Self {
        Self {
            shared: Rc::new(Shared {
                handle: buffer.buffer,
                device_address: buffer.device_address,
                size: buffer.size,
                buffer: Cell::new(Some(buffer)),
                count: Cell::new(0),
            }),
        }
    }

    /// Take a reference.
    #[must_use]
    pub fn acquire(&self) -> Self {
        self.shared.count.set(self.shared.count.get() + 1);
        self.clone()
    }

    /// Drop a reference, freeing the buffer on the last one.
    ///
    /// Returns whether the buffer was freed.
    pub fn release<D: Device>(self, device: &mut D) -> Result<bool> {
        let count = self.shared.count.get();
        if count == 0 {
            return Err(GpuError::InvalidState(
                "shared buffer released more often than acquired".to_string(),
            ));
        }
        self.shared.count.set(count - 1);
        if count > 1 {
            return Ok(false);
        }
        match self.shared.buffer.take() {
            Some(buffer) => {
                device.free_buffer(buffer)?;
                Ok(true)
            }
            None => Err(GpuError::InvalidState("shared buffer already freed".to_string())),
        }
    }

    /// Free the buffer of a handle that was never acquired.
    pub fn free_unused<D: Device>(self, device: &mut D) -> Result<()> {
        if self.count() != 0 {
            return Err(GpuError::InvalidState(format!(
                "shared buffer still has {} references",
                self.count()
            )));
        }
        match self.shared.buffer.take() {
            Some(buffer) => device.free_buffer(buffer),
            None => Ok(()),
        }
    }

    /// Current number of references.
    pub fn count(&self) -> usize {
        self.shared.count.get()
    }

    pub fn buffer(&self) -> vk::Buffer {
        self.shared.handle
    }

    pub fn device_address(&self) -> vk::DeviceAddress {
        self.shared.device_address
    }

    pub fn size(&self) -> u64 {
        self.shared.size
    }

    /// Whether two handles share the same buffer.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.shared, &other.shared)
    }
}

impl fmt::Debug for RcBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RcBuffer")
            .field("buffer", &self.shared.handle)
            .field("size", &self.shared.size)
            .field("count", &self.shared.count.get())
            .finish()
    }
}

//! Synchronization primitives.

use crate::backend::Device;
use crate::error::Result;
use ash::vk;

/// Frame synchronization resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSync {
    /// Semaphore signaled when image is available
    pub image_available: vk::Semaphore,
    /// Semaphore signaled when rendering is complete
    pub render_finished: vk::Semaphore,
    /// Fence to wait for frame completion, created signaled
    pub in_flight: vk::Fence,
}

impl FrameSync {
    /// Create frame synchronization resources.
    pub fn new<D: Device>(device: &mut D) -> Result<Self> {
        let image_available = device.create_semaphore()?;
        let render_finished = match device.create_semaphore() {
            Ok(semaphore) => semaphore,
            Err(e) => {
                device.destroy_semaphore(image_available);
                return Err(e);
            }
        };
        let in_flight = match device.create_fence(true) {
            Ok(fence) => fence,
            Err(e) => {
                device.destroy_semaphore(image_available);
                device.destroy_semaphore(render_finished);
                return Err(e);
            }
        };
        Ok(Self {
            image_available,
            render_finished,
            in_flight,
        })
    }

    /// Wait for this frame to be available.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn wait<D: Device>(&self, device: &mut D) -> Result<()> {
        device.wait_for_fence(self.in_flight, u64::MAX)
    }

    /// Reset the fence for the next frame.
    pub fn reset<D: Device>(&self, device: &mut D) -> Result<()> {
        device.reset_fence(self.in_flight)
    }

    /// Destroy synchronization resources.
    ///
    /// Resources must not be in use.
    pub fn destroy<D: Device>(self, device: &mut D) {
        device.destroy_semaphore(self.image_available);
        device.destroy_semaphore(self.render_finished);
        device.destroy_fence(self.in_flight);
    }
}

//! Fence-gated deferred cleanup.
//!
//! Resources referenced by a submitted command buffer cannot be released
//! until the GPU has finished with it. Each submission through
//! [`DeferredQueue::submit`] gets its own fence; the cleanups registered
//! with it run once that fence reports signaled.

use crate::backend::{CommandPoolKind, Device, Submission};
use crate::error::{GpuError, Result};
use crate::memory::GpuBuffer;
use crate::rc::RcBuffer;
use ash::vk;
use hashbrown::HashMap;

/// A release action that runs after a submission has completed.
#[derive(Debug)]
pub enum Cleanup {
    FreeBuffer(GpuBuffer),
    /// Free a command buffer allocated from the transient pool.
    FreeCommandBuffer(vk::CommandBuffer),
    DestroyAccelerationStructure(vk::AccelerationStructureKHR),
    /// Drop one reference to a shared buffer.
    Release(RcBuffer),
}

impl Cleanup {
    /// Run the action.
    pub fn run<D: Device>(self, device: &mut D) -> Result<()> {
        match self {
            Self::FreeBuffer(buffer) => device.free_buffer(buffer),
            Self::FreeCommandBuffer(cmd) => {
                device.free_command_buffers(CommandPoolKind::Transient, &[cmd]);
                Ok(())
            }
            Self::DestroyAccelerationStructure(handle) => {
                device.destroy_acceleration_structure(handle);
                Ok(())
            }
            Self::Release(buffer) => buffer.release(device).map(|_| ()),
        }
    }
}

/// Run every cleanup even when some fail; the first error is returned.
fn run_all<D: Device>(device: &mut D, cleanups: Vec<Cleanup>) -> Result<()> {
    let mut first_error = None;
    for cleanup in cleanups {
        if let Err(e) = cleanup.run(device) {
            tracing::warn!("Deferred cleanup failed: {e}");
            first_error.get_or_insert(e);
        }
    }
    first_error.map_or(Ok(()), Err)
}

/// Release the cleanups of a submission that never reached the queue and
/// return its error.
///
/// Earlier submissions may still read the buffers handed over, so the
/// device is drained first.
fn abandon<D: Device, T>(device: &mut D, cleanup: Vec<Cleanup>, error: GpuError) -> Result<T> {
    if !cleanup.is_empty() {
        if let Err(e) = device.wait_idle() {
            tracing::warn!("Wait idle after failed submission: {e}");
        }
        // The submission error is the one worth reporting.
        let _ = run_all(device, cleanup);
    }
    Err(error)
}

/// Registry of in-flight submissions and their pending cleanups.
#[derive(Debug, Default)]
pub struct DeferredQueue {
    pending: HashMap<vk::Fence, Vec<Cleanup>>,
}

impl DeferredQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Submit `cmd` with a fresh fence and register `cleanup` against it.
    ///
    /// With `end_recording` the command buffer is ended first. If the
    /// submission itself fails nothing reached the GPU: the device is waited
    /// idle, the cleanups run immediately and the submission error is
    /// returned.
    pub fn submit<D: Device>(
        &mut self,
        device: &mut D,
        cmd: vk::CommandBuffer,
        end_recording: bool,
        cleanup: Vec<Cleanup>,
    ) -> Result<vk::Fence> {
        if end_recording {
            if let Err(e) = device.end_command_buffer(cmd) {
                return abandon(device, cleanup, e);
            }
        }

        let fence = match device.create_fence(false) {
            Ok(fence) => fence,
            Err(e) => return abandon(device, cleanup, e),
        };

        let submission = Submission {
            command_buffer: cmd,
            wait: &[],
            signal: &[],
            fence,
        };
        if let Err(e) = device.submit(&submission) {
            device.destroy_fence(fence);
            return abandon(device, cleanup, e);
        }

        self.pending.insert(fence, cleanup);
        Ok(fence)
    }

    /// Submit `cmd` and block until it has completed.
    ///
    /// Only meant for setup code that needs results back from the GPU.
    pub fn submit_and_wait<D: Device>(
        &mut self,
        device: &mut D,
        cmd: vk::CommandBuffer,
        end_recording: bool,
    ) -> Result<()> {
        if end_recording {
            device.end_command_buffer(cmd)?;
        }
        let fence = device.create_fence(false)?;
        let submission = Submission {
            command_buffer: cmd,
            wait: &[],
            signal: &[],
            fence,
        };
        let result = device
            .submit(&submission)
            .and_then(|()| device.wait_for_fence(fence, u64::MAX));
        device.destroy_fence(fence);
        result
    }

    /// Run the cleanups of every submission whose fence has signaled.
    ///
    /// Returns the number of completed submissions.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn poll_completed<D: Device>(&mut self, device: &mut D) -> Result<usize> {
        let mut signaled = Vec::new();
        for &fence in self.pending.keys() {
            if device.fence_signaled(fence)? {
                signaled.push(fence);
            }
        }

        let mut result = Ok(signaled.len());
        for &fence in &signaled {
            // Removed before running so a failing cleanup can never run twice.
            if let Some(cleanups) = self.pending.remove(&fence) {
                device.destroy_fence(fence);
                if let Err(e) = run_all(device, cleanups) {
                    if result.is_ok() {
                        result = Err(e);
                    }
                }
            }
        }
        result
    }

    /// Run every pending cleanup regardless of fence state.
    ///
    /// Call this during shutdown after the device is idle.
    pub fn flush<D: Device>(&mut self, device: &mut D) -> Result<()> {
        let pending: Vec<_> = self.pending.drain().collect();
        if !pending.is_empty() {
            tracing::debug!("Flushing {} deferred submissions", pending.len());
        }
        let mut result = Ok(());
        for (fence, cleanups) in pending {
            device.destroy_fence(fence);
            if let Err(e) = run_all(device, cleanups) {
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        result
    }

    /// Number of submissions whose cleanups have not run yet.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::BufferDesc;
    use crate::testing::FakeDevice;
    use gpu_allocator::MemoryLocation;

    fn buffer(device: &mut FakeDevice) -> GpuBuffer {
        device
            .create_buffer(&BufferDesc {
                size: 64,
                usage: vk::BufferUsageFlags::STORAGE_BUFFER,
                location: MemoryLocation::GpuOnly,
                alignment: 1,
                name: "test",
            })
            .unwrap()
    }

    fn submit_one(device: &mut FakeDevice, queue: &mut DeferredQueue) -> (vk::Fence, vk::Buffer) {
        let cmd = crate::memory::allocate_transient(device).unwrap();
        device
            .begin_command_buffer(cmd, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)
            .unwrap();
        let buffer = buffer(device);
        let handle = buffer.buffer;
        let fence = queue
            .submit(
                device,
                cmd,
                true,
                vec![Cleanup::FreeCommandBuffer(cmd), Cleanup::FreeBuffer(buffer)],
            )
            .unwrap();
        (fence, handle)
    }

    #[test]
    fn nothing_runs_before_signal() {
        let mut device = FakeDevice::new();
        device.set_auto_complete(false);
        let mut queue = DeferredQueue::new();

        let (_, handle) = submit_one(&mut device, &mut queue);
        assert_eq!(queue.poll_completed(&mut device).unwrap(), 0);
        assert_eq!(queue.pending_count(), 1);
        assert!(device.is_buffer_live(handle));
    }

    #[test]
    fn cleanups_run_exactly_once_in_any_signal_order() {
        // Each order is a permutation of 0..5 produced by a fixed multiplier.
        for step in [1usize, 2, 3, 4] {
            let mut device = FakeDevice::new();
            device.set_auto_complete(false);
            let mut queue = DeferredQueue::new();

            let entries: Vec<_> = (0..5).map(|_| submit_one(&mut device, &mut queue)).collect();

            for i in 0..5 {
                let (fence, handle) = entries[(i * step + 1) % 5];
                device.signal_fence(fence);
                queue.poll_completed(&mut device).unwrap();
                queue.poll_completed(&mut device).unwrap();
                assert!(!device.is_buffer_live(handle));
                assert_eq!(queue.pending_count(), 4 - i);
            }

            assert_eq!(device.double_free_count(), 0);
            assert_eq!(device.live_buffer_count(), 0);
            assert_eq!(device.live_command_buffer_count(), 0);
            assert_eq!(device.live_fence_count(), 0);
        }
    }

    #[test]
    fn submit_and_wait_leaves_no_fence_behind() {
        let mut device = FakeDevice::new();
        device.set_auto_complete(false);
        let mut queue = DeferredQueue::new();

        let cmd = crate::memory::allocate_transient(&mut device).unwrap();
        device
            .begin_command_buffer(cmd, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)
            .unwrap();
        queue.submit_and_wait(&mut device, cmd, true).unwrap();

        assert_eq!(device.submission_count(), 1);
        assert_eq!(device.live_fence_count(), 0);
        assert_eq!(queue.pending_count(), 0);
    }

    #[test]
    fn failed_submit_runs_cleanups_immediately() {
        let mut device = FakeDevice::new();
        let mut queue = DeferredQueue::new();
        let cmd = crate::memory::allocate_transient(&mut device).unwrap();
        device
            .begin_command_buffer(cmd, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)
            .unwrap();
        let buffer = buffer(&mut device);

        device.fail_next_submit(vk::Result::ERROR_DEVICE_LOST);
        let err = queue
            .submit(&mut device, cmd, true, vec![Cleanup::FreeBuffer(buffer)])
            .unwrap_err();

        assert!(matches!(err, crate::GpuError::Vulkan(vk::Result::ERROR_DEVICE_LOST)));
        assert_eq!(device.live_buffer_count(), 0);
        assert_eq!(device.live_fence_count(), 0);
        assert_eq!(queue.pending_count(), 0);
    }

    #[test]
    fn failed_submit_drains_earlier_work_before_freeing() {
        let mut device = FakeDevice::new();
        device.set_auto_complete(false);
        let mut queue = DeferredQueue::new();
        let (earlier, _) = submit_one(&mut device, &mut queue);

        let cmd = crate::memory::allocate_transient(&mut device).unwrap();
        device
            .begin_command_buffer(cmd, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)
            .unwrap();
        let input = buffer(&mut device);
        let handle = input.buffer;

        device.fail_next_submit(vk::Result::ERROR_DEVICE_LOST);
        let err = queue
            .submit(
                &mut device,
                cmd,
                true,
                vec![Cleanup::FreeBuffer(stale_buffer()), Cleanup::FreeBuffer(input)],
            )
            .unwrap_err();

        // The submission error wins over the failing cleanup.
        assert!(matches!(err, crate::GpuError::Vulkan(vk::Result::ERROR_DEVICE_LOST)));
        assert_eq!(device.idle_wait_count(), 1);
        assert!(device.fence_signaled(earlier).unwrap());
        assert!(!device.is_buffer_live(handle));
        assert_eq!(queue.pending_count(), 1);
    }

    fn stale_buffer() -> GpuBuffer {
        use ash::vk::Handle;
        GpuBuffer {
            buffer: vk::Buffer::from_raw(0xDEAD),
            size: 64,
            device_address: 0,
            offset: 0,
            host_coherent: true,
            mapped: false,
        }
    }

    #[test]
    fn failing_cleanup_does_not_skip_the_rest() {
        let mut device = FakeDevice::new();
        let mut queue = DeferredQueue::new();
        let cmd = crate::memory::allocate_transient(&mut device).unwrap();
        device
            .begin_command_buffer(cmd, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)
            .unwrap();
        let live = buffer(&mut device);
        let handle = live.buffer;

        queue
            .submit(
                &mut device,
                cmd,
                true,
                vec![
                    Cleanup::FreeBuffer(stale_buffer()),
                    Cleanup::FreeBuffer(live),
                    Cleanup::FreeCommandBuffer(cmd),
                ],
            )
            .unwrap();

        assert!(queue.poll_completed(&mut device).is_err());
        assert!(!device.is_buffer_live(handle));
        assert_eq!(device.live_command_buffer_count(), 0);
        assert_eq!(device.live_fence_count(), 0);
        assert_eq!(queue.pending_count(), 0);
    }

    #[test]
    fn flush_runs_everything() {
        let mut device = FakeDevice::new();
        device.set_auto_complete(false);
        let mut queue = DeferredQueue::new();
        for _ in 0..3 {
            submit_one(&mut device, &mut queue);
        }

        device.wait_idle().unwrap();
        queue.flush(&mut device).unwrap();
        assert_eq!(queue.pending_count(), 0);
        assert_eq!(device.live_buffer_count(), 0);
        assert_eq!(device.live_fence_count(), 0);
    }
}

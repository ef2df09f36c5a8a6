//! The per-frame driver running on the render thread.

use crate::config::AppConfig;
use crate::frame::FramePass;
use crate::lifecycle::FrameLifecycle;
use crate::window::SharedWindowState;
use ash::vk;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use voxtrace_gpu::{
    AcquireOutcome, DeferredQueue, GpuError, PresentOutcome, Presenter, Result, Submission,
};

/// What happened to one iteration of the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    /// A frame was submitted and presented.
    Rendered,
    /// The window has no area; nothing was done.
    Minimized,
    /// The swapchain went out of date before submission; the frame was
    /// dropped and the swapchain is rebuilt next iteration.
    Invalidated,
}

/// Owns the device, the frame lifecycle and the pass, and drives frames.
pub struct RenderLoop<D: Presenter, P: FramePass<D>> {
    device: D,
    deferred: DeferredQueue,
    pass: P,
    lifecycle: FrameLifecycle,
    window: Arc<SharedWindowState>,
    target_frame_time: Option<Duration>,
    frame_index: usize,
    frame_count: u64,
    start: Instant,
}

impl<D: Presenter, P: FramePass<D>> RenderLoop<D, P> {
    /// Build the swapchain and frame resources for the current window size.
    pub fn new(
        mut device: D,
        deferred: DeferredQueue,
        mut pass: P,
        window: Arc<SharedWindowState>,
        config: &AppConfig,
    ) -> Result<Self> {
        let (width, height) = window.size();
        let request = config.swapchain_request(width.max(1), height.max(1));
        let lifecycle = FrameLifecycle::new(&mut device, &mut pass, request)?;

        Ok(Self {
            device,
            deferred,
            pass,
            lifecycle,
            window,
            target_frame_time: config
                .target_fps
                .filter(|&fps| fps > 0)
                .map(|fps| Duration::from_nanos(1_000_000_000 / u64::from(fps))),
            frame_index: 0,
            frame_count: 0,
            start: Instant::now(),
        })
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    pub fn lifecycle(&self) -> &FrameLifecycle {
        &self.lifecycle
    }

    pub fn pass(&self) -> &P {
        &self.pass
    }

    /// Frame slot the next frame uses.
    pub fn frame_index(&self) -> usize {
        self.frame_index
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    /// Render one frame.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn render_frame(&mut self) -> Result<FrameOutcome> {
        let (width, height) = self.window.size();
        if width == 0 || height == 0 {
            return Ok(FrameOutcome::Minimized);
        }
        if self.lifecycle.extent() != Some(vk::Extent2D { width, height }) {
            self.lifecycle.mark_needs_recreate();
        }
        if self.lifecycle.needs_recreate() {
            self.lifecycle
                .recreate(&mut self.device, &mut self.pass, width, height)?;
            self.frame_index = 0;
        }

        let slot = self.lifecycle.sync(self.frame_index)?;
        slot.wait(&mut self.device)?;

        let swapchain = self
            .lifecycle
            .swapchain()
            .ok_or_else(|| GpuError::InvalidState("no swapchain".to_string()))?;
        let index = match self
            .device
            .acquire_next_image(swapchain, slot.image_available, u64::MAX)?
        {
            AcquireOutcome::Acquired { index, suboptimal } => {
                if suboptimal {
                    debug!("Acquired image {index} from a suboptimal swapchain");
                    self.lifecycle.mark_needs_recreate();
                }
                index
            }
            AcquireOutcome::OutOfDate => {
                warn!("Swapchain out of date on acquire");
                self.lifecycle.mark_needs_recreate();
                return Ok(FrameOutcome::Invalidated);
            }
        };

        self.lifecycle
            .claim_image(&mut self.device, index, slot.in_flight)?;
        slot.reset(&mut self.device)?;

        let extent = vk::Extent2D { width, height };
        let uniforms = self
            .pass
            .uniforms(extent, self.start.elapsed().as_secs_f32());
        if !uniforms.is_empty() {
            self.lifecycle
                .write_uniforms(&mut self.device, index, &uniforms)?;
        }

        // Render completion is signalled per image: the presentation engine
        // may still hold the semaphore of a slot that is already reused.
        let render_finished = self.lifecycle.sync(index as usize)?.render_finished;
        let wait = [(slot.image_available, self.pass.wait_stage())];
        let signal = [render_finished];
        self.device.submit(&Submission {
            command_buffer: self.lifecycle.command_buffer(index)?,
            wait: &wait,
            signal: &signal,
            fence: slot.in_flight,
        })?;

        let swapchain = self
            .lifecycle
            .swapchain()
            .ok_or_else(|| GpuError::InvalidState("no swapchain".to_string()))?;
        match self.device.present(swapchain, index, render_finished)? {
            PresentOutcome::Presented => {}
            PresentOutcome::Suboptimal => {
                debug!("Presented to a suboptimal swapchain");
                self.lifecycle.mark_needs_recreate();
            }
            PresentOutcome::OutOfDate => {
                warn!("Swapchain out of date on present");
                self.lifecycle.mark_needs_recreate();
            }
        }

        self.deferred.poll_completed(&mut self.device)?;
        self.frame_index = (self.frame_index + 1) % self.lifecycle.image_count().max(1);
        self.frame_count += 1;
        Ok(FrameOutcome::Rendered)
    }

    /// Render until the window asks to close, then tear down.
    pub fn run(mut self) -> Result<D> {
        info!("Render loop started");
        let mut minimized = false;
        while !self.window.close_requested() {
            let frame_start = Instant::now();
            match self.render_frame() {
                Ok(FrameOutcome::Minimized) => {
                    if !minimized {
                        debug!("Window minimized, pausing rendering");
                    }
                    minimized = true;
                    std::thread::sleep(Duration::from_millis(10));
                    continue;
                }
                Ok(_) => minimized = false,
                Err(e) => {
                    if let Err(cleanup) = self.teardown() {
                        warn!("Teardown after render error failed: {cleanup}");
                    }
                    return Err(e);
                }
            }

            if let Some(target) = self.target_frame_time {
                let elapsed = frame_start.elapsed();
                if elapsed < target {
                    std::thread::sleep(target - elapsed);
                }
            }
        }
        self.shutdown()
    }

    /// Wait for the device, run every deferred cleanup and destroy the pass
    /// and the frame resources. Returns the device.
    pub fn shutdown(mut self) -> Result<D> {
        let elapsed = self.start.elapsed().as_secs_f64();
        if self.frame_count > 0 && elapsed > 0.0 {
            info!(
                "Rendered {} frames, {:.1} fps average",
                self.frame_count,
                self.frame_count as f64 / elapsed
            );
        }
        self.teardown()?;
        Ok(self.device)
    }

    fn teardown(&mut self) -> Result<()> {
        self.device.wait_idle()?;
        self.deferred.flush(&mut self.device)?;
        self.pass.destroy(&mut self.device)?;
        self.lifecycle.destroy(&mut self.device)?;
        info!("Render loop shut down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_pass::MarkerPass;
    use voxtrace_gpu::testing::FakeDevice;

    fn render_loop(device: FakeDevice, width: u32, height: u32) -> RenderLoop<FakeDevice, MarkerPass> {
        let window = Arc::new(SharedWindowState::new(width, height));
        RenderLoop::new(
            device,
            DeferredQueue::new(),
            MarkerPass::default(),
            window,
            &AppConfig::default(),
        )
        .unwrap()
    }

    #[test]
    fn frames_cycle_through_slots() {
        let mut frames = render_loop(FakeDevice::new(), 640, 480);

        for expected in [1, 2, 0, 1] {
            assert_eq!(frames.render_frame().unwrap(), FrameOutcome::Rendered);
            assert_eq!(frames.frame_index(), expected);
        }
        assert_eq!(frames.frame_count(), 4);
        assert_eq!(frames.device().acquired_images(), &[0, 1, 2, 0]);
        assert_eq!(frames.device().submission_count(), 4);
        assert_eq!(frames.pass().uniform_frames, 4);
    }

    #[test]
    fn frames_in_flight_never_exceed_image_count() {
        let mut device = FakeDevice::new();
        device.set_auto_complete(false);
        let mut frames = render_loop(device, 640, 480);
        let images = frames.lifecycle().image_count();

        for _ in 0..20 {
            assert_eq!(frames.render_frame().unwrap(), FrameOutcome::Rendered);
        }
        assert_eq!(frames.device().submission_count(), 20);
        assert!(frames.device().max_pending_submissions() <= images);
        assert_eq!(frames.device().max_pending_submissions(), images);
    }

    #[test]
    fn submission_waits_on_acquire_and_signals_per_image() {
        let mut frames = render_loop(FakeDevice::new(), 640, 480);
        frames.render_frame().unwrap();

        let slot = frames.lifecycle().sync(0).unwrap();
        let submitted = frames.device().submissions()[0].clone();
        assert_eq!(submitted.wait, vec![slot.image_available]);
        assert_eq!(submitted.signal, vec![slot.render_finished]);
        assert_eq!(submitted.fence, slot.in_flight);
        assert_eq!(submitted.command_buffer, frames.lifecycle().command_buffer(0).unwrap());
    }

    #[test]
    fn uniforms_go_to_the_acquired_image() {
        let mut device = FakeDevice::new();
        device.queue_acquire(AcquireOutcome::Acquired {
            index: 2,
            suboptimal: false,
        });
        let mut frames = render_loop(device, 640, 480);
        frames.render_frame().unwrap();

        let set = frames.lifecycle().descriptor_sets()[2];
        let ubo = frames
            .device()
            .descriptor_writes(set)
            .iter()
            .find_map(|write| match write.resource {
                voxtrace_gpu::DescriptorResource::UniformBuffer { buffer, .. } => Some(buffer),
                _ => None,
            })
            .unwrap();
        assert_eq!(&frames.device().buffer_contents(ubo)[..16], &[1u8; 16]);
    }

    #[test]
    fn out_of_date_present_recreates_and_restarts_at_slot_zero() {
        let mut device = FakeDevice::new();
        device.queue_present(PresentOutcome::Presented);
        device.queue_present(PresentOutcome::OutOfDate);
        let mut frames = render_loop(device, 640, 480);
        let old_views = frames.lifecycle().swapchain().unwrap().image_views.clone();

        frames.render_frame().unwrap();
        frames.render_frame().unwrap();
        assert_eq!(frames.frame_index(), 2);
        assert!(frames.lifecycle().needs_recreate());

        assert_eq!(frames.render_frame().unwrap(), FrameOutcome::Rendered);
        assert_eq!(frames.frame_index(), 1);
        assert_eq!(frames.device().destroyed_image_views(), old_views.as_slice());
        assert_eq!(frames.device().live_swapchain_count(), 1);
        // The first frame after the rebuild used slot 0 of the new swapchain.
        let slot = frames.lifecycle().sync(0).unwrap();
        assert_eq!(frames.device().submissions().last().unwrap().fence, slot.in_flight);
    }

    #[test]
    fn out_of_date_acquire_skips_the_frame() {
        let mut device = FakeDevice::new();
        device.queue_acquire(AcquireOutcome::OutOfDate);
        let mut frames = render_loop(device, 640, 480);

        assert_eq!(frames.render_frame().unwrap(), FrameOutcome::Invalidated);
        assert_eq!(frames.device().submission_count(), 0);
        assert_eq!(frames.frame_index(), 0);

        assert_eq!(frames.render_frame().unwrap(), FrameOutcome::Rendered);
        assert_eq!(frames.device().swapchain_requests().len(), 2);
    }

    #[test]
    fn resize_rebuilds_with_the_window_size() {
        let window = Arc::new(SharedWindowState::new(640, 480));
        let mut frames = RenderLoop::new(
            FakeDevice::new(),
            DeferredQueue::new(),
            MarkerPass::default(),
            Arc::clone(&window),
            &AppConfig::default(),
        )
        .unwrap();
        frames.render_frame().unwrap();

        window.set_size(1024, 768);
        frames.render_frame().unwrap();

        assert_eq!(
            frames.lifecycle().extent(),
            Some(vk::Extent2D {
                width: 1024,
                height: 768
            })
        );
        assert_eq!(frames.frame_index(), 1);
        assert_eq!(frames.device().idle_wait_count(), 1);
    }

    #[test]
    fn minimized_window_renders_nothing() {
        let window = Arc::new(SharedWindowState::new(640, 480));
        let mut frames = RenderLoop::new(
            FakeDevice::new(),
            DeferredQueue::new(),
            MarkerPass::default(),
            Arc::clone(&window),
            &AppConfig::default(),
        )
        .unwrap();

        window.set_size(0, 0);
        assert_eq!(frames.render_frame().unwrap(), FrameOutcome::Minimized);
        assert_eq!(frames.device().submission_count(), 0);
        assert!(frames.device().acquired_images().is_empty());
    }

    #[test]
    fn run_exits_on_close_and_tears_everything_down() {
        let window = Arc::new(SharedWindowState::new(640, 480));
        window.request_close();
        let mut device = FakeDevice::new();
        device.set_auto_complete(false);
        let frames = RenderLoop::new(
            device,
            DeferredQueue::new(),
            MarkerPass::default(),
            window,
            &AppConfig::default(),
        )
        .unwrap();

        let device = frames.run().unwrap();
        assert_eq!(device.submission_count(), 0);
        assert_eq!(device.live_swapchain_count(), 0);
        assert_eq!(device.live_image_view_count(), 0);
        assert_eq!(device.live_command_buffer_count(), 0);
        assert_eq!(device.live_fence_count(), 0);
        assert_eq!(device.live_semaphore_count(), 0);
        assert_eq!(device.live_buffer_count(), 0);
        assert_eq!(device.live_descriptor_pool_count(), 0);
    }

    #[test]
    fn shutdown_after_frames_leaves_nothing_live() {
        let mut device = FakeDevice::new();
        device.set_auto_complete(false);
        let mut frames = render_loop(device, 640, 480);
        for _ in 0..5 {
            frames.render_frame().unwrap();
        }

        let device = frames.shutdown().unwrap();
        assert_eq!(device.live_fence_count(), 0);
        assert_eq!(device.live_semaphore_count(), 0);
        assert_eq!(device.live_buffer_count(), 0);
        assert_eq!(device.live_command_buffer_count(), 0);
        assert_eq!(device.double_free_count(), 0);
    }
}

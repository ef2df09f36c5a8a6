//! Swapchain and per-image frame resources.
//!
//! Everything whose shape depends on the swapchain is owned here and
//! rebuilt as one unit: descriptor sets, pre-recorded command buffers,
//! uniform buffers and synchronization objects.

use crate::frame::{FrameImage, FramePass};
use ash::vk;
use tracing::{info, warn};
use voxtrace_gpu::{
    CommandPoolKind, DescriptorWrite, Device, FrameSync, GpuError, Presenter, Result, Swapchain,
    SwapchainRequest, UniformBuffers,
};

/// Where a [`FrameLifecycle`] is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Building,
    Valid,
    NeedsRecreate,
    Destroyed,
}

#[derive(Debug, Default)]
struct FrameResources {
    descriptor_pool: Option<vk::DescriptorPool>,
    descriptor_sets: Vec<vk::DescriptorSet>,
    command_buffers: Vec<vk::CommandBuffer>,
    uniforms: Option<UniformBuffers>,
    /// Indexed by frame slot for acquire and fence, by image for render
    /// completion; there is one slot per image.
    sync: Vec<FrameSync>,
    /// Fence of the submission that last used each image.
    images_in_flight: Vec<Option<vk::Fence>>,
}

impl FrameResources {
    fn destroy<D: Device>(self, device: &mut D) -> Result<()> {
        for sync in self.sync {
            sync.destroy(device);
        }
        if !self.command_buffers.is_empty() {
            device.free_command_buffers(CommandPoolKind::Frame, &self.command_buffers);
        }
        if let Some(pool) = self.descriptor_pool {
            device.destroy_descriptor_pool(pool);
        }
        if let Some(uniforms) = self.uniforms {
            uniforms.destroy(device)?;
        }
        Ok(())
    }
}

/// The swapchain and everything rebuilt with it.
#[derive(Debug)]
pub struct FrameLifecycle {
    state: LifecycleState,
    request: SwapchainRequest,
    swapchain: Option<Swapchain>,
    resources: FrameResources,
}

impl FrameLifecycle {
    /// Create the swapchain and the frame resources of `pass`.
    pub fn new<D, P>(device: &mut D, pass: &mut P, request: SwapchainRequest) -> Result<Self>
    where
        D: Presenter,
        P: FramePass<D>,
    {
        let mut lifecycle = Self {
            state: LifecycleState::Building,
            request,
            swapchain: None,
            resources: FrameResources::default(),
        };
        if let Err(e) = lifecycle.rebuild(device, pass) {
            if let Err(cleanup) = lifecycle.destroy(device) {
                warn!("Cleanup after failed frame setup failed: {cleanup}");
            }
            return Err(e);
        }
        Ok(lifecycle)
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn swapchain(&self) -> Option<&Swapchain> {
        self.swapchain.as_ref()
    }

    pub fn extent(&self) -> Option<vk::Extent2D> {
        self.swapchain.as_ref().map(|swapchain| swapchain.extent)
    }

    pub fn image_count(&self) -> usize {
        self.swapchain.as_ref().map_or(0, Swapchain::image_count)
    }

    pub fn needs_recreate(&self) -> bool {
        self.state == LifecycleState::NeedsRecreate
    }

    /// Schedule a rebuild before the next frame.
    pub fn mark_needs_recreate(&mut self) {
        if self.state == LifecycleState::Valid {
            self.state = LifecycleState::NeedsRecreate;
        }
    }

    /// Rebuild for a framebuffer of `width` × `height`.
    ///
    /// Waits for the device to go idle first. The old swapchain is handed to
    /// the new one's creation and destroyed afterwards.
    pub fn recreate<D, P>(&mut self, device: &mut D, pass: &mut P, width: u32, height: u32) -> Result<()>
    where
        D: Presenter,
        P: FramePass<D>,
    {
        if self.state == LifecycleState::Destroyed {
            return Err(GpuError::InvalidState("frame lifecycle is destroyed".to_string()));
        }
        self.request.width = width;
        self.request.height = height;
        device.wait_idle()?;
        self.rebuild(device, pass)
    }

    fn rebuild<D, P>(&mut self, device: &mut D, pass: &mut P) -> Result<()>
    where
        D: Presenter,
        P: FramePass<D>,
    {
        self.state = LifecycleState::Building;
        std::mem::take(&mut self.resources).destroy(device)?;

        let old = self.swapchain.take();
        let created = device.create_swapchain(&self.request, old.as_ref());
        if let Some(old) = old {
            device.destroy_swapchain(old);
        }
        let swapchain = match created {
            Ok(swapchain) => swapchain,
            Err(e) => {
                self.state = LifecycleState::NeedsRecreate;
                return Err(e);
            }
        };
        info!(
            "Swapchain created: {}x{} ({} images)",
            swapchain.extent.width,
            swapchain.extent.height,
            swapchain.image_count()
        );

        let built = build_resources(device, pass, &swapchain);
        self.swapchain = Some(swapchain);
        match built {
            Ok(resources) => {
                self.resources = resources;
                self.state = LifecycleState::Valid;
                Ok(())
            }
            Err(e) => {
                self.state = LifecycleState::NeedsRecreate;
                Err(e)
            }
        }
    }

    /// Synchronization objects of frame slot `slot`.
    pub fn sync(&self, slot: usize) -> Result<FrameSync> {
        self.resources
            .sync
            .get(slot)
            .copied()
            .ok_or_else(|| GpuError::InvalidState(format!("no frame slot {slot}")))
    }

    /// The pre-recorded command buffer of image `index`.
    pub fn command_buffer(&self, index: u32) -> Result<vk::CommandBuffer> {
        self.resources
            .command_buffers
            .get(index as usize)
            .copied()
            .ok_or_else(|| GpuError::InvalidState(format!("no command buffer for image {index}")))
    }

    pub fn descriptor_sets(&self) -> &[vk::DescriptorSet] {
        &self.resources.descriptor_sets
    }

    /// Wait until image `index` is no longer used by another slot's
    /// submission, then hand it to `fence`.
    pub fn claim_image<D: Device>(&mut self, device: &mut D, index: u32, fence: vk::Fence) -> Result<()> {
        let slot = self
            .resources
            .images_in_flight
            .get_mut(index as usize)
            .ok_or_else(|| GpuError::InvalidState(format!("image {index} out of range")))?;
        if let Some(previous) = *slot {
            if previous != fence {
                device.wait_for_fence(previous, u64::MAX)?;
            }
        }
        *slot = Some(fence);
        Ok(())
    }

    /// Write the uniforms read by image `index`.
    pub fn write_uniforms<D: Device>(&self, device: &mut D, index: u32, data: &[u8]) -> Result<()> {
        match &self.resources.uniforms {
            Some(uniforms) => uniforms.write(device, index as usize, data),
            None => Err(GpuError::InvalidState("pass declared no uniform buffer".to_string())),
        }
    }

    /// Destroy everything without rebuilding. The device must be idle.
    pub fn destroy<D: Presenter>(&mut self, device: &mut D) -> Result<()> {
        self.state = LifecycleState::Destroyed;
        std::mem::take(&mut self.resources).destroy(device)?;
        if let Some(swapchain) = self.swapchain.take() {
            device.destroy_swapchain(swapchain);
        }
        Ok(())
    }
}

fn build_resources<D, P>(device: &mut D, pass: &mut P, swapchain: &Swapchain) -> Result<FrameResources>
where
    D: Device,
    P: FramePass<D>,
{
    let mut resources = FrameResources::default();
    match fill_resources(device, pass, swapchain, &mut resources) {
        Ok(()) => Ok(resources),
        Err(e) => {
            if let Err(cleanup) = resources.destroy(device) {
                warn!("Cleanup of partial frame resources failed: {cleanup}");
            }
            Err(e)
        }
    }
}

fn fill_resources<D, P>(
    device: &mut D,
    pass: &mut P,
    swapchain: &Swapchain,
    resources: &mut FrameResources,
) -> Result<()>
where
    D: Device,
    P: FramePass<D>,
{
    let count = swapchain.image_count();
    let count_u32 = u32::try_from(count)
        .map_err(|_| GpuError::InvalidState(format!("{count} swapchain images")))?;
    let images: Vec<FrameImage> = (0..count_u32)
        .zip(swapchain.images.iter().zip(&swapchain.image_views))
        .map(|(index, (&image, &view))| FrameImage {
            index,
            image,
            view,
            format: swapchain.format,
            extent: swapchain.extent,
        })
        .collect();

    let uniform_size = pass.uniform_size();
    if uniform_size > 0 {
        resources.uniforms = Some(UniformBuffers::new(device, count, uniform_size)?);
    }

    let writes: Vec<Vec<DescriptorWrite>> = images
        .iter()
        .map(|image| {
            let uniforms = resources
                .uniforms
                .as_ref()
                .and_then(|uniforms| uniforms.get(image.index as usize));
            pass.descriptor_writes(image, uniforms)
        })
        .collect();
    if writes.iter().any(|set| !set.is_empty()) {
        let (pool, sets) = device.create_descriptor_sets(pass.descriptor_set_layout(), &writes)?;
        resources.descriptor_pool = Some(pool);
        resources.descriptor_sets = sets;
    } else {
        resources.descriptor_sets = vec![vk::DescriptorSet::null(); count];
    }

    for _ in 0..count {
        resources.sync.push(FrameSync::new(device)?);
    }
    resources.images_in_flight = vec![None; count];

    resources.command_buffers = device.allocate_command_buffers(CommandPoolKind::Frame, count_u32)?;
    let commands = resources.command_buffers.clone();
    for ((image, cmd), set) in images.iter().zip(commands).zip(resources.descriptor_sets.clone()) {
        device.begin_command_buffer(cmd, vk::CommandBufferUsageFlags::empty())?;
        pass.record(device, cmd, image, set)?;
        device.end_command_buffer(cmd)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_pass::MarkerPass;
    use voxtrace_gpu::testing::{FakeDevice, RecordedCommand};
    use voxtrace_gpu::DescriptorResource;

    fn request(width: u32, height: u32) -> SwapchainRequest {
        SwapchainRequest {
            width,
            height,
            preferred_image_count: 3,
            vsync: false,
        }
    }

    #[test]
    fn builds_one_of_everything_per_image() {
        let mut device = FakeDevice::new();
        let mut pass = MarkerPass::default();
        let lifecycle = FrameLifecycle::new(&mut device, &mut pass, request(640, 480)).unwrap();

        assert_eq!(lifecycle.state(), LifecycleState::Valid);
        assert_eq!(lifecycle.image_count(), 3);
        assert_eq!(
            lifecycle.extent(),
            Some(vk::Extent2D {
                width: 640,
                height: 480
            })
        );
        assert_eq!(device.live_descriptor_pool_count(), 1);
        assert_eq!(device.live_command_buffer_count(), 3);
        assert_eq!(device.live_fence_count(), 3);
        assert_eq!(device.live_semaphore_count(), 6);
        assert_eq!(device.live_buffer_count(), 3);

        let swapchain = lifecycle.swapchain().unwrap();
        for (i, &set) in lifecycle.descriptor_sets().iter().enumerate() {
            let writes = device.descriptor_writes(set);
            assert_eq!(
                writes[0].resource,
                DescriptorResource::StorageImage(swapchain.image_views[i])
            );
            let cmd = lifecycle.command_buffer(i as u32).unwrap();
            assert_eq!(
                device.recorded(cmd),
                vec![RecordedCommand::Marker(format!("draw image {i}"))]
            );
        }
    }

    #[test]
    fn image_count_follows_surface_limits() {
        let mut device = FakeDevice::new();
        device.set_surface_image_counts(4, 6);
        let mut pass = MarkerPass::default();
        let lifecycle = FrameLifecycle::new(&mut device, &mut pass, request(64, 64)).unwrap();
        assert_eq!(lifecycle.image_count(), 4);

        let mut device = FakeDevice::new();
        device.set_surface_image_counts(1, 2);
        let lifecycle = FrameLifecycle::new(&mut device, &mut pass, request(64, 64)).unwrap();
        assert_eq!(lifecycle.image_count(), 2);
    }

    #[test]
    fn recreate_hands_over_and_destroys_the_old_swapchain() {
        let mut device = FakeDevice::new();
        let mut pass = MarkerPass::default();
        let mut lifecycle = FrameLifecycle::new(&mut device, &mut pass, request(640, 480)).unwrap();
        let old = lifecycle.swapchain().unwrap().swapchain;
        let old_views = lifecycle.swapchain().unwrap().image_views.clone();

        lifecycle.mark_needs_recreate();
        assert!(lifecycle.needs_recreate());
        lifecycle.recreate(&mut device, &mut pass, 800, 600).unwrap();

        assert_eq!(lifecycle.state(), LifecycleState::Valid);
        let (last_request, handed_over) = device.swapchain_requests().last().copied().unwrap();
        assert_eq!(handed_over, Some(old));
        assert_eq!((last_request.width, last_request.height), (800, 600));
        assert_eq!(device.destroyed_image_views(), old_views.as_slice());
        assert_eq!(device.live_swapchain_count(), 1);
        assert_eq!(device.live_image_view_count(), 3);
        assert_eq!(device.live_descriptor_pool_count(), 1);
        assert_eq!(device.live_fence_count(), 3);
        assert_eq!(device.idle_wait_count(), 1);
        assert_eq!(pass.recorded, 6);
    }

    #[test]
    fn claim_waits_for_the_previous_user_of_an_image() {
        let mut device = FakeDevice::new();
        device.set_auto_complete(false);
        let mut pass = MarkerPass::default();
        let mut lifecycle = FrameLifecycle::new(&mut device, &mut pass, request(64, 64)).unwrap();

        let first = lifecycle.sync(0).unwrap().in_flight;
        let second = lifecycle.sync(1).unwrap().in_flight;
        lifecycle.claim_image(&mut device, 2, first).unwrap();
        // Claiming again with the same fence does not wait on it.
        lifecycle.claim_image(&mut device, 2, first).unwrap();
        lifecycle.claim_image(&mut device, 2, second).unwrap();
        assert!(lifecycle.claim_image(&mut device, 3, first).is_err());
    }

    #[test]
    fn passes_without_bindings_get_null_sets() {
        let mut device = FakeDevice::new();
        let mut pass = MarkerPass {
            uniform_size: 0,
            bind_image: false,
            ..MarkerPass::default()
        };
        let lifecycle = FrameLifecycle::new(&mut device, &mut pass, request(64, 64)).unwrap();

        assert_eq!(device.live_descriptor_pool_count(), 0);
        assert!(lifecycle
            .descriptor_sets()
            .iter()
            .all(|&set| set == vk::DescriptorSet::null()));
        assert!(lifecycle.write_uniforms(&mut device, 0, &[1, 2, 3]).is_err());
    }

    #[test]
    fn destroy_leaves_nothing_behind() {
        let mut device = FakeDevice::new();
        let mut pass = MarkerPass::default();
        let mut lifecycle = FrameLifecycle::new(&mut device, &mut pass, request(64, 64)).unwrap();

        lifecycle.destroy(&mut device).unwrap();
        assert_eq!(lifecycle.state(), LifecycleState::Destroyed);
        assert_eq!(device.live_swapchain_count(), 0);
        assert_eq!(device.live_image_view_count(), 0);
        assert_eq!(device.live_command_buffer_count(), 0);
        assert_eq!(device.live_fence_count(), 0);
        assert_eq!(device.live_semaphore_count(), 0);
        assert_eq!(device.live_descriptor_pool_count(), 0);
        assert_eq!(device.live_buffer_count(), 0);
        assert!(lifecycle.recreate(&mut device, &mut pass, 64, 64).is_err());
    }
}

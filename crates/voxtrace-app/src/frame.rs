//! What the render loop needs from the code that draws a frame.

use ash::vk;
use voxtrace_gpu::{DescriptorWrite, Device, GpuBuffer, Result};

/// One swapchain image as seen by a [`FramePass`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameImage {
    pub index: u32,
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
}

/// Per-image rendering work.
///
/// Command buffers are recorded once per swapchain (re)creation, one per
/// image, and resubmitted every frame. Anything that changes per frame goes
/// through [`FramePass::uniforms`].
pub trait FramePass<D: Device> {
    /// Layout of the per-image descriptor set; null when the pass binds none.
    fn descriptor_set_layout(&self) -> vk::DescriptorSetLayout;

    /// Size of the per-image uniform buffer; zero for none.
    fn uniform_size(&self) -> u64 {
        0
    }

    /// Stage the submission waits in for the acquired image.
    fn wait_stage(&self) -> vk::PipelineStageFlags {
        vk::PipelineStageFlags::ALL_COMMANDS
    }

    /// Descriptor writes of the set for `image`.
    fn descriptor_writes(&self, image: &FrameImage, uniforms: Option<&GpuBuffer>) -> Vec<DescriptorWrite>;

    /// Record the commands drawing into `image`.
    fn record(
        &mut self,
        device: &mut D,
        cmd: vk::CommandBuffer,
        image: &FrameImage,
        set: vk::DescriptorSet,
    ) -> Result<()>;

    /// Uniform bytes for the next frame, `elapsed` seconds into the run.
    #[allow(unused_variables)]
    fn uniforms(&mut self, extent: vk::Extent2D, elapsed: f32) -> Vec<u8> {
        Vec::new()
    }

    /// Release everything the pass owns. The device is idle.
    fn destroy(&mut self, device: &mut D) -> Result<()>;
}

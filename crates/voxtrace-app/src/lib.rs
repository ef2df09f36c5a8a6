//! Window, frame lifecycle and render loop for the voxtrace demos.
//!
//! The window event loop runs on the main thread and only publishes the
//! framebuffer size and a close flag. A render thread owns the device and
//! drives frames through a [`RenderLoop`]: pre-recorded command buffers per
//! swapchain image, one fence per frame slot, and swapchain recreation when
//! the window changes or the swapchain goes out of date.
//!
//! # Example
//!
//! ```no_run
//! use voxtrace_app::{run, AppConfig};
//! # use voxtrace_app::{FrameImage, FramePass};
//! # use voxtrace_gpu::{DeferredQueue, DescriptorWrite, GpuBuffer, VulkanDevice};
//! # use ash::vk;
//! # struct Clear;
//! # impl FramePass<VulkanDevice> for Clear {
//! #     fn descriptor_set_layout(&self) -> vk::DescriptorSetLayout { vk::DescriptorSetLayout::null() }
//! #     fn descriptor_writes(&self, _: &FrameImage, _: Option<&GpuBuffer>) -> Vec<DescriptorWrite> { Vec::new() }
//! #     fn record(&mut self, _: &mut VulkanDevice, _: vk::CommandBuffer, _: &FrameImage, _: vk::DescriptorSet) -> voxtrace_gpu::Result<()> { Ok(()) }
//! #     fn destroy(&mut self, _: &mut VulkanDevice) -> voxtrace_gpu::Result<()> { Ok(()) }
//! # }
//!
//! fn main() -> anyhow::Result<()> {
//!     run(
//!         AppConfig::new("clear"),
//!         Box::new(|_: &mut VulkanDevice, _: &mut DeferredQueue| Ok(Clear)),
//!     )
//! }
//! ```

mod config;
mod frame;
mod lifecycle;
mod render_loop;
mod runner;
#[cfg(test)]
mod test_pass;
mod window;

pub use config::AppConfig;
pub use frame::{FrameImage, FramePass};
pub use lifecycle::{FrameLifecycle, LifecycleState};
pub use render_loop::{FrameOutcome, RenderLoop};
pub use runner::{init_logging, run, PassSetup};
pub use window::SharedWindowState;

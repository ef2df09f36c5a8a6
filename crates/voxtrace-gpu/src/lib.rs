//! Vulkan layer for the voxtrace renderer.
//!
//! This crate provides:
//! - Vulkan instance and device management
//! - GPU capability detection
//! - Buffer allocation via gpu-allocator, with staged uploads
//! - Fence-gated deferred cleanup and shared buffers
//! - Compute and ray tracing pipelines, shader binding tables
//! - Swapchain handling
//!
//! Everything above instance creation is written against the [`Device`] and
//! [`Presenter`] traits, which [`VulkanDevice`] implements.

pub mod allocator;
pub mod backend;
pub mod capabilities;
pub mod command;
pub mod context;
pub mod deferred;
pub mod descriptors;
pub mod device;
pub mod error;
pub mod instance;
pub mod memory;
pub mod pipeline;
pub mod ray_tracing;
pub mod rc;
pub mod sbt;
pub mod surface;
pub mod swapchain;
pub mod sync;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use allocator::GpuAllocator;
pub use backend::{
    AcquireOutcome, BuildCommand, BuildSizes, CommandPoolKind, Device, DeviceLimits,
    GeometryDesc, MemoryBarrier, PresentOutcome, Presenter, Submission,
};
pub use capabilities::GpuCapabilities;
pub use context::{GpuContext, GpuContextBuilder};
pub use deferred::{Cleanup, DeferredQueue};
pub use descriptors::{DescriptorResource, DescriptorSetLayoutBuilder, DescriptorWrite};
pub use device::VulkanDevice;
pub use error::{GpuError, Result};
pub use memory::{
    create_buffer, create_buffer_with, round_up_to_multiple, BufferDesc, BufferRequest,
    GpuBuffer, UniformBuffers,
};
pub use pipeline::ComputePipeline;
pub use ray_tracing::{RayTracingPipeline, RayTracingShaders};
pub use rc::RcBuffer;
pub use sbt::{SbtLayout, ShaderBindingTable};
pub use surface::{SurfaceCapabilities, SurfaceContext};
pub use swapchain::{Swapchain, SwapchainRequest};
pub use sync::FrameSync;

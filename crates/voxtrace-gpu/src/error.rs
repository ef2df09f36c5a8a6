//! GPU error types.

use ash::vk;
use thiserror::Error;

/// GPU-related errors.
#[derive(Error, Debug)]
pub enum GpuError {
    #[error("Vulkan error: {0:?}")]
    Vulkan(#[from] vk::Result),

    #[error("No suitable GPU found")]
    NoSuitableDevice,

    #[error("Required extension not supported: {0}")]
    ExtensionNotSupported(String),

    #[error("Required feature not supported: {0}")]
    FeatureNotSupported(String),

    #[error("Memory allocation failed: {0}")]
    AllocationFailed(String),

    #[error("Surface creation failed: {0}")]
    SurfaceCreation(String),

    #[error("Swapchain creation failed: {0}")]
    SwapchainCreation(String),

    #[error("Shader compilation failed: {0}")]
    ShaderCompilation(String),

    #[error("Pipeline creation failed: {0}")]
    PipelineCreation(String),

    #[error("{what} {address:#x} is not aligned to {alignment} bytes")]
    Alignment {
        what: &'static str,
        address: u64,
        alignment: u64,
    },

    #[error("{what} of {requested} exceeds the device limit of {limit}")]
    LimitExceeded {
        what: &'static str,
        requested: u64,
        limit: u64,
    },

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("{0}")]
    Other(String),
}

impl GpuError {
    /// Whether the error reports an out-of-date swapchain.
    pub fn is_out_of_date(&self) -> bool {
        matches!(self, Self::Vulkan(vk::Result::ERROR_OUT_OF_DATE_KHR))
    }
}

/// Result type for GPU operations.
pub type Result<T> = std::result::Result<T, GpuError>;

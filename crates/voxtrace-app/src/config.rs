//! Application configuration.

use voxtrace_gpu::SwapchainRequest;

/// Application configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Window title.
    pub title: String,
    /// Initial window width.
    pub width: u32,
    /// Initial window height.
    pub height: u32,
    /// Target frames per second (None for unlimited).
    pub target_fps: Option<u32>,
    /// Enable vsync.
    pub vsync: bool,
    /// Enable Vulkan validation layers (default: debug builds only).
    pub validation: bool,
    /// Swapchain images to ask for; the surface limits still apply.
    pub preferred_image_count: u32,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            title: "voxtrace".to_string(),
            width: 1280,
            height: 720,
            target_fps: None,
            vsync: false,
            validation: cfg!(debug_assertions),
            preferred_image_count: 3,
        }
    }
}

impl AppConfig {
    /// Create a new config with the given title.
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Default::default()
        }
    }

    /// Set the window dimensions.
    #[must_use]
    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    /// Set the target FPS.
    #[must_use]
    pub fn with_target_fps(mut self, fps: u32) -> Self {
        self.target_fps = Some(fps);
        self
    }

    /// Enable or disable vsync.
    #[must_use]
    pub fn with_vsync(mut self, vsync: bool) -> Self {
        self.vsync = vsync;
        self
    }

    /// Enable or disable validation layers.
    #[must_use]
    pub fn with_validation(mut self, validation: bool) -> Self {
        self.validation = validation;
        self
    }

    #[must_use]
    pub fn with_image_count(mut self, count: u32) -> Self {
        self.preferred_image_count = count;
        self
    }

    /// The swapchain request for a framebuffer of `width` × `height`.
    pub fn swapchain_request(&self, width: u32, height: u32) -> SwapchainRequest {
        SwapchainRequest {
            width,
            height,
            preferred_image_count: self.preferred_image_count,
            vsync: self.vsync,
        }
    }
}

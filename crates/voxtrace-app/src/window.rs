//! State shared between the event loop and the render thread.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

/// Close flag and framebuffer size, written by the window thread and read
/// by the render thread.
#[derive(Debug)]
pub struct SharedWindowState {
    close_requested: AtomicBool,
    size: Mutex<(u32, u32)>,
}

impl SharedWindowState {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            close_requested: AtomicBool::new(false),
            size: Mutex::new((width, height)),
        }
    }

    pub fn request_close(&self) {
        self.close_requested.store(true, Ordering::Release);
    }

    pub fn close_requested(&self) -> bool {
        self.close_requested.load(Ordering::Acquire)
    }

    /// Framebuffer size in pixels. Zero while minimized.
    pub fn size(&self) -> (u32, u32) {
        *self.size.lock()
    }

    pub fn set_size(&self, width: u32, height: u32) {
        *self.size.lock() = (width, height);
    }

    pub fn is_minimized(&self) -> bool {
        let (width, height) = self.size();
        width == 0 || height == 0
    }
}

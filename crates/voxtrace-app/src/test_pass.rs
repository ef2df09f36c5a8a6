//! A [`FramePass`] over the fake device that records markers.

use crate::frame::{FrameImage, FramePass};
use ash::vk::{self, Handle};
use voxtrace_gpu::testing::FakeDevice;
use voxtrace_gpu::{DescriptorResource, DescriptorWrite, GpuBuffer, Result};

pub(crate) struct MarkerPass {
    pub uniform_size: u64,
    pub bind_image: bool,
    pub recorded: usize,
    pub uniform_frames: usize,
    pub destroyed: bool,
}

impl Default for MarkerPass {
    fn default() -> Self {
        Self {
            uniform_size: 64,
            bind_image: true,
            recorded: 0,
            uniform_frames: 0,
            destroyed: false,
        }
    }
}

impl FramePass<FakeDevice> for MarkerPass {
    fn descriptor_set_layout(&self) -> vk::DescriptorSetLayout {
        vk::DescriptorSetLayout::from_raw(0xD5)
    }

    fn uniform_size(&self) -> u64 {
        self.uniform_size
    }

    fn descriptor_writes(&self, image: &FrameImage, uniforms: Option<&GpuBuffer>) -> Vec<DescriptorWrite> {
        let mut writes = Vec::new();
        if self.bind_image {
            writes.push(DescriptorWrite::new(0, DescriptorResource::StorageImage(image.view)));
        }
        if let Some(buffer) = uniforms {
            writes.push(DescriptorWrite::new(
                1,
                DescriptorResource::UniformBuffer {
                    buffer: buffer.buffer,
                    range: buffer.size,
                },
            ));
        }
        writes
    }

    fn record(
        &mut self,
        device: &mut FakeDevice,
        cmd: vk::CommandBuffer,
        image: &FrameImage,
        _set: vk::DescriptorSet,
    ) -> Result<()> {
        self.recorded += 1;
        device.record_marker(cmd, format!("draw image {}", image.index));
        Ok(())
    }

    fn uniforms(&mut self, _extent: vk::Extent2D, _elapsed: f32) -> Vec<u8> {
        if self.uniform_size == 0 {
            return Vec::new();
        }
        self.uniform_frames += 1;
        vec![self.uniform_frames as u8; 16]
    }

    fn destroy(&mut self, _device: &mut FakeDevice) -> Result<()> {
        self.destroyed = true;
        Ok(())
    }
}

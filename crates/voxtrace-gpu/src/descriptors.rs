//! Descriptor set layouts and backend-neutral descriptor writes.

use crate::error::Result;
use ash::vk;

/// The resource bound at one descriptor binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorResource {
    AccelerationStructure(vk::AccelerationStructureKHR),
    StorageImage(vk::ImageView),
    UniformBuffer { buffer: vk::Buffer, range: u64 },
    StorageBuffer { buffer: vk::Buffer, range: u64 },
}

impl DescriptorResource {
    pub fn descriptor_type(&self) -> vk::DescriptorType {
        match self {
            Self::AccelerationStructure(_) => vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
            Self::StorageImage(_) => vk::DescriptorType::STORAGE_IMAGE,
            Self::UniformBuffer { .. } => vk::DescriptorType::UNIFORM_BUFFER,
            Self::StorageBuffer { .. } => vk::DescriptorType::STORAGE_BUFFER,
        }
    }
}

/// One descriptor write into a set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorWrite {
    pub binding: u32,
    pub resource: DescriptorResource,
}

impl DescriptorWrite {
    pub fn new(binding: u32, resource: DescriptorResource) -> Self {
        Self { binding, resource }
    }
}

/// Pool sizes able to hold every write of `sets`.
pub fn pool_sizes(sets: &[Vec<DescriptorWrite>]) -> Vec<vk::DescriptorPoolSize> {
    let mut sizes: Vec<vk::DescriptorPoolSize> = Vec::new();
    for write in sets.iter().flatten() {
        let ty = write.resource.descriptor_type();
        match sizes.iter_mut().find(|size| size.ty == ty) {
            Some(size) => size.descriptor_count += 1,
            None => sizes.push(vk::DescriptorPoolSize {
                ty,
                descriptor_count: 1,
            }),
        }
    }
    sizes
}

/// Descriptor set layout builder.
pub struct DescriptorSetLayoutBuilder<'a> {
    bindings: Vec<vk::DescriptorSetLayoutBinding<'a>>,
}

impl<'a> DescriptorSetLayoutBuilder<'a> {
    /// Create a new builder.
    pub fn new() -> Self {
        Self {
            bindings: Vec::new(),
        }
    }

    /// Add a single-descriptor binding.
    #[must_use]
    pub fn binding(
        mut self,
        binding: u32,
        descriptor_type: vk::DescriptorType,
        stage_flags: vk::ShaderStageFlags,
    ) -> Self {
        self.bindings.push(
            vk::DescriptorSetLayoutBinding::default()
                .binding(binding)
                .descriptor_type(descriptor_type)
                .descriptor_count(1)
                .stage_flags(stage_flags),
        );
        self
    }

    #[must_use]
    pub fn storage_buffer(self, binding: u32, stage_flags: vk::ShaderStageFlags) -> Self {
        self.binding(binding, vk::DescriptorType::STORAGE_BUFFER, stage_flags)
    }

    #[must_use]
    pub fn uniform_buffer(self, binding: u32, stage_flags: vk::ShaderStageFlags) -> Self {
        self.binding(binding, vk::DescriptorType::UNIFORM_BUFFER, stage_flags)
    }

    #[must_use]
    pub fn storage_image(self, binding: u32, stage_flags: vk::ShaderStageFlags) -> Self {
        self.binding(binding, vk::DescriptorType::STORAGE_IMAGE, stage_flags)
    }

    #[must_use]
    pub fn acceleration_structure(self, binding: u32, stage_flags: vk::ShaderStageFlags) -> Self {
        self.binding(
            binding,
            vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
            stage_flags,
        )
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Build the descriptor set layout.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn build(self, device: &ash::Device) -> Result<vk::DescriptorSetLayout> {
        let layout_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&self.bindings);

        let layout = device.create_descriptor_set_layout(&layout_info, None)?;
        Ok(layout)
    }
}

impl Default for DescriptorSetLayoutBuilder<'_> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    #[test]
    fn pool_sizes_count_every_descriptor() {
        let set = |image: u64| {
            vec![
                DescriptorWrite::new(
                    0,
                    DescriptorResource::AccelerationStructure(vk::AccelerationStructureKHR::from_raw(1)),
                ),
                DescriptorWrite::new(1, DescriptorResource::StorageImage(vk::ImageView::from_raw(image))),
                DescriptorWrite::new(
                    2,
                    DescriptorResource::UniformBuffer {
                        buffer: vk::Buffer::from_raw(9),
                        range: 128,
                    },
                ),
            ]
        };
        let sizes = pool_sizes(&[set(2), set(3), set(4)]);

        assert_eq!(sizes.len(), 3);
        assert!(sizes.iter().all(|size| size.descriptor_count == 3));
        assert!(sizes
            .iter()
            .any(|size| size.ty == vk::DescriptorType::ACCELERATION_STRUCTURE_KHR));
    }
}

//! GPU capability detection.

use crate::backend::DeviceLimits;
use crate::error::{GpuError, Result};
use ash::vk;
use std::collections::HashSet;
use std::ffi::CStr;

/// Device extensions every demo needs.
pub const REQUIRED_DEVICE_EXTENSIONS: [&CStr; 4] = [
    ash::khr::swapchain::NAME,
    ash::khr::acceleration_structure::NAME,
    ash::khr::deferred_host_operations::NAME,
    ash::khr::ray_query::NAME,
];

/// Detected GPU capabilities.
#[derive(Debug, Clone)]
pub struct GpuCapabilities {
    /// Device name
    pub device_name: String,
    /// Vulkan API version
    pub api_version: u32,

    pub supports_synchronization2: bool,
    pub supports_buffer_device_address: bool,
    pub supports_acceleration_structure: bool,
    pub supports_ray_query: bool,
    /// `VK_KHR_ray_tracing_pipeline` with its feature bit; optional.
    pub supports_ray_tracing_pipeline: bool,

    /// Device-local memory in MB
    pub device_local_memory_mb: u64,

    /// Limits used by acceleration structure builds
    pub limits: DeviceLimits,

    // Available extensions
    pub available_extensions: HashSet<String>,
}

impl GpuCapabilities {
    /// Query capabilities from a physical device.
    ///
    /// # Safety
    /// The instance and physical device must be valid.
    pub unsafe fn query(instance: &ash::Instance, physical_device: vk::PhysicalDevice) -> Self {
        let extensions = instance
            .enumerate_device_extension_properties(physical_device)
            .unwrap_or_default();

        let available_extensions: HashSet<String> = extensions
            .iter()
            .filter_map(|ext| {
                CStr::from_ptr(ext.extension_name.as_ptr())
                    .to_str()
                    .ok()
                    .map(String::from)
            })
            .collect();

        let has = |name: &CStr| {
            name.to_str()
                .is_ok_and(|name| available_extensions.contains(name))
        };
        let has_acceleration_structure = has(ash::khr::acceleration_structure::NAME);
        let has_ray_query = has(ash::khr::ray_query::NAME);
        let has_ray_tracing_pipeline = has(ash::khr::ray_tracing_pipeline::NAME);

        // Extension property structs may only be chained when the extension exists.
        let mut acceleration_properties =
            vk::PhysicalDeviceAccelerationStructurePropertiesKHR::default();
        let mut pipeline_properties = vk::PhysicalDeviceRayTracingPipelinePropertiesKHR::default();
        let mut properties2 = vk::PhysicalDeviceProperties2::default();
        if has_acceleration_structure {
            properties2 = properties2.push_next(&mut acceleration_properties);
        }
        if has_ray_tracing_pipeline {
            properties2 = properties2.push_next(&mut pipeline_properties);
        }
        instance.get_physical_device_properties2(physical_device, &mut properties2);
        let properties = properties2.properties;

        let mut acceleration_features =
            vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default();
        let mut ray_query_features = vk::PhysicalDeviceRayQueryFeaturesKHR::default();
        let mut pipeline_features = vk::PhysicalDeviceRayTracingPipelineFeaturesKHR::default();
        let mut vulkan_1_2_features = vk::PhysicalDeviceVulkan12Features::default();
        let mut vulkan_1_3_features = vk::PhysicalDeviceVulkan13Features::default();
        let mut features2 = vk::PhysicalDeviceFeatures2::default()
            .push_next(&mut vulkan_1_2_features)
            .push_next(&mut vulkan_1_3_features);
        if has_acceleration_structure {
            features2 = features2.push_next(&mut acceleration_features);
        }
        if has_ray_query {
            features2 = features2.push_next(&mut ray_query_features);
        }
        if has_ray_tracing_pipeline {
            features2 = features2.push_next(&mut pipeline_features);
        }
        instance.get_physical_device_features2(physical_device, &mut features2);

        let memory_properties = instance.get_physical_device_memory_properties(physical_device);
        let device_local_memory_mb: u64 = memory_properties
            .memory_heaps
            .iter()
            .take(memory_properties.memory_heap_count as usize)
            .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
            .map(|heap| heap.size / (1024 * 1024))
            .sum();

        let device_name = CStr::from_ptr(properties.device_name.as_ptr())
            .to_string_lossy()
            .into_owned();

        let limits = DeviceLimits {
            min_acceleration_structure_scratch_offset_alignment: u64::from(
                acceleration_properties.min_acceleration_structure_scratch_offset_alignment,
            ),
            shader_group_base_alignment: u64::from(pipeline_properties.shader_group_base_alignment),
            shader_group_handle_size: pipeline_properties.shader_group_handle_size,
            shader_group_handle_alignment: pipeline_properties.shader_group_handle_alignment,
            max_primitive_count: acceleration_properties.max_primitive_count,
            max_instance_count: acceleration_properties.max_instance_count,
            non_coherent_atom_size: properties.limits.non_coherent_atom_size,
        };

        Self {
            device_name,
            api_version: properties.api_version,
            supports_synchronization2: vulkan_1_3_features.synchronization2 == vk::TRUE,
            supports_buffer_device_address: vulkan_1_2_features.buffer_device_address == vk::TRUE,
            supports_acceleration_structure: acceleration_features.acceleration_structure
                == vk::TRUE,
            supports_ray_query: ray_query_features.ray_query == vk::TRUE,
            supports_ray_tracing_pipeline: pipeline_features.ray_tracing_pipeline == vk::TRUE,
            device_local_memory_mb,
            limits,
            available_extensions,
        }
    }

    /// Check the device against everything the demos rely on.
    pub fn check_requirements(&self) -> Result<()> {
        let api_major = vk::api_version_major(self.api_version);
        let api_minor = vk::api_version_minor(self.api_version);
        if api_major < 1 || (api_major == 1 && api_minor < 3) {
            return Err(GpuError::FeatureNotSupported(format!(
                "Vulkan 1.3 (device reports {api_major}.{api_minor})"
            )));
        }

        for extension in REQUIRED_DEVICE_EXTENSIONS {
            let name = extension.to_string_lossy();
            if !self.available_extensions.contains(name.as_ref()) {
                return Err(GpuError::ExtensionNotSupported(name.into_owned()));
            }
        }

        let features = [
            ("synchronization2", self.supports_synchronization2),
            ("bufferDeviceAddress", self.supports_buffer_device_address),
            ("accelerationStructure", self.supports_acceleration_structure),
            ("rayQuery", self.supports_ray_query),
        ];
        if let Some((name, _)) = features.iter().find(|(_, supported)| !supported) {
            return Err(GpuError::FeatureNotSupported((*name).to_string()));
        }

        Ok(())
    }

    /// Check if the GPU meets minimum requirements.
    pub fn meets_requirements(&self) -> bool {
        self.check_requirements().is_ok()
    }

    /// Get a human-readable summary of capabilities.
    pub fn summary(&self) -> String {
        format!(
            "{} - Vulkan {}.{}.{} - {} MB VRAM - ray tracing pipeline: {}",
            self.device_name,
            vk::api_version_major(self.api_version),
            vk::api_version_minor(self.api_version),
            vk::api_version_patch(self.api_version),
            self.device_local_memory_mb,
            if self.supports_ray_tracing_pipeline { "yes" } else { "no" },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ray_tracing_capable() -> GpuCapabilities {
        GpuCapabilities {
            device_name: "test".to_string(),
            api_version: vk::make_api_version(0, 1, 3, 250),
            supports_synchronization2: true,
            supports_buffer_device_address: true,
            supports_acceleration_structure: true,
            supports_ray_query: true,
            supports_ray_tracing_pipeline: false,
            device_local_memory_mb: 8192,
            limits: DeviceLimits::default(),
            available_extensions: REQUIRED_DEVICE_EXTENSIONS
                .iter()
                .map(|name| name.to_string_lossy().into_owned())
                .collect(),
        }
    }

    #[test]
    fn summary_names_device_version_and_pipeline_support() {
        let mut caps = ray_tracing_capable();
        assert_eq!(
            caps.summary(),
            "test - Vulkan 1.3.250 - 8192 MB VRAM - ray tracing pipeline: no"
        );
        caps.supports_ray_tracing_pipeline = true;
        assert!(caps.summary().ends_with("ray tracing pipeline: yes"));
    }

    #[test]
    fn ray_tracing_pipeline_is_optional() {
        let caps = ray_tracing_capable();
        assert!(!caps.supports_ray_tracing_pipeline);
        assert!(caps.meets_requirements());
    }

    #[test]
    fn requirements_accept_capable_device() {
        assert!(ray_tracing_capable().meets_requirements());
    }

    #[test]
    fn missing_ray_query_extension_is_reported() {
        let mut caps = ray_tracing_capable();
        caps.available_extensions.remove("VK_KHR_ray_query");
        assert!(matches!(
            caps.check_requirements(),
            Err(GpuError::ExtensionNotSupported(name)) if name == "VK_KHR_ray_query"
        ));
    }

    #[test]
    fn missing_feature_is_reported() {
        let mut caps = ray_tracing_capable();
        caps.supports_acceleration_structure = false;
        assert!(matches!(
            caps.check_requirements(),
            Err(GpuError::FeatureNotSupported(name)) if name == "accelerationStructure"
        ));

        let mut old = ray_tracing_capable();
        old.api_version = vk::make_api_version(0, 1, 2, 0);
        assert!(!old.meets_requirements());
    }
}

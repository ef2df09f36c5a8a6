//! Vulkan instance creation and physical device selection.

use crate::capabilities::GpuCapabilities;
use crate::error::{GpuError, Result};
use ash::vk;
use std::ffi::{CStr, CString};

/// Validation layers to enable on request.
pub fn validation_layers() -> Vec<&'static CStr> {
    vec![c"VK_LAYER_KHRONOS_validation"]
}

/// Create a Vulkan instance with the surface extensions of `display`.
///
/// # Safety
/// The entry must be a valid Vulkan entry point.
pub unsafe fn create_instance(
    entry: &ash::Entry,
    app_name: &str,
    display: raw_window_handle::RawDisplayHandle,
    enable_validation: bool,
) -> Result<ash::Instance> {
    let app_name = CString::new(app_name)
        .map_err(|e| GpuError::Other(format!("Invalid application name: {e}")))?;

    let app_info = vk::ApplicationInfo::default()
        .application_name(&app_name)
        .application_version(vk::make_api_version(0, 0, 1, 0))
        .engine_name(c"voxtrace")
        .engine_version(vk::make_api_version(0, 0, 1, 0))
        .api_version(vk::API_VERSION_1_3);

    let extension_names = ash_window::enumerate_required_extensions(display)
        .map_err(|e| GpuError::SurfaceCreation(e.to_string()))?
        .to_vec();

    let layers = if enable_validation {
        validation_layers()
    } else {
        vec![]
    };

    let available_layers = entry.enumerate_instance_layer_properties()?;
    let mut layer_names: Vec<*const std::ffi::c_char> = Vec::new();
    for layer in &layers {
        let found = available_layers
            .iter()
            .any(|props| CStr::from_ptr(props.layer_name.as_ptr()) == *layer);
        if found {
            layer_names.push(layer.as_ptr());
        } else {
            tracing::warn!("Validation layer {} not available", layer.to_string_lossy());
        }
    }

    let create_info = vk::InstanceCreateInfo::default()
        .application_info(&app_info)
        .enabled_extension_names(&extension_names)
        .enabled_layer_names(&layer_names);

    let instance = entry.create_instance(&create_info, None)?;

    Ok(instance)
}

/// Select the best physical device that can run the demos.
///
/// # Safety
/// The instance must be valid.
pub unsafe fn select_physical_device(
    instance: &ash::Instance,
) -> Result<(vk::PhysicalDevice, GpuCapabilities)> {
    let devices = instance.enumerate_physical_devices()?;

    if devices.is_empty() {
        return Err(GpuError::NoSuitableDevice);
    }

    let mut best: Option<(i32, vk::PhysicalDevice, GpuCapabilities)> = None;
    let mut last_rejection = None;

    for device in devices {
        let capabilities = GpuCapabilities::query(instance, device);
        if let Err(e) = capabilities.check_requirements() {
            tracing::debug!("Skipping {}: {e}", capabilities.device_name);
            last_rejection = Some(e);
            continue;
        }
        let score = score_physical_device(instance, device, &capabilities);
        if best.as_ref().map_or(true, |(best_score, _, _)| score > *best_score) {
            best = Some((score, device, capabilities));
        }
    }

    match best {
        Some((_, device, capabilities)) => Ok((device, capabilities)),
        // Report why the last candidate failed, it is usually the only one.
        None => Err(last_rejection.unwrap_or(GpuError::NoSuitableDevice)),
    }
}

/// Score a physical device for selection.
unsafe fn score_physical_device(
    instance: &ash::Instance,
    device: vk::PhysicalDevice,
    capabilities: &GpuCapabilities,
) -> i32 {
    let properties = instance.get_physical_device_properties(device);

    let mut score = match properties.device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
        vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
        vk::PhysicalDeviceType::VIRTUAL_GPU => 50,
        _ => 0,
    };

    // +1 per GB
    score += i32::try_from(capabilities.device_local_memory_mb / 1024).unwrap_or(i32::MAX / 2);

    score
}

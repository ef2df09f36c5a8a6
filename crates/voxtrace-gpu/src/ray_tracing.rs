//! Ray tracing pipelines.

use crate::error::{GpuError, Result};
use ash::vk;

/// SPIR-V for the stages of a ray tracing pipeline, entry point `main`.
///
/// With an intersection shader the hit group is procedural (AABB
/// geometry), otherwise it is a triangle hit group.
#[derive(Debug, Clone, Copy)]
pub struct RayTracingShaders<'a> {
    pub raygen: &'a [u32],
    pub miss: &'a [u32],
    pub closest_hit: &'a [u32],
    pub intersection: Option<&'a [u32]>,
}

/// Stage indices in pipeline creation order.
const RAYGEN: u32 = 0;
const MISS: u32 = 1;
const CLOSEST_HIT: u32 = 2;
const INTERSECTION: u32 = 3;

/// Groups for one ray generation, one miss and one hit group.
pub fn shader_groups(procedural: bool) -> [vk::RayTracingShaderGroupCreateInfoKHR<'static>; 3] {
    let general = |shader| {
        vk::RayTracingShaderGroupCreateInfoKHR::default()
            .ty(vk::RayTracingShaderGroupTypeKHR::GENERAL)
            .general_shader(shader)
            .closest_hit_shader(vk::SHADER_UNUSED_KHR)
            .any_hit_shader(vk::SHADER_UNUSED_KHR)
            .intersection_shader(vk::SHADER_UNUSED_KHR)
    };
    let (ty, intersection) = if procedural {
        (vk::RayTracingShaderGroupTypeKHR::PROCEDURAL_HIT_GROUP, INTERSECTION)
    } else {
        (vk::RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP, vk::SHADER_UNUSED_KHR)
    };
    let hit = vk::RayTracingShaderGroupCreateInfoKHR::default()
        .ty(ty)
        .general_shader(vk::SHADER_UNUSED_KHR)
        .closest_hit_shader(CLOSEST_HIT)
        .any_hit_shader(vk::SHADER_UNUSED_KHR)
        .intersection_shader(intersection);
    [general(RAYGEN), general(MISS), hit]
}

/// A ray tracing pipeline and its layout.
pub struct RayTracingPipeline {
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
}

impl RayTracingPipeline {
    pub const MISS_GROUPS: u32 = 1;
    pub const HIT_GROUPS: u32 = 1;
    pub const GROUP_COUNT: u32 = 1 + Self::MISS_GROUPS + Self::HIT_GROUPS;

    /// Create a pipeline with recursion depth one.
    ///
    /// # Safety
    /// The device must be valid, `loader` must belong to it and the shader
    /// code must be valid SPIR-V.
    pub unsafe fn new(
        device: &ash::Device,
        loader: &ash::khr::ray_tracing_pipeline::Device,
        shaders: &RayTracingShaders<'_>,
        descriptor_set_layouts: &[vk::DescriptorSetLayout],
    ) -> Result<Self> {
        let mut stages = vec![
            (vk::ShaderStageFlags::RAYGEN_KHR, shaders.raygen),
            (vk::ShaderStageFlags::MISS_KHR, shaders.miss),
            (vk::ShaderStageFlags::CLOSEST_HIT_KHR, shaders.closest_hit),
        ];
        if let Some(code) = shaders.intersection {
            stages.push((vk::ShaderStageFlags::INTERSECTION_KHR, code));
        }

        let mut modules = Vec::with_capacity(stages.len());
        for (_, code) in &stages {
            let info = vk::ShaderModuleCreateInfo::default().code(code);
            match device.create_shader_module(&info, None) {
                Ok(module) => modules.push(module),
                Err(e) => {
                    destroy_modules(device, &modules);
                    return Err(GpuError::ShaderCompilation(e.to_string()));
                }
            }
        }

        let created = create(device, loader, &stages, &modules, shaders, descriptor_set_layouts);
        // The modules are only needed during pipeline creation.
        destroy_modules(device, &modules);
        created
    }

    /// Destroy the pipeline.
    ///
    /// # Safety
    /// The device must be valid and the pipeline must not be in use.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        device.destroy_pipeline(self.pipeline, None);
        device.destroy_pipeline_layout(self.layout, None);
    }
}

unsafe fn create(
    device: &ash::Device,
    loader: &ash::khr::ray_tracing_pipeline::Device,
    stages: &[(vk::ShaderStageFlags, &[u32])],
    modules: &[vk::ShaderModule],
    shaders: &RayTracingShaders<'_>,
    descriptor_set_layouts: &[vk::DescriptorSetLayout],
) -> Result<RayTracingPipeline> {
    let layout_info = vk::PipelineLayoutCreateInfo::default().set_layouts(descriptor_set_layouts);
    let layout = device
        .create_pipeline_layout(&layout_info, None)
        .map_err(|e| GpuError::PipelineCreation(e.to_string()))?;

    let stage_infos: Vec<_> = stages
        .iter()
        .zip(modules)
        .map(|((stage, _), &module)| {
            vk::PipelineShaderStageCreateInfo::default()
                .stage(*stage)
                .module(module)
                .name(c"main")
        })
        .collect();
    let groups = shader_groups(shaders.intersection.is_some());

    let pipeline_info = vk::RayTracingPipelineCreateInfoKHR::default()
        .stages(&stage_infos)
        .groups(&groups)
        .max_pipeline_ray_recursion_depth(1)
        .layout(layout);

    let created = loader.create_ray_tracing_pipelines(
        vk::DeferredOperationKHR::null(),
        vk::PipelineCache::null(),
        &[pipeline_info],
        None,
    );
    let pipeline = match created {
        Ok(pipelines) => pipelines.into_iter().next(),
        Err((_, e)) => {
            device.destroy_pipeline_layout(layout, None);
            return Err(GpuError::PipelineCreation(format!("ray tracing pipeline: {e}")));
        }
    };
    let Some(pipeline) = pipeline else {
        device.destroy_pipeline_layout(layout, None);
        return Err(GpuError::PipelineCreation("no pipeline returned".to_string()));
    };

    Ok(RayTracingPipeline { pipeline, layout })
}

unsafe fn destroy_modules(device: &ash::Device, modules: &[vk::ShaderModule]) {
    for &module in modules {
        device.destroy_shader_module(module, None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn general_groups_come_first() {
        let [raygen, miss, _] = shader_groups(false);
        assert_eq!(raygen.ty, vk::RayTracingShaderGroupTypeKHR::GENERAL);
        assert_eq!(raygen.general_shader, 0);
        assert_eq!(miss.ty, vk::RayTracingShaderGroupTypeKHR::GENERAL);
        assert_eq!(miss.general_shader, 1);
        assert_eq!(miss.closest_hit_shader, vk::SHADER_UNUSED_KHR);
    }

    #[test]
    fn hit_group_follows_the_geometry_kind() {
        let [_, _, triangles] = shader_groups(false);
        assert_eq!(triangles.ty, vk::RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP);
        assert_eq!(triangles.closest_hit_shader, 2);
        assert_eq!(triangles.intersection_shader, vk::SHADER_UNUSED_KHR);

        let [_, _, procedural] = shader_groups(true);
        assert_eq!(procedural.ty, vk::RayTracingShaderGroupTypeKHR::PROCEDURAL_HIT_GROUP);
        assert_eq!(procedural.closest_hit_shader, 2);
        assert_eq!(procedural.intersection_shader, 3);
        assert_eq!(procedural.general_shader, vk::SHADER_UNUSED_KHR);
    }

    #[test]
    fn group_count_matches_the_groups() {
        assert_eq!(shader_groups(true).len() as u32, RayTracingPipeline::GROUP_COUNT);
    }
}

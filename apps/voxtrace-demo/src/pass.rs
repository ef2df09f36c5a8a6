//! The frame pass: trace the scene with the ray tracing pipeline or with ray
//! queries from a compute shader, or clear the screen when there is no
//! shader for the scene.

use ash::vk;
use tracing::{info, warn};
use voxtrace_app::{FrameImage, FramePass};
use voxtrace_gpu::surface::color_subresource_range;
use voxtrace_gpu::{
    ComputePipeline, DeferredQueue, DescriptorResource, DescriptorSetLayoutBuilder, DescriptorWrite,
    Device, GpuBuffer, GpuError, RayTracingPipeline, Result, ShaderBindingTable, VulkanDevice,
};

use crate::camera::{CameraUniforms, OrbitCamera};
use crate::scene::{Scene, SceneKind, SceneOptions};
use crate::shader::{PipelineShaderCode, TraceShaders};

const WORKGROUP_SIZE: u32 = 8;

/// Shown when there is no trace shader.
const CLEAR_COLOR: [f32; 4] = [0.39, 0.58, 0.93, 1.0];

pub mod binding {
    pub const TLAS: u32 = 0;
    pub const OUTPUT_IMAGE: u32 = 1;
    pub const CAMERA: u32 = 2;
    pub const GEOMETRY_TABLE: u32 = 3;
    pub const PALETTE: u32 = 4;
}

type Access = (vk::PipelineStageFlags2, vk::AccessFlags2, vk::ImageLayout);

/// How a frame reaches the swapchain image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceMode {
    Clear,
    /// Compute dispatch tracing with ray queries.
    RayQuery,
    /// `vkCmdTraceRaysKHR` through a shader binding table.
    RayPipeline,
}

impl TraceMode {
    /// Pick the mode for a scene from the shaders at hand.
    ///
    /// Chunk and cube scenes prefer the ray tracing pipeline; the triangle
    /// scene always traces with ray queries.
    pub fn choose(kind: SceneKind, query: bool, pipeline: bool, pipeline_supported: bool) -> Self {
        let pipeline = pipeline && pipeline_supported && kind != SceneKind::Triangle;
        if pipeline {
            Self::RayPipeline
        } else if query {
            Self::RayQuery
        } else {
            Self::Clear
        }
    }

    /// Stage, access and layout of the writes to the swapchain image.
    fn target(self) -> Access {
        match self {
            Self::Clear => (
                vk::PipelineStageFlags2::TRANSFER,
                vk::AccessFlags2::TRANSFER_WRITE,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            ),
            Self::RayQuery => (
                vk::PipelineStageFlags2::COMPUTE_SHADER,
                vk::AccessFlags2::SHADER_STORAGE_WRITE,
                vk::ImageLayout::GENERAL,
            ),
            Self::RayPipeline => (
                vk::PipelineStageFlags2::RAY_TRACING_SHADER_KHR,
                vk::AccessFlags2::SHADER_STORAGE_WRITE,
                vk::ImageLayout::GENERAL,
            ),
        }
    }

    /// The stage that waits on image acquisition.
    fn wait_stage(self) -> vk::PipelineStageFlags {
        match self {
            Self::Clear => vk::PipelineStageFlags::TRANSFER,
            Self::RayQuery => vk::PipelineStageFlags::COMPUTE_SHADER,
            Self::RayPipeline => vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR,
        }
    }

    /// Transition of a freshly acquired image out of `UNDEFINED`.
    ///
    /// The source stage is the acquire wait stage, so the transition is
    /// ordered after the semaphore wait.
    fn acquire_barrier(self, image: vk::Image) -> vk::ImageMemoryBarrier2<'static> {
        let target = self.target();
        layout_barrier(
            image,
            (target.0, vk::AccessFlags2::NONE, vk::ImageLayout::UNDEFINED),
            target,
        )
    }
}

enum Trace {
    Query {
        pipeline: ComputePipeline,
        set_layout: vk::DescriptorSetLayout,
    },
    Pipeline {
        pipeline: RayTracingPipeline,
        sbt: ShaderBindingTable,
        set_layout: vk::DescriptorSetLayout,
    },
}

impl Trace {
    fn mode(&self) -> TraceMode {
        match self {
            Self::Query { .. } => TraceMode::RayQuery,
            Self::Pipeline { .. } => TraceMode::RayPipeline,
        }
    }

    fn set_layout(&self) -> vk::DescriptorSetLayout {
        match self {
            Self::Query { set_layout, .. } | Self::Pipeline { set_layout, .. } => *set_layout,
        }
    }

    fn destroy(self, device: &mut VulkanDevice) -> Result<()> {
        match self {
            Self::Query {
                pipeline,
                set_layout,
            } => unsafe {
                pipeline.destroy(device.raw());
                device.raw().destroy_descriptor_set_layout(set_layout, None);
            },
            Self::Pipeline {
                pipeline,
                sbt,
                set_layout,
            } => {
                unsafe {
                    pipeline.destroy(device.raw());
                    device.raw().destroy_descriptor_set_layout(set_layout, None);
                }
                sbt.destroy(device)?;
            }
        }
        Ok(())
    }
}

pub struct ScenePass {
    scene: Option<Scene>,
    trace: Option<Trace>,
    camera: OrbitCamera,
}

impl ScenePass {
    /// Build the scene and the trace pipeline its mode calls for.
    pub fn new(
        device: &mut VulkanDevice,
        deferred: &mut DeferredQueue,
        options: &SceneOptions,
        shaders: &TraceShaders,
    ) -> anyhow::Result<Self> {
        let scene = Scene::build(device, deferred, options)?;
        let camera = OrbitCamera::new(scene.framing());

        let pipeline_supported = device.ray_tracing().is_some();
        if shaders.pipeline.is_some() && !pipeline_supported {
            warn!("Device has no ray tracing pipeline support, ignoring the pipeline shaders");
        }
        let mode = TraceMode::choose(
            scene.kind(),
            shaders.query.is_some(),
            shaders.pipeline.is_some(),
            pipeline_supported,
        );

        let created = match (mode, &shaders.query, &shaders.pipeline) {
            (TraceMode::RayQuery, Some(code), _) => create_query_trace(device.raw(), code).map(Some),
            (TraceMode::RayPipeline, _, Some(code)) => create_pipeline_trace(device, deferred, code).map(Some),
            _ => {
                warn!("No trace shader for the {:?} scene, frames are cleared only", scene.kind());
                Ok(None)
            }
        };
        let trace = match created {
            Ok(trace) => trace,
            Err(e) => {
                device.wait_idle()?;
                deferred.flush(device)?;
                scene.destroy(device)?;
                return Err(e.into());
            }
        };
        info!("{:?} scene pass ready ({mode:?})", scene.kind());

        Ok(Self {
            scene: Some(scene),
            trace,
            camera,
        })
    }

    fn mode(&self) -> TraceMode {
        self.trace.as_ref().map_or(TraceMode::Clear, Trace::mode)
    }
}

fn scene_bindings(stage: vk::ShaderStageFlags) -> DescriptorSetLayoutBuilder<'static> {
    DescriptorSetLayoutBuilder::new()
        .acceleration_structure(binding::TLAS, stage)
        .storage_image(binding::OUTPUT_IMAGE, stage)
        .uniform_buffer(binding::CAMERA, stage)
        .storage_buffer(binding::GEOMETRY_TABLE, stage)
        .storage_buffer(binding::PALETTE, stage)
}

fn create_query_trace(device: &ash::Device, code: &[u32]) -> Result<Trace> {
    unsafe {
        let set_layout = scene_bindings(vk::ShaderStageFlags::COMPUTE).build(device)?;
        match ComputePipeline::new(device, code, &[set_layout]) {
            Ok(pipeline) => Ok(Trace::Query {
                pipeline,
                set_layout,
            }),
            Err(e) => {
                device.destroy_descriptor_set_layout(set_layout, None);
                Err(e)
            }
        }
    }
}

fn create_pipeline_trace(
    device: &mut VulkanDevice,
    deferred: &mut DeferredQueue,
    code: &PipelineShaderCode,
) -> Result<Trace> {
    let loader = device
        .ray_tracing()
        .ok_or_else(|| GpuError::FeatureNotSupported("rayTracingPipeline".to_string()))?;
    let raw = device.raw();
    let stage = vk::ShaderStageFlags::RAYGEN_KHR
        | vk::ShaderStageFlags::MISS_KHR
        | vk::ShaderStageFlags::CLOSEST_HIT_KHR
        | vk::ShaderStageFlags::INTERSECTION_KHR;

    let (pipeline, set_layout) = unsafe {
        let set_layout = scene_bindings(stage).build(raw)?;
        match RayTracingPipeline::new(raw, loader, &code.shaders(), &[set_layout]) {
            Ok(pipeline) => (pipeline, set_layout),
            Err(e) => {
                raw.destroy_descriptor_set_layout(set_layout, None);
                return Err(e);
            }
        }
    };

    let sbt = device
        .shader_group_handles(pipeline.pipeline, RayTracingPipeline::GROUP_COUNT)
        .and_then(|handles| {
            ShaderBindingTable::new(
                device,
                deferred,
                &handles,
                RayTracingPipeline::MISS_GROUPS,
                RayTracingPipeline::HIT_GROUPS,
            )
        });
    match sbt {
        Ok(sbt) => Ok(Trace::Pipeline {
            pipeline,
            sbt,
            set_layout,
        }),
        Err(e) => {
            unsafe {
                pipeline.destroy(device.raw());
                device.raw().destroy_descriptor_set_layout(set_layout, None);
            }
            Err(e)
        }
    }
}

/// Bindings of the trace shader for one swapchain image.
pub fn trace_writes(scene: &Scene, image: &FrameImage, camera: &GpuBuffer) -> Vec<DescriptorWrite> {
    let storage = |buffer: &GpuBuffer| DescriptorResource::StorageBuffer {
        buffer: buffer.buffer,
        range: buffer.size,
    };
    vec![
        DescriptorWrite::new(
            binding::TLAS,
            DescriptorResource::AccelerationStructure(scene.tlas().handle()),
        ),
        DescriptorWrite::new(binding::OUTPUT_IMAGE, DescriptorResource::StorageImage(image.view)),
        DescriptorWrite::new(
            binding::CAMERA,
            DescriptorResource::UniformBuffer {
                buffer: camera.buffer,
                range: camera.size,
            },
        ),
        DescriptorWrite::new(binding::GEOMETRY_TABLE, storage(scene.geometry_table())),
        DescriptorWrite::new(binding::PALETTE, storage(scene.palette())),
    ]
}

fn layout_barrier(
    image: vk::Image,
    (src_stage, src_access, old_layout): Access,
    (dst_stage, dst_access, new_layout): Access,
) -> vk::ImageMemoryBarrier2<'static> {
    vk::ImageMemoryBarrier2::default()
        .src_stage_mask(src_stage)
        .src_access_mask(src_access)
        .dst_stage_mask(dst_stage)
        .dst_access_mask(dst_access)
        .old_layout(old_layout)
        .new_layout(new_layout)
        .image(image)
        .subresource_range(color_subresource_range())
}

unsafe fn barrier(device: &ash::Device, cmd: vk::CommandBuffer, barrier: vk::ImageMemoryBarrier2<'_>) {
    let dependency_info = vk::DependencyInfo::default().image_memory_barriers(std::slice::from_ref(&barrier));
    unsafe { device.cmd_pipeline_barrier2(cmd, &dependency_info) };
}

const PRESENT: Access = (
    vk::PipelineStageFlags2::BOTTOM_OF_PIPE,
    vk::AccessFlags2::NONE,
    vk::ImageLayout::PRESENT_SRC_KHR,
);

impl FramePass<VulkanDevice> for ScenePass {
    fn descriptor_set_layout(&self) -> vk::DescriptorSetLayout {
        self.trace
            .as_ref()
            .map_or_else(vk::DescriptorSetLayout::null, Trace::set_layout)
    }

    fn uniform_size(&self) -> u64 {
        if self.trace.is_some() {
            std::mem::size_of::<CameraUniforms>() as u64
        } else {
            0
        }
    }

    fn wait_stage(&self) -> vk::PipelineStageFlags {
        self.mode().wait_stage()
    }

    fn descriptor_writes(&self, image: &FrameImage, uniforms: Option<&GpuBuffer>) -> Vec<DescriptorWrite> {
        match (&self.scene, &self.trace, uniforms) {
            (Some(scene), Some(_), Some(camera)) => trace_writes(scene, image, camera),
            _ => Vec::new(),
        }
    }

    fn record(
        &mut self,
        device: &mut VulkanDevice,
        cmd: vk::CommandBuffer,
        image: &FrameImage,
        set: vk::DescriptorSet,
    ) -> Result<()> {
        let mode = self.mode();
        let ray_tracing = device.ray_tracing();
        if mode == TraceMode::RayPipeline && ray_tracing.is_none() {
            return Err(GpuError::FeatureNotSupported("rayTracingPipeline".to_string()));
        }
        let device = device.raw();
        let extent = image.extent;

        unsafe {
            barrier(device, cmd, mode.acquire_barrier(image.image));
            match &self.trace {
                Some(Trace::Query { pipeline, .. }) => {
                    device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::COMPUTE, pipeline.pipeline);
                    device.cmd_bind_descriptor_sets(
                        cmd,
                        vk::PipelineBindPoint::COMPUTE,
                        pipeline.layout,
                        0,
                        &[set],
                        &[],
                    );
                    let workgroup_x = extent.width.div_ceil(WORKGROUP_SIZE);
                    let workgroup_y = extent.height.div_ceil(WORKGROUP_SIZE);
                    device.cmd_dispatch(cmd, workgroup_x, workgroup_y, 1);
                }
                Some(Trace::Pipeline { pipeline, sbt, .. }) => {
                    device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::RAY_TRACING_KHR, pipeline.pipeline);
                    device.cmd_bind_descriptor_sets(
                        cmd,
                        vk::PipelineBindPoint::RAY_TRACING_KHR,
                        pipeline.layout,
                        0,
                        &[set],
                        &[],
                    );
                    if let Some(loader) = ray_tracing {
                        loader.cmd_trace_rays(
                            cmd,
                            &sbt.raygen,
                            &sbt.miss,
                            &sbt.hit,
                            &sbt.callable,
                            extent.width,
                            extent.height,
                            1,
                        );
                    }
                }
                None => {
                    device.cmd_clear_color_image(
                        cmd,
                        image.image,
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        &vk::ClearColorValue {
                            float32: CLEAR_COLOR,
                        },
                        &[color_subresource_range()],
                    );
                }
            }
            barrier(device, cmd, layout_barrier(image.image, mode.target(), PRESENT));
        }
        Ok(())
    }

    fn uniforms(&mut self, extent: vk::Extent2D, elapsed: f32) -> Vec<u8> {
        if self.trace.is_none() {
            return Vec::new();
        }
        let camera = self.camera.uniforms(extent.width, extent.height, elapsed);
        bytemuck::bytes_of(&camera).to_vec()
    }

    fn destroy(&mut self, device: &mut VulkanDevice) -> Result<()> {
        if let Some(trace) = self.trace.take() {
            trace.destroy(device)?;
        }
        if let Some(scene) = self.scene.take() {
            scene.destroy(device)?;
        }
        Ok(())
    }
}

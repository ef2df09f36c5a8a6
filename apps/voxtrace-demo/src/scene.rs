//! Scene construction: geometry upload and acceleration structure builds.

use std::str::FromStr;

use ash::vk;
use glam::{Mat4, Vec3};
use tracing::info;
use voxtrace_gpu::{create_buffer, BufferRequest, DeferredQueue, Device, GpuBuffer, Result};
use voxtrace_rt::{
    aabb_geometry, build_blas, build_chunk_blases, build_tlas, chunk_instances, geometry_table,
    triangle_geometry, upload_input, AabbPositions, AccelerationStructure, Chunk, TlasInstance,
    TriangleLayout,
};
use voxtrace_world::{generate_grid, palette, single_triangle, terrain_columns, TerrainGenerator, WorldSeed, CHUNK_SIZE};

/// Which geometry the demo traces against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SceneKind {
    /// Meshed terrain chunks, one compacted BLAS per chunk.
    #[default]
    Chunks,
    /// One box per terrain column in a single procedural BLAS.
    Cubes,
    /// A single triangle.
    Triangle,
}

impl SceneKind {
    /// Whether the scene's bottom level holds AABBs rather than triangles.
    pub fn is_procedural(self) -> bool {
        self == Self::Cubes
    }
}

impl FromStr for SceneKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "chunks" => Ok(Self::Chunks),
            "cubes" => Ok(Self::Cubes),
            "triangle" => Ok(Self::Triangle),
            other => Err(format!("unknown scene '{other}' (expected chunks, cubes or triangle)")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SceneOptions {
    pub kind: SceneKind,
    /// Chunk radius around the origin.
    pub radius: i32,
    pub seed: WorldSeed,
}

impl Default for SceneOptions {
    fn default() -> Self {
        Self {
            kind: SceneKind::Chunks,
            radius: 2,
            seed: 0,
        }
    }
}

/// Where the camera should look and from how far away.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Framing {
    pub target: Vec3,
    pub distance: f32,
    /// Eye height above the target.
    pub height: f32,
}

/// Everything a scene owns on the device.
#[derive(Default)]
struct Parts {
    chunks: Vec<Chunk>,
    blases: Vec<AccelerationStructure>,
    tlas: Option<AccelerationStructure>,
    geometry_table: Option<GpuBuffer>,
    palette: Option<GpuBuffer>,
}

impl Parts {
    fn destroy<D: Device>(self, device: &mut D) -> Result<()> {
        if let Some(tlas) = self.tlas {
            tlas.destroy(device)?;
        }
        for blas in self.blases {
            blas.destroy(device)?;
        }
        for chunk in self.chunks {
            chunk.destroy(device)?;
        }
        if let Some(table) = self.geometry_table {
            device.free_buffer(table)?;
        }
        if let Some(palette) = self.palette {
            device.free_buffer(palette)?;
        }
        Ok(())
    }
}

/// A built scene: its top-level structure and the buffers shaders read.
pub struct Scene {
    kind: SceneKind,
    tlas: AccelerationStructure,
    geometry_table: GpuBuffer,
    palette: GpuBuffer,
    parts: Parts,
    framing: Framing,
}

impl Scene {
    /// Generate and upload the geometry of `options` and build its
    /// acceleration structures.
    ///
    /// Builds are submitted asynchronously; their inputs are released by
    /// `deferred` once they complete.
    pub fn build<D: Device>(
        device: &mut D,
        deferred: &mut DeferredQueue,
        options: &SceneOptions,
    ) -> Result<Self> {
        let mut parts = Parts::default();
        match build_parts(device, deferred, options, &mut parts) {
            Ok(framing) => {
                let (Some(tlas), Some(geometry_table), Some(palette)) =
                    (parts.tlas.take(), parts.geometry_table.take(), parts.palette.take())
                else {
                    parts.destroy(device)?;
                    return Err(voxtrace_gpu::GpuError::InvalidState(
                        "scene build left parts missing".to_string(),
                    ));
                };
                info!(
                    "Built {:?} scene: {} bottom-level structures",
                    options.kind,
                    parts.chunks.len() + parts.blases.len()
                );
                Ok(Self {
                    kind: options.kind,
                    tlas,
                    geometry_table,
                    palette,
                    parts,
                    framing,
                })
            }
            Err(e) => {
                device.wait_idle()?;
                parts.destroy(device)?;
                Err(e)
            }
        }
    }

    pub fn kind(&self) -> SceneKind {
        self.kind
    }

    pub fn tlas(&self) -> &AccelerationStructure {
        &self.tlas
    }

    /// `(positions, indices)` device address pairs, indexed by instance
    /// custom index. Zeroed for scenes that are not chunked.
    pub fn geometry_table(&self) -> &GpuBuffer {
        &self.geometry_table
    }

    /// Voxel type colors, `0x00BBGGRR`.
    pub fn palette(&self) -> &GpuBuffer {
        &self.palette
    }

    pub fn framing(&self) -> Framing {
        self.framing
    }

    /// Free every structure and buffer of the scene.
    ///
    /// The device must be idle.
    pub fn destroy<D: Device>(self, device: &mut D) -> Result<()> {
        self.tlas.destroy(device)?;
        device.free_buffer(self.geometry_table)?;
        device.free_buffer(self.palette)?;
        self.parts.destroy(device)
    }
}

fn build_parts<D: Device>(
    device: &mut D,
    deferred: &mut DeferredQueue,
    options: &SceneOptions,
    parts: &mut Parts,
) -> Result<Framing> {
    let framing = match options.kind {
        SceneKind::Chunks => build_chunks(device, deferred, options, parts)?,
        SceneKind::Cubes => build_cubes(device, deferred, options, parts)?,
        SceneKind::Triangle => build_triangle(device, deferred, parts)?,
    };
    if parts.geometry_table.is_none() {
        parts.geometry_table = Some(create_buffer(
            device,
            deferred,
            &BufferRequest::with_data(
                "empty geometry table",
                vk::BufferUsageFlags::STORAGE_BUFFER,
                bytemuck::bytes_of(&[0u64; 2]),
            ),
        )?);
    }
    let colors = palette();
    parts.palette = Some(create_buffer(
        device,
        deferred,
        &BufferRequest::with_data(
            "palette",
            vk::BufferUsageFlags::STORAGE_BUFFER,
            bytemuck::cast_slice(&colors),
        ),
    )?);
    Ok(framing)
}

fn build_chunks<D: Device>(
    device: &mut D,
    deferred: &mut DeferredQueue,
    options: &SceneOptions,
    parts: &mut Parts,
) -> Result<Framing> {
    for ((cx, cz), mesh) in generate_grid(options.seed, options.radius) {
        if mesh.is_empty() {
            continue;
        }
        let chunk = Chunk::upload(device, deferred, (cx, cz), &mesh.positions, &mesh.indices)?;
        parts.chunks.push(chunk);
    }
    build_chunk_blases(device, deferred, &mut parts.chunks)?;
    let instances = chunk_instances(&parts.chunks, CHUNK_SIZE)?;
    parts.geometry_table = Some(geometry_table(device, deferred, &parts.chunks)?);
    parts.tlas = Some(build_tlas(device, deferred, &instances)?);

    let half = CHUNK_SIZE as f32 * 0.5;
    Ok(Framing {
        target: Vec3::new(half, 20.0, half),
        distance: (2 * options.radius).max(2) as f32 * CHUNK_SIZE as f32,
        height: 30.0,
    })
}

fn build_cubes<D: Device>(
    device: &mut D,
    deferred: &mut DeferredQueue,
    options: &SceneOptions,
    parts: &mut Parts,
) -> Result<Framing> {
    let extent = (2 * options.radius.unsigned_abs() + 1) * CHUNK_SIZE;
    let generator = TerrainGenerator::with_seed(options.seed);
    let boxes: Vec<AabbPositions> = terrain_columns(&generator, extent)
        .iter()
        .map(|b| AabbPositions::new(b.min, b.max))
        .collect();

    let input = upload_input(device, deferred, "column boxes", bytemuck::cast_slice(&boxes), 8)?;
    let geometry = aabb_geometry(&input);
    let blas = build_blas(device, deferred, &geometry, boxes.len() as u32, vec![input])?;
    let instance = TlasInstance::new(&blas, Mat4::IDENTITY, 0);
    parts.blases.push(blas);
    parts.tlas = Some(build_tlas(device, deferred, &[instance])?);

    let half = extent as f32 * 0.5;
    Ok(Framing {
        target: Vec3::new(half, 20.0, half),
        distance: extent as f32,
        height: 40.0,
    })
}

fn build_triangle<D: Device>(
    device: &mut D,
    deferred: &mut DeferredQueue,
    parts: &mut Parts,
) -> Result<Framing> {
    let triangle = single_triangle();
    let vertices = upload_input(
        device,
        deferred,
        "triangle vertices",
        bytemuck::cast_slice(&triangle.positions),
        4,
    )?;
    let indices = match upload_input(
        device,
        deferred,
        "triangle indices",
        bytemuck::cast_slice(&triangle.indices),
        4,
    ) {
        Ok(indices) => indices,
        Err(e) => {
            device.wait_idle()?;
            device.free_buffer(vertices)?;
            return Err(e);
        }
    };

    let layout = TriangleLayout {
        vertex_format: vk::Format::R32G32B32_SFLOAT,
        vertex_stride: 12,
        vertex_count: 3,
        index_type: vk::IndexType::UINT16,
    };
    let geometry = triangle_geometry(&vertices, &indices, &layout);
    let blas = build_blas(device, deferred, &geometry, 1, vec![vertices, indices])?;
    let instance = TlasInstance::new(&blas, Mat4::IDENTITY, 0);
    parts.blases.push(blas);
    parts.tlas = Some(build_tlas(device, deferred, &[instance])?);

    Ok(Framing {
        target: Vec3::ZERO,
        distance: 5.0,
        height: 0.0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use voxtrace_gpu::testing::FakeDevice;

    fn build(kind: SceneKind, radius: i32) -> (FakeDevice, DeferredQueue, Scene) {
        let mut device = FakeDevice::new();
        let mut deferred = DeferredQueue::new();
        let options = SceneOptions {
            kind,
            radius,
            seed: 7,
        };
        let scene = Scene::build(&mut device, &mut deferred, &options).unwrap();
        (device, deferred, scene)
    }

    fn teardown(mut device: FakeDevice, mut deferred: DeferredQueue, scene: Scene) {
        device.wait_idle().unwrap();
        deferred.flush(&mut device).unwrap();
        scene.destroy(&mut device).unwrap();
        assert_eq!(device.live_buffer_count(), 0);
        assert_eq!(device.live_structure_count(), 0);
        assert_eq!(device.double_free_count(), 0);
    }

    #[test]
    fn scene_names_parse() {
        assert_eq!("chunks".parse::<SceneKind>(), Ok(SceneKind::Chunks));
        assert_eq!("cubes".parse::<SceneKind>(), Ok(SceneKind::Cubes));
        assert_eq!("triangle".parse::<SceneKind>(), Ok(SceneKind::Triangle));
        assert!("spheres".parse::<SceneKind>().is_err());
        assert!(SceneKind::Cubes.is_procedural());
        assert!(!SceneKind::Chunks.is_procedural());
    }

    #[test]
    fn chunk_scene_has_one_table_entry_per_chunk() {
        let (device, deferred, scene) = build(SceneKind::Chunks, 1);
        assert_eq!(scene.kind(), SceneKind::Chunks);
        assert!(device.structure(scene.tlas().handle()).is_some());

        let table = device.buffer_contents(scene.geometry_table().buffer);
        assert_eq!(table.len(), scene.parts.chunks.len() * 16);
        assert!(!scene.parts.chunks.is_empty());

        let palette = device.buffer_contents(scene.palette().buffer);
        assert_eq!(palette.len(), 256 * 4);
        assert_eq!(&palette[..4], &[0, 0, 0, 0]);

        assert_eq!(scene.framing().distance, 64.0);
        teardown(device, deferred, scene);
    }

    #[test]
    fn cube_scene_builds_one_procedural_structure() {
        let (device, deferred, scene) = build(SceneKind::Cubes, 0);
        assert_eq!(scene.parts.blases.len(), 1);
        assert!(scene.parts.chunks.is_empty());
        assert_eq!(device.buffer_contents(scene.geometry_table().buffer), vec![0; 16]);
        assert_eq!(scene.framing().target, Vec3::new(16.0, 20.0, 16.0));
        teardown(device, deferred, scene);
    }

    #[test]
    fn triangle_scene_releases_its_inputs() {
        let (mut device, mut deferred, scene) = build(SceneKind::Triangle, 0);
        assert_eq!(scene.parts.blases.len(), 1);

        device.wait_idle().unwrap();
        deferred.flush(&mut device).unwrap();
        // Structures and their storage, the table and the palette.
        assert!(device.live_buffer_count() <= 4);
        teardown(device, deferred, scene);
    }

    #[test]
    fn failed_build_frees_everything() {
        let mut device = FakeDevice::new();
        let mut deferred = DeferredQueue::new();
        device.limits_mut().max_instance_count = 0;
        let options = SceneOptions {
            kind: SceneKind::Triangle,
            ..Default::default()
        };
        assert!(Scene::build(&mut device, &mut deferred, &options).is_err());

        device.wait_idle().unwrap();
        deferred.flush(&mut device).unwrap();
        assert_eq!(device.live_buffer_count(), 0);
        assert_eq!(device.live_structure_count(), 0);
        assert_eq!(device.double_free_count(), 0);
    }
}

//! Geometry for the smaller demo scenes and the material palette.

use glam::Vec3;

use crate::{TerrainGenerator, GROUND, SURFACE};

/// Axis-aligned box in world units.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

impl Aabb {
    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    /// `min` then `max`, the layout of `VkAabbPositionsKHR`.
    pub fn to_array(&self) -> [f32; 6] {
        [self.min.x, self.min.y, self.min.z, self.max.x, self.max.y, self.max.z]
    }

    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }
}

/// One box per terrain column over an `extent` × `extent` area.
///
/// Each box spans from the ground plane to the top of the column's surface
/// voxel.
pub fn terrain_columns(generator: &TerrainGenerator, extent: u32) -> Vec<Aabb> {
    let mut boxes = Vec::with_capacity((extent * extent) as usize);
    for z in 0..extent {
        for x in 0..extent {
            let h = generator.height_at(i64::from(x), i64::from(z));
            let min = Vec3::new(x as f32, 0.0, z as f32);
            boxes.push(Aabb::new(min, min + Vec3::new(1.0, h as f32 + 1.0, 1.0)));
        }
    }
    tracing::debug!("Generated {} column boxes", boxes.len());
    boxes
}

/// An indexed triangle with 16-bit indices.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Triangle {
    pub positions: [[f32; 3]; 3],
    pub indices: [u16; 3],
}

/// The triangle of the smallest scene, facing +z.
pub fn single_triangle() -> Triangle {
    Triangle {
        positions: [[-2.0, -1.0, 0.0], [2.0, -1.0, 0.0], [0.0, 1.0, 0.0]],
        indices: [0, 1, 2],
    }
}

/// Grass green, used for both terrain voxel types.
const TERRAIN_COLOR: u32 = 0x0021_4020;

/// 256 `0x00RRGGBB` colours indexed by voxel type. Type zero is empty.
pub fn palette() -> [u32; 256] {
    let mut colors = [0u32; 256];
    for (i, color) in colors.iter_mut().enumerate().skip(1) {
        // Cycle the hue through six segments of a ramp.
        let i = i as u32;
        let t = (i * 37) % 256;
        let (r, g, b) = match (i / 43) % 6 {
            0 => (255, t, 0),
            1 => (255 - t, 255, 0),
            2 => (0, 255, t),
            3 => (0, 255 - t, 255),
            4 => (t, 0, 255),
            _ => (255, 0, 255 - t),
        };
        *color = (r << 16) | (g << 8) | b;
    }
    colors[usize::from(SURFACE)] = TERRAIN_COLOR;
    colors[usize::from(GROUND)] = TERRAIN_COLOR;
    colors
}

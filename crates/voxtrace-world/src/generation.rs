//! Procedural terrain generation.

use noise::{Fbm, MultiFractal, NoiseFn, Perlin};
use rayon::prelude::*;

use crate::{WorldSeed, CHUNK_HEIGHT, CHUNK_SIZE, GROUND, SURFACE};

/// Terrain generator configuration.
#[derive(Debug, Clone)]
pub struct TerrainConfig {
    /// Seed for noise generation.
    pub seed: WorldSeed,
    /// Lowest surface height.
    pub base_height: f64,
    /// Horizontal scale of terrain features.
    pub terrain_scale: f64,
    /// Maximum terrain height variation.
    pub terrain_height: f64,
    /// Number of noise octaves for detail.
    pub octaves: usize,
    /// Frequency multiplier between octaves.
    pub lacunarity: f64,
    /// Amplitude multiplier between octaves.
    pub persistence: f64,
}

impl Default for TerrainConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            base_height: 10.0,
            terrain_scale: 400.0,
            terrain_height: 120.0,
            octaves: 4,
            lacunarity: 2.2,
            persistence: 0.42,
        }
    }
}

/// Procedural terrain generator using fractal noise.
pub struct TerrainGenerator {
    config: TerrainConfig,
    height_noise: Fbm<Perlin>,
}

impl TerrainGenerator {
    /// Create a new terrain generator with the given configuration.
    pub fn new(config: TerrainConfig) -> Self {
        let height_noise = Fbm::<Perlin>::new(config.seed as u32)
            .set_octaves(config.octaves)
            .set_lacunarity(config.lacunarity)
            .set_persistence(config.persistence);

        Self {
            config,
            height_noise,
        }
    }

    /// Create a terrain generator with default configuration.
    pub fn with_seed(seed: WorldSeed) -> Self {
        Self::new(TerrainConfig {
            seed,
            ..Default::default()
        })
    }

    /// Get the terrain configuration.
    pub fn config(&self) -> &TerrainConfig {
        &self.config
    }

    /// Surface height at world XZ coordinates.
    ///
    /// Always within `0..CHUNK_HEIGHT - 1`, so the face above the surface
    /// still fits a chunk.
    pub fn height_at(&self, world_x: i64, world_z: i64) -> u32 {
        let nx = world_x as f64 / self.config.terrain_scale;
        let nz = world_z as f64 / self.config.terrain_scale;

        // Noise returns roughly [-1, 1]
        let noise_value = self.height_noise.get([nx, nz]);
        let height = self.config.base_height + (noise_value + 1.0) * 0.5 * self.config.terrain_height;
        height.clamp(0.0, f64::from(CHUNK_HEIGHT - 2)) as u32
    }

    /// Generate the voxel field of chunk `(cx, cz)`.
    pub fn generate_field(&self, cx: i32, cz: i32) -> VoxelField {
        VoxelField::from_heights(cx, cz, |x, z| self.height_at(x, z))
    }

    /// Generate multiple chunks in parallel, in the order given.
    pub fn generate_fields_parallel(&self, positions: &[(i32, i32)]) -> Vec<VoxelField> {
        positions
            .par_iter()
            .map(|&(cx, cz)| self.generate_field(cx, cz))
            .collect()
    }
}

/// Voxel types of one chunk plus a one-voxel border of its neighbours.
///
/// Zero is empty. Columns are filled from below the chunk up to their
/// surface height, so the bottom of a chunk is never exposed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoxelField {
    pub cx: i32,
    pub cz: i32,
    /// Lowest surface height, border included.
    pub min_y: u32,
    /// Highest surface height, border included.
    pub max_y: u32,
    data: Vec<u8>,
}

const SIDE: usize = CHUNK_SIZE as usize + 2;
const LAYERS: usize = CHUNK_HEIGHT as usize + 2;

impl VoxelField {
    /// Fill chunk `(cx, cz)` from a world-space height function.
    pub fn from_heights(cx: i32, cz: i32, height: impl Fn(i64, i64) -> u32) -> Self {
        let mut data = vec![0u8; SIDE * LAYERS * SIDE];
        let mut min_y = u32::MAX;
        let mut max_y = 0;
        let base_x = i64::from(cx) * i64::from(CHUNK_SIZE);
        let base_z = i64::from(cz) * i64::from(CHUNK_SIZE);

        for z in -1..=CHUNK_SIZE as i32 {
            for x in -1..=CHUNK_SIZE as i32 {
                let h = height(base_x + i64::from(x), base_z + i64::from(z)).min(CHUNK_HEIGHT - 2);
                min_y = min_y.min(h);
                max_y = max_y.max(h);
                for y in -1..=h as i32 {
                    data[index(x, y, z)] = if y == h as i32 { SURFACE } else { GROUND };
                }
            }
        }

        Self {
            cx,
            cz,
            min_y,
            max_y,
            data,
        }
    }

    /// Voxel type at chunk-local coordinates; the border is `-1` and
    /// `CHUNK_SIZE` horizontally, `-1` and `CHUNK_HEIGHT` vertically.
    pub fn get(&self, x: i32, y: i32, z: i32) -> u8 {
        let size = CHUNK_SIZE as i32;
        let height = CHUNK_HEIGHT as i32;
        if !(-1..=size).contains(&x) || !(-1..=height).contains(&y) || !(-1..=size).contains(&z) {
            return 0;
        }
        self.data[index(x, y, z)]
    }

    pub fn is_solid(&self, x: i32, y: i32, z: i32) -> bool {
        self.get(x, y, z) != 0
    }
}

fn index(x: i32, y: i32, z: i32) -> usize {
    (x + 1) as usize + SIDE * ((z + 1) as usize + (y + 1) as usize * SIDE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generator_deterministic() {
        let gen1 = TerrainGenerator::with_seed(12345);
        let gen2 = TerrainGenerator::with_seed(12345);

        for x in -100..100 {
            for z in -100..100 {
                assert_eq!(gen1.height_at(x, z), gen2.height_at(x, z));
            }
        }
    }

    #[test]
    fn heights_stay_inside_the_chunk() {
        let gen = TerrainGenerator::new(TerrainConfig {
            terrain_height: 1000.0,
            ..Default::default()
        });
        for x in (-2000..2000).step_by(37) {
            for z in (-2000..2000).step_by(41) {
                assert!(gen.height_at(x, z) <= CHUNK_HEIGHT - 2);
            }
        }
    }

    #[test]
    fn columns_are_filled_up_to_the_surface() {
        let field = VoxelField::from_heights(0, 0, |x, z| (x + z).rem_euclid(5) as u32 + 3);

        for (x, z) in [(0i32, 0i32), (4, 7), (31, 31), (-1, 32)] {
            let h = (x + z).rem_euclid(5) + 3;
            assert_eq!(field.get(x, h, z), SURFACE);
            assert_eq!(field.get(x, h - 1, z), GROUND);
            assert_eq!(field.get(x, -1, z), GROUND);
            assert_eq!(field.get(x, h + 1, z), 0);
        }
        assert_eq!(field.min_y, 3);
        assert_eq!(field.max_y, 7);
        assert_eq!(field.get(40, 0, 0), 0);
    }

    #[test]
    fn border_matches_neighbouring_chunk() {
        let gen = TerrainGenerator::with_seed(7);
        let left = gen.generate_field(0, 0);
        let right = gen.generate_field(1, 0);

        for z in 0..CHUNK_SIZE as i32 {
            for y in 0..CHUNK_HEIGHT as i32 {
                assert_eq!(left.get(CHUNK_SIZE as i32, y, z), right.get(0, y, z));
                assert_eq!(right.get(-1, y, z), left.get(CHUNK_SIZE as i32 - 1, y, z));
            }
        }
    }

    #[test]
    fn parallel_generation_matches_sequential() {
        let gen = TerrainGenerator::with_seed(42);
        let positions = vec![(0, 0), (1, 0), (0, 1), (-2, -2)];

        let parallel = gen.generate_fields_parallel(&positions);
        for ((cx, cz), field) in positions.into_iter().zip(parallel) {
            assert_eq!(field, gen.generate_field(cx, cz));
        }
    }
}

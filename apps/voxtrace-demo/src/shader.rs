//! Loading precompiled SPIR-V from disk.

use std::path::Path;

use anyhow::{bail, Context};
use voxtrace_gpu::RayTracingShaders;

const SPIRV_MAGIC: u32 = 0x0723_0203;

/// Stage files looked up in a ray tracing shader directory.
pub const RAYGEN_FILE: &str = "raygen.spv";
pub const MISS_FILE: &str = "miss.spv";
pub const CLOSEST_HIT_FILE: &str = "closest_hit.spv";
pub const INTERSECTION_FILE: &str = "intersection.spv";

/// Shaders for the frame pass; which one runs depends on the scene.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TraceShaders {
    /// Compute shader tracing with ray queries.
    pub query: Option<Vec<u32>>,
    pub pipeline: Option<PipelineShaderCode>,
}

/// Stages of a ray tracing pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineShaderCode {
    pub raygen: Vec<u32>,
    pub miss: Vec<u32>,
    pub closest_hit: Vec<u32>,
    pub intersection: Option<Vec<u32>>,
}

impl PipelineShaderCode {
    /// Load the stages from `dir`. The intersection stage is only read for
    /// procedural geometry.
    pub fn load(dir: &Path, procedural: bool) -> anyhow::Result<Self> {
        let stage = |file: &str| load_spirv(&dir.join(file));
        Ok(Self {
            raygen: stage(RAYGEN_FILE)?,
            miss: stage(MISS_FILE)?,
            closest_hit: stage(CLOSEST_HIT_FILE)?,
            intersection: procedural.then(|| stage(INTERSECTION_FILE)).transpose()?,
        })
    }

    pub fn shaders(&self) -> RayTracingShaders<'_> {
        RayTracingShaders {
            raygen: &self.raygen,
            miss: &self.miss,
            closest_hit: &self.closest_hit,
            intersection: self.intersection.as_deref(),
        }
    }
}

/// Read a SPIR-V module from `path`.
pub fn load_spirv(path: &Path) -> anyhow::Result<Vec<u32>> {
    let bytes = std::fs::read(path).with_context(|| format!("Failed to read shader {}", path.display()))?;
    bytes_to_spirv(&bytes).with_context(|| format!("Invalid shader {}", path.display()))
}

/// Convert little-endian SPIR-V bytes into words.
pub fn bytes_to_spirv(bytes: &[u8]) -> anyhow::Result<Vec<u32>> {
    if bytes.len() % 4 != 0 {
        bail!("SPIR-V length {} is not a multiple of 4", bytes.len());
    }
    let words: Vec<u32> = bytes
        .chunks_exact(4)
        .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect();
    match words.first() {
        Some(&SPIRV_MAGIC) => Ok(words),
        Some(&magic) => bail!("bad SPIR-V magic number {magic:#010x}"),
        None => bail!("empty SPIR-V module"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn module(words: &[u32]) -> Vec<u8> {
        words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    #[test]
    fn words_are_little_endian() {
        let words = bytes_to_spirv(&module(&[SPIRV_MAGIC, 0x0001_0500, 7])).unwrap();
        assert_eq!(words, vec![SPIRV_MAGIC, 0x0001_0500, 7]);
    }

    #[test]
    fn malformed_modules_are_rejected() {
        assert!(bytes_to_spirv(&[]).is_err());
        assert!(bytes_to_spirv(&module(&[0x0302_2307])).is_err());
        let mut truncated = module(&[SPIRV_MAGIC, 1]);
        truncated.pop();
        assert!(bytes_to_spirv(&truncated).is_err());
    }

    #[test]
    fn pipeline_stages_are_read_from_the_directory() {
        let dir = std::env::temp_dir().join(format!("voxtrace-shaders-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        for (file, tag) in [(RAYGEN_FILE, 1), (MISS_FILE, 2), (CLOSEST_HIT_FILE, 3)] {
            std::fs::write(dir.join(file), module(&[SPIRV_MAGIC, tag])).unwrap();
        }

        let code = PipelineShaderCode::load(&dir, false).unwrap();
        assert_eq!(code.raygen, vec![SPIRV_MAGIC, 1]);
        assert_eq!(code.miss, vec![SPIRV_MAGIC, 2]);
        assert_eq!(code.closest_hit, vec![SPIRV_MAGIC, 3]);
        assert!(code.intersection.is_none());
        assert!(code.shaders().intersection.is_none());

        // Procedural geometry needs the intersection stage as well.
        let err = PipelineShaderCode::load(&dir, true).unwrap_err();
        assert!(format!("{err:#}").contains(INTERSECTION_FILE));

        std::fs::write(dir.join(INTERSECTION_FILE), module(&[SPIRV_MAGIC, 4])).unwrap();
        let code = PipelineShaderCode::load(&dir, true).unwrap();
        assert_eq!(code.shaders().intersection, Some(&[SPIRV_MAGIC, 4][..]));

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn missing_file_names_the_path() {
        let err = load_spirv(Path::new("/nonexistent/trace.spv")).unwrap_err();
        assert!(format!("{err:#}").contains("/nonexistent/trace.spv"));
    }
}

//! voxtrace demo
//!
//! Builds acceleration structures over a procedural scene and renders it
//! into the swapchain. Chunk and cube scenes are traced with the ray tracing
//! pipeline when its shaders are given and the device supports it; the
//! triangle scene, and the others as a fallback, use ray queries from a
//! compute shader.
//!
//! ## Usage
//!
//! ```bash
//! cargo run -p voxtrace-demo -- [OPTIONS]
//! ```
//!
//! ## Options
//!
//! - `--scene <chunks|cubes|triangle>`: Scene to build (default: chunks)
//! - `--radius <N>`: Chunk radius around the origin (default: 2)
//! - `--seed <N>`: Terrain seed (default: 0)
//! - `--shader <PATH>`: SPIR-V ray query compute shader
//! - `--rt-shaders <DIR>`: Directory with `raygen.spv`, `miss.spv`,
//!   `closest_hit.spv` and, for cubes, `intersection.spv`
//! - `--images <N>`: Preferred swapchain image count (default: 3)
//! - `--fps <N>`: Frame rate cap
//! - `--vsync`: Present with vsync
//! - `--no-validation`: Disable validation layers in debug builds
//! - `-h, --help`: Print help message
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: Set log level (e.g., info, debug, trace)

mod camera;
mod pass;
mod scene;
mod shader;

use std::path::PathBuf;

use anyhow::Context;
use voxtrace_app::AppConfig;
use voxtrace_gpu::{DeferredQueue, VulkanDevice};

use crate::pass::ScenePass;
use crate::scene::SceneOptions;
use crate::shader::{PipelineShaderCode, TraceShaders};

const WIDTH: u32 = 1280;
const HEIGHT: u32 = 720;

#[derive(Debug, Clone, PartialEq)]
struct Args {
    scene: SceneOptions,
    shader: Option<PathBuf>,
    rt_shaders: Option<PathBuf>,
    images: u32,
    target_fps: Option<u32>,
    vsync: bool,
    validation: bool,
    help: bool,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            scene: SceneOptions::default(),
            shader: None,
            rt_shaders: None,
            images: 3,
            target_fps: None,
            vsync: false,
            validation: cfg!(debug_assertions),
            help: false,
        }
    }
}

fn parse_args(args: impl IntoIterator<Item = String>) -> Result<Args, String> {
    fn value<T: std::str::FromStr>(flag: &str, value: Option<String>) -> Result<T, String> {
        let value = value.ok_or_else(|| format!("{flag} needs a value"))?;
        value
            .parse()
            .map_err(|_| format!("invalid value '{value}' for {flag}"))
    }

    let mut parsed = Args::default();
    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--scene" => {
                let name: String = value(&arg, args.next())?;
                parsed.scene.kind = name.parse()?;
            }
            "--radius" => parsed.scene.radius = value(&arg, args.next())?,
            "--seed" => parsed.scene.seed = value(&arg, args.next())?,
            "--shader" => parsed.shader = Some(value(&arg, args.next())?),
            "--rt-shaders" => parsed.rt_shaders = Some(value(&arg, args.next())?),
            "--images" => parsed.images = value(&arg, args.next())?,
            "--fps" => parsed.target_fps = Some(value(&arg, args.next())?),
            "--vsync" => parsed.vsync = true,
            "--no-validation" => parsed.validation = false,
            "-h" | "--help" => parsed.help = true,
            other => return Err(format!("unknown argument '{other}'")),
        }
    }
    if parsed.scene.radius < 0 {
        return Err("--radius must not be negative".to_string());
    }
    Ok(parsed)
}

fn main() -> anyhow::Result<()> {
    let args = match parse_args(std::env::args().skip(1)) {
        Ok(args) => args,
        Err(message) => {
            eprintln!("error: {message}\n");
            print_help();
            std::process::exit(2);
        }
    };
    if args.help {
        print_help();
        return Ok(());
    }

    let shaders = TraceShaders {
        query: args
            .shader
            .as_deref()
            .map(shader::load_spirv)
            .transpose()
            .context("Failed to load ray query shader")?,
        pipeline: args
            .rt_shaders
            .as_deref()
            .map(|dir| PipelineShaderCode::load(dir, args.scene.kind.is_procedural()))
            .transpose()
            .context("Failed to load ray tracing shaders")?,
    };

    let mut config = AppConfig::new(format!("voxtrace - {:?}", args.scene.kind))
        .with_size(WIDTH, HEIGHT)
        .with_vsync(args.vsync)
        .with_validation(args.validation)
        .with_image_count(args.images);
    if let Some(fps) = args.target_fps {
        config = config.with_target_fps(fps);
    }

    let options = args.scene;
    voxtrace_app::run(
        config,
        Box::new(move |device: &mut VulkanDevice, deferred: &mut DeferredQueue| {
            ScenePass::new(device, deferred, &options, &shaders)
        }),
    )
}

fn print_help() {
    eprintln!(
        "voxtrace demo: ray traced voxel scenes

USAGE:
    cargo run -p voxtrace-demo -- [OPTIONS]

SCENE OPTIONS:
    --scene <NAME>          chunks, cubes or triangle (default: chunks)
    --radius <N>            Chunk radius around the origin (default: 2)
    --seed <N>              Terrain seed (default: 0)

RENDER OPTIONS:
    --shader <PATH>         SPIR-V compute shader tracing with ray queries
    --rt-shaders <DIR>      Ray tracing pipeline stages: raygen.spv, miss.spv,
                            closest_hit.spv and, for cubes, intersection.spv
                            Used for chunks and cubes when the device has
                            ray tracing pipeline support
                            Without any shader frames are only cleared
    --images <N>            Preferred swapchain image count (default: 3)
    --fps <N>               Frame rate cap (default: unlimited)
    --vsync                 Present with vsync
    --no-validation         Disable validation layers in debug builds

OTHER:
    -h, --help              Print this help message

ENVIRONMENT VARIABLES:
    RUST_LOG                Set log level (e.g., info, debug, trace)"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::SceneKind;

    fn parse(args: &[&str]) -> Result<Args, String> {
        parse_args(args.iter().map(|s| (*s).to_string()))
    }

    #[test]
    fn defaults_trace_chunks() {
        let args = parse(&[]).unwrap();
        assert_eq!(args.scene.kind, SceneKind::Chunks);
        assert_eq!(args.scene.radius, 2);
        assert_eq!(args.images, 3);
        assert!(args.shader.is_none());
        assert!(args.rt_shaders.is_none());
        assert!(!args.help);
    }

    #[test]
    fn options_are_applied() {
        let args = parse(&[
            "--scene", "cubes", "--radius", "1", "--seed", "99", "--shader", "trace.spv", "--rt-shaders",
            "shaders/rt", "--images", "2", "--fps", "60", "--vsync", "--no-validation",
        ])
        .unwrap();
        assert_eq!(args.scene.kind, SceneKind::Cubes);
        assert_eq!(args.scene.radius, 1);
        assert_eq!(args.scene.seed, 99);
        assert_eq!(args.shader, Some(PathBuf::from("trace.spv")));
        assert_eq!(args.rt_shaders, Some(PathBuf::from("shaders/rt")));
        assert_eq!(args.images, 2);
        assert_eq!(args.target_fps, Some(60));
        assert!(args.vsync);
        assert!(!args.validation);
    }

    #[test]
    fn bad_arguments_are_reported() {
        assert!(parse(&["--scene", "spheres"]).is_err());
        assert!(parse(&["--radius"]).is_err());
        assert!(parse(&["--radius", "-1"]).is_err());
        assert!(parse(&["--images", "many"]).is_err());
        assert!(parse(&["--rt-shaders"]).is_err());
        assert!(parse(&["--frobnicate"]).is_err());
        assert!(parse(&["-h"]).unwrap().help);
    }
}

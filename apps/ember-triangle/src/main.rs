//! Ember Triangle
//!
//! Draws a colour-interpolated quad through the Ember frame pipeline. Useful
//! as a smoke test for swapchain rebuilds: resize or minimize the window
//! while it runs.
//!
//! ## Usage
//!
//! ```bash
//! glslc shaders/triangle.vert -o shaders/triangle.vert.spv
//! glslc shaders/triangle.frag -o shaders/triangle.frag.spv
//! cargo run -p ember-triangle -- [OPTIONS]
//! ```
//!
//! ## Options
//!
//! - `--vert <PATH>`: Vertex shader SPIR-V (default: `shaders/triangle.vert.spv`)
//! - `--frag <PATH>`: Fragment shader SPIR-V (default: `shaders/triangle.frag.spv`)
//! - `--width <N>`, `--height <N>`: Initial window size (default: 1280x720)
//! - `--frames-in-flight <N>`: Frames the CPU may run ahead (default: 2)
//! - `--fps <N>`: Frame rate cap
//! - `--vsync`: Force FIFO presentation
//! - `--frames <N>`: Exit after N presented frames
//! - `--no-validation`: Disable Vulkan validation layers
//! - `-h, --help`: Print help message
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: Set log level (e.g., info, debug, trace)

use std::mem::{offset_of, size_of};
use std::path::PathBuf;
use std::process::ExitCode;
use std::str::FromStr;

use anyhow::{bail, Context};
use ash::vk;
use bytemuck::{Pod, Zeroable};
use ember_app::{run_frame_loop, AppConfig, Scene};
use ember_gpu::{read_spirv_file, GraphicsPipelineConfig};
use glam::{Vec2, Vec3};

const WIDTH: u32 = 1280;
const HEIGHT: u32 = 720;
const DEFAULT_VERT: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/shaders/triangle.vert.spv");
const DEFAULT_FRAG: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/shaders/triangle.frag.spv");

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct Vertex {
    position: Vec2,
    color: Vec3,
}

impl Vertex {
    const fn new(position: Vec2, color: Vec3) -> Self {
        Self { position, color }
    }

    fn bindings() -> Vec<vk::VertexInputBindingDescription> {
        vec![vk::VertexInputBindingDescription {
            binding: 0,
            stride: size_of::<Self>() as u32,
            input_rate: vk::VertexInputRate::VERTEX,
        }]
    }

    fn attributes() -> Vec<vk::VertexInputAttributeDescription> {
        vec![
            vk::VertexInputAttributeDescription {
                location: 0,
                binding: 0,
                format: vk::Format::R32G32_SFLOAT,
                offset: offset_of!(Self, position) as u32,
            },
            vk::VertexInputAttributeDescription {
                location: 1,
                binding: 0,
                format: vk::Format::R32G32B32_SFLOAT,
                offset: offset_of!(Self, color) as u32,
            },
        ]
    }
}

const VERTICES: [Vertex; 4] = [
    Vertex::new(Vec2::new(-0.5, -0.5), Vec3::new(1.0, 0.0, 0.0)),
    Vertex::new(Vec2::new(0.5, -0.5), Vec3::new(0.0, 1.0, 0.0)),
    Vertex::new(Vec2::new(0.5, 0.5), Vec3::new(0.0, 0.0, 1.0)),
    Vertex::new(Vec2::new(-0.5, 0.5), Vec3::new(1.0, 1.0, 1.0)),
];

const INDICES: [u16; 6] = [0, 1, 2, 2, 3, 0];

/// Command-line options.
#[derive(Debug)]
struct Args {
    vert: PathBuf,
    frag: PathBuf,
    width: u32,
    height: u32,
    frames_in_flight: usize,
    fps: Option<u32>,
    vsync: bool,
    frames: Option<u64>,
    validation: bool,
    help: bool,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            vert: PathBuf::from(DEFAULT_VERT),
            frag: PathBuf::from(DEFAULT_FRAG),
            width: WIDTH,
            height: HEIGHT,
            frames_in_flight: ember_app::DEFAULT_FRAMES_IN_FLIGHT,
            fps: None,
            vsync: false,
            frames: None,
            validation: cfg!(debug_assertions),
            help: false,
        }
    }
}

impl Args {
    /// Parse arguments, excluding the program name.
    fn parse(args: impl IntoIterator<Item = String>) -> anyhow::Result<Self> {
        let mut parsed = Self::default();
        let mut args = args.into_iter();

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "-h" | "--help" => parsed.help = true,
                "--vert" => parsed.vert = value(&arg, args.next())?,
                "--frag" => parsed.frag = value(&arg, args.next())?,
                "--width" => parsed.width = value(&arg, args.next())?,
                "--height" => parsed.height = value(&arg, args.next())?,
                "--frames-in-flight" => parsed.frames_in_flight = value(&arg, args.next())?,
                "--fps" => parsed.fps = Some(value(&arg, args.next())?),
                "--vsync" => parsed.vsync = true,
                "--frames" => parsed.frames = Some(value(&arg, args.next())?),
                "--no-validation" => parsed.validation = false,
                other => bail!("unknown option `{other}` (see --help)"),
            }
        }

        if parsed.frames_in_flight == 0 {
            bail!("--frames-in-flight must be at least 1");
        }
        Ok(parsed)
    }

    fn config(&self) -> AppConfig {
        let mut config = AppConfig::new("Ember Triangle")
            .with_size(self.width, self.height)
            .with_vsync(self.vsync)
            .with_validation(self.validation)
            .with_frames_in_flight(self.frames_in_flight);
        if let Some(fps) = self.fps {
            config = config.with_target_fps(fps);
        }
        if let Some(frames) = self.frames {
            config = config.with_frame_limit(frames);
        }
        config
    }
}

fn value<T>(flag: &str, raw: Option<String>) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw = raw.with_context(|| format!("{flag} expects a value"))?;
    raw.parse()
        .with_context(|| format!("invalid value `{raw}` for {flag}"))
}

fn main() -> ExitCode {
    ember_app::init_logging();
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> anyhow::Result<()> {
    let args = Args::parse(std::env::args().skip(1))?;
    if args.help {
        print_help();
        return Ok(());
    }

    let pipeline = GraphicsPipelineConfig {
        vertex_shader: read_spirv_file(&args.vert)?,
        fragment_shader: read_spirv_file(&args.frag)?,
        vertex_bindings: Vertex::bindings(),
        vertex_attributes: Vertex::attributes(),
        cull_mode: vk::CullModeFlags::NONE,
        ..Default::default()
    };
    let scene = Scene::new(pipeline)
        .with_vertices(&VERTICES)
        .with_indices(&INDICES);

    run_frame_loop(args.config(), scene)
}

fn print_help() {
    eprintln!(
        "Ember Triangle

USAGE:
    cargo run -p ember-triangle -- [OPTIONS]

SHADERS:
    --vert <PATH>           Vertex shader SPIR-V (default: shaders/triangle.vert.spv)
    --frag <PATH>           Fragment shader SPIR-V (default: shaders/triangle.frag.spv)

    Build the defaults with:
        glslc shaders/triangle.vert -o shaders/triangle.vert.spv
        glslc shaders/triangle.frag -o shaders/triangle.frag.spv

WINDOW & PACING:
    --width <N>             Initial window width (default: 1280)
    --height <N>            Initial window height (default: 720)
    --fps <N>               Frame rate cap (default: uncapped)
    --vsync                 Force FIFO presentation

FRAME PIPELINE:
    --frames-in-flight <N>  Frames the CPU may run ahead of the GPU (default: 2)
    --frames <N>            Exit after N presented frames
    --no-validation         Disable Vulkan validation layers

OTHER:
    -h, --help              Print this help message

ENVIRONMENT VARIABLES:
    RUST_LOG                Set log level (e.g., info, debug, trace)"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> anyhow::Result<Args> {
        Args::parse(args.iter().map(|s| s.to_string()))
    }

    #[test]
    fn defaults_without_arguments() {
        let args = parse(&[]).unwrap();
        assert_eq!((args.width, args.height), (WIDTH, HEIGHT));
        assert_eq!(args.frames_in_flight, 2);
        assert!(args.vert.ends_with("shaders/triangle.vert.spv"));
        assert!(args.frag.ends_with("shaders/triangle.frag.spv"));
        assert!(!args.vsync);
        assert!(!args.help);
    }

    #[test]
    fn parses_every_option() {
        let args = parse(&[
            "--vert",
            "a.spv",
            "--frag",
            "b.spv",
            "--width",
            "800",
            "--height",
            "600",
            "--frames-in-flight",
            "3",
            "--fps",
            "60",
            "--vsync",
            "--frames",
            "120",
            "--no-validation",
        ])
        .unwrap();

        assert_eq!(args.vert, PathBuf::from("a.spv"));
        assert_eq!(args.frag, PathBuf::from("b.spv"));
        assert_eq!((args.width, args.height), (800, 600));
        assert_eq!(args.frames_in_flight, 3);
        assert_eq!(args.fps, Some(60));
        assert!(args.vsync);
        assert_eq!(args.frames, Some(120));
        assert!(!args.validation);

        let config = args.config();
        assert_eq!(config.frame_limit, Some(120));
        assert_eq!(config.target_fps, Some(60));
    }

    #[test]
    fn rejects_bad_input() {
        assert!(parse(&["--width"]).is_err());
        assert!(parse(&["--width", "wide"]).is_err());
        assert!(parse(&["--frames-in-flight", "0"]).is_err());
        assert!(parse(&["--bogus"]).is_err());
    }

    #[test]
    fn vertex_layout_matches_shader() {
        assert_eq!(size_of::<Vertex>(), 20);
        let attributes = Vertex::attributes();
        assert_eq!(attributes[0].offset, 0);
        assert_eq!(attributes[1].offset, 8);
        assert_eq!(Vertex::bindings()[0].stride, 20);
    }
}

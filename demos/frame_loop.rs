//! # Frame Loop Demo
//!
//! Headless frame loop driving the frame core: every frame streams a block of
//! per-frame data, occasionally replaces a texture and drops the old one, clears
//! an offscreen color target in a render pass, and reports how many deferred
//! objects are still waiting for the device.
//!
//! ```bash
//! cargo run --example frame_loop -- --backend dummy --max-frames 120
//! RUST_LOG=debug cargo run --example frame_loop -- --backend vulkan
//! ```

use std::time::Instant;

use clap::Parser;
use gpu_frames::{
    BackendType, BufferDescriptor, BufferUsage, FrameCore, FrameError, FrameParameters, LoadOp,
    OverflowPolicy, RenderPassDescriptor, StoreOp, Texture, TextureDescriptor, TextureFormat,
    TextureUsage,
};

/// Graphics backend selection for CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
enum CliBackend {
    /// Vulkan when available, otherwise the dummy backend.
    #[default]
    Auto,
    /// Native Vulkan via ash.
    Vulkan,
    /// Simulated device, no GPU required.
    Dummy,
}

impl From<CliBackend> for BackendType {
    fn from(cli: CliBackend) -> Self {
        match cli {
            CliBackend::Auto => BackendType::Auto,
            CliBackend::Vulkan => BackendType::Vulkan,
            CliBackend::Dummy => BackendType::Dummy,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "frame_loop", about = "Headless frame loop demo", version)]
struct Args {
    /// Graphics backend to use.
    #[arg(long, default_value = "auto", value_enum)]
    backend: CliBackend,

    /// Number of frames to run.
    #[arg(long, default_value = "60")]
    max_frames: u64,

    /// Staging memory per frame slot, in KiB.
    #[arg(long, default_value = "1024")]
    staging_kib: u64,

    /// Reject uploads that do not fit instead of allocating extra staging memory.
    #[arg(long)]
    strict_staging: bool,

    /// Enable API validation layers.
    #[arg(long)]
    validation: bool,

    /// Frames between texture replacements.
    #[arg(long, default_value = "8")]
    texture_interval: u64,
}

const TEXTURE_SIZE: u32 = 64;

fn create_texture(core: &FrameCore, generation: u64) -> Result<Texture, FrameError> {
    core.create_texture(
        &TextureDescriptor::new_2d(
            TEXTURE_SIZE,
            TEXTURE_SIZE,
            TextureFormat::Rgba8Unorm,
            TextureUsage::TEXTURE_BINDING | TextureUsage::COPY_DST,
        )
        .with_mip_levels(4)
        .with_label(format!("streamed texture {generation}")),
    )
}

fn run(args: &Args) -> Result<(), FrameError> {
    let overflow_policy = if args.strict_staging {
        OverflowPolicy::Fail
    } else {
        OverflowPolicy::Grow
    };
    let params = FrameParameters::new()
        .with_backend(args.backend.into())
        .with_staging_size(args.staging_kib * 1024)
        .with_overflow_policy(overflow_policy)
        .with_present_semaphore(false)
        .with_validation(args.validation);

    let core = FrameCore::with_parameters(params)?;
    log::info!("Running {} frames on {}", args.max_frames, core.backend().name());

    let per_frame = core.create_buffer(
        &BufferDescriptor::new(4096, BufferUsage::UNIFORM | BufferUsage::COPY_DST)
            .with_label("per-frame data"),
    )?;
    let mut texture = create_texture(&core, 0)?;
    let mut texture_dirty = true;

    let target = core.create_texture(
        &TextureDescriptor::new_2d(
            TEXTURE_SIZE,
            TEXTURE_SIZE,
            TextureFormat::Bgra8UnormSrgb,
            TextureUsage::RENDER_ATTACHMENT | TextureUsage::TEXTURE_BINDING,
        )
        .with_label("offscreen target"),
    )?;

    let start = Instant::now();
    for frame in 0..args.max_frames {
        core.begin_frame()?;

        let time = start.elapsed().as_secs_f32();
        let uniforms = [time, frame as f32, 0.0, 1.0];
        core.queue_buffer_upload_pod(per_frame.handle(), &uniforms, 0)?;

        if frame > 0 && args.texture_interval > 0 && frame % args.texture_interval == 0 {
            // The old texture stays alive until this frame has completed.
            texture = create_texture(&core, frame)?;
            texture_dirty = true;
        }
        if texture_dirty {
            let fill = (frame % 256) as u8;
            let texels = vec![fill; texture.upload_size() as usize];
            core.queue_texture_upload(texture.handle(), &texels, None)?;
            texture_dirty = false;
        }

        let pulse = (time.sin() + 1.0) * 0.5;
        let pass = core.begin_render_pass(
            &RenderPassDescriptor::new(TEXTURE_SIZE, TEXTURE_SIZE)
                .with_color(target.handle(), LoadOp::Clear, StoreOp::Store)
                .with_color_clear([pulse, 0.2, 0.3, 1.0]),
        )?;
        core.end_render_pass(pass)?;

        core.end_frame()?;
    }

    core.wait_idle()?;
    let elapsed = start.elapsed();
    log::info!(
        "{} frames in {:.2?} ({:.1} frames/s)",
        core.frame_number(),
        elapsed,
        core.frame_number() as f64 / elapsed.as_secs_f64().max(f64::EPSILON)
    );
    Ok(())
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    log::debug!("{:?}", args);

    if let Err(e) = run(&args) {
        log::error!("Frame loop failed: {}", e);
        std::process::exit(1);
    }
}

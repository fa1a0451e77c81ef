//! Simcoe studio.
//!
//! Opens a window and drives a `Context` frame loop. Keys:
//! - R: simulate device removal (recovered on the next frame)
//! - N: move to the next hardware adapter
//! - W: move to the software adapter
//! - Escape: exit
//!
//! `--headless` runs a scripted session against the reference backend
//! instead: frames, a resize, a device removal and an adapter switch.

use anyhow::{Context as _, Result, bail};
use clap::Parser;
use winit::dpi::LogicalSize;
use winit::event::{ElementState, WindowEvent};
use winit::keyboard::{KeyCode, PhysicalKey};

use simcoe_render::core::{App, AppControl, FrameCtx};
use simcoe_render::logging::{LoggingConfig, init_logging};
use simcoe_render::window::{ContextSettings, Runtime, RuntimeConfig};
use simcoe_render::{
    AdapterLuid, Backend, Context, ContextConfig, DebugFlags, Instance, InstanceConfig,
    ReferenceSystem, SurfaceInfo, VirtualSwapChainFactory,
};

#[derive(Parser, Debug)]
#[command(name = "simcoe-studio")]
#[command(about = "Drives the Simcoe device orchestrator")]
struct Args {
    /// Adapter to use first, as `high:low` hex
    #[arg(long)]
    adapter: Option<AdapterLuid>,

    /// Force the software adapter
    #[arg(long)]
    warp: bool,

    /// Fall back to the software adapter when no hardware adapter works
    #[arg(long)]
    allow_software: bool,

    /// Enable debug layers and forward validation messages to the log
    #[arg(long)]
    debug: bool,

    /// Number of back buffers
    #[arg(long, default_value = "2")]
    buffers: u32,

    /// Run a scripted session on the reference backend without a window
    #[arg(long)]
    headless: bool,

    /// Frames to present in headless mode
    #[arg(long, default_value = "120")]
    frames: u64,

    /// Print the available adapters and exit
    #[arg(long)]
    list_adapters: bool,
}

impl Args {
    fn debug_flags(&self) -> DebugFlags {
        let mut flags = DebugFlags::empty();
        if self.debug {
            flags |= DebugFlags::DEVICE_DEBUG_LAYER
                | DebugFlags::INFO_QUEUE
                | DebugFlags::AUTO_NAME
                | DebugFlags::DEVICE_REMOVED_INFO;
        }
        if self.warp {
            flags |= DebugFlags::WARP_ADAPTER;
        }
        flags
    }

    fn backend(&self) -> Backend {
        if self.headless {
            Backend::Reference(ReferenceSystem::default())
        } else {
            Backend::default()
        }
    }
}

fn main() -> Result<()> {
    init_logging(LoggingConfig::default());
    let args = Args::parse();

    if args.list_adapters {
        return list_adapters(&args);
    }
    if args.headless {
        return run_headless(&args);
    }

    let config = RuntimeConfig {
        title: "Simcoe Studio".to_string(),
        initial_size: LogicalSize::new(1280.0, 720.0),
        context: ContextSettings {
            debug_flags: args.debug_flags(),
            adapter_override: args.adapter,
            allow_software_adapter: args.allow_software,
            buffer_count: args.buffers,
            ..ContextSettings::default()
        },
    };
    Runtime::run(config, Studio::default())
}

fn list_adapters(args: &Args) -> Result<()> {
    let instance = Instance::new(InstanceConfig {
        flags: args.debug_flags(),
        preference: Default::default(),
        backend: args.backend(),
    })
    .context("failed to create instance")?;

    for adapter in instance.adapters() {
        let info = adapter.info();
        println!(
            "{}  {:<40} {:>6} MiB dedicated",
            info.luid,
            info.name,
            info.dedicated_video_memory >> 20
        );
    }
    if let Some(adapter) = instance.software_adapter() {
        println!("{}  {:<40} (software)", adapter.luid(), adapter.name());
    }
    Ok(())
}

// ── headless ────────────────────────────────────────────────────────────

fn run_headless(args: &Args) -> Result<()> {
    let mut config = ContextConfig::new(
        VirtualSwapChainFactory,
        SurfaceInfo::new(640, 360, args.buffers),
    )
    .with_backend(args.backend())
    .with_debug_flags(args.debug_flags())
    .with_software_fallback(args.allow_software);
    config.adapter_override = args.adapter;

    let mut context = Context::new(config).context("failed to create context")?;
    let frames = args.frames.max(4);

    for frame in 0..frames {
        if frame == frames / 4 {
            context
                .update_swap_chain(context.surface_info().with_size(800, 450))
                .context("resize failed")?;
        }
        if frame == frames / 2 {
            log::info!("simulating device removal at frame {frame}");
            context.remove_device();
        }
        if frame == frames * 3 / 4 {
            let next = next_adapter(&context);
            context
                .set_adapter(next)
                .with_context(|| format!("failed to move to adapter {next}"))?;
        }

        if let Err(e) = context.present() {
            log::warn!("frame {frame} failed: {e}");
            context
                .set_adapter(context.adapter())
                .context("device recovery failed")?;
        }
    }

    let errors = context.device().validation_errors();
    println!(
        "presented {} frames on `{}` ({}), {errors} validation errors",
        context.frames_presented(),
        context.device().adapter().name,
        context.adapter()
    );
    if errors > 0 {
        bail!("{errors} validation errors reported");
    }
    Ok(())
}

/// The hardware adapter after the active one, wrapping around.
fn next_adapter(context: &Context) -> AdapterLuid {
    let adapters = context.adapters();
    let current = context.adapter();
    adapters
        .iter()
        .position(|a| a.luid() == current)
        .and_then(|i| adapters.get((i + 1) % adapters.len()))
        .or_else(|| adapters.first())
        .map_or(current, |a| a.luid())
}

// ── windowed ────────────────────────────────────────────────────────────

#[derive(Default)]
struct Studio;

impl Studio {
    fn switch_adapter(context: &mut Context, luid: AdapterLuid) {
        if luid == context.adapter() {
            return;
        }
        if let Err(e) = context.set_adapter(luid) {
            log::error!("failed to switch to adapter {luid}: {e}");
        }
    }
}

impl App for Studio {
    fn on_window_event(&mut self, context: &mut Context, event: &WindowEvent) -> AppControl {
        let WindowEvent::KeyboardInput { event, .. } = event else {
            return AppControl::Continue;
        };
        if event.state != ElementState::Pressed || event.repeat {
            return AppControl::Continue;
        }

        match event.physical_key {
            PhysicalKey::Code(KeyCode::Escape) => return AppControl::Exit,
            PhysicalKey::Code(KeyCode::KeyR) => {
                log::info!("simulating device removal");
                context.remove_device();
            }
            PhysicalKey::Code(KeyCode::KeyN) => {
                let next = next_adapter(context);
                Self::switch_adapter(context, next);
            }
            PhysicalKey::Code(KeyCode::KeyW) => match context.software_adapter() {
                Some(adapter) => {
                    let luid = adapter.luid();
                    Self::switch_adapter(context, luid);
                }
                None => log::warn!("no software adapter available"),
            },
            _ => {}
        }
        AppControl::Continue
    }

    fn on_frame(&mut self, ctx: &mut FrameCtx<'_>) -> AppControl {
        let phase = (ctx.frame % 240) as f32 / 240.0;
        let colour = [0.0, 0.2 + 0.2 * phase, 0.4, 1.0];

        // A failed frame leaves the context inactive; the runtime recovers it
        // before the next one.
        if let Err(e) = ctx.render(|list, target| list.clear_render_target(target, colour)) {
            log::warn!("frame {} failed: {e}", ctx.frame);
        }
        AppControl::Continue
    }
}

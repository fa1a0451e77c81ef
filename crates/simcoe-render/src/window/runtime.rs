use std::sync::Arc;

use anyhow::{Context as _, Result};
use winit::application::ApplicationHandler;
use winit::dpi::{LogicalSize, PhysicalSize};
use winit::event::WindowEvent;
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::window::{Window, WindowId};

use crate::context::{Context, ContextConfig, ContextState, DescriptorHeapSizes};
use crate::core::{App, AppControl, FrameCtx};
use crate::device::FeatureLevel;
use crate::error::RenderError;
use crate::instance::{AdapterLuid, AdapterPreference, Backend, DebugFlags};
use crate::surface::{SurfaceInfo, SwapChainFactory, WindowSwapChainFactory};
use crate::texture::Format;

/// Context options the runtime applies when it builds the window's context.
#[derive(Debug, Clone)]
pub struct ContextSettings {
    pub debug_flags: DebugFlags,
    pub adapter_override: Option<AdapterLuid>,
    pub preference: AdapterPreference,
    pub target_level: FeatureLevel,
    pub allow_software_adapter: bool,
    pub backends: wgpu::Backends,
    pub sync_interval: u32,
    pub buffer_count: u32,
    pub format: Format,
    pub clear_colour: [f32; 4],
    pub heap_sizes: DescriptorHeapSizes,
}

impl Default for ContextSettings {
    fn default() -> Self {
        let info = SurfaceInfo::new(1, 1, 2);
        Self {
            debug_flags: DebugFlags::empty(),
            adapter_override: None,
            preference: AdapterPreference::HighPerformance,
            target_level: FeatureLevel::Level11_0,
            allow_software_adapter: false,
            backends: wgpu::Backends::all(),
            sync_interval: 1,
            buffer_count: info.length,
            format: info.format,
            clear_colour: info.clear_colour,
            heap_sizes: DescriptorHeapSizes::default(),
        }
    }
}

impl ContextSettings {
    fn into_config(self, factory: WindowSwapChainFactory, size: PhysicalSize<u32>) -> ContextConfig {
        let (width, height) = factory.limits().clamp_size(size.width, size.height);
        let info = SurfaceInfo::new(width, height, self.buffer_count)
            .with_format(self.format)
            .with_clear_colour(self.clear_colour);

        ContextConfig {
            debug_flags: self.debug_flags,
            adapter_override: self.adapter_override,
            preference: self.preference,
            target_level: self.target_level,
            allow_software_adapter: self.allow_software_adapter,
            backend: Backend::Wgpu(self.backends),
            sync_interval: self.sync_interval,
            heap_sizes: self.heap_sizes,
            ..ContextConfig::new(factory, info)
        }
    }
}

/// Window/runtime configuration.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub title: String,
    pub initial_size: LogicalSize<f64>,
    pub context: ContextSettings,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            title: "simcoe".to_string(),
            initial_size: LogicalSize::new(1280.0, 720.0),
            context: ContextSettings::default(),
        }
    }
}

/// Entry point for the runtime.
pub struct Runtime;

impl Runtime {
    /// Opens one window, builds a [`Context`] presenting into it and drives
    /// `app` until the window closes or the app exits.
    pub fn run<A>(config: RuntimeConfig, app: A) -> Result<()>
    where
        A: 'static + App,
    {
        let event_loop = EventLoop::new().context("failed to create winit EventLoop")?;
        let mut state = AppState::new(config, app);

        event_loop
            .run_app(&mut state)
            .context("winit event loop terminated with error")?;

        match state.startup_error.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

struct AppState<A>
where
    A: App + 'static,
{
    config: RuntimeConfig,
    app: A,

    // Declared before `window`; the context's surface must drop first.
    context: Option<Context>,
    window: Option<Arc<Window>>,

    frame: u64,
    exit_requested: bool,
    startup_error: Option<anyhow::Error>,
}

impl<A> AppState<A>
where
    A: App + 'static,
{
    fn new(config: RuntimeConfig, app: A) -> Self {
        Self {
            config,
            app,
            context: None,
            window: None,
            frame: 0,
            exit_requested: false,
            startup_error: None,
        }
    }

    fn request_exit(&mut self, event_loop: &ActiveEventLoop) {
        self.exit_requested = true;
        event_loop.exit();
    }

    fn create_window_and_context(&mut self, event_loop: &ActiveEventLoop) -> Result<()> {
        let attrs = Window::default_attributes()
            .with_title(self.config.title.clone())
            .with_inner_size(self.config.initial_size);

        let window = Arc::new(
            event_loop
                .create_window(attrs)
                .context("failed to create window")?,
        );

        let config = self.config.context.clone().into_config(
            WindowSwapChainFactory::new(Arc::clone(&window)),
            window.inner_size(),
        );
        let context = Context::new(config).context("failed to create rendering context")?;

        window.request_redraw();
        self.window = Some(window);
        self.context = Some(context);
        Ok(())
    }

    fn destroy(&mut self) {
        self.context = None;
        self.window = None;
    }

    fn resize(&mut self, size: PhysicalSize<u32>) -> Result<(), RenderError> {
        // minimized
        if size.width == 0 || size.height == 0 {
            return Ok(());
        }
        let Some(context) = self.context.as_mut() else {
            return Ok(());
        };
        let (width, height) = WindowSwapChainFactory::LIMITS.clamp_size(size.width, size.height);
        let info = context.surface_info().with_size(width, height);
        if info == *context.surface_info() {
            return Ok(());
        }
        context.update_swap_chain(info)
    }

    fn redraw(&mut self) -> Result<AppControl, RenderError> {
        let (Some(context), Some(window)) = (self.context.as_mut(), self.window.as_ref()) else {
            return Ok(AppControl::Continue);
        };

        if context.state() != ContextState::Active {
            return Err(context.last_error().cloned().unwrap_or_else(|| {
                RenderError::InvalidState(format!("context is {:?}", context.state()))
            }));
        }

        self.frame += 1;
        let mut ctx = FrameCtx {
            window,
            context,
            frame: self.frame,
        };
        Ok(self.app.on_frame(&mut ctx))
    }

    fn recover(&mut self, event_loop: &ActiveEventLoop, error: RenderError) {
        let Some(context) = self.context.as_mut() else {
            return;
        };
        if self.app.on_device_error(context, &error) == AppControl::Exit {
            self.request_exit(event_loop);
        }
    }
}

impl<A> ApplicationHandler for AppState<A>
where
    A: App + 'static,
{
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        if let Err(e) = self.create_window_and_context(event_loop) {
            log::error!("failed to start: {e:#}");
            self.startup_error = Some(e);
            self.request_exit(event_loop);
        }
    }

    fn about_to_wait(&mut self, event_loop: &ActiveEventLoop) {
        if self.exit_requested {
            event_loop.exit();
            return;
        }

        event_loop.set_control_flow(ControlFlow::Wait);

        // Continuous redraw.
        if let Some(window) = &self.window {
            window.request_redraw();
        }
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        window_id: WindowId,
        event: WindowEvent,
    ) {
        if self.exit_requested {
            event_loop.exit();
            return;
        }
        if self.window.as_ref().map(|w| w.id()) != Some(window_id) {
            return;
        }

        if let Some(context) = self.context.as_mut() {
            if self.app.on_window_event(context, &event) == AppControl::Exit {
                self.request_exit(event_loop);
                return;
            }
        }

        match &event {
            WindowEvent::CloseRequested => {
                self.destroy();
                self.request_exit(event_loop);
            }

            WindowEvent::Resized(new_size) => {
                if let Err(e) = self.resize(*new_size) {
                    self.recover(event_loop, e);
                }
            }

            WindowEvent::ScaleFactorChanged { .. } => {
                let size = self.window.as_ref().map(|w| w.inner_size());
                if let Some(size) = size {
                    if let Err(e) = self.resize(size) {
                        self.recover(event_loop, e);
                    }
                }
            }

            WindowEvent::RedrawRequested => match self.redraw() {
                Ok(AppControl::Continue) => {}
                Ok(AppControl::Exit) => self.request_exit(event_loop),
                Err(e) => self.recover(event_loop, e),
            },

            _ => {}
        }
    }

    fn exiting(&mut self, _event_loop: &ActiveEventLoop) {
        self.destroy();
    }
}

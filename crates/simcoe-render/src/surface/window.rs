use std::any::Any;
use std::sync::Arc;

use raw_window_handle::HasWindowHandle;
use winit::window::Window;

use super::{SurfaceCreateObjects, SurfaceInfo, SwapChain, SwapChainFactory, SwapChainLimits};
use crate::error::{RenderError, RenderResult, SurfaceErrorAction};
use crate::hal::gpu::{self, GpuDevice};
use crate::texture::{Format, Surface, TextureDesc};

/// Builds swap chains presenting into a winit window.
///
/// Only wgpu devices can present; other backends fail with a surface error.
#[derive(Debug, Clone)]
pub struct WindowSwapChainFactory {
    window: Arc<Window>,
}

impl WindowSwapChainFactory {
    pub const LIMITS: SwapChainLimits = SwapChainLimits {
        min_length: 2,
        max_length: 16,
        min_size: 16,
        max_size: 16384,
    };

    pub fn new(window: Arc<Window>) -> Self {
        Self { window }
    }

    pub fn window(&self) -> &Arc<Window> {
        &self.window
    }
}

impl SwapChainFactory for WindowSwapChainFactory {
    fn limits(&self) -> SwapChainLimits {
        Self::LIMITS
    }

    fn create_swap_chain(
        &self,
        objects: &SurfaceCreateObjects<'_>,
        info: &SurfaceInfo,
    ) -> RenderResult<Box<dyn SwapChain>> {
        let gpu = gpu_device(objects)?;

        let handle = self
            .window
            .window_handle()
            .map_err(|e| RenderError::Surface(format!("window has no native handle: {e}")))?;
        log::debug!("creating window surface for {:?}", handle.as_raw());

        let surface = gpu
            .instance()
            .create_surface(Arc::clone(&self.window))
            .map_err(|e| RenderError::Surface(format!("failed to create wgpu surface: {e}")))?;

        let caps = surface.get_capabilities(gpu.adapter());
        if !caps.usages.contains(wgpu::TextureUsages::COPY_DST) {
            return Err(RenderError::Surface(
                "window surface does not accept copies".into(),
            ));
        }

        let format = choose_surface_format(&caps, info.format).ok_or_else(|| {
            RenderError::Surface("no supported 8-bit RGBA/BGRA surface format".into())
        })?;

        let config = wgpu::SurfaceConfiguration {
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_DST,
            format: format.to_wgpu(),
            width: info.width,
            height: info.height,
            present_mode: wgpu::PresentMode::Fifo,
            alpha_mode: choose_alpha_mode(&caps, None),
            view_formats: vec![],
            desired_maximum_frame_latency: info.length.saturating_sub(1).max(1),
        };
        surface.configure(gpu.device(), &config);

        let info = SurfaceInfo { format, ..*info };
        let buffers = allocate_back_buffers(objects, &info)?;

        Ok(Box::new(WindowSwapChain {
            window: Arc::clone(&self.window),
            surface,
            device: gpu.device().clone(),
            queue: gpu.queue().clone(),
            present_modes: caps.present_modes,
            config,
            buffers,
            index: 0,
            info,
        }))
    }
}

fn gpu_device<'a>(objects: &SurfaceCreateObjects<'a>) -> RenderResult<&'a GpuDevice> {
    objects
        .device
        .raw()
        .as_any()
        .downcast_ref::<GpuDevice>()
        .ok_or_else(|| RenderError::Surface("window swap chains require a wgpu device".into()))
}

fn allocate_back_buffers(
    objects: &SurfaceCreateObjects<'_>,
    info: &SurfaceInfo,
) -> RenderResult<Vec<Surface>> {
    (0..info.length)
        .map(|i| {
            let desc = TextureDesc::render_target(info.width, info.height, info.format)
                .with_label(objects.device.object_label(format_args!("back buffer {i}")))
                .with_clear_colour(info.clear_colour);
            objects.allocator.allocate_surface(desc)
        })
        .collect()
}

/// Swap chain presenting into a window surface.
///
/// Frames render into device-owned back buffers; presenting copies the
/// current back buffer into the acquired surface texture.
pub struct WindowSwapChain {
    window: Arc<Window>,
    surface: wgpu::Surface<'static>,
    device: wgpu::Device,
    queue: wgpu::Queue,
    present_modes: Vec<wgpu::PresentMode>,
    config: wgpu::SurfaceConfiguration,
    buffers: Vec<Surface>,
    index: u32,
    info: SurfaceInfo,
}

impl WindowSwapChain {
    pub fn window(&self) -> &Window {
        &self.window
    }

    pub fn present_mode(&self) -> wgpu::PresentMode {
        self.config.present_mode
    }

    fn acquire(&self) -> RenderResult<Option<wgpu::SurfaceTexture>> {
        let err = match self.surface.get_current_texture() {
            Ok(frame) => return Ok(Some(frame)),
            Err(err) => err,
        };

        match map_surface_error(&self.surface, &self.device, &self.config, err.clone()) {
            SurfaceErrorAction::Reconfigured => {
                self.surface.get_current_texture().map(Some).map_err(|e| {
                    RenderError::Surface(format!("surface unusable after reconfigure: {e}"))
                })
            }
            SurfaceErrorAction::SkipFrame => {
                log::warn!("skipping presentation: {err}");
                Ok(None)
            }
            SurfaceErrorAction::Fatal => {
                Err(RenderError::Surface(format!("fatal surface error: {err}")))
            }
        }
    }
}

impl SwapChain for WindowSwapChain {
    fn info(&self) -> &SurfaceInfo {
        &self.info
    }

    fn length(&self) -> u32 {
        self.buffers.len() as u32
    }

    fn current_surface_index(&self) -> u32 {
        self.index
    }

    fn surface(&self, index: u32) -> RenderResult<Surface> {
        self.buffers
            .get(index as usize)
            .cloned()
            .ok_or_else(|| super::surface_out_of_range(index, self.length()))
    }

    fn present(&mut self, sync_interval: u32) -> RenderResult<()> {
        let mode = choose_present_mode(&self.present_modes, sync_interval);
        if mode != self.config.present_mode {
            log::debug!("switching present mode to {mode:?}");
            self.config.present_mode = mode;
            self.surface.configure(&self.device, &self.config);
        }

        let current = self.index as usize;
        self.index = (self.index + 1) % self.length();

        let Some(frame) = self.acquire()? else {
            return Ok(());
        };

        let source = gpu::downcast(self.buffers[current].raw())?;
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("simcoe present copy"),
            });
        encoder.copy_texture_to_texture(
            source.texture().as_image_copy(),
            frame.texture.as_image_copy(),
            wgpu::Extent3d {
                width: self.config.width.min(frame.texture.width()),
                height: self.config.height.min(frame.texture.height()),
                depth_or_array_layers: 1,
            },
        );
        self.queue.submit(std::iter::once(encoder.finish()));

        self.window.pre_present_notify();
        frame.present();
        Ok(())
    }

    fn update_surface_info(
        &mut self,
        objects: &SurfaceCreateObjects<'_>,
        info: &SurfaceInfo,
    ) -> RenderResult<()> {
        let gpu = gpu_device(objects)?;
        self.buffers.clear();

        self.config.width = info.width;
        self.config.height = info.height;
        self.config.desired_maximum_frame_latency = info.length.saturating_sub(1).max(1);
        self.device = gpu.device().clone();
        self.queue = gpu.queue().clone();
        self.surface.configure(&self.device, &self.config);

        // the surface format was fixed at creation
        let info = SurfaceInfo {
            format: self.info.format,
            ..*info
        };
        self.buffers = allocate_back_buffers(objects, &info)?;
        self.info = info;
        self.index = 0;
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Picks the requested format if the surface supports it, else the closest
/// 8-bit format with the same sRGB-ness, else any supported 8-bit format.
fn choose_surface_format(caps: &wgpu::SurfaceCapabilities, requested: Format) -> Option<Format> {
    let supported: Vec<Format> = caps
        .formats
        .iter()
        .filter_map(|f| Format::from_wgpu(*f))
        .collect();

    if supported.contains(&requested) {
        return Some(requested);
    }
    supported
        .iter()
        .copied()
        .find(|f| f.is_srgb() == requested.is_srgb())
        .or_else(|| supported.first().copied())
}

fn choose_alpha_mode(
    caps: &wgpu::SurfaceCapabilities,
    requested: Option<wgpu::CompositeAlphaMode>,
) -> wgpu::CompositeAlphaMode {
    requested
        .filter(|m| caps.alpha_modes.contains(m))
        .or_else(|| caps.alpha_modes.first().copied())
        .unwrap_or(wgpu::CompositeAlphaMode::Auto)
}

/// Sync interval 0 asks for an unsynchronized mode when the surface offers one.
fn choose_present_mode(available: &[wgpu::PresentMode], sync_interval: u32) -> wgpu::PresentMode {
    if sync_interval == 0 {
        for mode in [wgpu::PresentMode::Immediate, wgpu::PresentMode::Mailbox] {
            if available.contains(&mode) {
                return mode;
            }
        }
    }
    wgpu::PresentMode::Fifo
}

fn map_surface_error(
    surface: &wgpu::Surface,
    device: &wgpu::Device,
    config: &wgpu::SurfaceConfiguration,
    err: wgpu::SurfaceError,
) -> SurfaceErrorAction {
    match err {
        wgpu::SurfaceError::Lost | wgpu::SurfaceError::Outdated => {
            surface.configure(device, config);
            SurfaceErrorAction::Reconfigured
        }
        wgpu::SurfaceError::OutOfMemory => SurfaceErrorAction::Fatal,
        wgpu::SurfaceError::Timeout => SurfaceErrorAction::SkipFrame,
        wgpu::SurfaceError::Other => SurfaceErrorAction::SkipFrame,
    }
}

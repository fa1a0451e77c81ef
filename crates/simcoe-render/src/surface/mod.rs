//! Presentation surfaces.
//!
//! A [`SwapChainFactory`] knows how to build one kind of [`SwapChain`]: a
//! window-backed chain presenting through wgpu, or a virtual chain that keeps
//! its back buffers in device memory for headless runs and tests. The context
//! only talks to the traits.

mod offscreen;
mod window;

use std::any::Any;
use std::fmt;

use crate::device::Device;
use crate::error::{RenderError, RenderResult};
use crate::instance::Instance;
use crate::memory::Allocator;
use crate::queue::CommandQueue;
use crate::texture::{Format, Surface};

pub use offscreen::{VirtualSwapChain, VirtualSwapChainFactory};
pub use window::{WindowSwapChain, WindowSwapChainFactory};

/// Requested presentation geometry.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct SurfaceInfo {
    pub format: Format,
    pub width: u32,
    pub height: u32,
    /// Number of back buffers.
    pub length: u32,
    pub clear_colour: [f32; 4],
}

impl SurfaceInfo {
    pub fn new(width: u32, height: u32, length: u32) -> Self {
        Self {
            format: Format::Rgba8Unorm,
            width,
            height,
            length,
            clear_colour: [0.0, 0.2, 0.4, 1.0],
        }
    }

    pub fn with_format(mut self, format: Format) -> Self {
        self.format = format;
        self
    }

    pub fn with_clear_colour(mut self, colour: [f32; 4]) -> Self {
        self.clear_colour = colour;
        self
    }

    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn with_length(mut self, length: u32) -> Self {
        self.length = length;
        self
    }
}

/// Inclusive bounds a factory accepts for [`SurfaceInfo`].
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct SwapChainLimits {
    pub min_length: u32,
    pub max_length: u32,
    pub min_size: u32,
    pub max_size: u32,
}

impl SwapChainLimits {
    pub fn validate(&self, info: &SurfaceInfo) -> RenderResult<()> {
        if !(self.min_length..=self.max_length).contains(&info.length) {
            return Err(RenderError::Surface(format!(
                "swap chain length {} outside {}..={}",
                info.length, self.min_length, self.max_length
            )));
        }

        let sizes = self.min_size..=self.max_size;
        if !sizes.contains(&info.width) || !sizes.contains(&info.height) {
            return Err(RenderError::Surface(format!(
                "surface size {}x{} outside {}..={}",
                info.width, info.height, self.min_size, self.max_size
            )));
        }
        Ok(())
    }

    /// Clamps a window size into range, e.g. after a resize to a tiny window.
    pub fn clamp_size(&self, width: u32, height: u32) -> (u32, u32) {
        (
            width.clamp(self.min_size, self.max_size),
            height.clamp(self.min_size, self.max_size),
        )
    }
}

/// Device objects a swap chain is built against.
#[derive(Clone, Copy)]
pub struct SurfaceCreateObjects<'a> {
    pub instance: &'a Instance,
    pub device: &'a Device,
    pub queue: &'a CommandQueue,
    pub allocator: &'a Allocator,
}

impl fmt::Debug for SurfaceCreateObjects<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SurfaceCreateObjects")
            .field("device", self.device)
            .field("queue", self.queue)
            .finish_non_exhaustive()
    }
}

/// Rotating set of presentable back buffers.
pub trait SwapChain: Send {
    fn info(&self) -> &SurfaceInfo;

    fn length(&self) -> u32;

    /// Index of the back buffer the next frame renders into.
    fn current_surface_index(&self) -> u32;

    fn surface(&self, index: u32) -> RenderResult<Surface>;

    /// Presents the current back buffer and advances the index.
    fn present(&mut self, sync_interval: u32) -> RenderResult<()>;

    /// Rebuilds the back buffers for new geometry. All previously returned
    /// surfaces must have been released by the caller.
    fn update_surface_info(
        &mut self,
        objects: &SurfaceCreateObjects<'_>,
        info: &SurfaceInfo,
    ) -> RenderResult<()>;

    fn as_any(&self) -> &dyn Any;
}

/// Builds swap chains of one kind.
pub trait SwapChainFactory: Send {
    fn limits(&self) -> SwapChainLimits;

    fn create_swap_chain(
        &self,
        objects: &SurfaceCreateObjects<'_>,
        info: &SurfaceInfo,
    ) -> RenderResult<Box<dyn SwapChain>>;

    /// Validates `info` against [`limits`](Self::limits) and builds the chain.
    fn new_swap_chain(
        &self,
        objects: &SurfaceCreateObjects<'_>,
        info: &SurfaceInfo,
    ) -> RenderResult<Box<dyn SwapChain>> {
        self.limits().validate(info)?;
        let chain = self.create_swap_chain(objects, info)?;
        log::debug!(
            "created swap chain: {} x {}x{} {:?}",
            chain.length(),
            info.width,
            info.height,
            info.format
        );
        Ok(chain)
    }
}

pub(crate) fn surface_out_of_range(index: u32, length: u32) -> RenderError {
    log::error!("requested back buffer {index} of a {length}-buffer swap chain");
    RenderError::ResourceExhausted {
        resource: "swap chain surfaces",
        capacity: length,
    }
}

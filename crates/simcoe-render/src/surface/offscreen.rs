use std::any::Any;
use std::sync::Arc;

use super::{SurfaceCreateObjects, SurfaceInfo, SwapChain, SwapChainFactory, SwapChainLimits};
use crate::error::{RenderError, RenderResult};
use crate::hal::RawDevice;
use crate::texture::{ResourceState, Surface, TextureDesc};

const VIRTUAL_LIMITS: SwapChainLimits = SwapChainLimits {
    min_length: 2,
    max_length: 16,
    min_size: 16,
    max_size: 16384,
};

/// Builds headless swap chains whose back buffers never leave device memory.
#[derive(Debug, Default, Clone, Copy)]
pub struct VirtualSwapChainFactory;

impl VirtualSwapChainFactory {
    pub fn new() -> Self {
        Self
    }
}

impl SwapChainFactory for VirtualSwapChainFactory {
    fn limits(&self) -> SwapChainLimits {
        VIRTUAL_LIMITS
    }

    fn create_swap_chain(
        &self,
        objects: &SurfaceCreateObjects<'_>,
        info: &SurfaceInfo,
    ) -> RenderResult<Box<dyn SwapChain>> {
        let surfaces = allocate_surfaces(objects, info)?;
        Ok(Box::new(VirtualSwapChain {
            info: *info,
            surfaces,
            index: 0,
            presented: 0,
            device: Arc::clone(objects.device.raw()),
        }))
    }
}

fn allocate_surfaces(
    objects: &SurfaceCreateObjects<'_>,
    info: &SurfaceInfo,
) -> RenderResult<Vec<Surface>> {
    (0..info.length)
        .map(|i| {
            let desc = TextureDesc::render_target(info.width, info.height, info.format)
                .with_label(objects.device.object_label(format_args!("virtual surface {i}")))
                .with_clear_colour(info.clear_colour);
            objects.allocator.allocate_surface(desc)
        })
        .collect()
}

/// Headless swap chain.
///
/// Presenting only rotates the current index, `(i + 1) % length`. On backends
/// that track resource states, presenting a surface that is not in the
/// `Present` state is an error.
pub struct VirtualSwapChain {
    info: SurfaceInfo,
    surfaces: Vec<Surface>,
    index: u32,
    presented: u64,
    device: Arc<dyn RawDevice>,
}

impl VirtualSwapChain {
    /// Reads back the texels of back buffer `index`.
    pub fn read_surface(&self, index: u32) -> RenderResult<Vec<u32>> {
        let surface = self.surface(index)?;
        self.device.read_texture(surface.raw())
    }

    /// Number of successful presents since creation.
    pub fn presented(&self) -> u64 {
        self.presented
    }
}

impl SwapChain for VirtualSwapChain {
    fn info(&self) -> &SurfaceInfo {
        &self.info
    }

    fn length(&self) -> u32 {
        self.surfaces.len() as u32
    }

    fn current_surface_index(&self) -> u32 {
        self.index
    }

    fn surface(&self, index: u32) -> RenderResult<Surface> {
        self.surfaces
            .get(index as usize)
            .cloned()
            .ok_or_else(|| super::surface_out_of_range(index, self.length()))
    }

    fn present(&mut self, _sync_interval: u32) -> RenderResult<()> {
        if self.device.is_removed() {
            return Err(RenderError::DeviceRemoved(
                "cannot present on a removed device".into(),
            ));
        }

        let surface = &self.surfaces[self.index as usize];
        match surface.tracked_state() {
            Some(ResourceState::Present) | None => {}
            Some(state) => {
                return Err(RenderError::InvalidState(format!(
                    "presenting `{}` while it is in {state:?}",
                    surface.name()
                )));
            }
        }

        self.index = (self.index + 1) % self.length();
        self.presented += 1;
        Ok(())
    }

    fn update_surface_info(
        &mut self,
        objects: &SurfaceCreateObjects<'_>,
        info: &SurfaceInfo,
    ) -> RenderResult<()> {
        self.surfaces.clear();
        self.surfaces = allocate_surfaces(objects, info)?;
        self.info = *info;
        self.index = 0;
        self.device = Arc::clone(objects.device.raw());
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::AllocatorFlags;
    use crate::queue::QueueDesc;
    use crate::test_support;

    #[test]
    fn present_rotates_through_surfaces() {
        let instance = test_support::instance();
        let device = test_support::device_on(&instance);
        let queue = device.new_command_queue(QueueDesc::direct()).expect("queue");
        let allocator = device.new_allocator(AllocatorFlags::empty()).expect("allocator");
        let objects = SurfaceCreateObjects {
            instance: &instance,
            device: &device,
            queue: &queue,
            allocator: &allocator,
        };

        let mut chain = VirtualSwapChainFactory
            .new_swap_chain(&objects, &SurfaceInfo::new(64, 32, 3))
            .expect("swap chain");

        let mut order = Vec::new();
        for _ in 0..5 {
            order.push(chain.current_surface_index());
            chain.present(1).expect("present");
        }
        assert_eq!(order, [0, 1, 2, 0, 1]);
        assert!(chain.surface(3).is_err());
    }

    #[test]
    fn update_reallocates_and_restarts_index() {
        let instance = test_support::instance();
        let device = test_support::device_on(&instance);
        let queue = device.new_command_queue(QueueDesc::direct()).expect("queue");
        let allocator = device.new_allocator(AllocatorFlags::empty()).expect("allocator");
        let objects = SurfaceCreateObjects {
            instance: &instance,
            device: &device,
            queue: &queue,
            allocator: &allocator,
        };

        let mut chain = VirtualSwapChainFactory
            .new_swap_chain(&objects, &SurfaceInfo::new(64, 32, 2))
            .expect("swap chain");
        chain.present(0).expect("present");

        chain
            .update_surface_info(&objects, &SurfaceInfo::new(128, 16, 4))
            .expect("resize");
        assert_eq!(chain.length(), 4);
        assert_eq!(chain.current_surface_index(), 0);
        assert_eq!(chain.surface(0).expect("surface").width(), 128);
        assert_eq!(allocator.stats().live_allocations, 4);
    }

    #[test]
    fn surfaces_start_with_clear_colour() {
        let instance = test_support::instance();
        let device = test_support::device_on(&instance);
        let queue = device.new_command_queue(QueueDesc::direct()).expect("queue");
        let allocator = device.new_allocator(AllocatorFlags::empty()).expect("allocator");
        let objects = SurfaceCreateObjects {
            instance: &instance,
            device: &device,
            queue: &queue,
            allocator: &allocator,
        };

        let chain = VirtualSwapChainFactory
            .create_swap_chain(&objects, &SurfaceInfo::new(16, 16, 2))
            .expect("swap chain");
        let chain = chain
            .as_any()
            .downcast_ref::<VirtualSwapChain>()
            .expect("virtual chain");
        let texels = chain.read_surface(1).expect("read back");
        assert!(texels.iter().all(|&t| t == 0xff66_3300));
    }
}

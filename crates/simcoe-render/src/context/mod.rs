//! Device orchestration.
//!
//! [`Context`] owns the instance, the active device and everything built on
//! top of it:
//! - adapter selection and live adapter switching
//! - the swap chain, its back buffers and their render target views
//! - the present fence and the per-back-buffer frame timeline
//! - caller-registered [`DeviceResource`]s, rebuilt with the device

mod config;
mod resources;
mod select;

pub use config::{ContextConfig, DescriptorHeapSizes};
pub use resources::{DeviceResource, ResourceContext, ResourceHandle};

use std::fmt;

use crate::commands::{CommandBufferSet, CommandList};
use crate::descriptor::{DescriptorKind, DescriptorPool, HostDescriptor};
use crate::device::{Device, FeatureLevel};
use crate::error::{RenderError, RenderResult};
use crate::fence::Fence;
use crate::instance::{Adapter, AdapterLuid, Instance, InstanceConfig};
use crate::memory::{Allocator, AllocatorFlags};
use crate::queue::{CommandQueue, QueueDesc, QueueKind};
use crate::surface::{SurfaceCreateObjects, SurfaceInfo, SwapChain, SwapChainFactory};
use crate::texture::{ResourceState, Surface};

use resources::ResourceRegistry;
use select::SelectOptions;

/// Lifecycle of a [`Context`].
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ContextState {
    /// Frames can be recorded and presented.
    Active,
    /// Device objects are being torn down or rebuilt.
    Recreating,
    /// The device was lost. Recover with [`Context::set_adapter`].
    Removed,
    /// An operation failed part-way. Recover with [`Context::set_adapter`].
    Faulted,
}

/// One swap chain surface plus its frame bookkeeping.
struct BackBuffer {
    surface: Surface,
    rtv_index: u32,
    rtv: HostDescriptor,
    /// Fence value to wait for before this buffer is recorded into again.
    value: u64,
}

/// Everything created against the active device.
///
/// Fields drop in declaration order: views and fences first, the allocator
/// and queue last.
struct DeviceState {
    present_fence: Fence,
    back_buffers: Vec<BackBuffer>,
    current: u32,
    commands: CommandBufferSet,
    swap_chain: Box<dyn SwapChain>,
    srv_heap: DescriptorPool,
    dsv_heap: DescriptorPool,
    rtv_heap: DescriptorPool,
    queue: CommandQueue,
    allocator: Allocator,
}

impl DeviceState {
    fn back_buffer(&self) -> RenderResult<&BackBuffer> {
        self.back_buffers.get(self.current as usize).ok_or_else(|| {
            RenderError::InvalidState(format!("no back buffer at index {}", self.current))
        })
    }

    /// Signals the value of the frame just submitted, moves to the swap
    /// chain's next buffer and waits until the GPU is done with it.
    fn advance_frame(&mut self) -> RenderResult<()> {
        let value = self.back_buffer()?.value;
        self.commands.mark_submitted(value);
        self.present_fence.signal(&self.queue, value)?;

        self.current = self.swap_chain.current_surface_index();
        let next = self
            .back_buffers
            .get_mut(self.current as usize)
            .ok_or_else(|| {
                RenderError::InvalidState(format!(
                    "swap chain moved to missing back buffer {}",
                    self.current
                ))
            })?;
        self.present_fence.wait(next.value)?;
        next.value = value + 1;

        self.allocator.set_current_frame_index(self.current);
        Ok(())
    }

    fn release_back_buffers(&mut self, device: &Device) {
        for buffer in self.back_buffers.drain(..) {
            device.release_render_target_view(buffer.rtv);
            self.rtv_heap.free(buffer.rtv_index);
        }
    }
}

/// Owns the instance, the active device and the presentation timeline.
///
/// Rendering follows `begin` / record / `end` (or [`present`](Self::present)
/// for an empty frame). Any failure moves the context to
/// [`ContextState::Removed`] or [`ContextState::Faulted`]; calling
/// [`set_adapter`](Self::set_adapter) rebuilds it.
pub struct Context {
    /// Device objects, `None` while torn down.
    state: Option<DeviceState>,

    /// Caller-registered resources.
    resources: ResourceRegistry,

    /// Active device.
    device: Device,

    /// Builds the swap chain on every device (re)creation.
    factory: Box<dyn SwapChainFactory>,

    instance: Instance,

    /// Presentation geometry currently in effect.
    surface_info: SurfaceInfo,

    heap_sizes: DescriptorHeapSizes,
    target_level: FeatureLevel,
    sync_interval: u32,

    status: ContextState,

    /// Error that moved the context out of `Active`.
    failure: Option<RenderError>,

    /// A frame is between `begin` and `end`.
    frame_open: bool,

    frames_presented: u64,
}

impl Context {
    /// Creates the instance, selects a device and builds all device state.
    pub fn new(config: ContextConfig) -> RenderResult<Self> {
        let ContextConfig {
            debug_flags,
            adapter_override,
            preference,
            target_level,
            allow_software_adapter,
            backend,
            sync_interval,
            heap_sizes,
            swap_chain_factory,
            surface_info,
        } = config;

        swap_chain_factory.limits().validate(&surface_info)?;

        let instance = Instance::new(InstanceConfig {
            flags: debug_flags,
            preference,
            backend,
        })?;

        let device = select::select_device(
            &instance,
            &SelectOptions {
                adapter_override,
                level: target_level,
                flags: debug_flags,
                allow_software: allow_software_adapter,
            },
        )?;

        let mut context = Self {
            state: None,
            resources: ResourceRegistry::default(),
            device,
            factory: swap_chain_factory,
            instance,
            surface_info,
            heap_sizes,
            target_level,
            sync_interval,
            status: ContextState::Recreating,
            failure: None,
            frame_open: false,
            frames_presented: 0,
        };
        context.create_device_state()?;
        context.status = ContextState::Active;

        log::info!(
            "context ready on `{}` with {} back buffers",
            context.device.adapter().name,
            context.surface_info.length
        );
        Ok(context)
    }

    pub fn instance(&self) -> &Instance {
        &self.instance
    }

    /// Hardware adapters in preference order.
    pub fn adapters(&self) -> &[Adapter] {
        self.instance.adapters()
    }

    pub fn software_adapter(&self) -> Option<&Adapter> {
        self.instance.software_adapter()
    }

    /// LUID of the adapter the active device was opened on.
    pub fn adapter(&self) -> AdapterLuid {
        self.device.luid()
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn state(&self) -> ContextState {
        self.status
    }

    /// Error that last moved the context out of [`ContextState::Active`].
    pub fn last_error(&self) -> Option<&RenderError> {
        self.failure.as_ref()
    }

    pub fn surface_info(&self) -> &SurfaceInfo {
        &self.surface_info
    }

    pub fn sync_interval(&self) -> u32 {
        self.sync_interval
    }

    pub fn set_sync_interval(&mut self, interval: u32) {
        self.sync_interval = interval;
    }

    pub fn frames_presented(&self) -> u64 {
        self.frames_presented
    }

    pub fn swap_chain(&self) -> RenderResult<&dyn SwapChain> {
        Ok(self.device_state()?.swap_chain.as_ref())
    }

    pub fn allocator(&self) -> RenderResult<&Allocator> {
        Ok(&self.device_state()?.allocator)
    }

    /// Shader-visible descriptor pool shared with registered resources.
    pub fn srv_heap(&self) -> RenderResult<&DescriptorPool> {
        Ok(&self.device_state()?.srv_heap)
    }

    pub fn srv_heap_mut(&mut self) -> RenderResult<&mut DescriptorPool> {
        Ok(&mut self.device_state_mut()?.srv_heap)
    }

    pub fn rtv_heap(&self) -> RenderResult<&DescriptorPool> {
        Ok(&self.device_state()?.rtv_heap)
    }

    pub fn dsv_heap(&self) -> RenderResult<&DescriptorPool> {
        Ok(&self.device_state()?.dsv_heap)
    }

    /// Index of the back buffer the next frame renders into.
    pub fn current_frame_index(&self) -> u32 {
        self.state.as_ref().map_or(0, |s| s.current)
    }

    /// Fence value guarding each back buffer, in swap chain order.
    pub fn frame_fence_values(&self) -> Vec<u64> {
        self.state
            .as_ref()
            .map(|s| s.back_buffers.iter().map(|b| b.value).collect())
            .unwrap_or_default()
    }

    /// Last value the GPU reached on the present fence.
    pub fn present_fence_completed(&self) -> RenderResult<u64> {
        Ok(self.device_state()?.present_fence.completed_value())
    }

    /// Back buffer the current frame renders into.
    pub fn back_buffer(&self) -> RenderResult<&Surface> {
        Ok(&self.device_state()?.back_buffer()?.surface)
    }

    /// Render target view of the current back buffer.
    pub fn render_target(&self) -> RenderResult<HostDescriptor> {
        Ok(self.device_state()?.back_buffer()?.rtv)
    }

    /// Reads back the texels of back buffer `index`.
    pub fn read_back_buffer(&self, index: u32) -> RenderResult<Vec<u32>> {
        let state = self.device_state()?;
        let buffer = state
            .back_buffers
            .get(index as usize)
            .ok_or_else(|| crate::surface::surface_out_of_range(index, state.back_buffers.len() as u32))?;
        self.device.read_surface(&buffer.surface)
    }

    /// Marks the active device as lost. Returns false if it already was.
    pub fn remove_device(&self) -> bool {
        self.device.set_removed()
    }

    // ── frames ──────────────────────────────────────────────────────────

    /// Opens a frame: transitions the current back buffer to a render
    /// target, binds the SRV heap and clears to the configured colour.
    pub fn begin(&mut self) -> RenderResult<()> {
        self.ensure_active()?;
        if self.frame_open {
            return Err(RenderError::InvalidState("frame already begun".into()));
        }

        match self.record_begin() {
            Ok(()) => {
                self.frame_open = true;
                Ok(())
            }
            Err(e) => Err(self.fault(e)),
        }
    }

    /// Command list of the open frame.
    pub fn command_list(&mut self) -> RenderResult<CommandList<'_>> {
        if !self.frame_open {
            return Err(RenderError::InvalidState("no frame in progress".into()));
        }
        self.device_state_mut()?.commands.list()
    }

    /// Closes the frame: transitions back to present, submits, presents and
    /// moves to the next back buffer.
    pub fn end(&mut self) -> RenderResult<()> {
        if !self.frame_open {
            return Err(RenderError::InvalidState("end without begin".into()));
        }
        self.frame_open = false;

        match self.submit_frame() {
            Ok(()) => {
                self.frames_presented += 1;
                Ok(())
            }
            Err(e) => Err(self.fault(e)),
        }
    }

    /// Records and presents a frame containing only the clear.
    pub fn present(&mut self) -> RenderResult<()> {
        self.begin()?;
        self.end()
    }

    /// Blocks until the GPU has finished all submitted work.
    pub fn flush(&mut self) -> RenderResult<()> {
        self.ensure_active()?;
        self.wait_for_gpu().map_err(|e| self.fault(e))
    }

    fn record_begin(&mut self) -> RenderResult<()> {
        self.device.check_alive()?;
        let colour = self.surface_info.clear_colour;

        let state = self.device_state_mut()?;
        let buffer = state.back_buffer()?;
        let (surface, rtv) = (buffer.surface.clone(), buffer.rtv);

        let mut list = state.commands.list()?;
        list.barrier(&surface, ResourceState::Present, ResourceState::RenderTarget);
        list.set_descriptor_heap(&state.srv_heap);
        list.set_render_target(rtv);
        list.clear_render_target(rtv, colour);
        Ok(())
    }

    fn submit_frame(&mut self) -> RenderResult<()> {
        let sync_interval = self.sync_interval;
        let state = self.device_state_mut()?;

        let surface = state.back_buffer()?.surface.clone();
        state
            .commands
            .list()?
            .barrier(&surface, ResourceState::RenderTarget, ResourceState::Present);

        let commands = state.commands.close()?;
        state.queue.submit(commands)?;
        state.swap_chain.present(sync_interval)?;
        state.advance_frame()?;

        let slot = state.current;
        state.commands.reset(slot, &state.present_fence);
        Ok(())
    }

    fn wait_for_gpu(&mut self) -> RenderResult<()> {
        let state = self.device_state_mut()?;
        let current = state.current;
        let buffer = state.back_buffers.get_mut(current as usize).ok_or_else(|| {
            RenderError::InvalidState(format!("no back buffer at index {current}"))
        })?;

        let value = buffer.value;
        buffer.value += 1;
        state.present_fence.signal(&state.queue, value)?;
        state.present_fence.wait(value)
    }

    // ── device lifecycle ────────────────────────────────────────────────

    /// Switches to the adapter identified by `luid`, or rebuilds the device
    /// on the same adapter when `luid` is the active one.
    ///
    /// When moving to another adapter, the new device is opened before the
    /// old one is torn down; if that fails the context is left untouched.
    /// Once teardown has started, a failure leaves the context faulted.
    pub fn set_adapter(&mut self, luid: AdapterLuid) -> RenderResult<()> {
        if self.frame_open {
            return Err(RenderError::InvalidState(
                "cannot change adapter inside a frame".into(),
            ));
        }

        if self.state.is_some() {
            if let Err(e) = self.wait_for_gpu() {
                log::warn!("flush before adapter change failed: {e}");
            }
        }

        let result = if luid == self.device.luid() {
            self.recreate_device()
        } else {
            self.move_device(luid)
        };

        match result {
            Ok(()) => {
                self.status = ContextState::Active;
                self.failure = None;
                log::info!(
                    "context active on `{}` ({})",
                    self.device.adapter().name,
                    self.device.luid()
                );
                Ok(())
            }
            Err(e) if self.status != ContextState::Recreating => Err(e),
            Err(e) => Err(self.fault(e)),
        }
    }

    /// Rebuilds the swap chain for new geometry.
    ///
    /// Back buffers are recreated carrying the current fence value, and
    /// registered resources receive [`DeviceResource::update`].
    pub fn update_swap_chain(&mut self, info: SurfaceInfo) -> RenderResult<()> {
        self.ensure_active()?;
        if self.frame_open {
            return Err(RenderError::InvalidState(
                "cannot resize inside a frame".into(),
            ));
        }
        self.factory.limits().validate(&info)?;

        self.wait_for_gpu().map_err(|e| self.fault(e))?;
        self.rebuild_swap_chain(&info).map_err(|e| self.fault(e))?;

        log::debug!(
            "swap chain updated: {} x {}x{}",
            info.length,
            info.width,
            info.height
        );
        Ok(())
    }

    fn recreate_device(&mut self) -> RenderResult<()> {
        log::info!("recreating device on `{}`", self.device.adapter().name);
        self.status = ContextState::Recreating;
        self.reset_device_state();

        self.device = select::create_device_on(
            &self.instance,
            self.device.luid(),
            self.target_level,
            self.instance.flags(),
        )?;
        self.create_device_state()
    }

    fn move_device(&mut self, luid: AdapterLuid) -> RenderResult<()> {
        let device =
            select::create_device_on(&self.instance, luid, self.target_level, self.instance.flags())?;

        log::info!(
            "moving from `{}` to `{}`",
            self.device.adapter().name,
            device.adapter().name
        );
        self.status = ContextState::Recreating;
        self.reset_device_state();
        self.device = device;
        self.create_device_state()
    }

    fn create_device_state(&mut self) -> RenderResult<()> {
        let device = &self.device;
        let allocator = device.new_allocator(
            AllocatorFlags::SINGLE_THREADED | AllocatorFlags::DEFAULT_POOLS_NOT_ZEROED,
        )?;
        let queue = device.new_command_queue(QueueDesc::direct())?;

        let swap_chain = self.factory.new_swap_chain(
            &SurfaceCreateObjects {
                instance: &self.instance,
                device,
                queue: &queue,
                allocator: &allocator,
            },
            &self.surface_info,
        )?;

        let rtv_capacity = self.factory.limits().max_length + self.heap_sizes.rtv;
        let mut rtv_heap =
            DescriptorPool::new(device, DescriptorKind::RenderTarget, rtv_capacity, false)?;
        let dsv_heap =
            DescriptorPool::new(device, DescriptorKind::DepthStencil, self.heap_sizes.dsv, false)?;
        let srv_heap =
            DescriptorPool::new(device, DescriptorKind::ShaderResource, self.heap_sizes.srv, true)?;

        let mut back_buffers = create_back_buffers(device, swap_chain.as_ref(), &mut rtv_heap, 0)?;
        let current = swap_chain.current_surface_index();
        allocator.set_current_frame_index(current);

        let commands =
            CommandBufferSet::new(device, QueueKind::Direct, back_buffers.len() as u32, current)?;
        let present_fence = Fence::new(device, 0, "present fence")?;

        match back_buffers.get_mut(current as usize) {
            Some(buffer) => buffer.value += 1,
            None => {
                return Err(RenderError::InvalidState(format!(
                    "swap chain starts at missing back buffer {current}"
                )));
            }
        }

        self.state = Some(DeviceState {
            present_fence,
            back_buffers,
            current,
            commands,
            swap_chain,
            srv_heap,
            dsv_heap,
            rtv_heap,
            queue,
            allocator,
        });

        let Some(state) = self.state.as_mut() else {
            return Err(no_device_state());
        };
        let mut ctx = resource_context(&self.device, state, &self.surface_info);
        self.resources.create_all(&mut ctx)
    }

    fn rebuild_swap_chain(&mut self, info: &SurfaceInfo) -> RenderResult<()> {
        let Some(state) = self.state.as_mut() else {
            return Err(no_device_state());
        };

        let carried = state.back_buffer()?.value;
        state.release_back_buffers(&self.device);
        state.swap_chain.update_surface_info(
            &SurfaceCreateObjects {
                instance: &self.instance,
                device: &self.device,
                queue: &state.queue,
                allocator: &state.allocator,
            },
            info,
        )?;
        self.surface_info = *info;

        state.back_buffers = create_back_buffers(
            &self.device,
            state.swap_chain.as_ref(),
            &mut state.rtv_heap,
            carried,
        )?;
        state.current = state.swap_chain.current_surface_index();
        state.allocator.set_current_frame_index(state.current);
        state.commands = CommandBufferSet::new(
            &self.device,
            QueueKind::Direct,
            state.back_buffers.len() as u32,
            state.current,
        )?;

        let mut ctx = resource_context(&self.device, state, &self.surface_info);
        self.resources.update_all(&mut ctx, info)
    }

    /// Resets registered resources, then releases every device object.
    fn reset_device_state(&mut self) {
        self.resources.reset_all();
        if let Some(mut state) = self.state.take() {
            state.release_back_buffers(&self.device);
            log::debug!("released device state for epoch {}", self.device.epoch());
        }
    }

    // ── resources ───────────────────────────────────────────────────────

    /// Registers `resource` and creates it against the active device.
    ///
    /// While the context has no device state the resource is only
    /// registered; it is created by the next successful `set_adapter`.
    pub fn add_resource<T: DeviceResource>(&mut self, mut resource: T) -> RenderResult<ResourceHandle<T>> {
        if let Some(state) = self.state.as_mut() {
            let mut ctx = resource_context(&self.device, state, &self.surface_info);
            if let Err(e) = resource.create(&mut ctx) {
                resource.reset();
                return Err(e);
            }
        }
        Ok(self.resources.insert(resource))
    }

    pub fn resource<T: DeviceResource>(&self, handle: ResourceHandle<T>) -> Option<&T> {
        self.resources.get(handle)
    }

    pub fn resource_mut<T: DeviceResource>(&mut self, handle: ResourceHandle<T>) -> Option<&mut T> {
        self.resources.get_mut(handle)
    }

    /// Unregisters a resource after waiting for the GPU and resetting it.
    ///
    /// Returns `Ok(None)` for a handle that is no longer registered. Fails with
    /// [`RenderError::InvalidState`] inside a frame, since the open command
    /// list may still reference the resource.
    pub fn remove_resource<T: DeviceResource>(
        &mut self,
        handle: ResourceHandle<T>,
    ) -> RenderResult<Option<T>> {
        if self.frame_open {
            return Err(RenderError::InvalidState(
                "cannot remove a resource inside a frame".into(),
            ));
        }
        let Some(mut resource) = self.resources.remove(handle) else {
            return Ok(None);
        };
        if self.state.is_some() && !self.device.is_removed() {
            if let Err(e) = self.wait_for_gpu() {
                log::warn!("flush before resource removal failed: {e}");
            }
        }
        resource.reset();
        Ok(Some(resource))
    }

    pub fn resource_count(&self) -> usize {
        self.resources.len()
    }

    // ── internals ───────────────────────────────────────────────────────

    fn ensure_active(&self) -> RenderResult<()> {
        if self.status == ContextState::Active {
            return Ok(());
        }
        Err(self.failure.clone().unwrap_or_else(|| {
            RenderError::InvalidState(format!("context is {:?}", self.status))
        }))
    }

    /// Records `error` as the reason the context left `Active`.
    fn fault(&mut self, error: RenderError) -> RenderError {
        self.frame_open = false;
        self.status = if error.is_device_removed() || self.device.is_removed() {
            ContextState::Removed
        } else {
            ContextState::Faulted
        };
        log::error!("context {:?}: {error}", self.status);
        self.failure = Some(error.clone());
        error
    }

    fn device_state(&self) -> RenderResult<&DeviceState> {
        self.state.as_ref().ok_or_else(no_device_state)
    }

    fn device_state_mut(&mut self) -> RenderResult<&mut DeviceState> {
        self.state.as_mut().ok_or_else(no_device_state)
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        if self.state.is_some() && !self.device.is_removed() {
            if let Err(e) = self.wait_for_gpu() {
                log::warn!("flush on shutdown failed: {e}");
            }
        }
        self.reset_device_state();
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("device", &self.device)
            .field("status", &self.status)
            .field("surface_info", &self.surface_info)
            .field("current_frame", &self.current_frame_index())
            .field("resources", &self.resources.len())
            .finish_non_exhaustive()
    }
}

fn no_device_state() -> RenderError {
    RenderError::InvalidState("context has no device state".into())
}

fn resource_context<'a>(
    device: &'a Device,
    state: &'a mut DeviceState,
    surface: &'a SurfaceInfo,
) -> ResourceContext<'a> {
    ResourceContext {
        device,
        allocator: &state.allocator,
        queue: &state.queue,
        srv_heap: &mut state.srv_heap,
        surface,
        frame_count: state.back_buffers.len() as u32,
    }
}

/// Allocates a render target view for every swap chain surface.
fn create_back_buffers(
    device: &Device,
    swap_chain: &dyn SwapChain,
    rtv_heap: &mut DescriptorPool,
    initial_value: u64,
) -> RenderResult<Vec<BackBuffer>> {
    (0..swap_chain.length())
        .map(|i| {
            let surface = swap_chain.surface(i)?;
            let rtv_index = rtv_heap.allocate()?;
            let rtv = rtv_heap.host(rtv_index);
            if let Err(e) = device.create_render_target_view(&surface, rtv) {
                rtv_heap.free(rtv_index);
                return Err(e);
            }
            Ok(BackBuffer {
                surface,
                rtv_index,
                rtv,
                value: initial_value,
            })
        })
        .collect()
}

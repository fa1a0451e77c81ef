//! wgpu backend.
//!
//! wgpu tracks resource states itself, so barriers and heap bindings recorded
//! by callers are accepted and skipped. Fence signals complete from the queue's
//! submitted-work callback, which runs during device polling; each signal's
//! submission index is recorded so a wait polls only as far as it needs.

use std::any::Any;
use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::{
    FenceTimeline, HeapAddressSpace, HeapDesc, Liveness, MessageSink, RawAdapter, RawDevice,
    RawInstance, RawQueue, RawTexture, SignalLog,
};
use crate::commands::Command;
use crate::descriptor::{DescriptorKind, HostDescriptor};
use crate::device::{DebugMessage, FeatureLevel, Severity};
use crate::error::{RenderError, RenderResult};
use crate::instance::{AdapterFlags, AdapterInfo, AdapterLuid, DebugFlags};
use crate::queue::QueueKind;
use crate::texture::{ResourceState, TextureDesc, TextureUsage};

pub(crate) struct GpuInstance {
    adapters: Vec<Arc<dyn RawAdapter>>,
    software: Option<Arc<dyn RawAdapter>>,
}

impl GpuInstance {
    pub(crate) fn new(backends: wgpu::Backends, flags: DebugFlags) -> RenderResult<Self> {
        let mut instance_flags = wgpu::InstanceFlags::default();
        if flags.intersects(DebugFlags::DEVICE_DEBUG_LAYER | DebugFlags::FACTORY_DEBUG) {
            instance_flags |= wgpu::InstanceFlags::DEBUG;
        }
        if flags.contains(DebugFlags::GPU_VALIDATION) {
            instance_flags |=
                wgpu::InstanceFlags::VALIDATION | wgpu::InstanceFlags::GPU_BASED_VALIDATION;
        }

        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends,
            flags: instance_flags,
            ..Default::default()
        });

        let mut hardware: Vec<GpuAdapter> = Vec::new();
        for adapter in pollster::block_on(instance.enumerate_adapters(backends)) {
            let adapter = GpuAdapter::new(instance.clone(), adapter);
            if is_new_hardware(&adapter.info, hardware.iter().map(|a| &a.info)) {
                hardware.push(adapter);
            } else {
                log::debug!("skipping adapter `{}` in hardware list", adapter.info.name);
            }
        }

        let software = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::None,
            compatible_surface: None,
            force_fallback_adapter: true,
        }))
        .ok()
        .map(|adapter| {
            let mut adapter = GpuAdapter::new(instance.clone(), adapter);
            adapter.info.flags |= AdapterFlags::SOFTWARE;
            Arc::new(adapter) as Arc<dyn RawAdapter>
        });

        if hardware.is_empty() && software.is_none() {
            log::warn!("wgpu reported no adapters for backends {backends:?}");
        }

        Ok(Self {
            adapters: hardware
                .into_iter()
                .map(|a| Arc::new(a) as Arc<dyn RawAdapter>)
                .collect(),
            software,
        })
    }
}

impl RawInstance for GpuInstance {
    fn adapters(&self) -> Vec<Arc<dyn RawAdapter>> {
        self.adapters.clone()
    }

    fn software_adapter(&self) -> Option<Arc<dyn RawAdapter>> {
        self.software.clone()
    }

    fn tearing_supported(&self) -> bool {
        // present modes are a per-surface capability under wgpu
        false
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

struct GpuAdapter {
    instance: wgpu::Instance,
    adapter: wgpu::Adapter,
    info: AdapterInfo,
}

impl GpuAdapter {
    fn new(instance: wgpu::Instance, adapter: wgpu::Adapter) -> Self {
        let native = adapter.get_info();

        let mut flags = AdapterFlags::empty();
        match native.device_type {
            wgpu::DeviceType::IntegratedGpu => flags |= AdapterFlags::INTEGRATED,
            wgpu::DeviceType::Cpu => flags |= AdapterFlags::SOFTWARE,
            _ => {}
        }

        let info = AdapterInfo {
            name: format!("{} ({:?})", native.name, native.backend),
            luid: derive_luid(&native),
            vendor_id: native.vendor,
            device_id: native.device,
            dedicated_video_memory: 0,
            shared_system_memory: 0,
            flags,
        };

        Self {
            instance,
            adapter,
            info,
        }
    }
}

/// wgpu exposes no LUID; derive a stable one from the adapter identity.
///
/// The PCI bus id keeps two boards of the same model apart.
fn derive_luid(native: &wgpu::AdapterInfo) -> AdapterLuid {
    let mut hasher = DefaultHasher::new();
    native.name.hash(&mut hasher);
    native.vendor.hash(&mut hasher);
    native.device.hash(&mut hasher);
    native.device_pci_bus_id.hash(&mut hasher);
    native.backend.hash(&mut hasher);
    AdapterLuid::new(native.backend as i32, hasher.finish() as u32)
}

/// Software adapters and repeats of an already listed LUID stay out of the
/// hardware list.
fn is_new_hardware<'a>(
    candidate: &AdapterInfo,
    mut listed: impl Iterator<Item = &'a AdapterInfo>,
) -> bool {
    !candidate.is_software() && listed.all(|info| info.luid != candidate.luid)
}

/// Limits and features approximating each feature level.
fn requirements(level: FeatureLevel) -> (wgpu::Limits, wgpu::Features) {
    match level {
        FeatureLevel::Level11_0 | FeatureLevel::Level11_1 => {
            (wgpu::Limits::downlevel_defaults(), wgpu::Features::empty())
        }
        FeatureLevel::Level12_0 => (wgpu::Limits::default(), wgpu::Features::empty()),
        FeatureLevel::Level12_1 => (
            wgpu::Limits::default(),
            wgpu::Features::INDIRECT_FIRST_INSTANCE,
        ),
        FeatureLevel::Level12_2 => (
            wgpu::Limits::default(),
            wgpu::Features::INDIRECT_FIRST_INSTANCE | wgpu::Features::SHADER_F16,
        ),
    }
}

impl RawAdapter for GpuAdapter {
    fn info(&self) -> &AdapterInfo {
        &self.info
    }

    fn open(
        &self,
        level: FeatureLevel,
        flags: DebugFlags,
        sink: MessageSink,
    ) -> RenderResult<Arc<dyn RawDevice>> {
        let (required_limits, required_features) = requirements(level);
        let failed = |reason: String| RenderError::DeviceCreationFailed {
            adapter: self.info.name.clone(),
            reason,
        };

        let missing = required_features - self.adapter.features();
        if !missing.is_empty() {
            return Err(failed(format!(
                "feature level {level} needs unsupported features {missing:?}"
            )));
        }

        let label = flags
            .contains(DebugFlags::AUTO_NAME)
            .then(|| format!("simcoe device ({level})"));
        let (device, queue) = pollster::block_on(self.adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: label.as_deref(),
                required_features,
                required_limits,
                experimental_features: wgpu::ExperimentalFeatures::disabled(),
                memory_hints: wgpu::MemoryHints::Performance,
                trace: wgpu::Trace::Off,
            },
        ))
        .map_err(|e| failed(e.to_string()))?;

        let shared = Arc::new(Shared {
            liveness: Liveness::default(),
            views: Mutex::new(HashMap::new()),
            signals: Mutex::new(SignalLog::default()),
            errors: AtomicU64::new(0),
            sink,
        });

        {
            let shared = Arc::clone(&shared);
            device.set_device_lost_callback(move |reason, message| {
                if shared.liveness.mark_removed() {
                    shared.report(
                        Severity::Corruption,
                        format!("device lost ({reason:?}): {message}"),
                    );
                }
            });
        }

        Ok(Arc::new(GpuDevice {
            instance: self.instance.clone(),
            adapter: self.adapter.clone(),
            device,
            queue,
            shared,
            addresses: HeapAddressSpace::default(),
        }))
    }
}

/// State shared between a device, its queues and the device-lost callback.
struct Shared {
    liveness: Liveness,
    views: Mutex<HashMap<HostDescriptor, wgpu::TextureView>>,
    signals: Mutex<SignalLog<wgpu::SubmissionIndex>>,
    errors: AtomicU64,
    sink: MessageSink,
}

impl Shared {
    fn report(&self, severity: Severity, text: String) {
        if severity >= Severity::Error {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }
        (self.sink)(&DebugMessage { severity, text });
    }

    fn check_alive(&self) -> RenderResult<()> {
        if self.liveness.is_removed() {
            return Err(RenderError::DeviceRemoved("wgpu device was lost".into()));
        }
        Ok(())
    }

    fn views(&self) -> MutexGuard<'_, HashMap<HostDescriptor, wgpu::TextureView>> {
        self.views.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn signals(&self) -> MutexGuard<'_, SignalLog<wgpu::SubmissionIndex>> {
        self.signals.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub(crate) struct GpuDevice {
    instance: wgpu::Instance,
    adapter: wgpu::Adapter,
    device: wgpu::Device,
    queue: wgpu::Queue,
    shared: Arc<Shared>,
    addresses: HeapAddressSpace,
}

impl GpuDevice {
    pub(crate) fn instance(&self) -> &wgpu::Instance {
        &self.instance
    }

    pub(crate) fn adapter(&self) -> &wgpu::Adapter {
        &self.adapter
    }

    pub(crate) fn device(&self) -> &wgpu::Device {
        &self.device
    }

    pub(crate) fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    /// Blocks until `submission` has executed, or everything submitted so far
    /// when `None`.
    fn poll(&self, submission: Option<wgpu::SubmissionIndex>) -> RenderResult<()> {
        self.device
            .poll(wgpu::PollType::Wait {
                submission_index: submission,
                timeout: None,
            })
            .map(|_| ())
            .map_err(|e| RenderError::Backend(format!("device poll failed: {e}")))
    }
}

impl RawDevice for GpuDevice {
    fn is_removed(&self) -> bool {
        self.shared.liveness.is_removed()
    }

    fn set_removed(&self) -> bool {
        if !self.shared.liveness.mark_removed() {
            return false;
        }
        self.device.destroy();
        true
    }

    fn create_queue(&self, _kind: QueueKind) -> RenderResult<Arc<dyn RawQueue>> {
        self.shared.check_alive()?;
        // wgpu exposes one queue per device; every queue kind shares it.
        Ok(Arc::new(GpuQueue {
            device: self.device.clone(),
            queue: self.queue.clone(),
            shared: Arc::clone(&self.shared),
        }))
    }

    fn create_fence(&self, initial: u64) -> RenderResult<Arc<FenceTimeline>> {
        self.shared.check_alive()?;
        let fence = Arc::new(FenceTimeline::new(initial));
        self.shared.liveness.register(&fence);
        Ok(fence)
    }

    fn create_descriptor_heap(
        &self,
        kind: DescriptorKind,
        capacity: u32,
        shader_visible: bool,
    ) -> RenderResult<HeapDesc> {
        self.shared.check_alive()?;
        Ok(self.addresses.reserve(kind, capacity, shader_visible))
    }

    fn create_texture(&self, desc: &TextureDesc) -> RenderResult<Arc<dyn RawTexture>> {
        self.shared.check_alive()?;

        let mut usage = wgpu::TextureUsages::empty();
        if desc.usage.contains(TextureUsage::RENDER_TARGET) {
            usage |= wgpu::TextureUsages::RENDER_ATTACHMENT;
        }
        if desc.usage.contains(TextureUsage::COPY_SRC) {
            usage |= wgpu::TextureUsages::COPY_SRC;
        }
        if desc.usage.contains(TextureUsage::COPY_DST) {
            usage |= wgpu::TextureUsages::COPY_DST;
        }
        if desc.usage.contains(TextureUsage::SHADER_RESOURCE) {
            usage |= wgpu::TextureUsages::TEXTURE_BINDING;
        }

        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: desc.label.as_deref(),
            size: wgpu::Extent3d {
                width: desc.width,
                height: desc.height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: desc.format.to_wgpu(),
            usage,
            view_formats: &[],
        });

        let clear = desc
            .clear_colour
            .filter(|_| usage.contains(wgpu::TextureUsages::RENDER_ATTACHMENT));
        if let Some(colour) = clear {
            let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
            let mut encoder = self
                .device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                    label: Some("simcoe texture clear"),
                });
            clear_pass(&mut encoder, &view, colour);
            self.queue.submit(std::iter::once(encoder.finish()));
        }

        Ok(Arc::new(GpuTexture {
            texture,
            desc: desc.clone(),
        }))
    }

    fn create_render_target_view(
        &self,
        texture: &Arc<dyn RawTexture>,
        handle: HostDescriptor,
    ) -> RenderResult<()> {
        self.shared.check_alive()?;
        let texture = downcast(texture)?;
        if !texture.desc.usage.contains(TextureUsage::RENDER_TARGET) {
            self.shared.report(
                Severity::Error,
                format!(
                    "render target view requested for {:?} which lacks RENDER_TARGET usage",
                    texture.desc.label
                ),
            );
        }
        let view = texture
            .texture
            .create_view(&wgpu::TextureViewDescriptor::default());
        self.shared.views().insert(handle, view);
        Ok(())
    }

    fn release_render_target_view(&self, handle: HostDescriptor) {
        self.shared.views().remove(&handle);
    }

    fn read_texture(&self, texture: &Arc<dyn RawTexture>) -> RenderResult<Vec<u32>> {
        self.shared.check_alive()?;
        let texture = downcast(texture)?;
        let (width, height) = (texture.desc.width, texture.desc.height);

        let unpadded = width * 4;
        let padded = unpadded.next_multiple_of(wgpu::COPY_BYTES_PER_ROW_ALIGNMENT);
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("simcoe readback"),
            size: u64::from(padded) * u64::from(height),
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("simcoe readback"),
            });
        encoder.copy_texture_to_buffer(
            texture.texture.as_image_copy(),
            wgpu::TexelCopyBufferInfo {
                buffer: &staging,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(padded),
                    rows_per_image: Some(height),
                },
            },
            wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
        );
        let submission = self.queue.submit(std::iter::once(encoder.finish()));

        let slice = staging.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        self.poll(Some(submission))?;
        rx.recv()
            .map_err(|_| RenderError::Backend("readback callback was dropped".into()))?
            .map_err(|e| RenderError::Backend(format!("readback mapping failed: {e}")))?;

        let mut texels = vec![0u32; width as usize * height as usize];
        {
            let data = slice.get_mapped_range();
            let bytes: &mut [u8] = bytemuck::cast_slice_mut(&mut texels);
            for (row, dst) in bytes.chunks_exact_mut(unpadded as usize).enumerate() {
                let start = row * padded as usize;
                dst.copy_from_slice(&data[start..start + unpadded as usize]);
            }
        }
        staging.unmap();
        Ok(texels)
    }

    fn wait_for(&self, fence: &Arc<FenceTimeline>, value: u64) -> RenderResult<()> {
        self.shared.check_alive()?;
        let submission = self.shared.signals().submission_for(fence, value);
        if submission.is_none() {
            log::debug!("no recorded signal reaches {value}; waiting for all submitted work");
        }
        self.poll(submission)
    }

    fn validation_errors(&self) -> u64 {
        self.shared.errors.load(Ordering::Relaxed)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

struct GpuQueue {
    device: wgpu::Device,
    queue: wgpu::Queue,
    shared: Arc<Shared>,
}

impl RawQueue for GpuQueue {
    fn submit(&self, commands: &[Command]) -> RenderResult<()> {
        self.shared.check_alive()?;

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("simcoe frame commands"),
            });

        {
            let views = self.shared.views();
            for command in commands {
                match command {
                    Command::Barrier { .. } | Command::SetDescriptorHeap { .. } => {}
                    Command::SetRenderTarget { target } => {
                        if !views.contains_key(target) {
                            return Err(RenderError::InvalidState(format!(
                                "render target descriptor {target} is empty"
                            )));
                        }
                    }
                    Command::ClearRenderTarget { target, colour } => {
                        let view = views.get(target).ok_or_else(|| {
                            RenderError::InvalidState(format!(
                                "cleared render target descriptor {target} is empty"
                            ))
                        })?;
                        clear_pass(&mut encoder, view, *colour);
                    }
                }
            }
        }

        self.queue.submit(std::iter::once(encoder.finish()));
        Ok(())
    }

    fn signal(&self, fence: &Arc<FenceTimeline>, value: u64) -> RenderResult<()> {
        self.shared.check_alive()?;
        // An empty submission orders the signal after all earlier work, and
        // its index is what a wait on `value` polls for.
        let submission = self.queue.submit(std::iter::empty());
        self.shared.signals().record(fence, value, submission);

        let fence = Arc::clone(fence);
        self.queue
            .on_submitted_work_done(move || fence.complete(value));
        Ok(())
    }
}

fn clear_pass(encoder: &mut wgpu::CommandEncoder, view: &wgpu::TextureView, colour: [f32; 4]) {
    let [r, g, b, a] = colour.map(f64::from);
    let _pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
        label: Some("simcoe clear"),
        color_attachments: &[Some(wgpu::RenderPassColorAttachment {
            view,
            resolve_target: None,
            ops: wgpu::Operations {
                load: wgpu::LoadOp::Clear(wgpu::Color { r, g, b, a }),
                store: wgpu::StoreOp::Store,
            },
            depth_slice: None,
        })],
        depth_stencil_attachment: None,
        timestamp_writes: None,
        occlusion_query_set: None,
        multiview_mask: None,
    });
}

#[derive(Debug)]
pub(crate) struct GpuTexture {
    texture: wgpu::Texture,
    desc: TextureDesc,
}

impl GpuTexture {
    pub(crate) fn texture(&self) -> &wgpu::Texture {
        &self.texture
    }
}

impl RawTexture for GpuTexture {
    fn tracked_state(&self) -> Option<ResourceState> {
        None
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

pub(crate) fn downcast(texture: &Arc<dyn RawTexture>) -> RenderResult<Arc<GpuTexture>> {
    Arc::clone(texture)
        .into_any()
        .downcast::<GpuTexture>()
        .map_err(|_| {
            RenderError::Backend(format!(
                "texture {texture:?} does not belong to the wgpu backend"
            ))
        })
}

//! Deterministic CPU backend.
//!
//! Commands execute synchronously at submission, so a fence signal completes
//! as soon as it is enqueued. Textures keep their pixels as packed `u32`s and
//! track their resource state; a barrier or clear issued against the wrong
//! state is reported through the device's message sink as a validation error.

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::{
    FenceTimeline, HeapAddressSpace, HeapDesc, Liveness, MessageSink, RawAdapter, RawDevice,
    RawInstance, RawQueue, RawTexture,
};
use crate::commands::Command;
use crate::descriptor::{DescriptorKind, HostDescriptor};
use crate::device::{DebugMessage, FeatureLevel, Severity};
use crate::error::{RenderError, RenderResult};
use crate::instance::{AdapterFlags, AdapterInfo, AdapterLuid, DebugFlags};
use crate::queue::QueueKind;
use crate::texture::{ResourceState, TextureDesc, TextureUsage};

/// One scripted adapter of a [`ReferenceSystem`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceAdapterDesc {
    pub name: String,
    pub luid: AdapterLuid,
    pub max_level: FeatureLevel,
    pub dedicated_video_memory: u64,
    pub shared_system_memory: u64,
    pub flags: AdapterFlags,
    /// Every device creation on this adapter fails.
    pub fail_device_creation: bool,
}

impl ReferenceAdapterDesc {
    pub fn new(name: impl Into<String>, luid: AdapterLuid, max_level: FeatureLevel) -> Self {
        Self {
            name: name.into(),
            luid,
            max_level,
            dedicated_video_memory: 0,
            shared_system_memory: 4 << 30,
            flags: AdapterFlags::empty(),
            fail_device_creation: false,
        }
    }

    /// The software rasterizer, supporting up to feature level 12_1.
    pub fn software(luid: AdapterLuid) -> Self {
        let mut desc = Self::new("Reference Software Rasterizer", luid, FeatureLevel::Level12_1);
        desc.flags = AdapterFlags::SOFTWARE;
        desc
    }

    pub fn with_memory(mut self, dedicated: u64) -> Self {
        self.dedicated_video_memory = dedicated;
        self
    }

    pub fn integrated(mut self) -> Self {
        self.flags |= AdapterFlags::INTEGRATED;
        self
    }

    pub fn failing(mut self) -> Self {
        self.fail_device_creation = true;
        self
    }

    fn info(&self) -> AdapterInfo {
        AdapterInfo {
            name: self.name.clone(),
            luid: self.luid,
            vendor_id: 0x1414,
            device_id: 0x008c,
            dedicated_video_memory: self.dedicated_video_memory,
            shared_system_memory: self.shared_system_memory,
            flags: self.flags,
        }
    }
}

/// Adapter set exposed by a reference instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceSystem {
    pub adapters: Vec<ReferenceAdapterDesc>,
    pub software: Option<ReferenceAdapterDesc>,
    pub tearing: bool,
}

impl Default for ReferenceSystem {
    fn default() -> Self {
        Self {
            adapters: vec![
                ReferenceAdapterDesc::new(
                    "Reference Discrete",
                    AdapterLuid::new(0, 0x1001),
                    FeatureLevel::Level12_2,
                )
                .with_memory(8 << 30),
                ReferenceAdapterDesc::new(
                    "Reference Integrated",
                    AdapterLuid::new(0, 0x1002),
                    FeatureLevel::Level12_0,
                )
                .with_memory(512 << 20)
                .integrated(),
            ],
            software: Some(ReferenceAdapterDesc::software(AdapterLuid::new(0, 0x1003))),
            tearing: true,
        }
    }
}

pub(crate) struct ReferenceInstance {
    adapters: Vec<Arc<dyn RawAdapter>>,
    software: Option<Arc<dyn RawAdapter>>,
    tearing: bool,
}

impl ReferenceInstance {
    pub(crate) fn new(system: ReferenceSystem) -> Self {
        let wrap = |desc: ReferenceAdapterDesc| -> Arc<dyn RawAdapter> {
            Arc::new(ReferenceAdapter {
                info: desc.info(),
                desc,
            })
        };

        Self {
            adapters: system.adapters.into_iter().map(wrap).collect(),
            software: system.software.map(wrap),
            tearing: system.tearing,
        }
    }
}

impl RawInstance for ReferenceInstance {
    fn adapters(&self) -> Vec<Arc<dyn RawAdapter>> {
        self.adapters.clone()
    }

    fn software_adapter(&self) -> Option<Arc<dyn RawAdapter>> {
        self.software.clone()
    }

    fn tearing_supported(&self) -> bool {
        self.tearing
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

struct ReferenceAdapter {
    desc: ReferenceAdapterDesc,
    info: AdapterInfo,
}

impl RawAdapter for ReferenceAdapter {
    fn info(&self) -> &AdapterInfo {
        &self.info
    }

    fn open(
        &self,
        level: FeatureLevel,
        _flags: DebugFlags,
        sink: MessageSink,
    ) -> RenderResult<Arc<dyn RawDevice>> {
        if self.desc.fail_device_creation {
            return Err(RenderError::DeviceCreationFailed {
                adapter: self.desc.name.clone(),
                reason: "adapter refused device creation".into(),
            });
        }
        if level > self.desc.max_level {
            return Err(RenderError::DeviceCreationFailed {
                adapter: self.desc.name.clone(),
                reason: format!(
                    "adapter supports feature level {} but {level} was requested",
                    self.desc.max_level
                ),
            });
        }

        Ok(Arc::new(ReferenceDevice {
            shared: Arc::new(Shared {
                liveness: Liveness::default(),
                views: Mutex::new(HashMap::new()),
                heaps: Mutex::new(HashMap::new()),
                errors: AtomicU64::new(0),
                sink,
            }),
            addresses: HeapAddressSpace::default(),
        }))
    }
}

#[derive(Debug, Copy, Clone)]
struct HeapRecord {
    kind: DescriptorKind,
    shader_visible: bool,
}

/// State shared between a device and its queues.
struct Shared {
    liveness: Liveness,
    views: Mutex<HashMap<HostDescriptor, Arc<ReferenceTexture>>>,
    heaps: Mutex<HashMap<u64, HeapRecord>>,
    errors: AtomicU64,
    sink: MessageSink,
}

impl Shared {
    fn check_alive(&self) -> RenderResult<()> {
        if self.liveness.is_removed() {
            return Err(RenderError::DeviceRemoved("reference device was removed".into()));
        }
        Ok(())
    }

    fn report(&self, text: String) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        (self.sink)(&DebugMessage {
            severity: Severity::Error,
            text,
        });
    }

    fn view(&self, handle: HostDescriptor) -> Option<Arc<ReferenceTexture>> {
        lock(&self.views).get(&handle).cloned()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct ReferenceDevice {
    shared: Arc<Shared>,
    addresses: HeapAddressSpace,
}

impl RawDevice for ReferenceDevice {
    fn is_removed(&self) -> bool {
        self.shared.liveness.is_removed()
    }

    fn set_removed(&self) -> bool {
        self.shared.liveness.mark_removed()
    }

    fn create_queue(&self, _kind: QueueKind) -> RenderResult<Arc<dyn RawQueue>> {
        self.shared.check_alive()?;
        Ok(Arc::new(ReferenceQueue {
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
        let heap = self.addresses.reserve(kind, capacity, shader_visible);
        lock(&self.shared.heaps).insert(
            heap.host_base,
            HeapRecord {
                kind,
                shader_visible,
            },
        );
        Ok(heap)
    }

    fn create_texture(&self, desc: &TextureDesc) -> RenderResult<Arc<dyn RawTexture>> {
        self.shared.check_alive()?;
        if desc.width == 0 || desc.height == 0 {
            return Err(RenderError::Backend(format!(
                "cannot create a {}x{} texture",
                desc.width, desc.height
            )));
        }

        let fill = desc.clear_colour.map_or(0, |c| desc.format.pack(c));
        let texels = desc.width as usize * desc.height as usize;
        Ok(Arc::new(ReferenceTexture {
            desc: desc.clone(),
            image: Mutex::new(Image {
                state: desc.initial_state,
                texels: vec![fill; texels],
            }),
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
            self.shared.report(format!(
                "render target view requested for `{}` which lacks RENDER_TARGET usage",
                texture.name()
            ));
        }
        lock(&self.shared.views).insert(handle, texture);
        Ok(())
    }

    fn release_render_target_view(&self, handle: HostDescriptor) {
        lock(&self.shared.views).remove(&handle);
    }

    fn read_texture(&self, texture: &Arc<dyn RawTexture>) -> RenderResult<Vec<u32>> {
        let texture = downcast(texture)?;
        let texels = lock(&texture.image).texels.clone();
        Ok(texels)
    }

    fn wait_for(&self, _fence: &Arc<FenceTimeline>, _value: u64) -> RenderResult<()> {
        // signals complete at submission
        self.shared.check_alive()
    }

    fn validation_errors(&self) -> u64 {
        self.shared.errors.load(Ordering::Relaxed)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

struct ReferenceQueue {
    shared: Arc<Shared>,
}

impl ReferenceQueue {
    fn execute(&self, command: &Command) -> RenderResult<()> {
        let shared = &self.shared;
        match command {
            Command::Barrier {
                surface,
                before,
                after,
            } => {
                let texture = downcast(surface.raw())?;
                let mut image = lock(&texture.image);
                if image.state != *before {
                    shared.report(format!(
                        "barrier on `{}` expects {before:?} but the resource is in {:?}",
                        texture.name(),
                        image.state
                    ));
                }
                image.state = *after;
            }
            Command::SetDescriptorHeap { heap } => match lock(&shared.heaps).get(&heap.host_base) {
                None => shared.report(format!(
                    "descriptor heap at {:#x} does not exist",
                    heap.host_base
                )),
                Some(record) if !record.shader_visible => shared.report(format!(
                    "{:?} descriptor heap at {:#x} is not shader visible",
                    record.kind, heap.host_base
                )),
                Some(_) => {}
            },
            Command::SetRenderTarget { target } => {
                if shared.view(*target).is_none() {
                    shared.report(format!("render target descriptor {target} is empty"));
                }
            }
            Command::ClearRenderTarget { target, colour } => {
                let Some(texture) = shared.view(*target) else {
                    shared.report(format!("cleared render target descriptor {target} is empty"));
                    return Ok(());
                };
                let mut image = lock(&texture.image);
                if image.state != ResourceState::RenderTarget {
                    shared.report(format!(
                        "clearing `{}` while it is in {:?}",
                        texture.name(),
                        image.state
                    ));
                    return Ok(());
                }
                let texel = texture.desc.format.pack(*colour);
                image.texels.fill(texel);
            }
        }
        Ok(())
    }
}

impl RawQueue for ReferenceQueue {
    fn submit(&self, commands: &[Command]) -> RenderResult<()> {
        self.shared.check_alive()?;
        for command in commands {
            self.execute(command)?;
        }
        Ok(())
    }

    fn signal(&self, fence: &Arc<FenceTimeline>, value: u64) -> RenderResult<()> {
        self.shared.check_alive()?;
        fence.complete(value);
        Ok(())
    }
}

#[derive(Debug)]
struct Image {
    state: ResourceState,
    texels: Vec<u32>,
}

#[derive(Debug)]
struct ReferenceTexture {
    desc: TextureDesc,
    image: Mutex<Image>,
}

impl ReferenceTexture {
    fn name(&self) -> &str {
        self.desc.label.as_deref().unwrap_or("<unnamed texture>")
    }
}

impl RawTexture for ReferenceTexture {
    fn tracked_state(&self) -> Option<ResourceState> {
        Some(lock(&self.image).state)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

fn downcast(texture: &Arc<dyn RawTexture>) -> RenderResult<Arc<ReferenceTexture>> {
    Arc::clone(texture)
        .into_any()
        .downcast::<ReferenceTexture>()
        .map_err(|_| {
            RenderError::Backend(format!(
                "texture {texture:?} does not belong to the reference backend"
            ))
        })
}

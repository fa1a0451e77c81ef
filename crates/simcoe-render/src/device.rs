//! Logical device and its debug plumbing.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::descriptor::HostDescriptor;
use crate::error::{RenderError, RenderResult};
use crate::hal::{MessageSink, RawDevice};
use crate::instance::{Adapter, AdapterInfo, AdapterLuid, DebugFlags};
use crate::memory::{Allocator, AllocatorFlags};
use crate::queue::{CommandQueue, QueueDesc};
use crate::texture::Surface;

/// Capability tier a device must support.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Default)]
pub enum FeatureLevel {
    #[default]
    Level11_0,
    Level11_1,
    Level12_0,
    Level12_1,
    Level12_2,
}

impl fmt::Display for FeatureLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FeatureLevel::Level11_0 => "11_0",
            FeatureLevel::Level11_1 => "11_1",
            FeatureLevel::Level12_0 => "12_0",
            FeatureLevel::Level12_1 => "12_1",
            FeatureLevel::Level12_2 => "12_2",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Severity {
    Info,
    Warning,
    Error,
    Corruption,
}

/// One message produced by a device's validation layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebugMessage {
    pub severity: Severity,
    pub text: String,
}

/// Log target receiving forwarded validation messages.
pub const GPU_LOG_TARGET: &str = "simcoe::gpu";

static NEXT_EPOCH: AtomicU64 = AtomicU64::new(1);

/// Opened logical device.
///
/// Each device receives a process-unique epoch. Objects created through it
/// carry that epoch, and submission rejects objects from any other epoch.
pub struct Device {
    adapter: AdapterInfo,
    level: FeatureLevel,
    flags: DebugFlags,
    epoch: u64,
    raw: Arc<dyn RawDevice>,
}

impl Device {
    /// Opens a device on `adapter` at `level`.
    pub fn create(adapter: &Adapter, level: FeatureLevel, flags: DebugFlags) -> RenderResult<Self> {
        let raw = adapter.raw.open(level, flags, message_sink(flags))?;
        let epoch = NEXT_EPOCH.fetch_add(1, Ordering::Relaxed);

        log::info!(
            "created device on `{}` ({}) at feature level {level}, epoch {epoch}",
            adapter.name(),
            adapter.luid()
        );

        Ok(Self {
            adapter: adapter.info().clone(),
            level,
            flags,
            epoch,
            raw,
        })
    }

    pub fn adapter(&self) -> &AdapterInfo {
        &self.adapter
    }

    pub fn luid(&self) -> AdapterLuid {
        self.adapter.luid
    }

    pub fn level(&self) -> FeatureLevel {
        self.level
    }

    pub fn flags(&self) -> DebugFlags {
        self.flags
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn is_removed(&self) -> bool {
        self.raw.is_removed()
    }

    /// Simulates device loss. Meant for exercising recovery paths.
    pub fn set_removed(&self) -> bool {
        let removed = self.raw.set_removed();
        if removed {
            log::warn!("device on `{}` marked as removed", self.adapter.name);
        }
        removed
    }

    /// Number of error-severity validation messages emitted so far.
    pub fn validation_errors(&self) -> u64 {
        self.raw.validation_errors()
    }

    pub fn new_allocator(&self, flags: AllocatorFlags) -> RenderResult<Allocator> {
        self.check_alive()?;
        Ok(Allocator::new(Arc::clone(&self.raw), self.epoch, flags))
    }

    pub fn new_command_queue(&self, desc: QueueDesc) -> RenderResult<CommandQueue> {
        self.check_alive()?;
        let raw = self.raw.create_queue(desc.kind)?;
        Ok(CommandQueue::new(raw, Arc::clone(&self.raw), self.epoch, desc))
    }

    /// Writes a render target view for `surface` into `handle`.
    pub fn create_render_target_view(
        &self,
        surface: &Surface,
        handle: HostDescriptor,
    ) -> RenderResult<()> {
        self.check_alive()?;
        self.check_epoch(surface)?;
        if handle.epoch != self.epoch {
            return Err(RenderError::StaleResource {
                name: format!("render target descriptor {handle}"),
                resource_epoch: handle.epoch,
                device_epoch: self.epoch,
            });
        }
        self.raw.create_render_target_view(surface.raw(), handle)
    }

    /// Drops the view written into `handle`, releasing the surface it kept alive.
    pub fn release_render_target_view(&self, handle: HostDescriptor) {
        if handle.epoch == self.epoch {
            self.raw.release_render_target_view(handle);
        }
    }

    /// Reads the texels of `surface` back to the CPU.
    pub fn read_surface(&self, surface: &Surface) -> RenderResult<Vec<u32>> {
        self.check_alive()?;
        self.check_epoch(surface)?;
        self.raw.read_texture(surface.raw())
    }

    /// Label for a new object, or `None` when auto-naming is off.
    pub(crate) fn object_label(&self, name: impl fmt::Display) -> Option<String> {
        self.flags
            .contains(DebugFlags::AUTO_NAME)
            .then(|| name.to_string())
    }

    pub(crate) fn check_alive(&self) -> RenderResult<()> {
        if self.raw.is_removed() {
            return Err(RenderError::DeviceRemoved(format!(
                "device on `{}` was removed",
                self.adapter.name
            )));
        }
        Ok(())
    }

    pub(crate) fn check_epoch(&self, surface: &Surface) -> RenderResult<()> {
        if surface.epoch() != self.epoch {
            return Err(RenderError::StaleResource {
                name: surface.name().to_owned(),
                resource_epoch: surface.epoch(),
                device_epoch: self.epoch,
            });
        }
        Ok(())
    }

    pub(crate) fn raw(&self) -> &Arc<dyn RawDevice> {
        &self.raw
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("adapter", &self.adapter.name)
            .field("luid", &self.adapter.luid)
            .field("level", &self.level)
            .field("epoch", &self.epoch)
            .finish_non_exhaustive()
    }
}

fn message_sink(flags: DebugFlags) -> MessageSink {
    let forward = flags.contains(DebugFlags::INFO_QUEUE);
    Arc::new(move |message: &DebugMessage| {
        if !forward {
            return;
        }
        match message.severity {
            Severity::Info => log::info!(target: GPU_LOG_TARGET, "{}", message.text),
            Severity::Warning => log::warn!(target: GPU_LOG_TARGET, "{}", message.text),
            Severity::Error | Severity::Corruption => {
                log::error!(target: GPU_LOG_TARGET, "{}", message.text)
            }
        }
    })
}

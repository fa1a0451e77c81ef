use std::fmt;
use std::sync::Arc;

use crate::commands::Command;
use crate::error::{RenderError, RenderResult};
use crate::hal::{FenceTimeline, RawDevice, RawQueue};

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Default)]
pub enum QueueKind {
    #[default]
    Direct,
    Compute,
    Copy,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Default)]
pub enum QueuePriority {
    #[default]
    Normal,
    High,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub struct QueueDesc {
    pub kind: QueueKind,
    pub priority: QueuePriority,
}

impl QueueDesc {
    pub fn direct() -> Self {
        Self::default()
    }
}

/// Submission queue of a device.
pub struct CommandQueue {
    desc: QueueDesc,
    epoch: u64,
    raw: Arc<dyn RawQueue>,
    device: Arc<dyn RawDevice>,
}

impl CommandQueue {
    pub(crate) fn new(
        raw: Arc<dyn RawQueue>,
        device: Arc<dyn RawDevice>,
        epoch: u64,
        desc: QueueDesc,
    ) -> Self {
        Self {
            desc,
            epoch,
            raw,
            device,
        }
    }

    pub fn kind(&self) -> QueueKind {
        self.desc.kind
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Executes a closed command list.
    ///
    /// Every surface, heap and descriptor referenced by the commands must come
    /// from this queue's device; anything else is rejected before the backend
    /// sees it.
    pub fn submit(&self, commands: &[Command]) -> RenderResult<()> {
        self.check_alive()?;
        if let Some(stale) = commands.iter().find(|c| c.epoch() != self.epoch) {
            return Err(RenderError::StaleResource {
                name: stale.target_name(),
                resource_epoch: stale.epoch(),
                device_epoch: self.epoch,
            });
        }
        self.raw.submit(commands)
    }

    pub(crate) fn signal_timeline(&self, timeline: &Arc<FenceTimeline>, value: u64) -> RenderResult<()> {
        self.check_alive()?;
        self.raw.signal(timeline, value)
    }

    fn check_alive(&self) -> RenderResult<()> {
        if self.device.is_removed() {
            return Err(RenderError::DeviceRemoved(
                "command queue belongs to a removed device".into(),
            ));
        }
        Ok(())
    }
}

impl fmt::Debug for CommandQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandQueue")
            .field("desc", &self.desc)
            .field("epoch", &self.epoch)
            .finish_non_exhaustive()
    }
}

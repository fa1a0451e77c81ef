//! Command recording.
//!
//! A [`CommandBufferSet`] owns one command allocator per back buffer and a
//! single recorder that cycles between them. Commands are plain values; a
//! queue validates and executes them at submission.

use std::fmt;

use crate::descriptor::{DescriptorPool, HeapBinding, HostDescriptor};
use crate::device::Device;
use crate::error::{RenderError, RenderResult};
use crate::fence::Fence;
use crate::queue::QueueKind;
use crate::texture::{ResourceState, Surface};

#[derive(Debug, Clone)]
pub enum Command {
    /// Transitions `surface` between resource states.
    Barrier {
        surface: Surface,
        before: ResourceState,
        after: ResourceState,
    },
    /// Binds a shader-visible descriptor heap.
    SetDescriptorHeap { heap: HeapBinding },
    SetRenderTarget { target: HostDescriptor },
    ClearRenderTarget {
        target: HostDescriptor,
        colour: [f32; 4],
    },
}

impl Command {
    /// Surface referenced by this command, if any.
    pub fn surface(&self) -> Option<&Surface> {
        match self {
            Command::Barrier { surface, .. } => Some(surface),
            _ => None,
        }
    }

    /// Epoch of the device owning the surface, heap or descriptor this
    /// command references.
    pub fn epoch(&self) -> u64 {
        match self {
            Command::Barrier { surface, .. } => surface.epoch(),
            Command::SetDescriptorHeap { heap } => heap.epoch,
            Command::SetRenderTarget { target } | Command::ClearRenderTarget { target, .. } => {
                target.epoch
            }
        }
    }

    /// Human-readable name of the referenced object.
    pub fn target_name(&self) -> String {
        match self {
            Command::Barrier { surface, .. } => surface.name().to_owned(),
            Command::SetDescriptorHeap { heap } => {
                format!("{:?} descriptor heap at {:#x}", heap.kind, heap.host_base)
            }
            Command::SetRenderTarget { target } | Command::ClearRenderTarget { target, .. } => {
                format!("render target descriptor {target}")
            }
        }
    }
}

/// Storage for one frame's worth of recorded commands.
#[derive(Debug, Default)]
struct CommandAllocator {
    commands: Vec<Command>,
    /// Fence value that must complete before this storage is reused.
    fence_target: u64,
}

/// Per-back-buffer command storage plus the open/closed recording state.
pub struct CommandBufferSet {
    kind: QueueKind,
    epoch: u64,
    allocators: Vec<CommandAllocator>,
    current: usize,
    recording: bool,
}

impl CommandBufferSet {
    /// Creates `frame_count` allocators and opens recording on `first`.
    ///
    /// # Panics
    /// Panics if `first` is out of range.
    pub fn new(device: &Device, kind: QueueKind, frame_count: u32, first: u32) -> RenderResult<Self> {
        device.check_alive()?;
        assert!(
            first < frame_count,
            "initial command allocator {first} out of range for {frame_count} frames"
        );

        Ok(Self {
            kind,
            epoch: device.epoch(),
            allocators: (0..frame_count).map(|_| CommandAllocator::default()).collect(),
            current: first as usize,
            recording: true,
        })
    }

    pub fn kind(&self) -> QueueKind {
        self.kind
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn len(&self) -> u32 {
        self.allocators.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.allocators.is_empty()
    }

    pub fn current_slot(&self) -> u32 {
        self.current as u32
    }

    pub fn is_recording(&self) -> bool {
        self.recording
    }

    /// Recorder for the open command list.
    pub fn list(&mut self) -> RenderResult<CommandList<'_>> {
        if !self.recording {
            return Err(RenderError::InvalidState(
                "command list is closed; reset it before recording".into(),
            ));
        }
        Ok(CommandList {
            commands: &mut self.allocators[self.current].commands,
        })
    }

    /// Closes the open list and returns its commands for submission.
    pub fn close(&mut self) -> RenderResult<&[Command]> {
        if !self.recording {
            return Err(RenderError::InvalidState("command list is already closed".into()));
        }
        self.recording = false;
        Ok(&self.allocators[self.current].commands)
    }

    /// Records the fence value that guards the current slot's storage.
    pub fn mark_submitted(&mut self, fence_value: u64) {
        self.allocators[self.current].fence_target = fence_value;
    }

    /// Clears `slot`'s storage and reopens recording on it.
    ///
    /// # Panics
    /// Panics if `slot` is out of range, if the list is still recording, or
    /// if the GPU has not yet reached the fence value guarding `slot`.
    pub fn reset(&mut self, slot: u32, fence: &Fence) {
        let slot = slot as usize;
        assert!(
            slot < self.allocators.len(),
            "command allocator {slot} out of range for {} frames",
            self.allocators.len()
        );
        assert!(!self.recording, "resetting a command list that is still recording");

        let allocator = &mut self.allocators[slot];
        let completed = fence.completed_value();
        assert!(
            completed >= allocator.fence_target,
            "command allocator {slot} reset while in flight (fence at {completed}, needs {})",
            allocator.fence_target
        );

        allocator.commands.clear();
        self.current = slot;
        self.recording = true;
    }
}

impl fmt::Debug for CommandBufferSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandBufferSet")
            .field("kind", &self.kind)
            .field("frames", &self.allocators.len())
            .field("current", &self.current)
            .field("recording", &self.recording)
            .finish()
    }
}

/// Borrowed recorder appending to the open command list.
pub struct CommandList<'a> {
    commands: &'a mut Vec<Command>,
}

impl CommandList<'_> {
    /// Appends an already built command.
    pub fn push(&mut self, command: Command) {
        self.commands.push(command);
    }

    pub fn barrier(&mut self, surface: &Surface, before: ResourceState, after: ResourceState) {
        self.commands.push(Command::Barrier {
            surface: surface.clone(),
            before,
            after,
        });
    }

    pub fn set_descriptor_heap(&mut self, pool: &DescriptorPool) {
        self.commands.push(Command::SetDescriptorHeap {
            heap: pool.binding(),
        });
    }

    pub fn set_render_target(&mut self, target: HostDescriptor) {
        self.commands.push(Command::SetRenderTarget { target });
    }

    pub fn clear_render_target(&mut self, target: HostDescriptor, colour: [f32; 4]) {
        self.commands.push(Command::ClearRenderTarget { target, colour });
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::QueueDesc;
    use crate::test_support;

    #[test]
    fn close_then_reset_reopens_on_slot() {
        let device = test_support::device();
        let fence = Fence::new(&device, 0, "fence").expect("fence");
        let mut set = CommandBufferSet::new(&device, QueueKind::Direct, 3, 1).expect("set");

        set.list()
            .expect("open")
            .clear_render_target(HostDescriptor::new(device.epoch(), 0x10), [0.0; 4]);
        assert_eq!(set.close().expect("close").len(), 1);
        assert!(set.list().is_err());
        assert!(set.close().is_err());

        set.reset(2, &fence);
        assert_eq!(set.current_slot(), 2);
        assert!(set.list().expect("open").is_empty());
    }

    #[test]
    fn reset_clears_previous_commands() {
        let device = test_support::device();
        let fence = Fence::new(&device, 0, "fence").expect("fence");
        let mut set = CommandBufferSet::new(&device, QueueKind::Direct, 2, 0).expect("set");

        set.list()
            .expect("open")
            .set_render_target(HostDescriptor::new(device.epoch(), 1));
        set.close().expect("close");
        set.reset(0, &fence);
        assert!(set.close().expect("close").is_empty());
    }

    #[test]
    #[should_panic(expected = "reset while in flight")]
    fn reset_before_fence_completes_panics() {
        let device = test_support::device();
        let queue = device.new_command_queue(QueueDesc::direct()).expect("queue");
        let fence = Fence::new(&device, 0, "fence").expect("fence");
        let mut set = CommandBufferSet::new(&device, QueueKind::Direct, 2, 0).expect("set");

        set.close().expect("close");
        set.mark_submitted(5);
        fence.signal(&queue, 4).expect("signal");
        set.reset(0, &fence);
    }

    #[test]
    #[should_panic(expected = "still recording")]
    fn reset_while_recording_panics() {
        let device = test_support::device();
        let fence = Fence::new(&device, 0, "fence").expect("fence");
        let mut set = CommandBufferSet::new(&device, QueueKind::Direct, 2, 0).expect("set");
        set.reset(1, &fence);
    }
}

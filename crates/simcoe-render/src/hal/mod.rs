//! Backend abstraction.
//!
//! The public device types hold these trait objects and never touch a backend
//! directly. Two backends exist:
//! - `gpu`: wgpu on whatever native API the platform offers
//! - `reference`: a deterministic CPU implementation that validates resource
//!   states and supports simulated device removal

pub(crate) mod gpu;
pub(crate) mod reference;

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};

use crate::commands::Command;
use crate::descriptor::{DescriptorKind, HostDescriptor};
use crate::device::{DebugMessage, FeatureLevel};
use crate::error::RenderResult;
use crate::instance::{AdapterInfo, DebugFlags};
use crate::queue::QueueKind;
use crate::texture::{ResourceState, TextureDesc};

/// Receives validation and diagnostic messages emitted by a backend device.
pub(crate) type MessageSink = Arc<dyn Fn(&DebugMessage) + Send + Sync>;

pub(crate) trait RawInstance: Send + Sync {
    /// Hardware adapters, in enumeration order.
    fn adapters(&self) -> Vec<Arc<dyn RawAdapter>>;

    /// The software rasterizer, if the backend provides one.
    fn software_adapter(&self) -> Option<Arc<dyn RawAdapter>>;

    fn tearing_supported(&self) -> bool;

    fn as_any(&self) -> &dyn Any;
}

pub(crate) trait RawAdapter: Send + Sync {
    fn info(&self) -> &AdapterInfo;

    fn open(
        &self,
        level: FeatureLevel,
        flags: DebugFlags,
        sink: MessageSink,
    ) -> RenderResult<Arc<dyn RawDevice>>;
}

/// Placement of a descriptor heap in the backend's address space.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) struct HeapDesc {
    pub host_base: u64,
    pub device_base: Option<u64>,
    pub stride: u64,
}

pub(crate) trait RawDevice: Send + Sync {
    fn is_removed(&self) -> bool;

    /// Forces the device into the removed state. Returns false if it already was.
    fn set_removed(&self) -> bool;

    fn create_queue(&self, kind: QueueKind) -> RenderResult<Arc<dyn RawQueue>>;

    fn create_fence(&self, initial: u64) -> RenderResult<Arc<FenceTimeline>>;

    fn create_descriptor_heap(
        &self,
        kind: DescriptorKind,
        capacity: u32,
        shader_visible: bool,
    ) -> RenderResult<HeapDesc>;

    fn create_texture(&self, desc: &TextureDesc) -> RenderResult<Arc<dyn RawTexture>>;

    /// Writes a render target view of `texture` into the descriptor `handle`.
    fn create_render_target_view(
        &self,
        texture: &Arc<dyn RawTexture>,
        handle: HostDescriptor,
    ) -> RenderResult<()>;

    /// Empties the descriptor `handle`. Unknown handles are ignored.
    fn release_render_target_view(&self, handle: HostDescriptor);

    /// Reads back the texels of a texture, one packed `u32` per pixel.
    fn read_texture(&self, texture: &Arc<dyn RawTexture>) -> RenderResult<Vec<u32>>;

    /// Drives outstanding work forward until the submission that signals
    /// `value` on `fence` has executed. Later submissions may still be running.
    fn wait_for(&self, fence: &Arc<FenceTimeline>, value: u64) -> RenderResult<()>;

    fn validation_errors(&self) -> u64;

    fn as_any(&self) -> &dyn Any;
}

pub(crate) trait RawQueue: Send + Sync {
    fn submit(&self, commands: &[Command]) -> RenderResult<()>;

    /// Completes `value` on `fence` once all previously submitted work has run.
    fn signal(&self, fence: &Arc<FenceTimeline>, value: u64) -> RenderResult<()>;
}

pub(crate) trait RawTexture: Send + Sync + fmt::Debug {
    fn tracked_state(&self) -> Option<ResourceState>;

    fn as_any(&self) -> &dyn Any;

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// Monotonic completed value of a fence.
///
/// Backends advance it from whichever thread observes completion; waiters
/// block on the condition variable.
#[derive(Debug, Default)]
pub(crate) struct FenceTimeline {
    completed: Mutex<u64>,
    cond: Condvar,
}

impl FenceTimeline {
    pub(crate) fn new(initial: u64) -> Self {
        Self {
            completed: Mutex::new(initial),
            cond: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, u64> {
        self.completed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn completed(&self) -> u64 {
        *self.lock()
    }

    /// Advances the timeline to `value`. Lower values are ignored.
    pub(crate) fn complete(&self, value: u64) {
        let mut completed = self.lock();
        if value > *completed {
            *completed = value;
            self.cond.notify_all();
        }
    }

    /// Blocks until the completed value reaches `value`.
    pub(crate) fn block_until(&self, value: u64) {
        let mut completed = self.lock();
        while *completed < value {
            completed = self
                .cond
                .wait(completed)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

/// Submission after which each enqueued fence signal completes.
///
/// `T` is the backend's submission token. Entries are kept in submission
/// order and dropped once their fence has passed them.
#[derive(Debug)]
pub(crate) struct SignalLog<T> {
    entries: Vec<PendingSignal<T>>,
}

#[derive(Debug)]
struct PendingSignal<T> {
    fence: Weak<FenceTimeline>,
    value: u64,
    submission: T,
}

impl<T> Default for SignalLog<T> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<T: Clone> SignalLog<T> {
    pub(crate) fn record(&mut self, fence: &Arc<FenceTimeline>, value: u64, submission: T) {
        self.entries.retain(|pending| {
            pending
                .fence
                .upgrade()
                .is_some_and(|f| f.completed() < pending.value)
        });
        self.entries.push(PendingSignal {
            fence: Arc::downgrade(fence),
            value,
            submission,
        });
    }

    /// Earliest submission whose signal brings `fence` to at least `value`.
    pub(crate) fn submission_for(&self, fence: &Arc<FenceTimeline>, value: u64) -> Option<T> {
        self.entries
            .iter()
            .find(|pending| {
                std::ptr::eq(pending.fence.as_ptr(), Arc::as_ptr(fence)) && pending.value >= value
            })
            .map(|pending| pending.submission.clone())
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Removal flag plus every fence created on a device.
///
/// A removed device reports `u64::MAX` from all its fences so that no waiter
/// can block forever on work that will never complete.
#[derive(Debug, Default)]
pub(crate) struct Liveness {
    removed: AtomicBool,
    fences: Mutex<Vec<Weak<FenceTimeline>>>,
}

impl Liveness {
    pub(crate) fn is_removed(&self) -> bool {
        self.removed.load(Ordering::Acquire)
    }

    pub(crate) fn mark_removed(&self) -> bool {
        if self.removed.swap(true, Ordering::AcqRel) {
            return false;
        }

        let fences = self.fences.lock().unwrap_or_else(PoisonError::into_inner);
        for fence in fences.iter().filter_map(Weak::upgrade) {
            fence.complete(u64::MAX);
        }
        true
    }

    pub(crate) fn register(&self, fence: &Arc<FenceTimeline>) {
        let mut fences = self.fences.lock().unwrap_or_else(PoisonError::into_inner);
        fences.retain(|f| f.strong_count() > 0);
        fences.push(Arc::downgrade(fence));

        if self.is_removed() {
            fence.complete(u64::MAX);
        }
    }
}

/// Hands out non-overlapping descriptor heap ranges.
///
/// Host and device ranges live in disjoint halves of the address space so a
/// device handle can never be mistaken for a host one.
#[derive(Debug)]
pub(crate) struct HeapAddressSpace {
    next: AtomicU64,
}

const HOST_HEAP_BASE: u64 = 0x0001_0000;
const DEVICE_HEAP_BASE: u64 = 0x8000_0000_0000;
const HEAP_ALIGNMENT: u64 = 0x1_0000;

impl Default for HeapAddressSpace {
    fn default() -> Self {
        Self {
            next: AtomicU64::new(HOST_HEAP_BASE),
        }
    }
}

impl HeapAddressSpace {
    pub(crate) fn stride(kind: DescriptorKind) -> u64 {
        match kind {
            DescriptorKind::RenderTarget | DescriptorKind::DepthStencil => 32,
            DescriptorKind::ShaderResource => 64,
        }
    }

    pub(crate) fn reserve(
        &self,
        kind: DescriptorKind,
        capacity: u32,
        shader_visible: bool,
    ) -> HeapDesc {
        let stride = Self::stride(kind);
        let span = (u64::from(capacity.max(1)) * stride).next_multiple_of(HEAP_ALIGNMENT);
        let host_base = self.next.fetch_add(span + HEAP_ALIGNMENT, Ordering::Relaxed);

        HeapDesc {
            host_base,
            device_base: shader_visible.then(|| DEVICE_HEAP_BASE + host_base),
            stride,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeline_ignores_lower_values() {
        let timeline = FenceTimeline::new(3);
        timeline.complete(2);
        assert_eq!(timeline.completed(), 3);
        timeline.complete(7);
        assert_eq!(timeline.completed(), 7);
    }

    #[test]
    fn removal_completes_registered_fences() {
        let liveness = Liveness::default();
        let fence = Arc::new(FenceTimeline::new(0));
        liveness.register(&fence);

        assert!(liveness.mark_removed());
        assert!(!liveness.mark_removed());
        assert_eq!(fence.completed(), u64::MAX);

        let late = Arc::new(FenceTimeline::new(0));
        liveness.register(&late);
        assert_eq!(late.completed(), u64::MAX);
    }

    #[test]
    fn blocked_waiter_wakes_on_completion() {
        let timeline = Arc::new(FenceTimeline::new(0));
        let waiter = {
            let timeline = Arc::clone(&timeline);
            std::thread::spawn(move || timeline.block_until(5))
        };
        timeline.complete(5);
        waiter.join().expect("waiter thread panicked");
    }

    #[test]
    fn wait_targets_the_first_signal_reaching_the_value() {
        let fence = Arc::new(FenceTimeline::new(0));
        let other = Arc::new(FenceTimeline::new(0));
        let mut log = SignalLog::default();
        log.record(&fence, 1, "frame 1");
        log.record(&other, 5, "other");
        log.record(&fence, 2, "frame 2");
        log.record(&fence, 3, "frame 3");

        assert_eq!(log.submission_for(&fence, 1), Some("frame 1"));
        assert_eq!(log.submission_for(&fence, 2), Some("frame 2"));
        assert_eq!(log.submission_for(&other, 2), Some("other"));
        // never signalled
        assert_eq!(log.submission_for(&fence, 4), None);
    }

    #[test]
    fn completed_and_dropped_signals_are_pruned() {
        let fence = Arc::new(FenceTimeline::new(0));
        let mut log = SignalLog::default();
        log.record(&fence, 1, 10_u64);
        log.record(&fence, 2, 11);
        {
            let dropped = Arc::new(FenceTimeline::new(0));
            log.record(&dropped, 1, 12);
        }

        fence.complete(1);
        log.record(&fence, 3, 13);

        assert_eq!(log.len(), 2);
        assert_eq!(log.submission_for(&fence, 1), Some(11));
    }

    #[test]
    fn heap_ranges_do_not_overlap() {
        let space = HeapAddressSpace::default();
        let a = space.reserve(DescriptorKind::RenderTarget, 18, false);
        let b = space.reserve(DescriptorKind::ShaderResource, 16, true);

        assert!(a.device_base.is_none());
        assert!(a.host_base + 18 * a.stride <= b.host_base);
        assert!(b.device_base.is_some_and(|d| d >= DEVICE_HEAP_BASE));
    }
}

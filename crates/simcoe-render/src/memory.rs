//! Device memory allocation and accounting.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::error::{RenderError, RenderResult};
use crate::hal::RawDevice;
use crate::texture::{Surface, TextureDesc};

bitflags::bitflags! {
    #[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Default)]
    pub struct AllocatorFlags: u32 {
        /// Allocations are made from a single thread; skips internal locking.
        const SINGLE_THREADED          = 1 << 0;
        /// Pooled memory is not zeroed before reuse.
        const DEFAULT_POOLS_NOT_ZEROED = 1 << 1;
    }
}

/// Snapshot of an allocator's live allocations.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub struct AllocatorStats {
    pub live_allocations: u64,
    pub live_bytes: u64,
    pub total_allocations: u64,
}

#[derive(Debug, Default)]
struct Counters {
    live: AtomicU64,
    bytes: AtomicU64,
    total: AtomicU64,
}

/// Shared view of an allocator's counters that outlives the allocator.
#[derive(Debug, Clone)]
pub struct AllocationTracker {
    counters: Arc<Counters>,
}

impl AllocationTracker {
    pub fn stats(&self) -> AllocatorStats {
        AllocatorStats {
            live_allocations: self.counters.live.load(Ordering::Acquire),
            live_bytes: self.counters.bytes.load(Ordering::Acquire),
            total_allocations: self.counters.total.load(Ordering::Acquire),
        }
    }
}

/// Accounting guard for one allocation; releases its bytes when dropped.
#[derive(Debug)]
pub(crate) struct Allocation {
    bytes: u64,
    counters: Arc<Counters>,
}

impl Drop for Allocation {
    fn drop(&mut self) {
        self.counters.live.fetch_sub(1, Ordering::AcqRel);
        self.counters.bytes.fetch_sub(self.bytes, Ordering::AcqRel);
    }
}

/// Creates device textures and tracks how much memory is live.
///
/// Allocators are cheap to clone; clones share counters and the frame index.
#[derive(Clone)]
pub struct Allocator {
    device: Arc<dyn RawDevice>,
    epoch: u64,
    flags: AllocatorFlags,
    counters: Arc<Counters>,
    frame_index: Arc<AtomicU32>,
}

impl Allocator {
    pub(crate) fn new(device: Arc<dyn RawDevice>, epoch: u64, flags: AllocatorFlags) -> Self {
        Self {
            device,
            epoch,
            flags,
            counters: Arc::default(),
            frame_index: Arc::default(),
        }
    }

    pub fn flags(&self) -> AllocatorFlags {
        self.flags
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Creates a texture backed by memory from this allocator.
    pub fn allocate_surface(&self, desc: TextureDesc) -> RenderResult<Surface> {
        if self.device.is_removed() {
            return Err(RenderError::DeviceRemoved(
                "allocator belongs to a removed device".into(),
            ));
        }

        let raw = self.device.create_texture(&desc)?;
        let bytes = desc.byte_size();
        self.counters.live.fetch_add(1, Ordering::AcqRel);
        self.counters.bytes.fetch_add(bytes, Ordering::AcqRel);
        self.counters.total.fetch_add(1, Ordering::AcqRel);

        let allocation = Allocation {
            bytes,
            counters: Arc::clone(&self.counters),
        };
        Ok(Surface::new(raw, desc, self.epoch, Some(allocation)))
    }

    pub fn stats(&self) -> AllocatorStats {
        self.tracker().stats()
    }

    pub fn tracker(&self) -> AllocationTracker {
        AllocationTracker {
            counters: Arc::clone(&self.counters),
        }
    }

    /// Frame slot used to age transient allocations.
    pub fn set_current_frame_index(&self, index: u32) {
        self.frame_index.store(index, Ordering::Release);
    }

    pub fn current_frame_index(&self) -> u32 {
        self.frame_index.load(Ordering::Acquire)
    }
}

impl fmt::Debug for Allocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Allocator")
            .field("epoch", &self.epoch)
            .field("flags", &self.flags)
            .field("stats", &self.stats())
            .field("frame_index", &self.current_frame_index())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support;
    use crate::texture::Format;

    #[test]
    fn dropping_surfaces_releases_accounting() {
        let device = test_support::device();
        let allocator = device.new_allocator(AllocatorFlags::empty()).expect("allocator");

        let a = allocator
            .allocate_surface(TextureDesc::render_target(16, 16, Format::Rgba8Unorm))
            .expect("surface");
        let b = a.clone();
        let c = allocator
            .allocate_surface(TextureDesc::render_target(8, 8, Format::Rgba8Unorm))
            .expect("surface");

        assert_eq!(allocator.stats().live_allocations, 2);
        assert_eq!(allocator.stats().live_bytes, 16 * 16 * 4 + 8 * 8 * 4);

        drop(a);
        assert_eq!(allocator.stats().live_allocations, 2);
        drop((b, c));
        assert_eq!(
            allocator.stats(),
            AllocatorStats {
                live_allocations: 0,
                live_bytes: 0,
                total_allocations: 2,
            }
        );
    }

    #[test]
    fn tracker_outlives_allocator() {
        let device = test_support::device();
        let allocator = device.new_allocator(AllocatorFlags::empty()).expect("allocator");
        let tracker = allocator.tracker();
        let surface = allocator
            .allocate_surface(TextureDesc::render_target(4, 4, Format::Bgra8Unorm))
            .expect("surface");

        drop(allocator);
        assert_eq!(tracker.stats().live_allocations, 1);
        drop(surface);
        assert_eq!(tracker.stats().live_allocations, 0);
    }

    #[test]
    fn frame_index_is_shared_between_clones() {
        let device = test_support::device();
        let allocator = device.new_allocator(AllocatorFlags::SINGLE_THREADED).expect("allocator");
        let clone = allocator.clone();
        allocator.set_current_frame_index(2);
        assert_eq!(clone.current_frame_index(), 2);
    }
}

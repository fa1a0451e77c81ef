//! Descriptor pools.
//!
//! A pool is a fixed-capacity native heap paired with a bitmap index allocator.
//! Slot `i` maps to `base + i * stride` in both host and (when shader visible)
//! device address space.

use std::fmt;

use crate::device::Device;
use crate::error::{RenderError, RenderResult};
use crate::hal::HeapDesc;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum DescriptorKind {
    RenderTarget,
    DepthStencil,
    ShaderResource,
}

impl DescriptorKind {
    fn resource_name(self) -> &'static str {
        match self {
            DescriptorKind::RenderTarget => "render target descriptors",
            DescriptorKind::DepthStencil => "depth stencil descriptors",
            DescriptorKind::ShaderResource => "shader resource descriptors",
        }
    }
}

/// CPU-side descriptor address, tagged with the epoch of the device whose
/// heap it points into.
///
/// Every device lays its heaps out from the same base, so the address alone
/// cannot tell a handle from a previous device apart from a live one.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct HostDescriptor {
    pub epoch: u64,
    pub address: u64,
}

impl HostDescriptor {
    pub const fn new(epoch: u64, address: u64) -> Self {
        Self { epoch, address }
    }
}

impl fmt::Display for HostDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.address)
    }
}

/// GPU-side descriptor address, only valid for shader-visible heaps.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct DeviceDescriptor(pub u64);

impl fmt::Display for DeviceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// A heap as it is bound on a command list.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct HeapBinding {
    pub kind: DescriptorKind,
    pub epoch: u64,
    pub host_base: u64,
    pub device_base: Option<u64>,
}

/// Fixed-capacity bitset allocator handing out the lowest free index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitMapIndexAllocator {
    words: Vec<u64>,
    capacity: u32,
    used: u32,
}

impl BitMapIndexAllocator {
    pub fn new(capacity: u32) -> Self {
        Self {
            words: vec![0; capacity.div_ceil(64) as usize],
            capacity,
            used: 0,
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn used(&self) -> u32 {
        self.used
    }

    pub fn is_full(&self) -> bool {
        self.used == self.capacity
    }

    pub fn is_set(&self, index: u32) -> bool {
        index < self.capacity && self.words[(index / 64) as usize] & (1 << (index % 64)) != 0
    }

    pub fn allocate(&mut self) -> Option<u32> {
        let (word_index, word) = self
            .words
            .iter_mut()
            .enumerate()
            .find(|(_, word)| **word != u64::MAX)?;

        let bit = word.trailing_ones();
        let index = word_index as u32 * 64 + bit;
        if index >= self.capacity {
            return None;
        }

        *word |= 1 << bit;
        self.used += 1;
        Some(index)
    }

    /// Releases `index`. Returns false if it was not allocated.
    pub fn release(&mut self, index: u32) -> bool {
        if !self.is_set(index) {
            return false;
        }
        self.words[(index / 64) as usize] &= !(1 << (index % 64));
        self.used -= 1;
        true
    }
}

/// Native descriptor heap plus slot bookkeeping.
pub struct DescriptorPool {
    kind: DescriptorKind,
    heap: HeapDesc,
    slots: BitMapIndexAllocator,
    epoch: u64,
}

impl DescriptorPool {
    pub fn new(
        device: &Device,
        kind: DescriptorKind,
        capacity: u32,
        shader_visible: bool,
    ) -> RenderResult<Self> {
        device.check_alive()?;
        let heap = device
            .raw()
            .create_descriptor_heap(kind, capacity, shader_visible)?;
        log::debug!(
            "created {kind:?} descriptor pool with {capacity} slots at {:#x}",
            heap.host_base
        );

        Ok(Self {
            kind,
            heap,
            slots: BitMapIndexAllocator::new(capacity),
            epoch: device.epoch(),
        })
    }

    pub fn kind(&self) -> DescriptorKind {
        self.kind
    }

    pub fn capacity(&self) -> u32 {
        self.slots.capacity()
    }

    pub fn used(&self) -> u32 {
        self.slots.used()
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn is_shader_visible(&self) -> bool {
        self.heap.device_base.is_some()
    }

    /// Reserves the lowest free slot.
    pub fn allocate(&mut self) -> RenderResult<u32> {
        self.slots.allocate().ok_or(RenderError::ResourceExhausted {
            resource: self.kind.resource_name(),
            capacity: self.capacity(),
        })
    }

    /// Returns a slot to the pool.
    ///
    /// # Panics
    /// Panics if `index` is not currently allocated.
    pub fn free(&mut self, index: u32) {
        assert!(
            self.slots.release(index),
            "descriptor slot {index} of {:?} pool is not allocated",
            self.kind
        );
    }

    pub fn host(&self, index: u32) -> HostDescriptor {
        debug_assert!(index < self.capacity());
        HostDescriptor::new(
            self.epoch,
            self.heap.host_base + u64::from(index) * self.heap.stride,
        )
    }

    /// Device handle of a slot, or `None` for pools that are not shader visible.
    pub fn device(&self, index: u32) -> Option<DeviceDescriptor> {
        debug_assert!(index < self.capacity());
        self.heap
            .device_base
            .map(|base| DeviceDescriptor(base + u64::from(index) * self.heap.stride))
    }

    pub fn allocate_host(&mut self) -> RenderResult<HostDescriptor> {
        let index = self.allocate()?;
        Ok(self.host(index))
    }

    pub fn free_host(&mut self, handle: HostDescriptor) {
        let index = self.index_of(handle).unwrap_or_else(|| {
            panic!("{handle} does not belong to this {:?} pool", self.kind)
        });
        self.free(index);
    }

    /// Slot index of `handle`, if it addresses a slot of this pool.
    pub fn index_of(&self, handle: HostDescriptor) -> Option<u32> {
        if handle.epoch != self.epoch {
            return None;
        }
        let offset = handle.address.checked_sub(self.heap.host_base)?;
        if offset % self.heap.stride != 0 {
            return None;
        }
        let index = u32::try_from(offset / self.heap.stride).ok()?;
        (index < self.capacity()).then_some(index)
    }

    pub fn contains(&self, handle: HostDescriptor) -> bool {
        self.index_of(handle).is_some()
    }

    pub fn binding(&self) -> HeapBinding {
        HeapBinding {
            kind: self.kind,
            epoch: self.epoch,
            host_base: self.heap.host_base,
            device_base: self.heap.device_base,
        }
    }
}

impl fmt::Debug for DescriptorPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DescriptorPool")
            .field("kind", &self.kind)
            .field("capacity", &self.capacity())
            .field("used", &self.used())
            .field("host_base", &format_args!("{:#x}", self.heap.host_base))
            .field("shader_visible", &self.is_shader_visible())
            .finish()
    }
}

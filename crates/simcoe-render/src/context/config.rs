use std::fmt;

use crate::device::FeatureLevel;
use crate::instance::{AdapterLuid, AdapterPreference, Backend, DebugFlags};
use crate::surface::{SurfaceInfo, SwapChainFactory};

/// Descriptor slots reserved beyond what the swap chain itself needs.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub struct DescriptorHeapSizes {
    pub rtv: u32,
    pub dsv: u32,
    pub srv: u32,
}

/// Construction-time configuration of a [`Context`](super::Context).
pub struct ContextConfig {
    pub debug_flags: DebugFlags,

    /// Adapter to try first. Falls back to automatic search if absent or unusable.
    pub adapter_override: Option<AdapterLuid>,

    /// Order in which automatic search visits hardware adapters.
    pub preference: AdapterPreference,

    /// Minimum feature level a device must support.
    pub target_level: FeatureLevel,

    /// Fall back to the software adapter once hardware adapters are exhausted.
    pub allow_software_adapter: bool,

    pub backend: Backend,

    /// Passed to `SwapChain::present`; 0 presents without waiting for vsync.
    pub sync_interval: u32,

    pub heap_sizes: DescriptorHeapSizes,

    pub swap_chain_factory: Box<dyn SwapChainFactory>,

    /// Initial presentation geometry.
    pub surface_info: SurfaceInfo,
}

impl ContextConfig {
    pub fn new(factory: impl SwapChainFactory + 'static, surface_info: SurfaceInfo) -> Self {
        Self {
            debug_flags: DebugFlags::empty(),
            adapter_override: None,
            preference: AdapterPreference::HighPerformance,
            target_level: FeatureLevel::Level11_0,
            allow_software_adapter: false,
            backend: Backend::default(),
            sync_interval: 1,
            heap_sizes: DescriptorHeapSizes::default(),
            swap_chain_factory: Box::new(factory),
            surface_info,
        }
    }

    pub fn with_backend(mut self, backend: Backend) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_debug_flags(mut self, flags: DebugFlags) -> Self {
        self.debug_flags = flags;
        self
    }

    pub fn with_adapter(mut self, luid: AdapterLuid) -> Self {
        self.adapter_override = Some(luid);
        self
    }

    pub fn with_preference(mut self, preference: AdapterPreference) -> Self {
        self.preference = preference;
        self
    }

    pub fn with_target_level(mut self, level: FeatureLevel) -> Self {
        self.target_level = level;
        self
    }

    pub fn with_software_fallback(mut self, allow: bool) -> Self {
        self.allow_software_adapter = allow;
        self
    }

    pub fn with_sync_interval(mut self, interval: u32) -> Self {
        self.sync_interval = interval;
        self
    }

    pub fn with_heap_sizes(mut self, sizes: DescriptorHeapSizes) -> Self {
        self.heap_sizes = sizes;
        self
    }
}

impl fmt::Debug for ContextConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextConfig")
            .field("debug_flags", &self.debug_flags)
            .field("adapter_override", &self.adapter_override)
            .field("preference", &self.preference)
            .field("target_level", &self.target_level)
            .field("allow_software_adapter", &self.allow_software_adapter)
            .field("backend", &self.backend)
            .field("sync_interval", &self.sync_interval)
            .field("heap_sizes", &self.heap_sizes)
            .field("surface_info", &self.surface_info)
            .finish_non_exhaustive()
    }
}

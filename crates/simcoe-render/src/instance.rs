//! Adapter enumeration and debug-layer configuration.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::error::{RenderError, RenderResult};
use crate::hal::gpu::GpuInstance;
use crate::hal::reference::{ReferenceInstance, ReferenceSystem};
use crate::hal::{RawAdapter, RawInstance};

/// Locally unique adapter identifier, stable for the lifetime of the process.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Default)]
pub struct AdapterLuid {
    pub high: i32,
    pub low: u32,
}

impl AdapterLuid {
    pub const fn new(high: i32, low: u32) -> Self {
        Self { high, low }
    }

    /// False for the all-zero LUID, which no adapter reports.
    pub fn is_present(self) -> bool {
        self.high != 0 || self.low != 0
    }

    pub fn as_u64(self) -> u64 {
        (u64::from(self.high as u32) << 32) | u64::from(self.low)
    }
}

impl fmt::Display for AdapterLuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}:{:x}", self.high as u32, self.low)
    }
}

/// Parses the `high:low` hex form produced by `Display`.
impl FromStr for AdapterLuid {
    type Err = RenderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || RenderError::InvalidState(format!("`{s}` is not an adapter LUID (high:low)"));
        let (high, low) = s.trim().split_once(':').ok_or_else(invalid)?;
        let high = u32::from_str_radix(high, 16).map_err(|_| invalid())?;
        let low = u32::from_str_radix(low, 16).map_err(|_| invalid())?;
        Ok(Self::new(high as i32, low))
    }
}

bitflags::bitflags! {
    #[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Default)]
    pub struct AdapterFlags: u32 {
        /// The adapter is a software rasterizer.
        const SOFTWARE   = 1 << 0;
        /// The adapter shares system memory with the CPU.
        const INTEGRATED = 1 << 1;
    }
}

/// Static description of one adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterInfo {
    pub name: String,
    pub luid: AdapterLuid,
    pub vendor_id: u32,
    pub device_id: u32,
    pub dedicated_video_memory: u64,
    pub shared_system_memory: u64,
    pub flags: AdapterFlags,
}

impl AdapterInfo {
    pub fn is_software(&self) -> bool {
        self.flags.contains(AdapterFlags::SOFTWARE)
    }
}

/// An enumerated adapter that devices can be opened on.
#[derive(Clone)]
pub struct Adapter {
    info: AdapterInfo,
    pub(crate) raw: Arc<dyn RawAdapter>,
}

impl Adapter {
    pub(crate) fn new(raw: Arc<dyn RawAdapter>) -> Self {
        Self {
            info: raw.info().clone(),
            raw,
        }
    }

    pub fn info(&self) -> &AdapterInfo {
        &self.info
    }

    pub fn luid(&self) -> AdapterLuid {
        self.info.luid
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }
}

impl fmt::Debug for Adapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Adapter").field(&self.info).finish()
    }
}

/// Ordering applied to the hardware adapter list.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Default)]
pub enum AdapterPreference {
    #[default]
    HighPerformance,
    MinimumPower,
}

impl fmt::Display for AdapterPreference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdapterPreference::HighPerformance => f.write_str("high performance"),
            AdapterPreference::MinimumPower => f.write_str("minimum power"),
        }
    }
}

/// Orders adapters by preference. The sort is stable, so adapters that tie keep
/// enumeration order.
pub fn sort_by_preference(adapters: &mut [Adapter], preference: AdapterPreference) {
    // discrete first and largest first for performance; integrated and smallest first for power
    let rank = |info: &AdapterInfo| {
        let integrated = info.flags.contains(AdapterFlags::INTEGRATED);
        let memory = info.dedicated_video_memory as i128;
        match preference {
            AdapterPreference::HighPerformance => (integrated, -memory),
            AdapterPreference::MinimumPower => (!integrated, memory),
        }
    };
    adapters.sort_by_key(|a| rank(&a.info));
}

bitflags::bitflags! {
    /// Debug facilities requested at instance and device creation.
    #[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Default)]
    pub struct DebugFlags: u32 {
        /// Enable the device debug layer.
        const DEVICE_DEBUG_LAYER  = 1 << 0;
        /// Enable instance-level (factory) debugging.
        const FACTORY_DEBUG       = 1 << 1;
        /// Collect extended information when a device is removed.
        const DEVICE_REMOVED_INFO = 1 << 2;
        /// Forward device validation messages to the log.
        const INFO_QUEUE          = 1 << 3;
        /// Label every created object with its role.
        const AUTO_NAME           = 1 << 4;
        /// Select the software adapter instead of hardware.
        const WARP_ADAPTER        = 1 << 5;
        /// Enable GPU-based validation. Implies the debug layer.
        const GPU_VALIDATION      = 1 << 6;
    }
}

/// Effective debug capabilities derived from [`DebugFlags`].
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub struct DebugState {
    pub debug_layer: bool,
    pub gpu_validation: bool,
    pub auto_name: bool,
    pub device_removed_info: bool,
    pub factory_debug: bool,
}

impl DebugState {
    pub fn new(flags: DebugFlags) -> Self {
        let gpu_validation = flags.contains(DebugFlags::GPU_VALIDATION);
        let auto_name = flags.contains(DebugFlags::AUTO_NAME);
        let device_removed_info = flags.contains(DebugFlags::DEVICE_REMOVED_INFO);

        Self {
            debug_layer: flags.contains(DebugFlags::DEVICE_DEBUG_LAYER)
                || gpu_validation
                || auto_name
                || device_removed_info,
            gpu_validation,
            auto_name,
            device_removed_info,
            factory_debug: flags.contains(DebugFlags::FACTORY_DEBUG),
        }
    }
}

/// Which native implementation an [`Instance`] drives.
#[derive(Debug, Clone)]
pub enum Backend {
    /// Deterministic CPU backend with scripted adapters.
    Reference(ReferenceSystem),
    /// wgpu, restricted to the given native APIs.
    Wgpu(wgpu::Backends),
}

impl Default for Backend {
    fn default() -> Self {
        Backend::Wgpu(wgpu::Backends::all())
    }
}

#[derive(Debug, Clone, Default)]
pub struct InstanceConfig {
    pub flags: DebugFlags,
    pub preference: AdapterPreference,
    pub backend: Backend,
}

/// Entry point to a backend: owns the adapter list and the debug configuration.
pub struct Instance {
    flags: DebugFlags,
    debug: DebugState,
    preference: AdapterPreference,
    adapters: Vec<Adapter>,
    software: Option<Adapter>,
    tearing: bool,
    pub(crate) raw: Box<dyn RawInstance>,
}

impl Instance {
    pub fn new(config: InstanceConfig) -> RenderResult<Self> {
        let debug = DebugState::new(config.flags);
        log::info!(
            "creating instance (debug layer: {}, gpu validation: {}, auto name: {}, removed info: {})",
            debug.debug_layer,
            debug.gpu_validation,
            debug.auto_name,
            debug.device_removed_info
        );

        let raw: Box<dyn RawInstance> = match config.backend {
            Backend::Reference(system) => Box::new(ReferenceInstance::new(system)),
            Backend::Wgpu(backends) => Box::new(GpuInstance::new(backends, config.flags)?),
        };

        let mut adapters: Vec<Adapter> = raw.adapters().into_iter().map(Adapter::new).collect();
        sort_by_preference(&mut adapters, config.preference);
        let software = raw.software_adapter().map(Adapter::new);
        let tearing = raw.tearing_supported();

        for adapter in &adapters {
            log::info!("adapter {}: {}", adapter.luid(), adapter.name());
        }
        match &software {
            Some(adapter) => log::info!("software adapter {}: {}", adapter.luid(), adapter.name()),
            None => log::info!("no software adapter available"),
        }

        Ok(Self {
            flags: config.flags,
            debug,
            preference: config.preference,
            adapters,
            software,
            tearing,
            raw,
        })
    }

    pub fn flags(&self) -> DebugFlags {
        self.flags
    }

    pub fn debug_state(&self) -> DebugState {
        self.debug
    }

    pub fn preference(&self) -> AdapterPreference {
        self.preference
    }

    /// Hardware adapters in preference order. Never includes the software adapter.
    pub fn adapters(&self) -> &[Adapter] {
        &self.adapters
    }

    pub fn software_adapter(&self) -> Option<&Adapter> {
        self.software.as_ref()
    }

    /// Looks an adapter up by LUID across hardware and software adapters.
    pub fn find_adapter(&self, luid: AdapterLuid) -> Option<&Adapter> {
        self.adapters
            .iter()
            .chain(self.software.as_ref())
            .find(|a| a.luid() == luid)
    }

    pub fn adapter_by_luid(&self, luid: AdapterLuid) -> RenderResult<&Adapter> {
        self.find_adapter(luid)
            .ok_or(RenderError::AdapterNotFound(luid))
    }

    pub fn tearing_supported(&self) -> bool {
        self.tearing
    }
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instance")
            .field("flags", &self.flags)
            .field("adapters", &self.adapters)
            .field("software", &self.software)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::reference::ReferenceAdapterDesc;
    use crate::device::FeatureLevel;

    #[test]
    fn luid_parses_its_display_form() {
        let luid = AdapterLuid::new(-1, 0x1234);
        assert_eq!(luid.to_string(), "ffffffff:1234");
        assert_eq!("ffffffff:1234".parse::<AdapterLuid>().ok(), Some(luid));
        assert_eq!("1000:1234".parse::<AdapterLuid>().ok(), Some(AdapterLuid::new(0x1000, 0x1234)));
        assert!("1234".parse::<AdapterLuid>().is_err());
        assert!("0:xyz".parse::<AdapterLuid>().is_err());
    }

    fn instance_with(system: ReferenceSystem, preference: AdapterPreference) -> Instance {
        Instance::new(InstanceConfig {
            flags: DebugFlags::empty(),
            preference,
            backend: Backend::Reference(system),
        })
        .expect("reference instance")
    }

    fn system() -> ReferenceSystem {
        ReferenceSystem {
            adapters: vec![
                ReferenceAdapterDesc::new("Small", AdapterLuid::new(0, 1), FeatureLevel::Level12_1)
                    .with_memory(1 << 30),
                ReferenceAdapterDesc::new("Onboard", AdapterLuid::new(0, 2), FeatureLevel::Level12_0)
                    .integrated(),
                ReferenceAdapterDesc::new("Big", AdapterLuid::new(0, 3), FeatureLevel::Level12_2)
                    .with_memory(8 << 30),
            ],
            software: Some(ReferenceAdapterDesc::software(AdapterLuid::new(0, 9))),
            tearing: true,
        }
    }

    // ── ordering ─────────────────────────────────────────────────────────

    #[test]
    fn high_performance_puts_largest_discrete_first() {
        let instance = instance_with(system(), AdapterPreference::HighPerformance);
        let names: Vec<_> = instance.adapters().iter().map(Adapter::name).collect();
        assert_eq!(names, ["Big", "Small", "Onboard"]);
    }

    #[test]
    fn minimum_power_puts_integrated_then_smallest_first() {
        let instance = instance_with(system(), AdapterPreference::MinimumPower);
        let names: Vec<_> = instance.adapters().iter().map(Adapter::name).collect();
        assert_eq!(names, ["Onboard", "Small", "Big"]);
    }

    #[test]
    fn software_adapter_is_not_in_hardware_list() {
        let instance = instance_with(system(), AdapterPreference::HighPerformance);
        assert!(instance.adapters().iter().all(|a| !a.info().is_software()));
        assert!(instance.software_adapter().is_some_and(|a| a.info().is_software()));
    }

    // ── lookup ───────────────────────────────────────────────────────────

    #[test]
    fn find_adapter_covers_software() {
        let instance = instance_with(system(), AdapterPreference::HighPerformance);
        assert_eq!(
            instance.find_adapter(AdapterLuid::new(0, 9)).map(Adapter::name),
            instance.software_adapter().map(Adapter::name)
        );
        assert!(matches!(
            instance.adapter_by_luid(AdapterLuid::new(0x1000, 0x1234)),
            Err(RenderError::AdapterNotFound(_))
        ));
    }

    #[test]
    fn luid_formats_as_hex_pair() {
        assert_eq!(AdapterLuid::new(0x1000, 0x1234).to_string(), "1000:1234");
        assert_eq!(AdapterLuid::new(1, 2).as_u64(), (1 << 32) | 2);
        assert!(!AdapterLuid::default().is_present());
    }

    // ── debug state ──────────────────────────────────────────────────────

    #[test]
    fn debug_layer_implied_by_dependent_flags() {
        assert!(!DebugState::new(DebugFlags::empty()).debug_layer);
        assert!(DebugState::new(DebugFlags::GPU_VALIDATION).debug_layer);
        assert!(DebugState::new(DebugFlags::AUTO_NAME).debug_layer);
        assert!(DebugState::new(DebugFlags::DEVICE_REMOVED_INFO).debug_layer);
        assert!(!DebugState::new(DebugFlags::INFO_QUEUE).debug_layer);
    }
}

use crate::device::{Device, FeatureLevel};
use crate::error::{RenderError, RenderResult};
use crate::instance::{AdapterLuid, DebugFlags, Instance};

#[derive(Debug, Copy, Clone)]
pub(crate) struct SelectOptions {
    pub adapter_override: Option<AdapterLuid>,
    pub level: FeatureLevel,
    pub flags: DebugFlags,
    pub allow_software: bool,
}

/// Picks the first adapter that can open a device at the requested level.
///
/// Order: forced software adapter (`WARP_ADAPTER`), then the override, then
/// hardware adapters in preference order, then the software adapter when
/// allowed.
pub(crate) fn select_device(instance: &Instance, options: &SelectOptions) -> RenderResult<Device> {
    let SelectOptions {
        adapter_override,
        level,
        flags,
        allow_software,
    } = *options;

    if flags.contains(DebugFlags::WARP_ADAPTER) {
        let adapter = instance.software_adapter().ok_or_else(|| {
            RenderError::NoSuitableAdapter("software adapter requested but unavailable".into())
        })?;
        log::info!("software adapter forced by debug flags");
        return Device::create(adapter, level, flags)
            .map_err(|e| RenderError::NoSuitableAdapter(format!("software adapter: {e}")));
    }

    if let Some(luid) = adapter_override.filter(|l| l.is_present()) {
        match instance.find_adapter(luid) {
            Some(adapter) => match Device::create(adapter, level, flags) {
                Ok(device) => return Ok(device),
                Err(e) => log::warn!("adapter override {luid} unusable ({e}); searching"),
            },
            None => log::warn!("adapter override {luid} not found; searching"),
        }
    }

    log::debug!(
        "searching {} adapters ({}) for feature level {level}",
        instance.adapters().len(),
        instance.preference()
    );
    for adapter in instance.adapters() {
        match Device::create(adapter, level, flags) {
            Ok(device) => return Ok(device),
            Err(e) => log::warn!("skipping `{}`: {e}", adapter.name()),
        }
    }

    if allow_software {
        match instance.software_adapter() {
            Some(adapter) => match Device::create(adapter, level, flags) {
                Ok(device) => {
                    log::warn!("no hardware adapter usable; falling back to `{}`", adapter.name());
                    return Ok(device);
                }
                Err(e) => log::warn!("software adapter unusable: {e}"),
            },
            None => log::warn!("software fallback allowed but no software adapter exists"),
        }
    }

    Err(RenderError::NoSuitableAdapter(format!(
        "no adapter can create a device at feature level {level}"
    )))
}

/// Opens a device on exactly `luid`, with no fallback.
pub(crate) fn create_device_on(
    instance: &Instance,
    luid: AdapterLuid,
    level: FeatureLevel,
    flags: DebugFlags,
) -> RenderResult<Device> {
    let adapter = instance.adapter_by_luid(luid)?;
    Device::create(adapter, level, flags)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::reference::{ReferenceAdapterDesc, ReferenceSystem};
    use crate::instance::{AdapterPreference, Backend, InstanceConfig};

    fn instance(system: ReferenceSystem) -> Instance {
        Instance::new(InstanceConfig {
            flags: DebugFlags::empty(),
            preference: AdapterPreference::HighPerformance,
            backend: Backend::Reference(system),
        })
        .expect("instance")
    }

    fn options(level: FeatureLevel) -> SelectOptions {
        SelectOptions {
            adapter_override: None,
            level,
            flags: DebugFlags::empty(),
            allow_software: false,
        }
    }

    fn two_adapters() -> ReferenceSystem {
        ReferenceSystem {
            adapters: vec![
                ReferenceAdapterDesc::new("Broken", AdapterLuid::new(0, 1), FeatureLevel::Level12_2)
                    .with_memory(16 << 30)
                    .failing(),
                ReferenceAdapterDesc::new("Modest", AdapterLuid::new(0, 2), FeatureLevel::Level12_0)
                    .with_memory(2 << 30),
            ],
            software: Some(ReferenceAdapterDesc::software(AdapterLuid::new(0, 3))),
            tearing: false,
        }
    }

    #[test]
    fn search_skips_adapters_that_fail_creation() {
        let instance = instance(two_adapters());
        let device = select_device(&instance, &options(FeatureLevel::Level11_0)).expect("device");
        assert_eq!(device.adapter().name, "Modest");
    }

    #[test]
    fn exhausted_search_without_fallback_fails() {
        let instance = instance(two_adapters());
        assert!(matches!(
            select_device(&instance, &options(FeatureLevel::Level12_1)),
            Err(RenderError::NoSuitableAdapter(_))
        ));
    }

    #[test]
    fn software_fallback_when_allowed() {
        let instance = instance(two_adapters());
        let device = select_device(
            &instance,
            &SelectOptions {
                allow_software: true,
                ..options(FeatureLevel::Level12_1)
            },
        )
        .expect("device");
        assert!(device.adapter().is_software());
    }

    #[test]
    fn override_wins_over_preference_order() {
        let instance = instance(ReferenceSystem::default());
        let integrated = AdapterLuid::new(0, 0x1002);
        let device = select_device(
            &instance,
            &SelectOptions {
                adapter_override: Some(integrated),
                ..options(FeatureLevel::Level11_0)
            },
        )
        .expect("device");
        assert_eq!(device.luid(), integrated);
    }

    #[test]
    fn unusable_override_falls_back_to_search() {
        let instance = instance(ReferenceSystem::default());
        let device = select_device(
            &instance,
            &SelectOptions {
                adapter_override: Some(AdapterLuid::new(0x1000, 0x1234)),
                ..options(FeatureLevel::Level11_0)
            },
        )
        .expect("device");
        assert_eq!(device.luid(), instance.adapters()[0].luid());
    }

    #[test]
    fn warp_flag_forces_software_adapter() {
        let instance = instance(ReferenceSystem::default());
        let device = select_device(
            &instance,
            &SelectOptions {
                flags: DebugFlags::WARP_ADAPTER,
                ..options(FeatureLevel::Level11_0)
            },
        )
        .expect("device");
        assert!(device.adapter().is_software());
    }

    #[test]
    fn explicit_creation_has_no_fallback() {
        let instance = instance(ReferenceSystem::default());
        assert!(matches!(
            create_device_on(
                &instance,
                AdapterLuid::new(0x1000, 0x1234),
                FeatureLevel::Level11_0,
                DebugFlags::empty()
            ),
            Err(RenderError::AdapterNotFound(_))
        ));
    }
}

//! Caller-owned objects rebuilt in lock-step with the device.

use std::any::{Any, type_name};
use std::fmt;
use std::marker::PhantomData;

use crate::descriptor::DescriptorPool;
use crate::device::Device;
use crate::error::RenderResult;
use crate::memory::Allocator;
use crate::queue::CommandQueue;
use crate::surface::SurfaceInfo;

/// Device objects available to a resource while it builds itself.
pub struct ResourceContext<'a> {
    pub device: &'a Device,
    pub allocator: &'a Allocator,
    pub queue: &'a CommandQueue,
    /// Shader-visible pool; resources allocate their own descriptors here.
    pub srv_heap: &'a mut DescriptorPool,
    pub surface: &'a SurfaceInfo,
    /// Number of back buffers in flight.
    pub frame_count: u32,
}

/// An object holding device state that must be torn down and rebuilt
/// whenever the context changes device.
///
/// `reset` may be called on a resource that was never created, or whose
/// `create` failed part-way, and must tolerate that.
pub trait DeviceResource: Send + 'static {
    /// Builds device objects against the current device.
    fn create(&mut self, ctx: &mut ResourceContext<'_>) -> RenderResult<()>;

    /// Releases every device object. The GPU is idle when this is called.
    fn reset(&mut self);

    /// Reacts to new presentation geometry.
    fn update(&mut self, ctx: &mut ResourceContext<'_>, info: &SurfaceInfo) -> RenderResult<()> {
        let _ = (ctx, info);
        Ok(())
    }
}

/// Typed key of a registered resource.
pub struct ResourceHandle<T> {
    id: u64,
    _marker: PhantomData<fn() -> T>,
}

impl<T> ResourceHandle<T> {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl<T> Clone for ResourceHandle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for ResourceHandle<T> {}

impl<T> PartialEq for ResourceHandle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<T> Eq for ResourceHandle<T> {}

impl<T> fmt::Debug for ResourceHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ResourceHandle<{}>({})", type_name::<T>(), self.id)
    }
}

trait ErasedResource: Send {
    fn resource(&mut self) -> &mut dyn DeviceResource;
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
    fn into_any(self: Box<Self>) -> Box<dyn Any>;
}

impl<T: DeviceResource> ErasedResource for T {
    fn resource(&mut self) -> &mut dyn DeviceResource {
        self
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

struct Entry {
    id: u64,
    name: &'static str,
    value: Box<dyn ErasedResource>,
}

/// Registered resources in registration order.
///
/// Creation and updates walk the list front to back; resets walk it back to
/// front, so a resource may depend on anything registered before it.
#[derive(Default)]
pub(crate) struct ResourceRegistry {
    entries: Vec<Entry>,
    next_id: u64,
}

impl ResourceRegistry {
    pub(crate) fn insert<T: DeviceResource>(&mut self, value: T) -> ResourceHandle<T> {
        self.next_id += 1;
        let id = self.next_id;
        self.entries.push(Entry {
            id,
            name: type_name::<T>(),
            value: Box::new(value),
        });
        ResourceHandle {
            id,
            _marker: PhantomData,
        }
    }

    pub(crate) fn get<T: DeviceResource>(&self, handle: ResourceHandle<T>) -> Option<&T> {
        self.entries
            .iter()
            .find(|e| e.id == handle.id)
            .and_then(|e| e.value.as_any().downcast_ref())
    }

    pub(crate) fn get_mut<T: DeviceResource>(&mut self, handle: ResourceHandle<T>) -> Option<&mut T> {
        self.entries
            .iter_mut()
            .find(|e| e.id == handle.id)
            .and_then(|e| e.value.as_any_mut().downcast_mut())
    }

    pub(crate) fn remove<T: DeviceResource>(&mut self, handle: ResourceHandle<T>) -> Option<T> {
        let position = self
            .entries
            .iter()
            .position(|e| e.id == handle.id && e.value.as_any().is::<T>())?;
        let entry = self.entries.remove(position);
        entry.value.into_any().downcast().ok().map(|boxed| *boxed)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn create_all(&mut self, ctx: &mut ResourceContext<'_>) -> RenderResult<()> {
        for entry in &mut self.entries {
            log::debug!("creating device resource {} ({})", entry.id, entry.name);
            entry.value.resource().create(ctx)?;
        }
        Ok(())
    }

    pub(crate) fn update_all(
        &mut self,
        ctx: &mut ResourceContext<'_>,
        info: &SurfaceInfo,
    ) -> RenderResult<()> {
        for entry in &mut self.entries {
            entry.value.resource().update(ctx, info)?;
        }
        Ok(())
    }

    pub(crate) fn reset_all(&mut self) {
        for entry in self.entries.iter_mut().rev() {
            log::debug!("resetting device resource {} ({})", entry.id, entry.name);
            entry.value.resource().reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    type Log = Arc<Mutex<Vec<String>>>;

    struct Probe {
        name: &'static str,
        log: Log,
    }

    impl DeviceResource for Probe {
        fn create(&mut self, _ctx: &mut ResourceContext<'_>) -> RenderResult<()> {
            self.log.lock().unwrap().push(format!("create {}", self.name));
            Ok(())
        }

        fn reset(&mut self) {
            self.log.lock().unwrap().push(format!("reset {}", self.name));
        }
    }

    struct Other;

    impl DeviceResource for Other {
        fn create(&mut self, _ctx: &mut ResourceContext<'_>) -> RenderResult<()> {
            Ok(())
        }

        fn reset(&mut self) {}
    }

    #[test]
    fn resets_in_reverse_registration_order() {
        let log = Log::default();
        let mut registry = ResourceRegistry::default();
        registry.insert(Probe { name: "a", log: log.clone() });
        registry.insert(Probe { name: "b", log: log.clone() });
        registry.insert(Probe { name: "c", log: log.clone() });

        registry.reset_all();
        assert_eq!(*log.lock().unwrap(), ["reset c", "reset b", "reset a"]);
    }

    #[test]
    fn handles_are_typed_and_unique() {
        let log = Log::default();
        let mut registry = ResourceRegistry::default();
        let probe = registry.insert(Probe { name: "a", log });
        let other = registry.insert(Other);

        assert_ne!(probe.id(), other.id());
        assert_eq!(registry.get(probe).map(|p| p.name), Some("a"));
        assert!(registry.get(other).is_some());

        let removed = registry.remove(probe).expect("registered");
        assert_eq!(removed.name, "a");
        assert!(registry.get(probe).is_none());
        assert!(registry.remove(probe).is_none());
        assert_eq!(registry.len(), 1);
    }
}

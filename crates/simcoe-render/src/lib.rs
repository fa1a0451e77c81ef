//! Simcoe render core.
//!
//! Selects a GPU adapter, owns the device and its presentation timeline, and
//! survives device loss and adapter switches by tearing down and rebuilding
//! everything built on the device, including caller-registered resources.
//!
//! Two backends sit underneath: wgpu for real hardware, and a deterministic
//! reference backend used by tests and headless runs.

pub mod commands;
pub mod context;
pub mod core;
pub mod descriptor;
pub mod device;
pub mod error;
pub mod fence;
pub mod instance;
pub mod logging;
pub mod memory;
pub mod queue;
pub mod surface;
pub mod texture;
pub mod window;

mod hal;

pub use context::{
    Context, ContextConfig, ContextState, DescriptorHeapSizes, DeviceResource, ResourceContext,
    ResourceHandle,
};
pub use device::{Device, FeatureLevel};
pub use error::{ErrorStatus, RenderError, RenderResult};
pub use hal::reference::{ReferenceAdapterDesc, ReferenceSystem};
pub use instance::{
    Adapter, AdapterLuid, AdapterPreference, Backend, DebugFlags, Instance, InstanceConfig,
};
pub use surface::{SurfaceInfo, SwapChain, SwapChainFactory, VirtualSwapChainFactory};

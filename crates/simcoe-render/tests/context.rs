//! Context scenarios against the reference backend and virtual swap chain.

use std::sync::{Arc, Mutex};

use simcoe_render::commands::Command;
use simcoe_render::memory::AllocatorFlags;
use simcoe_render::texture::{Format, ResourceState, Surface, TextureDesc};
use simcoe_render::{
    AdapterLuid, Backend, Context, ContextConfig, ContextState, DebugFlags, DescriptorHeapSizes,
    DeviceResource, ErrorStatus, FeatureLevel, ReferenceAdapterDesc, ReferenceSystem, RenderError,
    RenderResult, ResourceContext, SurfaceInfo, VirtualSwapChainFactory,
};

const DISCRETE: AdapterLuid = AdapterLuid::new(0, 0x1001);
const INTEGRATED: AdapterLuid = AdapterLuid::new(0, 0x1002);
const SOFTWARE: AdapterLuid = AdapterLuid::new(0, 0x1003);
const CLEAR_TEXEL: u32 = 0xff66_3300;

fn config(length: u32) -> ContextConfig {
    config_on(ReferenceSystem::default(), length)
}

fn config_on(system: ReferenceSystem, length: u32) -> ContextConfig {
    ContextConfig::new(VirtualSwapChainFactory, SurfaceInfo::new(64, 32, length))
        .with_backend(Backend::Reference(system))
        .with_debug_flags(DebugFlags::AUTO_NAME)
        .with_heap_sizes(DescriptorHeapSizes {
            rtv: 2,
            dsv: 1,
            srv: 8,
        })
}

fn context(length: u32) -> Context {
    Context::new(config(length)).expect("context")
}

type EventLog = Arc<Mutex<Vec<String>>>;

fn events(log: &EventLog) -> Vec<String> {
    log.lock().unwrap().clone()
}

/// Resource owning one texture and one SRV slot.
#[derive(Debug)]
struct Texture {
    name: &'static str,
    log: EventLog,
    surface: Option<Surface>,
    srv: Option<u32>,
    epoch: Option<u64>,
    updates: Vec<(u32, u32)>,
}

impl Texture {
    fn new(name: &'static str, log: &EventLog) -> Self {
        Self {
            name,
            log: log.clone(),
            surface: None,
            srv: None,
            epoch: None,
            updates: Vec::new(),
        }
    }
}

impl DeviceResource for Texture {
    fn create(&mut self, ctx: &mut ResourceContext<'_>) -> RenderResult<()> {
        self.log.lock().unwrap().push(format!("create {}", self.name));
        let desc = TextureDesc::render_target(8, 8, Format::Rgba8Unorm)
            .with_label(Some(self.name.to_owned()));
        self.surface = Some(ctx.allocator.allocate_surface(desc)?);
        self.srv = Some(ctx.srv_heap.allocate()?);
        self.epoch = Some(ctx.device.epoch());
        Ok(())
    }

    fn reset(&mut self) {
        self.log.lock().unwrap().push(format!("reset {}", self.name));
        self.surface = None;
        self.srv = None;
        self.epoch = None;
    }

    fn update(&mut self, _ctx: &mut ResourceContext<'_>, info: &SurfaceInfo) -> RenderResult<()> {
        self.updates.push((info.width, info.height));
        Ok(())
    }
}

/// Resource whose creation always fails.
struct Broken;

impl DeviceResource for Broken {
    fn create(&mut self, _ctx: &mut ResourceContext<'_>) -> RenderResult<()> {
        Err(RenderError::Backend("refusing to build".into()))
    }

    fn reset(&mut self) {}
}

// ── frame timeline ─────────────────────────────────────────────────────

#[test]
fn present_cycles_back_buffers_in_order() {
    let mut ctx = context(2);

    let mut order = Vec::new();
    for _ in 0..5 {
        order.push(ctx.current_frame_index());
        ctx.present().expect("present");
    }

    assert_eq!(order, [0, 1, 0, 1, 0]);
    assert_eq!(ctx.frames_presented(), 5);
    assert_eq!(ctx.device().validation_errors(), 0);
}

#[test]
fn fence_values_grow_on_every_revisit() {
    let mut ctx = context(3);
    assert_eq!(ctx.frame_fence_values(), [1, 0, 0]);

    let mut last_seen = vec![0u64; 3];
    for _ in 0..9 {
        let slot = ctx.current_frame_index() as usize;
        let value = ctx.frame_fence_values()[slot];
        assert!(value > last_seen[slot], "slot {slot} reused fence value {value}");
        last_seen[slot] = value;
        ctx.present().expect("present");
    }

    assert_eq!(ctx.present_fence_completed().expect("fence"), 9);
}

#[test]
fn present_clears_to_configured_colour() {
    let mut ctx = context(2);
    ctx.present().expect("present");

    let texels = ctx.read_back_buffer(0).expect("read back");
    assert_eq!(texels.len(), 64 * 32);
    assert!(texels.iter().all(|&t| t == CLEAR_TEXEL));
}

#[test]
fn recorded_commands_run_after_the_clear() {
    let mut ctx = context(2);

    ctx.begin().expect("begin");
    let target = ctx.render_target().expect("rtv");
    ctx.command_list()
        .expect("list")
        .clear_render_target(target, [1.0, 0.0, 0.0, 1.0]);
    ctx.end().expect("end");

    let texels = ctx.read_back_buffer(0).expect("read back");
    assert!(texels.iter().all(|&t| t == 0xff00_00ff));
    assert_eq!(
        ctx.back_buffer().expect("back buffer").tracked_state(),
        Some(ResourceState::Present)
    );
    assert_eq!(ctx.device().validation_errors(), 0);
}

#[test]
fn frame_scope_misuse_is_rejected() {
    let mut ctx = context(2);

    assert!(matches!(ctx.end(), Err(RenderError::InvalidState(_))));
    assert!(ctx.command_list().is_err());

    ctx.begin().expect("begin");
    assert!(matches!(ctx.begin(), Err(RenderError::InvalidState(_))));
    assert!(ctx.set_adapter(INTEGRATED).is_err());
    ctx.end().expect("end");

    assert_eq!(ctx.state(), ContextState::Active);
}

#[test]
fn flush_waits_for_everything_submitted() {
    let mut ctx = context(2);
    ctx.present().expect("present");
    ctx.present().expect("present");

    let before = ctx.frame_fence_values();
    ctx.flush().expect("flush");

    let slot = ctx.current_frame_index() as usize;
    assert_eq!(ctx.present_fence_completed().expect("fence"), before[slot]);
    assert_eq!(ctx.frame_fence_values()[slot], before[slot] + 1);
    ctx.present().expect("present after flush");
}

#[test]
fn auto_naming_labels_back_buffers() {
    let ctx = context(2);
    assert_eq!(ctx.back_buffer().expect("back buffer").name(), "virtual surface 0");
}

// ── swap chain updates ─────────────────────────────────────────────────

#[test]
fn resize_rebuilds_back_buffers() {
    let mut ctx = context(2);
    ctx.present().expect("present");
    ctx.present().expect("present");
    ctx.present().expect("present");

    ctx.update_swap_chain(SurfaceInfo::new(128, 64, 3))
        .expect("resize");

    let chain = ctx.swap_chain().expect("swap chain");
    assert_eq!(chain.length(), 3);
    assert_eq!(ctx.back_buffer().expect("back buffer").width(), 128);
    assert_eq!(ctx.surface_info().height, 64);
    assert_eq!(ctx.rtv_heap().expect("rtv heap").used(), 3);
    assert_eq!(ctx.allocator().expect("allocator").stats().live_allocations, 3);

    let values = ctx.frame_fence_values();
    let completed = ctx.present_fence_completed().expect("fence");
    assert!(values.iter().all(|&v| v == values[0] && v > completed));

    let mut order = Vec::new();
    for _ in 0..4 {
        order.push(ctx.current_frame_index());
        ctx.present().expect("present");
    }
    assert_eq!(order, [0, 1, 2, 0]);
    assert!(ctx.read_back_buffer(2).expect("read back").iter().all(|&t| t == CLEAR_TEXEL));
    assert_eq!(ctx.device().validation_errors(), 0);
}

#[test]
fn invalid_surface_info_is_rejected_without_side_effects() {
    let mut ctx = context(2);

    let err = ctx
        .update_swap_chain(SurfaceInfo::new(64, 32, 1))
        .expect_err("single buffer");
    assert_eq!(err.status(), ErrorStatus::SurfaceError);

    assert!(ctx.update_swap_chain(SurfaceInfo::new(8, 32, 2)).is_err());
    assert_eq!(ctx.state(), ContextState::Active);
    assert_eq!(ctx.swap_chain().expect("swap chain").length(), 2);
    ctx.present().expect("present");
}

#[test]
fn construction_rejects_invalid_surface_info() {
    let config = ContextConfig::new(VirtualSwapChainFactory, SurfaceInfo::new(64, 32, 17))
        .with_backend(Backend::Reference(ReferenceSystem::default()));
    assert!(matches!(Context::new(config), Err(RenderError::Surface(_))));
}

// ── adapters and recovery ──────────────────────────────────────────────

#[test]
fn unknown_adapter_leaves_context_usable() {
    let mut ctx = context(2);
    ctx.present().expect("present");
    let epoch = ctx.device().epoch();

    let err = ctx
        .set_adapter(AdapterLuid::new(0x1000, 0x1234))
        .expect_err("unknown adapter");
    assert!(matches!(err, RenderError::AdapterNotFound(_)));
    assert_eq!(err.to_string(), "adapter 1000:1234 not found");

    assert_eq!(ctx.state(), ContextState::Active);
    assert_eq!(ctx.adapter(), DISCRETE);
    assert_eq!(ctx.device().epoch(), epoch);
    ctx.present().expect("present after failed switch");
}

#[test]
fn failed_device_creation_keeps_old_device() {
    let mut system = ReferenceSystem::default();
    let broken = AdapterLuid::new(0, 0x2001);
    system.adapters.push(
        ReferenceAdapterDesc::new("Broken", broken, FeatureLevel::Level12_2)
            .with_memory(1 << 20)
            .failing(),
    );
    let mut ctx = Context::new(config_on(system, 2)).expect("context");

    let err = ctx.set_adapter(broken).expect_err("broken adapter");
    assert_eq!(err.status(), ErrorStatus::DeviceCreationFailed);
    assert_eq!(ctx.state(), ContextState::Active);
    assert_eq!(ctx.adapter(), DISCRETE);
    ctx.present().expect("present");
}

#[test]
fn removed_device_recovers_on_same_adapter() {
    let log = EventLog::default();
    let mut ctx = context(2);
    let handle = ctx.add_resource(Texture::new("albedo", &log)).expect("resource");
    ctx.present().expect("present");
    let old_epoch = ctx.device().epoch();

    assert!(ctx.remove_device());
    assert!(!ctx.remove_device());

    let err = ctx.present().expect_err("present on removed device");
    assert!(err.is_device_removed());
    assert_eq!(ctx.state(), ContextState::Removed);
    assert!(ctx.begin().is_err());

    ctx.set_adapter(ctx.adapter()).expect("recover");
    assert_eq!(ctx.state(), ContextState::Active);
    assert!(ctx.last_error().is_none());
    assert_eq!(ctx.adapter(), DISCRETE);
    assert!(ctx.device().epoch() > old_epoch);
    assert_eq!(ctx.frame_fence_values(), [1, 0]);
    assert_eq!(ctx.current_frame_index(), 0);

    let texture = ctx.resource(handle).expect("registered");
    assert_eq!(texture.epoch, Some(ctx.device().epoch()));
    assert_eq!(
        events(&log),
        ["create albedo", "reset albedo", "create albedo"]
    );

    ctx.present().expect("present after recovery");
    assert_eq!(ctx.device().validation_errors(), 0);
}

#[test]
fn moving_adapters_rebuilds_everything() {
    let log = EventLog::default();
    let mut ctx = context(2);
    ctx.add_resource(Texture::new("albedo", &log)).expect("resource");
    ctx.present().expect("present");

    let old_tracker = ctx.allocator().expect("allocator").tracker();
    assert_eq!(old_tracker.stats().live_allocations, 3);

    ctx.set_adapter(INTEGRATED).expect("move");
    assert_eq!(ctx.adapter(), INTEGRATED);
    assert_eq!(ctx.device().adapter().name, "Reference Integrated");
    assert_eq!(old_tracker.stats().live_allocations, 0);
    assert_eq!(ctx.allocator().expect("allocator").stats().live_allocations, 3);
    assert_eq!(ctx.srv_heap().expect("srv heap").used(), 1);

    ctx.present().expect("present on new adapter");
    ctx.set_adapter(SOFTWARE).expect("software adapter");
    assert!(ctx.device().adapter().is_software());
    ctx.present().expect("present on software adapter");
}

#[test]
fn commands_referencing_an_old_device_are_rejected() {
    let mut ctx = context(2);
    let stale = ctx.back_buffer().expect("back buffer").clone();

    ctx.set_adapter(INTEGRATED).expect("move");
    ctx.begin().expect("begin");
    ctx.command_list().expect("list").barrier(
        &stale,
        ResourceState::Present,
        ResourceState::RenderTarget,
    );

    let err = ctx.end().expect_err("stale surface");
    assert_eq!(err.status(), ErrorStatus::StaleResource);
    assert_eq!(ctx.state(), ContextState::Faulted);
    assert!(matches!(ctx.present(), Err(RenderError::StaleResource { .. })));

    ctx.set_adapter(ctx.adapter()).expect("recover");
    ctx.present().expect("present");
}

#[test]
fn descriptors_from_an_old_device_are_rejected() {
    let mut ctx = context(2);
    let stale_rtv = ctx.render_target().expect("render target");
    let old_epoch = ctx.device().epoch();

    ctx.set_adapter(INTEGRATED).expect("move");
    let live_rtv = ctx.render_target().expect("render target");
    assert_eq!(stale_rtv.address, live_rtv.address);
    assert_ne!(stale_rtv, live_rtv);

    ctx.begin().expect("begin");
    ctx.command_list()
        .expect("list")
        .clear_render_target(stale_rtv, [1.0, 0.0, 0.0, 1.0]);
    let err = ctx.end().expect_err("stale descriptor");
    match err {
        RenderError::StaleResource {
            resource_epoch,
            device_epoch,
            ..
        } => {
            assert_eq!(resource_epoch, old_epoch);
            assert_eq!(device_epoch, ctx.device().epoch());
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(ctx.device().validation_errors(), 0);

    ctx.set_adapter(ctx.adapter()).expect("recover");
    ctx.present().expect("present");
    let texels = ctx.read_back_buffer(0).expect("read back");
    assert!(texels.iter().all(|&t| t == CLEAR_TEXEL));
}

#[test]
fn heap_bindings_from_an_old_device_are_rejected() {
    let mut ctx = context(2);
    let stale_heap = ctx.srv_heap().expect("srv heap").binding();

    ctx.set_adapter(INTEGRATED).expect("move");
    ctx.begin().expect("begin");
    ctx.command_list()
        .expect("list")
        .push(Command::SetDescriptorHeap { heap: stale_heap });
    let err = ctx.end().expect_err("stale heap");
    assert_eq!(err.status(), ErrorStatus::StaleResource);
    assert_eq!(ctx.state(), ContextState::Faulted);
}

// ── device resources ───────────────────────────────────────────────────

#[test]
fn resources_reset_in_reverse_and_recreate_in_order() {
    let log = EventLog::default();
    let mut ctx = context(2);
    ctx.add_resource(Texture::new("a", &log)).expect("a");
    ctx.add_resource(Texture::new("b", &log)).expect("b");

    ctx.set_adapter(ctx.adapter()).expect("recreate");

    assert_eq!(
        events(&log),
        ["create a", "create b", "reset b", "reset a", "create a", "create b"]
    );
    assert_eq!(ctx.resource_count(), 2);
}

#[test]
fn resources_receive_surface_updates() {
    let log = EventLog::default();
    let mut ctx = context(2);
    let handle = ctx.add_resource(Texture::new("target", &log)).expect("resource");

    ctx.update_swap_chain(SurfaceInfo::new(256, 128, 2))
        .expect("resize");

    assert_eq!(ctx.resource(handle).expect("registered").updates, [(256, 128)]);
}

#[test]
fn removing_a_resource_resets_it() {
    let log = EventLog::default();
    let mut ctx = context(2);
    let handle = ctx.add_resource(Texture::new("scratch", &log)).expect("resource");
    assert_eq!(ctx.allocator().expect("allocator").stats().live_allocations, 3);

    let texture = ctx
        .remove_resource(handle)
        .expect("remove")
        .expect("registered");
    assert!(texture.surface.is_none());
    assert_eq!(events(&log), ["create scratch", "reset scratch"]);
    assert_eq!(ctx.allocator().expect("allocator").stats().live_allocations, 2);
    assert!(ctx.resource(handle).is_none());
    assert!(ctx.remove_resource(handle).expect("remove").is_none());
}

#[test]
fn resources_cannot_be_removed_inside_a_frame() {
    let log = EventLog::default();
    let mut ctx = context(2);
    let handle = ctx.add_resource(Texture::new("scratch", &log)).expect("resource");

    ctx.begin().expect("begin");
    let err = ctx.remove_resource(handle).expect_err("frame is open");
    assert_eq!(err.status(), ErrorStatus::InvalidState);
    assert!(ctx.resource(handle).is_some());
    assert_eq!(events(&log), ["create scratch"]);

    ctx.end().expect("end");
    assert!(ctx.remove_resource(handle).expect("remove").is_some());
    assert_eq!(events(&log), ["create scratch", "reset scratch"]);
}

#[test]
fn failing_resource_is_not_registered() {
    let mut ctx = context(2);
    assert!(ctx.add_resource(Broken).is_err());
    assert_eq!(ctx.resource_count(), 0);
    assert_eq!(ctx.state(), ContextState::Active);
}

#[test]
fn dropping_the_context_releases_all_allocations() {
    let log = EventLog::default();
    let mut ctx = context(3);
    ctx.add_resource(Texture::new("albedo", &log)).expect("resource");
    ctx.present().expect("present");
    let tracker = ctx.allocator().expect("allocator").tracker();

    drop(ctx);

    assert_eq!(tracker.stats().live_allocations, 0);
    assert_eq!(tracker.stats().live_bytes, 0);
    assert_eq!(events(&log), ["create albedo", "reset albedo"]);
}

// ── selection ──────────────────────────────────────────────────────────

#[test]
fn warp_flag_selects_the_software_adapter() {
    let config = config(2).with_debug_flags(DebugFlags::WARP_ADAPTER);
    let ctx = Context::new(config).expect("context");
    assert_eq!(ctx.adapter(), SOFTWARE);
}

#[test]
fn adapter_override_is_honoured() {
    let ctx = Context::new(config(2).with_adapter(INTEGRATED)).expect("context");
    assert_eq!(ctx.adapter(), INTEGRATED);
}

#[test]
fn unreachable_feature_level_fails_construction() {
    let config = config(2).with_target_level(FeatureLevel::Level12_2);
    let ctx = Context::new(config).expect("discrete supports 12_2");
    assert_eq!(ctx.adapter(), DISCRETE);

    let system = ReferenceSystem {
        adapters: vec![ReferenceAdapterDesc::new(
            "Old",
            AdapterLuid::new(0, 7),
            FeatureLevel::Level11_1,
        )],
        software: None,
        tearing: false,
    };
    let config = config_on(system, 2)
        .with_target_level(FeatureLevel::Level12_0)
        .with_software_fallback(true);
    assert!(matches!(
        Context::new(config),
        Err(RenderError::NoSuitableAdapter(_))
    ));
}

// ── command sets and allocators outside a context ──────────────────────

#[test]
fn submitted_commands_are_plain_values() {
    let mut ctx = context(2);
    ctx.begin().expect("begin");
    let list = ctx.command_list().expect("list");
    assert_eq!(list.len(), 4);
    drop(list);
    ctx.end().expect("end");

    let barrier = Command::Barrier {
        surface: ctx.back_buffer().expect("back buffer").clone(),
        before: ResourceState::Present,
        after: ResourceState::RenderTarget,
    };
    assert!(barrier.surface().is_some());
    assert_eq!(barrier.epoch(), ctx.device().epoch());
    assert_eq!(
        ctx.allocator().expect("allocator").flags(),
        AllocatorFlags::SINGLE_THREADED | AllocatorFlags::DEFAULT_POOLS_NOT_ZEROED
    );
}

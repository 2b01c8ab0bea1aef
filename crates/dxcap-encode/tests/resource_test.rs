//! Integration test: resources and heaps
//!
//! Write-watch injection, Map/Unmap memory capture under each tracking
//! mode, barrier state and residency priorities.
//!
//! Run with: cargo test --test resource_test -- --nocapture

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use common::{config, harness_from, harness_with, Harness, ScriptedWriteWatch};
use dxcap_core::config::{CaptureModeSetting, MemoryTrackingMode};
use dxcap_encode::{CommittedResourceArgs, DeviceDispatch, PlacedResourceArgs};
use dxcap_protocol::format::{
    BarrierFlags, CommandListType, CpuPageProperty, Format, HResult, HeapDesc, HeapFlags,
    HeapProperties, HeapType, MemoryPool, MemoryRange, ResidencyPriority, ResourceBarrier,
    ResourceDesc, ResourceStates, TileRange, TileRangeFlags, TileRegionSize,
    TiledResourceCoordinate,
};
use dxcap_protocol::records::{ObjectStateInfo, ResourceState, StateSnapshot, TileMappingState};
use dxcap_protocol::{ApiCallId, HandleId, NativeHandle, ObjectKind};

fn harness_for(mode: MemoryTrackingMode) -> Harness {
    harness_with(config(CaptureModeSetting::WriteAndTrack, mode))
}

fn create_committed(
    h: &Harness,
    device: NativeHandle,
    heap_type: HeapType,
    heap_flags: HeapFlags,
    desc: &ResourceDesc,
) -> (NativeHandle, HandleId) {
    let scope = h.manager.begin_call(ApiCallId::DeviceCreateCommittedResource);
    let properties = HeapProperties::of_type(heap_type);
    let args = CommittedResourceArgs {
        device,
        heap_properties: &properties,
        heap_flags,
        desc,
        initial_state: ResourceStates::GENERIC_READ,
    };
    let native = h
        .manager
        .override_create_committed_resource(scope, args)
        .expect("fake driver never fails");
    (native, h.id_of(native))
}

fn snapshot(h: &Harness) -> StateSnapshot {
    h.manager.write_tracked_state().expect("snapshot");
    h.sink.snapshots().pop().expect("snapshot written")
}

fn resource_state(snapshot: &StateSnapshot, id: HandleId) -> ResourceState {
    match &snapshot.find(id).expect("resource in snapshot").info {
        ObjectStateInfo::Resource(state) => state.clone(),
        other => panic!("expected Resource, got {:?}", other),
    }
}

// ── Write watch ─────────────────────────────────────────────

#[test]
fn test_write_watch_injected_on_upload_heap() {
    let h = harness_for(MemoryTrackingMode::PageGuard);
    let device = h.create_device();
    let (native, id) = create_committed(
        &h,
        device,
        HeapType::Upload,
        HeapFlags::empty(),
        &ResourceDesc::buffer(4096),
    );

    let (forwarded, flags) = h.driver.committed.lock()[&native];
    println!("Forwarded heap properties: {:?} {:?}", forwarded, flags);
    assert_eq!(forwarded.heap_type, HeapType::Custom);
    assert_eq!(forwarded.cpu_page_property, CpuPageProperty::WriteCombine);
    assert_eq!(forwarded.memory_pool_preference, MemoryPool::L0);
    assert!(flags.contains(HeapFlags::ALLOW_WRITE_WATCH));

    let state = resource_state(&snapshot(&h), id);
    assert!(state.has_write_watch);
    assert!(state.write_watch_injected);
    // The application's view is kept.
    assert_eq!(state.heap_type, HeapType::Upload);
}

#[test]
fn test_get_heap_properties_hides_injection() {
    let h = harness_for(MemoryTrackingMode::PageGuard);
    let device = h.create_device();
    let (native, _) = create_committed(
        &h,
        device,
        HeapType::Upload,
        HeapFlags::empty(),
        &ResourceDesc::buffer(256),
    );

    let (mut properties, mut flags) = h.driver.heap_properties(native).expect("known resource");
    h.manager
        .post_process_resource_get_heap_properties(native, HResult::S_OK, &mut properties, &mut flags);
    assert_eq!(properties.heap_type, HeapType::Upload);
    assert_eq!(properties.cpu_page_property, CpuPageProperty::Unknown);
    assert_eq!(properties.memory_pool_preference, MemoryPool::Unknown);
    assert!(!flags.contains(HeapFlags::ALLOW_WRITE_WATCH));
}

#[test]
fn test_write_watch_not_injected() {
    // Shared heaps, non-upload heaps and other tracking modes are left alone.
    let cases = [
        (MemoryTrackingMode::PageGuard, HeapType::Upload, HeapFlags::SHARED),
        (MemoryTrackingMode::PageGuard, HeapType::Default, HeapFlags::empty()),
        (MemoryTrackingMode::PageGuard, HeapType::Readback, HeapFlags::empty()),
        (MemoryTrackingMode::Assisted, HeapType::Upload, HeapFlags::empty()),
        (MemoryTrackingMode::Unassisted, HeapType::Upload, HeapFlags::empty()),
    ];
    for (mode, heap_type, heap_flags) in cases {
        let h = harness_for(mode);
        let device = h.create_device();
        let (native, id) =
            create_committed(&h, device, heap_type, heap_flags, &ResourceDesc::buffer(256));
        let (forwarded, flags) = h.driver.committed.lock()[&native];
        assert_eq!(forwarded.heap_type, heap_type, "{:?} {:?}", mode, heap_type);
        assert!(!flags.contains(HeapFlags::ALLOW_WRITE_WATCH));
        let state = resource_state(&snapshot(&h), id);
        assert!(!state.write_watch_injected);
    }
}

#[test]
fn test_application_write_watch_is_kept() {
    let h = harness_for(MemoryTrackingMode::PageGuard);
    let device = h.create_device();
    let mut properties = HeapProperties::of_type(HeapType::Custom);
    properties.cpu_page_property = CpuPageProperty::WriteBack;
    properties.memory_pool_preference = MemoryPool::L0;
    let desc = ResourceDesc::buffer(256);
    let scope = h.manager.begin_call(ApiCallId::DeviceCreateCommittedResource);
    let native = h
        .manager
        .override_create_committed_resource(
            scope,
            CommittedResourceArgs {
                device,
                heap_properties: &properties,
                heap_flags: HeapFlags::ALLOW_WRITE_WATCH,
                desc: &desc,
                initial_state: ResourceStates::GENERIC_READ,
            },
        )
        .expect("created");

    let state = resource_state(&snapshot(&h), h.id_of(native));
    assert!(state.has_write_watch);
    assert!(!state.write_watch_injected);
}

#[test]
fn test_ignored_write_watch_falls_back() {
    let h = harness_for(MemoryTrackingMode::PageGuard);
    h.driver.drop_write_watch.store(true, Ordering::Relaxed);
    let device = h.create_device();
    let (_, id) = create_committed(
        &h,
        device,
        HeapType::Upload,
        HeapFlags::empty(),
        &ResourceDesc::buffer(256),
    );

    let state = resource_state(&snapshot(&h), id);
    println!("has_write_watch={} injected={}", state.has_write_watch, state.write_watch_injected);
    assert!(!state.has_write_watch);
    assert!(state.write_watch_injected);
}

#[test]
fn test_heap_write_watch_and_placed_resource() {
    let h = harness_for(MemoryTrackingMode::PageGuard);
    let device = h.create_device();
    let desc = HeapDesc {
        size_in_bytes: 1 << 20,
        properties: HeapProperties::of_type(HeapType::Upload),
        alignment: 65536,
        flags: HeapFlags::DENY_RT_DS_TEXTURES,
    };
    let scope = h.manager.begin_call(ApiCallId::DeviceCreateHeap);
    let heap = h
        .manager
        .override_create_heap(scope, device, &desc, None)
        .expect("heap created");
    let heap_id = h.id_of(heap);

    // GetDesc returns what the application asked for.
    let mut reported = h.driver.heap_desc(heap);
    assert!(reported.flags.contains(HeapFlags::ALLOW_WRITE_WATCH));
    h.manager.post_process_heap_get_desc(heap, &mut reported);
    assert_eq!(reported.properties.heap_type, HeapType::Upload);
    assert_eq!(reported.flags, HeapFlags::DENY_RT_DS_TEXTURES);

    let resource = h.driver.new_handle();
    let buffer = ResourceDesc::buffer(4096);
    let scope = h.manager.begin_call(ApiCallId::DeviceCreatePlacedResource);
    let id = h
        .manager
        .post_process_create_placed_resource(
            scope,
            PlacedResourceArgs {
                device,
                heap,
                heap_offset: 65536,
                desc: &buffer,
                initial_state: ResourceStates::GENERIC_READ,
            },
            HResult::S_OK,
            Some(resource),
        )
        .expect("placed resource tracked");

    let snap = snapshot(&h);
    let state = resource_state(&snap, id);
    assert_eq!(state.heap, Some(heap_id));
    assert_eq!(state.heap_offset, 65536);
    assert_eq!(state.heap_type, HeapType::Upload);
    assert!(state.has_write_watch);
    match &snap.find(heap_id).expect("heap in snapshot").info {
        ObjectStateInfo::Heap(heap_state) => {
            assert!(heap_state.has_write_watch);
            assert_eq!(heap_state.flags, HeapFlags::DENY_RT_DS_TEXTURES.bits());
        }
        other => panic!("expected Heap, got {:?}", other),
    }
}

#[test]
fn test_reserved_resource_and_existing_heap() {
    let h = harness_for(MemoryTrackingMode::Unassisted);
    let device = h.create_device();

    let desc = ResourceDesc::texture_2d(256, 256, Format::R8G8B8A8_UNORM, 1);
    let scope = h.manager.begin_call(ApiCallId::DeviceCreateReservedResource);
    let reserved = h
        .manager
        .post_process_create_reserved_resource(
            scope,
            device,
            &desc,
            ResourceStates::COMMON,
            HResult::S_OK,
            Some(h.driver.new_handle()),
        )
        .expect("reserved resource tracked");

    let scope = h.manager.begin_call(ApiCallId::Device3OpenExistingHeapFromAddress);
    let heap = h
        .manager
        .post_process_open_existing_heap_from_address(
            scope,
            device,
            0x7f00_0000,
            HResult::S_OK,
            Some(h.driver.new_handle()),
        )
        .expect("heap tracked");

    let snap = snapshot(&h);
    let state = resource_state(&snap, reserved);
    assert!(state.reserved);
    assert_eq!(state.subresource_states, vec![ResourceStates::COMMON.bits()]);
    match &snap.find(heap).expect("heap in snapshot").info {
        ObjectStateInfo::Heap(heap_state) => {
            assert_eq!(heap_state.open_existing_address, Some(0x7f00_0000))
        }
        other => panic!("expected Heap, got {:?}", other),
    }
}

// ── Map / Unmap ─────────────────────────────────────────────

#[test]
fn test_map_unmap_map_tracks_mapped_set() {
    let h = harness_for(MemoryTrackingMode::Unassisted);
    let device = h.create_device();
    let (native, id) = create_committed(
        &h,
        device,
        HeapType::Upload,
        HeapFlags::empty(),
        &ResourceDesc::buffer(64),
    );
    let mut memory = vec![0u8; 64];
    let data = memory.as_mut_ptr();

    unsafe { h.manager.post_process_resource_map(native, 0, HResult::S_OK, data) };
    assert_eq!(snapshot(&h).mapped_resources, vec![id]);

    unsafe { data.add(8).write(0xAB) };
    h.manager.pre_process_resource_unmap(native, 0, None);
    assert!(snapshot(&h).mapped_resources.is_empty());

    unsafe { h.manager.post_process_resource_map(native, 0, HResult::S_OK, data) };
    unsafe { h.manager.post_process_resource_map(native, 0, HResult::S_OK, data) };
    assert_eq!(snapshot(&h).mapped_resources, vec![id]);

    // Nested maps stay mapped until the last unmap.
    h.manager.pre_process_resource_unmap(native, 0, None);
    assert_eq!(snapshot(&h).mapped_resources, vec![id]);
    h.manager.pre_process_resource_unmap(native, 0, None);
    assert!(snapshot(&h).mapped_resources.is_empty());

    let fills = h.sink.fill_memory();
    println!("{} fill-memory records", fills.len());
    assert_eq!(fills.len(), 3);
    assert_eq!(fills[0].resource, id);
    assert_eq!(fills[0].offset, 0);
    assert_eq!(fills[0].data.len(), 64);
    assert_eq!(fills[0].data[8], 0xAB);
    drop(memory);
}

#[test]
fn test_failed_map_is_ignored() {
    let h = harness_for(MemoryTrackingMode::Unassisted);
    let device = h.create_device();
    let (native, _) = create_committed(
        &h,
        device,
        HeapType::Upload,
        HeapFlags::empty(),
        &ResourceDesc::buffer(64),
    );
    let mut memory = vec![0u8; 64];
    unsafe {
        h.manager
            .post_process_resource_map(native, 0, HResult::E_INVALIDARG, memory.as_mut_ptr())
    };
    unsafe {
        h.manager
            .post_process_resource_map(native, 0, HResult::S_OK, std::ptr::null_mut())
    };
    assert!(snapshot(&h).mapped_resources.is_empty());

    // Unmap without a map writes nothing.
    h.manager.pre_process_resource_unmap(native, 0, None);
    assert!(h.sink.fill_memory().is_empty());
}

#[test]
fn test_assisted_mode_captures_written_range() {
    let h = harness_for(MemoryTrackingMode::Assisted);
    let device = h.create_device();
    let (native, id) = create_committed(
        &h,
        device,
        HeapType::Upload,
        HeapFlags::empty(),
        &ResourceDesc::buffer(64),
    );
    let mut memory: Vec<u8> = (0..64).collect();
    let data = memory.as_mut_ptr();

    unsafe { h.manager.post_process_resource_map(native, 0, HResult::S_OK, data) };
    h.manager
        .pre_process_resource_unmap(native, 0, Some(MemoryRange { begin: 16, end: 32 }));

    unsafe { h.manager.post_process_resource_map(native, 0, HResult::S_OK, data) };
    // Clipped to the subresource.
    h.manager
        .pre_process_resource_unmap(native, 0, Some(MemoryRange { begin: 48, end: 128 }));

    unsafe { h.manager.post_process_resource_map(native, 0, HResult::S_OK, data) };
    // An empty range means nothing was written.
    h.manager
        .pre_process_resource_unmap(native, 0, Some(MemoryRange { begin: 0, end: 0 }));

    let fills = h.sink.fill_memory();
    assert_eq!(fills.len(), 2);
    assert_eq!(fills[0].resource, id);
    assert_eq!(fills[0].offset, 16);
    assert_eq!(fills[0].data, (16..32).collect::<Vec<u8>>());
    assert_eq!(fills[1].offset, 48);
    assert_eq!(fills[1].data.len(), 16);
    drop(memory);
}

#[test]
fn test_page_guard_uses_write_watch_ranges() {
    let write_watch = Arc::new(ScriptedWriteWatch::default());
    let h = harness_from(
        config(CaptureModeSetting::WriteAndTrack, MemoryTrackingMode::PageGuard),
        |manager| manager.with_write_watch(write_watch.clone()),
    );
    let device = h.create_device();
    let (native, id) = create_committed(
        &h,
        device,
        HeapType::Upload,
        HeapFlags::empty(),
        &ResourceDesc::buffer(64),
    );
    let mut memory = vec![0x11u8; 64];
    let data = memory.as_mut_ptr();

    *write_watch.ranges.lock() = Some(vec![8..16, 60..80]);
    unsafe { h.manager.post_process_resource_map(native, 0, HResult::S_OK, data) };
    h.manager.pre_process_resource_unmap(native, 0, None);

    let fills = h.sink.fill_memory();
    println!("Dirty ranges captured: {:?}", fills.iter().map(|f| (f.offset, f.data.len())).collect::<Vec<_>>());
    assert_eq!(fills.len(), 2);
    assert_eq!((fills[0].offset, fills[0].data.len()), (8, 8));
    assert_eq!((fills[1].offset, fills[1].data.len()), (60, 4));

    // No dirty information: capture everything.
    h.sink.clear();
    unsafe { h.manager.post_process_resource_map(native, 0, HResult::S_OK, data) };
    h.manager.pre_process_resource_unmap(native, 0, None);
    let fills = h.sink.fill_memory();
    assert_eq!(fills.len(), 1);
    assert_eq!(fills[0].resource, id);
    assert_eq!(fills[0].data.len(), 64);
    assert_eq!(write_watch.queries.load(Ordering::Relaxed), 2);
    drop(memory);
}

#[test]
fn test_submission_flushes_persistent_maps() {
    let h = harness_for(MemoryTrackingMode::Unassisted);
    let device = h.create_device();
    let (native, id) = create_committed(
        &h,
        device,
        HeapType::Upload,
        HeapFlags::empty(),
        &ResourceDesc::buffer(32),
    );
    let queue = h.create(ApiCallId::DeviceCreateCommandQueue, ObjectKind::CommandQueue, Some(device));
    let mut memory = vec![0u8; 32];
    let data = memory.as_mut_ptr();

    unsafe { h.manager.post_process_resource_map(native, 0, HResult::S_OK, data) };
    unsafe { data.write(0x5A) };
    h.manager.pre_process_execute_command_lists(queue, &[]);

    let fills = h.sink.fill_memory();
    assert_eq!(fills.len(), 1);
    assert_eq!(fills[0].resource, id);
    assert_eq!(fills[0].data[0], 0x5A);
    // Still mapped afterwards.
    assert_eq!(snapshot(&h).mapped_resources, vec![id]);
    drop(memory);
}

#[test]
fn test_assisted_mode_does_not_flush_on_submit() {
    let h = harness_for(MemoryTrackingMode::Assisted);
    let device = h.create_device();
    let (native, _) = create_committed(
        &h,
        device,
        HeapType::Upload,
        HeapFlags::empty(),
        &ResourceDesc::buffer(32),
    );
    let queue = h.create(ApiCallId::DeviceCreateCommandQueue, ObjectKind::CommandQueue, Some(device));
    let mut memory = vec![0u8; 32];

    unsafe {
        h.manager
            .post_process_resource_map(native, 0, HResult::S_OK, memory.as_mut_ptr())
    };
    h.manager.pre_process_execute_command_lists(queue, &[]);
    assert!(h.sink.fill_memory().is_empty());
    drop(memory);
}

#[test]
fn test_destroying_mapped_resource_clears_mapped_set() {
    let h = harness_for(MemoryTrackingMode::Unassisted);
    let device = h.create_device();
    let (native, _) = create_committed(
        &h,
        device,
        HeapType::Upload,
        HeapFlags::empty(),
        &ResourceDesc::buffer(64),
    );
    let mut memory = vec![0u8; 64];
    unsafe {
        h.manager
            .post_process_resource_map(native, 0, HResult::S_OK, memory.as_mut_ptr())
    };
    h.manager.process_destroy(native);

    assert!(snapshot(&h).mapped_resources.is_empty());
    // Submitting afterwards must not touch the released memory.
    h.manager.pre_process_execute_command_lists(NativeHandle::NULL, &[]);
    assert!(h.sink.fill_memory().is_empty());
    drop(memory);
}

#[test]
fn test_map_racing_a_snapshot_is_included() {
    let h = harness_for(MemoryTrackingMode::Unassisted);
    let device = h.create_device();
    let (native, id) = create_committed(
        &h,
        device,
        HeapType::Upload,
        HeapFlags::empty(),
        &ResourceDesc::buffer(64),
    );
    let tracker = h.manager.tracker().expect("tracking enabled");
    let mut memory = vec![0u8; 64];
    let data = memory.as_mut_ptr() as usize;
    let (held_tx, held_rx) = crossbeam_channel::bounded(0);

    std::thread::scope(|s| {
        let mapper = s.spawn(|| {
            let _structure = tracker.hold_structure();
            held_tx.send(()).expect("signal");
            // Let the snapshot queue up behind the barrier.
            std::thread::sleep(Duration::from_millis(50));
            unsafe {
                h.manager
                    .post_process_resource_map(native, 0, HResult::S_OK, data as *mut u8)
            };
        });
        held_rx.recv().expect("barrier held");
        h.manager.write_tracked_state().expect("snapshot");
        mapper.join().expect("mapper thread");
    });

    let snapshot = h.sink.snapshots().pop().expect("snapshot written");
    assert_eq!(snapshot.mapped_resources, vec![id]);
    drop(memory);
}

#[test]
fn test_write_only_mode_records_calls_but_not_memory() {
    let h = harness_with(config(CaptureModeSetting::Write, MemoryTrackingMode::Unassisted));
    let device = h.create_device();
    let (native, id) = create_committed(
        &h,
        device,
        HeapType::Upload,
        HeapFlags::empty(),
        &ResourceDesc::buffer(64),
    );
    assert_eq!(id, HandleId::NULL);
    let mut memory = vec![0u8; 64];
    unsafe {
        h.manager
            .post_process_resource_map(native, 0, HResult::S_OK, memory.as_mut_ptr())
    };
    h.manager.pre_process_resource_unmap(native, 0, None);

    assert!(h.sink.fill_memory().is_empty());
    let calls: Vec<ApiCallId> = h.sink.calls().iter().map(|c| c.call_id).collect();
    assert_eq!(
        calls,
        vec![ApiCallId::D3d12CreateDevice, ApiCallId::DeviceCreateCommittedResource]
    );
    drop(memory);
}

// ── Barriers ────────────────────────────────────────────────

#[test]
fn test_barriers_update_subresource_states() {
    let h = harness_for(MemoryTrackingMode::Unassisted);
    let device = h.create_device();
    let desc = ResourceDesc::texture_2d(64, 64, Format::R8G8B8A8_UNORM, 3);
    let (texture, id) = create_committed(&h, device, HeapType::Default, HeapFlags::empty(), &desc);

    let allocator = h.create(
        ApiCallId::DeviceCreateCommandAllocator,
        ObjectKind::CommandAllocator,
        Some(device),
    );
    let scope = h.manager.begin_call(ApiCallId::DeviceCreateCommandList);
    let list = h.driver.new_handle();
    h.manager.post_process_create_command_list(
        scope,
        device,
        CommandListType::Direct,
        Some(allocator),
        HResult::S_OK,
        Some(list),
    );

    let barriers = [
        ResourceBarrier::transition(texture, ResourceStates::GENERIC_READ, ResourceStates::COPY_DEST),
        ResourceBarrier::Transition {
            resource: texture,
            subresource: 1,
            before: ResourceStates::COPY_DEST,
            after: ResourceStates::PIXEL_SHADER_RESOURCE,
            flags: BarrierFlags::empty(),
        },
        // Split barrier: only the end half changes the state.
        ResourceBarrier::Transition {
            resource: texture,
            subresource: 0,
            before: ResourceStates::COPY_DEST,
            after: ResourceStates::RENDER_TARGET,
            flags: BarrierFlags::BEGIN_ONLY,
        },
        ResourceBarrier::Uav { resource: texture },
    ];
    let scope = h.manager.begin_call(ApiCallId::CommandListResourceBarrier);
    h.manager.post_process_resource_barrier(scope, list, &barriers);

    let state = resource_state(&snapshot(&h), id);
    println!("Subresource states: {:?}", state.subresource_states);
    assert_eq!(
        state.subresource_states,
        vec![
            ResourceStates::COPY_DEST.bits(),
            ResourceStates::PIXEL_SHADER_RESOURCE.bits(),
            ResourceStates::COPY_DEST.bits(),
        ]
    );
    assert_eq!(state.initial_state, ResourceStates::GENERIC_READ.bits());

    // Subresource sizes came from the driver, so mip 1 can be captured.
    let tracker = h.manager.tracker().expect("tracking enabled");
    let object = tracker.lookup(texture).expect("texture tracked");
    let sizes = object.with_info(|info| info.as_resource().map(|r| r.subresource_sizes.clone()));
    assert_eq!(sizes, Some(vec![64 * 64 * 4, 32 * 32 * 4, 16 * 16 * 4]));
}

fn create_command_list(h: &Harness, device: NativeHandle) -> NativeHandle {
    let allocator = h.create(
        ApiCallId::DeviceCreateCommandAllocator,
        ObjectKind::CommandAllocator,
        Some(device),
    );
    let scope = h.manager.begin_call(ApiCallId::DeviceCreateCommandList);
    let list = h.driver.new_handle();
    h.manager.post_process_create_command_list(
        scope,
        device,
        CommandListType::Direct,
        Some(allocator),
        HResult::S_OK,
        Some(list),
    );
    list
}

fn transition(resource: NativeHandle, subresource: u32, after: ResourceStates) -> ResourceBarrier {
    ResourceBarrier::Transition {
        resource,
        subresource,
        before: ResourceStates::COMMON,
        after,
        flags: BarrierFlags::empty(),
    }
}

#[test]
fn test_full_mip_chain_has_every_subresource() {
    let h = harness_for(MemoryTrackingMode::Unassisted);
    let device = h.create_device();
    // MipLevels = 0 asks for the whole chain: 64, 32, 16, 8, 4, 2, 1.
    let desc = ResourceDesc::texture_2d(64, 64, Format::R8G8B8A8_UNORM, 0);
    assert_eq!(desc.subresource_count(), 7);
    let (texture, id) = create_committed(&h, device, HeapType::Default, HeapFlags::empty(), &desc);

    let list = create_command_list(&h, device);
    let scope = h.manager.begin_call(ApiCallId::CommandListResourceBarrier);
    h.manager.post_process_resource_barrier(
        scope,
        list,
        &[transition(texture, 3, ResourceStates::PIXEL_SHADER_RESOURCE)],
    );

    let state = resource_state(&snapshot(&h), id);
    println!("Subresource states: {:?}", state.subresource_states);
    assert_eq!(state.subresource_states.len(), 7);
    assert_eq!(state.subresource_states[3], ResourceStates::PIXEL_SHADER_RESOURCE.bits());
    assert_eq!(state.subresource_states[6], ResourceStates::GENERIC_READ.bits());
}

#[test]
fn test_depth_stencil_planes_are_subresources() {
    let h = harness_for(MemoryTrackingMode::Unassisted);
    let device = h.create_device();
    let desc = ResourceDesc::texture_2d(32, 32, Format::D24_UNORM_S8_UINT, 2);
    assert_eq!(desc.subresource_count(), 4);
    assert_eq!(ResourceDesc::texture_2d(32, 32, Format::D32_FLOAT, 2).subresource_count(), 2);
    assert_eq!(ResourceDesc::texture_2d(64, 64, Format::NV12, 1).subresource_count(), 2);
    let (texture, id) = create_committed(&h, device, HeapType::Default, HeapFlags::empty(), &desc);

    // Subresource 3 is mip 1 of the stencil plane.
    let list = create_command_list(&h, device);
    let scope = h.manager.begin_call(ApiCallId::CommandListResourceBarrier);
    h.manager.post_process_resource_barrier(
        scope,
        list,
        &[transition(texture, 3, ResourceStates::DEPTH_READ)],
    );

    let state = resource_state(&snapshot(&h), id);
    assert_eq!(
        state.subresource_states,
        vec![
            ResourceStates::GENERIC_READ.bits(),
            ResourceStates::GENERIC_READ.bits(),
            ResourceStates::GENERIC_READ.bits(),
            ResourceStates::DEPTH_READ.bits(),
        ]
    );
}

// ── Tile mappings ───────────────────────────────────────────

fn create_reserved(h: &Harness, device: NativeHandle) -> (NativeHandle, HandleId) {
    let desc = ResourceDesc::texture_2d(512, 512, Format::R8G8B8A8_UNORM, 1);
    let native = h.driver.new_handle();
    let scope = h.manager.begin_call(ApiCallId::DeviceCreateReservedResource);
    let id = h
        .manager
        .post_process_create_reserved_resource(
            scope,
            device,
            &desc,
            ResourceStates::COMMON,
            HResult::S_OK,
            Some(native),
        )
        .expect("reserved resource tracked");
    (native, id)
}

fn tile_mappings(snapshot: &StateSnapshot, id: HandleId) -> Vec<TileMappingState> {
    resource_state(snapshot, id).tile_mappings
}

#[test]
fn test_tile_mappings_of_reserved_resources() {
    let h = harness_for(MemoryTrackingMode::Unassisted);
    let device = h.create_device();
    let queue = h.create(ApiCallId::DeviceCreateCommandQueue, ObjectKind::CommandQueue, Some(device));
    let heap = h.create(ApiCallId::DeviceCreateHeap, ObjectKind::Heap, Some(device));
    let (source, source_id) = create_reserved(&h, device);
    let (dest, dest_id) = create_reserved(&h, device);

    let region = TileRegionSize {
        num_tiles: 4,
        ..Default::default()
    };
    let start = TiledResourceCoordinate::default();
    h.manager.post_process_update_tile_mappings(
        queue,
        source,
        &[(start, region)],
        heap,
        &[TileRange {
            flags: TileRangeFlags::empty(),
            heap_start_offset: 8,
            tile_count: 4,
        }],
        0,
    );
    h.manager
        .post_process_copy_tile_mappings(queue, dest, &start, source, &start, &region, 0);

    let snap = snapshot(&h);
    let source_ops = tile_mappings(&snap, source_id);
    println!("Source tile mappings: {:?}", source_ops);
    match source_ops.as_slice() {
        [TileMappingState::Update { sequence, queue: q, regions, heap: mapped_heap, ranges, .. }] => {
            assert_eq!(*sequence, 0);
            assert_eq!(*q, h.id_of(queue));
            assert_eq!(regions, &vec![(start, region)]);
            assert_eq!(*mapped_heap, Some(h.id_of(heap)));
            assert_eq!(ranges[0].heap_start_offset, 8);
        }
        other => panic!("expected one update, got {:?}", other),
    }
    match tile_mappings(&snap, dest_id).as_slice() {
        [TileMappingState::Copy { sequence, source, .. }] => {
            assert_eq!(*sequence, 1);
            assert_eq!(*source, source_id);
        }
        other => panic!("expected one copy, got {:?}", other),
    }

    // Unmapping every tile replaces the history.
    h.manager.post_process_update_tile_mappings(
        queue,
        source,
        &[],
        NativeHandle::NULL,
        &[TileRange {
            flags: TileRangeFlags::NULL,
            ..Default::default()
        }],
        0,
    );
    let ops = tile_mappings(&snapshot(&h), source_id);
    assert_eq!(ops.len(), 1);
    assert_eq!(ops[0].sequence(), 2);
}

#[test]
fn test_tile_mappings_ignored_when_not_reproducible() {
    let h = harness_for(MemoryTrackingMode::Unassisted);
    let device = h.create_device();
    let queue = h.create(ApiCallId::DeviceCreateCommandQueue, ObjectKind::CommandQueue, Some(device));
    let (reserved, reserved_id) = create_reserved(&h, device);
    let (committed, committed_id) = create_committed(
        &h,
        device,
        HeapType::Default,
        HeapFlags::empty(),
        &ResourceDesc::buffer(65536),
    );
    let range = [TileRange {
        tile_count: 1,
        ..Default::default()
    }];

    // Heap unknown to the registry.
    h.manager.post_process_update_tile_mappings(
        queue,
        reserved,
        &[],
        NativeHandle(0xdead_0000),
        &range,
        0,
    );
    // Not a reserved resource.
    h.manager.post_process_update_tile_mappings(
        queue,
        committed,
        &[],
        NativeHandle::NULL,
        &range,
        0,
    );

    let snap = snapshot(&h);
    assert!(tile_mappings(&snap, reserved_id).is_empty());
    assert!(tile_mappings(&snap, committed_id).is_empty());
}

// ── Residency ───────────────────────────────────────────────

#[test]
fn test_residency_priority_on_pageable_objects() {
    let h = harness_for(MemoryTrackingMode::Unassisted);
    let device = h.create_device();
    let (resource, id) = create_committed(
        &h,
        device,
        HeapType::Default,
        HeapFlags::empty(),
        &ResourceDesc::buffer(1024),
    );
    let fence = h.create(ApiCallId::DeviceCreateFence, ObjectKind::Fence, Some(device));

    h.manager.post_process_set_residency_priority(
        HResult::S_OK,
        &[resource, fence],
        &[ResidencyPriority::HIGH, ResidencyPriority::LOW],
    );
    assert_eq!(h.manager.residency_priority(resource), Some(ResidencyPriority::HIGH));
    assert_eq!(h.manager.residency_priority(fence), None);

    // Failed calls change nothing.
    h.manager.post_process_set_residency_priority(
        HResult::E_INVALIDARG,
        &[resource],
        &[ResidencyPriority::MINIMUM],
    );
    let state = resource_state(&snapshot(&h), id);
    assert_eq!(state.residency_priority, Some(ResidencyPriority::HIGH.0));

    h.manager.process_destroy(resource);
    assert_eq!(h.manager.residency_priority(resource), None);
}

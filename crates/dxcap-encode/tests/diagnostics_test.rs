//! Integration test: debug layer and device-removed diagnostics
//!
//! Diagnostic settings are values: they must survive the release of the
//! objects that configured them and appear in every snapshot.
//!
//! Run with: cargo test --test diagnostics_test -- --nocapture

mod common;

use std::sync::atomic::Ordering;

use common::{config, harness, harness_with};
use dxcap_core::config::{CaptureModeSetting, MemoryTrackingMode};
use dxcap_protocol::format::DredEnablement;
use dxcap_protocol::{ApiCallId, HandleId, ObjectKind};

#[test]
fn test_debug_layer_id_survives_release() {
    let h = harness();
    let debug = h.create(ApiCallId::D3d12GetDebugInterface, ObjectKind::Debug, None);
    let debug_id = h.id_of(debug);
    assert!(!h.manager.debug_layer_enabled());

    let scope = h.manager.begin_call(ApiCallId::DebugEnableDebugLayer);
    h.manager.post_process_enable_debug_layer(debug);
    h.manager.end_call(scope);

    // Applications release the debug interface right away.
    h.manager.process_destroy(debug);
    let tracker = h.manager.tracker().expect("tracking enabled");
    assert!(tracker.lookup(debug).is_none());

    println!("Debug layer enabled by {}", h.manager.enable_debug_layer_object_id());
    assert_eq!(h.manager.enable_debug_layer_object_id(), debug_id);
    assert!(h.manager.debug_layer_enabled());

    h.manager.write_tracked_state().expect("snapshot");
    let snapshot = h.sink.snapshots().pop().expect("snapshot written");
    assert_eq!(snapshot.diagnostics.debug_layer_object_id, debug_id);
    assert!(snapshot.find(debug_id).is_none());
}

#[test]
fn test_dred_settings_survive_release() {
    let h = harness();
    let dred = h.create(ApiCallId::D3d12GetDebugInterface, ObjectKind::DredSettings, None);
    let dred_id = h.id_of(dred);

    assert_eq!(h.manager.enable_dred_info().auto_breadcrumbs, DredEnablement::SystemControlled);
    h.manager
        .post_process_set_auto_breadcrumbs_enablement(dred, DredEnablement::ForcedOn);
    h.manager
        .post_process_set_breadcrumb_context_enablement(dred, DredEnablement::ForcedOn);
    h.manager
        .post_process_set_page_fault_enablement(dred, DredEnablement::ForcedOff);
    h.manager.process_destroy(dred);

    let info = h.manager.enable_dred_info();
    println!("DRED after release: {:?}", info);
    assert_eq!(info.dred_settings_object_id, dred_id);
    assert_eq!(info.auto_breadcrumbs, DredEnablement::ForcedOn);
    assert_eq!(info.breadcrumb_context, DredEnablement::ForcedOn);
    assert_eq!(info.page_fault, DredEnablement::ForcedOff);

    h.manager.write_tracked_state().expect("snapshot");
    let snapshot = h.sink.snapshots().pop().expect("snapshot written");
    assert_eq!(snapshot.diagnostics.dred, info);
}

#[test]
fn test_untracked_debug_object_records_null_id() {
    let h = harness_with(config(CaptureModeSetting::Write, MemoryTrackingMode::Unassisted));
    let debug = h.driver.new_handle();
    h.manager.post_process_enable_debug_layer(debug);
    assert_eq!(h.manager.enable_debug_layer_object_id(), HandleId::NULL);
    assert!(h.manager.debug_layer_enabled());
}

#[test]
fn test_configured_diagnostics_enabled_once() {
    let mut cfg = config(CaptureModeSetting::WriteAndTrack, MemoryTrackingMode::Unassisted);
    cfg.debug.debug_layer = true;
    cfg.debug.device_removed_diagnostics = true;
    let h = harness_with(cfg);

    for _ in 0..3 {
        h.manager.pre_process_create_device();
        h.create_device();
    }
    assert_eq!(h.driver.debug_layer_calls.load(Ordering::Relaxed), 1);
    assert_eq!(h.driver.dred_calls.load(Ordering::Relaxed), 1);
    assert!(h.manager.debug_layer_enabled());
}

#[test]
fn test_diagnostics_off_by_default() {
    let h = harness();
    h.manager.pre_process_create_device();
    assert_eq!(h.driver.debug_layer_calls.load(Ordering::Relaxed), 0);
    assert_eq!(h.driver.dred_calls.load(Ordering::Relaxed), 0);
}

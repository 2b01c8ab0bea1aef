//! Integration test: capture configuration and handle bookkeeping
//!
//! Run with: cargo test --test config_test -- --nocapture

use dxcap_core::config::{CaptureModeSetting, MemoryTrackingMode};
use dxcap_core::{CaptureConfig, CoreError, HandleAllocator, HandleMap};
use dxcap_protocol::{HandleId, NativeHandle};

#[test]
fn test_defaults() {
    let config = CaptureConfig::default();
    assert_eq!(config.capture.mode, CaptureModeSetting::WriteAndTrack);
    assert!(config.capture.compress);
    assert!(config.capture.trim_frame.is_none());
    assert_eq!(config.memory.tracking_mode, MemoryTrackingMode::PageGuard);
    assert!(config.memory.use_write_watch);
    assert_eq!(config.screenshots.queue_depth, 4);
    assert!(!config.debug.debug_layer);

    // An empty file means defaults everywhere.
    let parsed = CaptureConfig::parse("").expect("empty config");
    assert_eq!(parsed.capture.mode, CaptureModeSetting::WriteAndTrack);
    assert_eq!(parsed.screenshots.queue_depth, 4);
}

#[test]
fn test_parse_full_config() {
    let text = r#"
[capture]
mode = "write"
trace_file = "/tmp/app.dxtrace"
compress = false
trim_frame = 120

[memory]
tracking_mode = "assisted"
use_write_watch = false

[screenshots]
frames = [1, 60]
queue_depth = 2

[debug]
debug_layer = true
device_removed_diagnostics = true
"#;
    let config = CaptureConfig::parse(text).expect("valid config");
    println!("Parsed: {:?}", config);
    assert_eq!(config.capture.mode, CaptureModeSetting::Write);
    assert_eq!(config.capture.trace_file.as_deref(), Some("/tmp/app.dxtrace"));
    assert!(!config.capture.compress);
    assert_eq!(config.capture.trim_frame, Some(120));
    assert_eq!(config.memory.tracking_mode, MemoryTrackingMode::Assisted);
    assert!(!config.memory.use_write_watch);
    assert!(config.screenshot_requested(60));
    assert!(!config.screenshot_requested(2));
    assert_eq!(config.screenshots.queue_depth, 2);
    assert!(config.debug.debug_layer && config.debug.device_removed_diagnostics);
}

#[test]
fn test_invalid_config_rejected() {
    let zero_depth = "[screenshots]\nqueue_depth = 0\n";
    match CaptureConfig::parse(zero_depth) {
        Err(CoreError::ConfigError(msg)) => assert!(msg.contains("queue_depth")),
        other => panic!("expected ConfigError, got {:?}", other),
    }

    let bad_mode = "[capture]\nmode = \"replay\"\n";
    assert!(matches!(CaptureConfig::parse(bad_mode), Err(CoreError::ConfigError(_))));
}

#[test]
fn test_load_or_default() {
    let missing = std::env::temp_dir().join("dxcap-no-such-config.toml");
    let config = CaptureConfig::load_or_default(&missing.to_string_lossy());
    assert_eq!(config.capture.mode, CaptureModeSetting::WriteAndTrack);

    let dir = std::env::temp_dir().join(format!("dxcap-config-{}", std::process::id()));
    std::fs::create_dir_all(&dir).expect("temp dir");
    let path = dir.join("dxcap.toml");

    std::fs::write(&path, "[capture]\nmode = \"write\"\n").expect("write config");
    let config = CaptureConfig::load_or_default(&path.to_string_lossy());
    assert_eq!(config.capture.mode, CaptureModeSetting::Write);

    // Unparseable files fall back to defaults.
    std::fs::write(&path, "[capture\n").expect("write config");
    let config = CaptureConfig::load_or_default(&path.to_string_lossy());
    assert_eq!(config.capture.mode, CaptureModeSetting::WriteAndTrack);

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn test_handle_map_bindings() {
    let map = HandleMap::new();
    let ids = HandleAllocator::new();
    let a = ids.alloc();
    let b = ids.alloc();
    assert_eq!(a, HandleId(1));
    assert!(b > a);

    map.insert(NativeHandle(0x10), a).expect("bind a");
    map.insert(NativeHandle(0x20), b).expect("bind b");
    assert_eq!(map.len(), 2);
    assert_eq!(map.to_id(NativeHandle(0x20)), Some(b));

    match map.insert(NativeHandle(0x10), ids.alloc()) {
        Err(CoreError::DuplicateHandle(existing)) => assert_eq!(existing, a),
        other => panic!("expected DuplicateHandle, got {:?}", other),
    }
    assert_eq!(map.to_id(NativeHandle(0x10)), Some(a));

    assert_eq!(map.remove_by_native(NativeHandle(0x10)), Some(a));
    assert_eq!(map.remove_by_native(NativeHandle(0x10)), None);
    assert_eq!(map.to_id(NativeHandle(0x10)), None);

    // The pointer value can be bound again, to a new id.
    let c = ids.alloc();
    map.insert(NativeHandle(0x10), c).expect("rebind");
    assert_ne!(c, a);
    assert_eq!(map.len(), 2);
    assert!(!map.is_empty());
}

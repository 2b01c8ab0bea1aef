//! Integration test: process-wide capture manager
//!
//! The instance is global, so everything runs in one test function.
//!
//! Run with: cargo test --test instance_test -- --nocapture

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use dxcap_core::config::CaptureConfig;
use dxcap_encode::{CaptureManager, MemoryTraceSink};

fn new_manager(inits: &AtomicU32) -> Result<CaptureManager, String> {
    inits.fetch_add(1, Ordering::SeqCst);
    Ok(CaptureManager::new(
        CaptureConfig::default(),
        Arc::new(MemoryTraceSink::new()),
        None,
    ))
}

#[test]
fn test_instance_lifecycle() {
    let inits = AtomicU32::new(0);
    assert!(CaptureManager::instance().is_none());

    // A failed construction leaves no instance behind.
    let failed = CaptureManager::create_instance(|| Err::<CaptureManager, _>("no sink".to_string()));
    assert_eq!(failed.err().as_deref(), Some("no sink"));
    assert!(CaptureManager::instance().is_none());

    let first = CaptureManager::create_instance(|| new_manager(&inits)).expect("first acquisition");
    let second = CaptureManager::create_instance(|| new_manager(&inits)).expect("second acquisition");
    println!("Constructed {} time(s)", inits.load(Ordering::SeqCst));
    assert_eq!(inits.load(Ordering::SeqCst), 1);
    assert!(Arc::ptr_eq(&first, &second));

    let current = CaptureManager::instance().expect("instance alive");
    assert!(Arc::ptr_eq(&first, &current));

    // One release per acquisition.
    CaptureManager::destroy_instance();
    assert!(CaptureManager::instance().is_some());
    CaptureManager::destroy_instance();
    assert!(CaptureManager::instance().is_none());

    // Extra releases are ignored.
    CaptureManager::destroy_instance();

    // A later acquisition builds a fresh manager.
    let third = CaptureManager::create_instance(|| new_manager(&inits)).expect("re-acquisition");
    assert_eq!(inits.load(Ordering::SeqCst), 2);
    assert!(!Arc::ptr_eq(&first, &third));
    CaptureManager::destroy_instance();
    assert!(CaptureManager::instance().is_none());
}

//! Debug layer and device-removed extended data (DRED).
//!
//! These settings are process-global in the native runtime and are usually
//! configured through short-lived objects: the application enables the
//! debug layer and releases the debug interface right away. The settings
//! are therefore kept as plain values that outlive the objects, and end up
//! in every state snapshot.

use std::sync::atomic::Ordering;

use tracing::{info, warn};

use dxcap_protocol::format::DredEnablement;
use dxcap_protocol::records::DredInfo;
use dxcap_protocol::{HandleId, NativeHandle};

use crate::capture_manager::CaptureManager;

impl CaptureManager {
    /// D3D12CreateDevice, before the native call: apply the configured
    /// diagnostics, which only take effect before a device exists.
    pub fn pre_process_create_device(&self) {
        let debug = &self.config().debug;
        let Ok(table) = self.dispatch().device() else {
            return;
        };
        if debug.debug_layer && !self.debug_layer_enabled.swap(true, Ordering::AcqRel) {
            let result = table.enable_debug_layer();
            if result.failed() {
                warn!("enabling the debug layer failed: {}", result);
            } else {
                info!("debug layer enabled");
            }
        }
        if debug.device_removed_diagnostics && !self.dred_enabled.swap(true, Ordering::AcqRel) {
            let result = table.enable_device_removed_diagnostics();
            if result.failed() {
                warn!("enabling device-removed diagnostics failed: {}", result);
            } else {
                info!("device-removed diagnostics enabled");
            }
        }
    }

    /// ID3D12Debug::EnableDebugLayer / ID3D12Debug1::EnableDebugLayer.
    pub fn post_process_enable_debug_layer(&self, debug: NativeHandle) {
        let id = self.lookup_id(debug).unwrap_or(HandleId::NULL);
        self.diagnostics.lock().debug_layer_object_id = id;
        self.debug_layer_enabled.store(true, Ordering::Release);
    }

    pub fn post_process_set_auto_breadcrumbs_enablement(
        &self,
        dred_settings: NativeHandle,
        enablement: DredEnablement,
    ) {
        self.update_dred(dred_settings, |dred| dred.auto_breadcrumbs = enablement);
    }

    pub fn post_process_set_breadcrumb_context_enablement(
        &self,
        dred_settings: NativeHandle,
        enablement: DredEnablement,
    ) {
        self.update_dred(dred_settings, |dred| dred.breadcrumb_context = enablement);
    }

    pub fn post_process_set_page_fault_enablement(
        &self,
        dred_settings: NativeHandle,
        enablement: DredEnablement,
    ) {
        self.update_dred(dred_settings, |dred| dred.page_fault = enablement);
    }

    fn update_dred(&self, dred_settings: NativeHandle, update: impl FnOnce(&mut DredInfo)) {
        let id = self.lookup_id(dred_settings).unwrap_or(HandleId::NULL);
        let mut diagnostics = self.diagnostics.lock();
        diagnostics.dred.dred_settings_object_id = id;
        update(&mut diagnostics.dred);
    }

    /// Id of the debug object that last enabled the debug layer. Stays valid
    /// after that object is destroyed.
    pub fn enable_debug_layer_object_id(&self) -> HandleId {
        self.diagnostics.lock().debug_layer_object_id
    }

    pub fn enable_dred_info(&self) -> DredInfo {
        self.diagnostics.lock().dred
    }

    pub fn debug_layer_enabled(&self) -> bool {
        self.debug_layer_enabled.load(Ordering::Acquire)
    }
}

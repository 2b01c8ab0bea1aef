//! Capture manager: owns the registry, the trace sink and the dispatch
//! tables, and implements the hook contract the entry-point stubs call.
//!
//! Every stub follows the same sequence:
//!
//! ```text
//! let scope = manager.begin_call(ApiCallId::...);
//! scope.encode(|p| ...);                      // application parameters
//! manager.pre_process_...(...);               // when the entry point has one
//! let result = native(...);
//! manager.post_process_...(...);              // or end_call / end_create_call
//! ```
//!
//! Hook bodies live in the per-area modules (`resource`, `swapchain`,
//! `descriptor`, `sync`, `command`, `diagnostics`); this file holds the
//! shared machinery.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use dxcap_core::config::{CaptureConfig, CaptureModeSetting};
use dxcap_protocol::format::{Guid, HResult};
use dxcap_protocol::records::{CallRecord, DiagnosticState, FillMemoryRecord};
use dxcap_protocol::{ApiCallId, HandleId, NativeHandle, ObjectKind};

use crate::call_scope::{self, CallScope};
use crate::command_handles::HandleExtractorTable;
use crate::dispatch::{DeviceDispatch, DispatchTables, NoWriteWatch, PresentDispatch, WriteWatch};
use crate::error::CaptureError;
use crate::object_info::ObjectInfo;
use crate::renderer::FrameRenderer;
use crate::sink::TraceSink;
use crate::state_tracker::{
    LiveObject, NewEntry, SnapshotContext, StateTracker, StateTracking,
};

bitflags::bitflags! {
    /// What the manager does with intercepted calls.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CaptureMode: u32 {
        /// Emit call and fill-memory records. Always set.
        const WRITE = 0x1;
        /// Maintain the object registry.
        const TRACK = 0x2;
    }
}

impl From<CaptureModeSetting> for CaptureMode {
    fn from(setting: CaptureModeSetting) -> Self {
        match setting {
            CaptureModeSetting::Write => CaptureMode::WRITE,
            CaptureModeSetting::WriteAndTrack => CaptureMode::WRITE | CaptureMode::TRACK,
        }
    }
}

struct InstanceSlot {
    manager: Arc<CaptureManager>,
    refs: usize,
}

static INSTANCE: OnceLock<Mutex<Option<InstanceSlot>>> = OnceLock::new();

fn instance_slot() -> &'static Mutex<Option<InstanceSlot>> {
    INSTANCE.get_or_init(|| Mutex::new(None))
}

pub struct CaptureManager {
    config: CaptureConfig,
    mode: CaptureMode,
    dispatch: DispatchTables,
    sink: Arc<dyn TraceSink>,
    renderer: Option<Arc<dyn FrameRenderer>>,
    pub(crate) write_watch: Arc<dyn WriteWatch>,
    tracker: Option<Arc<dyn StateTracking>>,
    extractors: HandleExtractorTable,
    /// Resources with at least one mapped subresource.
    pub(crate) mapped_resources: Mutex<BTreeSet<HandleId>>,
    pub(crate) residency_priorities: DashMap<HandleId, u32>,
    pub(crate) diagnostics: Mutex<DiagnosticState>,
    pub(crate) debug_layer_enabled: AtomicBool,
    pub(crate) dred_enabled: AtomicBool,
    /// Frames presented by the application.
    pub(crate) frame: AtomicU32,
    /// Orders tile mapping changes across resources.
    pub(crate) tile_sequence: AtomicU64,
}

impl CaptureManager {
    pub fn new(
        config: CaptureConfig,
        sink: Arc<dyn TraceSink>,
        renderer: Option<Arc<dyn FrameRenderer>>,
    ) -> Self {
        let mode = CaptureMode::from(config.capture.mode);
        let tracker: Option<Arc<dyn StateTracking>> = if mode.contains(CaptureMode::TRACK) {
            Some(Arc::new(StateTracker::new()))
        } else {
            None
        };
        if config.capture.trim_frame.is_some() && tracker.is_none() {
            warn!("trim_frame is set but state tracking is disabled; no snapshot will be written");
        }
        info!("capture manager created (mode={:?})", mode);

        Self {
            config,
            mode,
            dispatch: DispatchTables::new(),
            sink,
            renderer,
            write_watch: Arc::new(NoWriteWatch),
            tracker,
            extractors: HandleExtractorTable::with_defaults(),
            mapped_resources: Mutex::new(BTreeSet::new()),
            residency_priorities: DashMap::new(),
            diagnostics: Mutex::new(DiagnosticState::default()),
            debug_layer_enabled: AtomicBool::new(false),
            dred_enabled: AtomicBool::new(false),
            frame: AtomicU32::new(0),
            tile_sequence: AtomicU64::new(0),
        }
    }

    pub fn with_write_watch(mut self, write_watch: Arc<dyn WriteWatch>) -> Self {
        self.write_watch = write_watch;
        self
    }

    /// Replace the registry implementation. Ignored when tracking is off.
    pub fn with_state_tracker(mut self, tracker: Arc<dyn StateTracking>) -> Self {
        if self.tracker.is_some() {
            self.tracker = Some(tracker);
        }
        self
    }

    pub fn with_extractors(mut self, extractors: HandleExtractorTable) -> Self {
        self.extractors = extractors;
        self
    }

    // ── Process-wide instance ───────────────────────────────

    /// Acquire the process-wide manager, constructing it with `init` on the
    /// first acquisition.
    pub fn create_instance<E>(
        init: impl FnOnce() -> Result<CaptureManager, E>,
    ) -> Result<Arc<CaptureManager>, E> {
        let mut slot = instance_slot().lock();
        if let Some(existing) = slot.as_mut() {
            existing.refs += 1;
            debug!("capture manager acquired (refs={})", existing.refs);
            return Ok(Arc::clone(&existing.manager));
        }
        let manager = Arc::new(init()?);
        *slot = Some(InstanceSlot {
            manager: Arc::clone(&manager),
            refs: 1,
        });
        Ok(manager)
    }

    /// Release one acquisition; the last release drops the instance.
    pub fn destroy_instance() {
        let mut slot = instance_slot().lock();
        let Some(existing) = slot.as_mut() else {
            debug!("capture manager release with no live instance");
            return;
        };
        if existing.refs > 1 {
            existing.refs -= 1;
            debug!("capture manager released (refs={})", existing.refs);
            return;
        }
        if let Some(last) = slot.take() {
            if let Err(e) = last.manager.sink.flush() {
                warn!("failed to flush trace on shutdown: {}", e);
            }
            info!("capture manager destroyed");
        }
    }

    pub fn instance() -> Option<Arc<CaptureManager>> {
        instance_slot()
            .lock()
            .as_ref()
            .map(|slot| Arc::clone(&slot.manager))
    }

    // ── Dispatch ────────────────────────────────────────────

    pub fn init_device_dispatch(&self, table: Arc<dyn DeviceDispatch>) -> Result<(), CaptureError> {
        self.dispatch.init_device(table)
    }

    pub fn init_present_dispatch(
        &self,
        table: Arc<dyn PresentDispatch>,
    ) -> Result<(), CaptureError> {
        self.dispatch.init_present(table)
    }

    pub fn dispatch(&self) -> &DispatchTables {
        &self.dispatch
    }

    // ── Accessors ───────────────────────────────────────────

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    pub fn mode(&self) -> CaptureMode {
        self.mode
    }

    pub fn is_tracking(&self) -> bool {
        self.mode().contains(CaptureMode::TRACK) && self.tracker.is_some()
    }

    pub fn tracker(&self) -> Option<&dyn StateTracking> {
        self.tracker.as_deref()
    }

    pub(crate) fn renderer(&self) -> Option<&dyn FrameRenderer> {
        self.renderer.as_deref()
    }

    pub(crate) fn extractors(&self) -> &HandleExtractorTable {
        &self.extractors
    }

    /// Number of frames the application has presented.
    pub fn frame(&self) -> u32 {
        self.frame.load(Ordering::Acquire)
    }

    pub(crate) fn lookup(&self, native: NativeHandle) -> Option<Arc<LiveObject>> {
        if native.is_null() {
            return None;
        }
        self.tracker()?.lookup(native)
    }

    pub(crate) fn lookup_id(&self, native: NativeHandle) -> Option<HandleId> {
        self.lookup(native).map(|o| o.id)
    }

    // ── Call lifecycle ──────────────────────────────────────

    pub fn begin_call(&self, call_id: ApiCallId) -> CallScope {
        CallScope::enter(call_id)
    }

    /// Finish a call that creates nothing.
    pub fn end_call(&self, scope: CallScope) {
        self.write_call_record(&scope);
    }

    /// Finish a creation call. The new object is registered when tracking is
    /// enabled, the call succeeded and the returned handle is non-null; the
    /// call record is written either way.
    pub fn end_create_call(
        &self,
        scope: CallScope,
        result: HResult,
        kind: ObjectKind,
        handle: Option<NativeHandle>,
        parent: Option<NativeHandle>,
        info: ObjectInfo,
    ) -> Option<Arc<LiveObject>> {
        let parent = parent.and_then(|p| self.lookup_id(p));
        let object = self.register_created(&scope, result, kind, handle, parent, info);
        self.write_call_record(&scope);
        object
    }

    pub(crate) fn register_created(
        &self,
        scope: &CallScope,
        result: HResult,
        kind: ObjectKind,
        handle: Option<NativeHandle>,
        parent: Option<HandleId>,
        info: ObjectInfo,
    ) -> Option<Arc<LiveObject>> {
        if !self.is_tracking() || result.failed() {
            return None;
        }
        let native = handle.filter(|h| !h.is_null())?;
        let tracker = self.tracker()?;
        let entry = NewEntry::new(kind, native, scope.call_id())
            .parameters(scope.parameters())
            .parent(parent)
            .info(info);
        match tracker.add_entry(entry) {
            Ok(object) => Some(object),
            Err(e) => {
                warn!("{:?} from {:?} not tracked: {}", kind, scope.call_id(), e);
                None
            }
        }
    }

    /// The native object behind `handle` was destroyed.
    pub fn process_destroy(&self, handle: NativeHandle) {
        let Some(tracker) = self.tracker() else {
            return;
        };
        // Objects owned by this one go in the same structural step.
        let _structure = tracker.hold_structure();
        // The final release is recorded first so it pairs with the removal.
        if let Some(object) = tracker.lookup(handle) {
            tracker.track_release(object.id);
        }
        let Some(object) = tracker.remove_entry(handle) else {
            return;
        };
        self.forget_object(&object);
    }

    /// The application released a reference to `handle`, which may still be
    /// alive.
    pub fn track_release(&self, handle: NativeHandle) {
        if let Some(object) = self.lookup(handle) {
            if let Some(tracker) = self.tracker() {
                tracker.track_release(object.id);
            }
        }
    }

    /// SetPrivateData on any tracked object. `data` of `None` (a null
    /// pointer) detaches the value stored under `guid`.
    pub fn post_process_set_private_data(
        &self,
        object: NativeHandle,
        result: HResult,
        guid: Guid,
        data: Option<&[u8]>,
    ) {
        if result.failed() {
            return;
        }
        if let Some(object) = self.lookup(object) {
            object.set_private_data(guid, data);
        }
    }

    /// Drop manager-side bookkeeping of a removed object. Diagnostic values
    /// are deliberately left in place.
    fn forget_object(&self, object: &LiveObject) {
        match object.kind {
            ObjectKind::Resource => {
                self.mapped_resources.lock().remove(&object.id);
            }
            ObjectKind::SwapChain => {
                let buffers = object
                    .with_info(|info| {
                        info.as_swap_chain_mut()
                            .map(|sc| std::mem::take(&mut sc.buffers))
                    })
                    .unwrap_or_default();
                self.release_swap_chain_buffers(buffers.into_iter().flatten());
            }
            _ => {}
        }
        self.residency_priorities.remove(&object.id);
    }

    // ── Output ──────────────────────────────────────────────

    pub(crate) fn write_call_record(&self, scope: &CallScope) {
        let parameters = scope.take_parameters();
        let record = CallRecord {
            call_id: scope.call_id(),
            thread_id: scope.thread_id(),
            parameters,
        };
        if let Err(e) = self.sink.write_call(record) {
            warn!("failed to write {:?} record: {}", scope.call_id(), e);
        }
    }

    pub(crate) fn write_fill_memory(
        &self,
        resource: HandleId,
        subresource: u32,
        offset: u64,
        data: Vec<u8>,
    ) {
        let record = FillMemoryRecord {
            thread_id: call_scope::current_thread_id(),
            resource,
            subresource,
            offset,
            data,
        };
        if let Err(e) = self.sink.write_fill_memory(record) {
            warn!("failed to write memory content of {}: {}", resource, e);
        }
    }

    // ── Snapshots ───────────────────────────────────────────

    /// Manager-side snapshot facts. Called by the tracker with the structure
    /// barrier held exclusive, so no map, unmap or residency change is in
    /// flight.
    fn snapshot_context(&self) -> SnapshotContext {
        SnapshotContext {
            thread_id: call_scope::current_thread_id(),
            frame: self.frame(),
            mapped_resources: self.mapped_resources.lock().iter().copied().collect(),
            residency_priorities: self
                .residency_priorities
                .iter()
                .map(|e| (*e.key(), *e.value()))
                .collect(),
            diagnostics: *self.diagnostics.lock(),
        }
    }

    /// Write a snapshot of every live object to the trace. Returns the number
    /// of objects written.
    pub fn write_tracked_state(&self) -> Result<usize, CaptureError> {
        let tracker = self.tracker().ok_or(CaptureError::TrackingDisabled)?;
        let frame = self.frame();
        let count =
            tracker.write_tracked_state(self.sink.as_ref(), &|| self.snapshot_context())?;
        info!("wrote state snapshot at frame {} ({} objects)", frame, count);
        Ok(count)
    }

    pub fn flush(&self) -> Result<(), CaptureError> {
        self.sink.flush()?;
        Ok(())
    }
}

impl Drop for CaptureManager {
    fn drop(&mut self) {
        if let Err(e) = self.sink.flush() {
            warn!("failed to flush trace: {}", e);
        }
    }
}

//! Live-object registry.
//!
//! Every object the application can see while tracking is enabled has one
//! [`LiveObject`] here, keyed both by its capture id and by its native
//! handle. Structural changes (add, remove) take the structure barrier
//! shared; writing a state snapshot takes it exclusive, so a snapshot never
//! sees half of a multi-object registration. Lookups do not take the barrier.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard, RwLock, RwLockReadGuard};
use tracing::{debug, error, warn};

use dxcap_core::{CoreError, HandleAllocator, HandleMap};
use dxcap_protocol::format::{CommandListType, CpuDescriptorHandle, Guid};
use dxcap_protocol::records::{DiagnosticState, ObjectState, PrivateDataState, StateSnapshot};
use dxcap_protocol::{ApiCallId, HandleId, NativeHandle, ObjectKind, ThreadId};

use crate::error::CaptureError;
use crate::object_info::{ObjectInfo, TrackedCommand};
use crate::sink::{SinkError, TraceSink};

/// Registry record of one live object.
#[derive(Debug)]
pub struct LiveObject {
    pub id: HandleId,
    pub kind: ObjectKind,
    pub native: NativeHandle,
    pub create_call: ApiCallId,
    pub create_parameters: Vec<u8>,
    pub parent: Option<HandleId>,
    info: Mutex<ObjectInfo>,
    private_data: Mutex<BTreeMap<Guid, Vec<u8>>>,
}

impl LiveObject {
    pub fn info(&self) -> MutexGuard<'_, ObjectInfo> {
        self.info.lock()
    }

    pub fn with_info<R>(&self, f: impl FnOnce(&mut ObjectInfo) -> R) -> R {
        f(&mut self.info.lock())
    }

    /// Attach `data` under `guid`, or detach it when `data` is `None`.
    pub fn set_private_data(&self, guid: Guid, data: Option<&[u8]>) {
        let mut private_data = self.private_data.lock();
        match data {
            Some(bytes) => {
                private_data.insert(guid, bytes.to_vec());
            }
            None => {
                private_data.remove(&guid);
            }
        }
    }

    pub fn private_data(&self, guid: Guid) -> Option<Vec<u8>> {
        self.private_data.lock().get(&guid).cloned()
    }

    fn to_state(&self, residency: Option<u32>) -> ObjectState {
        ObjectState {
            id: self.id,
            kind: self.kind,
            parent: self.parent,
            create_call: self.create_call,
            create_parameters: self.create_parameters.clone(),
            private_data: self
                .private_data
                .lock()
                .iter()
                .map(|(guid, data)| PrivateDataState {
                    guid: guid.0,
                    data: data.clone(),
                })
                .collect(),
            info: self.info.lock().to_state(residency),
        }
    }
}

/// Everything needed to register an object.
#[derive(Debug, Clone)]
pub struct NewEntry {
    pub kind: ObjectKind,
    pub native: NativeHandle,
    pub create_call: ApiCallId,
    pub create_parameters: Vec<u8>,
    pub parent: Option<HandleId>,
    pub info: ObjectInfo,
}

impl NewEntry {
    pub fn new(kind: ObjectKind, native: NativeHandle, create_call: ApiCallId) -> Self {
        Self {
            kind,
            native,
            create_call,
            create_parameters: Vec::new(),
            parent: None,
            info: ObjectInfo::Plain,
        }
    }

    pub fn parameters(mut self, parameters: Vec<u8>) -> Self {
        self.create_parameters = parameters;
        self
    }

    pub fn parent(mut self, parent: Option<HandleId>) -> Self {
        self.parent = parent;
        self
    }

    pub fn info(mut self, info: ObjectInfo) -> Self {
        self.info = info;
        self
    }
}

/// Shared hold on the structure barrier. While any guard is alive no state
/// snapshot can start, so several registrations made under one guard appear
/// in snapshots all together or not at all.
pub struct StructuralGuard<'a> {
    _guard: RwLockReadGuard<'a, ()>,
}

impl<'a> StructuralGuard<'a> {
    pub fn new(guard: RwLockReadGuard<'a, ()>) -> Self {
        Self { _guard: guard }
    }
}

/// Manager-owned facts that go into a snapshot alongside the registry.
#[derive(Debug, Clone, Default)]
pub struct SnapshotContext {
    pub thread_id: ThreadId,
    pub frame: u32,
    pub mapped_resources: Vec<HandleId>,
    pub residency_priorities: HashMap<HandleId, u32>,
    pub diagnostics: DiagnosticState,
}

/// Consistency report of removal and release bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryAudit {
    pub live: usize,
    pub removed: u64,
    pub released: u64,
    /// Removed from the registry with no release recorded.
    pub removed_without_release: Vec<HandleId>,
    /// Release recorded but the object is still registered.
    pub released_while_live: Vec<HandleId>,
}

impl RegistryAudit {
    pub fn is_consistent(&self) -> bool {
        self.removed_without_release.is_empty()
    }
}

/// Registry operations the capture manager depends on.
pub trait StateTracking: Send + Sync {
    /// Register a new object and return its entry. Fails on a null or
    /// already-registered native handle.
    fn add_entry(&self, entry: NewEntry) -> Result<Arc<LiveObject>, CaptureError>;

    /// Remove the object bound to `native`, returning its entry.
    fn remove_entry(&self, native: NativeHandle) -> Option<Arc<LiveObject>>;

    /// Record that the application released its reference to `id`.
    fn track_release(&self, id: HandleId);

    /// Append a recorded command to a command list's state.
    fn track_command(&self, list: NativeHandle, command: TrackedCommand) -> bool;

    fn lookup(&self, native: NativeHandle) -> Option<Arc<LiveObject>>;

    fn lookup_id(&self, id: HandleId) -> Option<Arc<LiveObject>>;

    /// Descriptor heap containing `handle`, and the slot index within it.
    fn find_descriptor(&self, handle: CpuDescriptorHandle) -> Option<(Arc<LiveObject>, u32)>;

    fn hold_structure(&self) -> StructuralGuard<'_>;

    /// Snapshot the registry. `context` runs with the exclusive barrier held.
    fn snapshot(&self, context: &dyn Fn() -> SnapshotContext) -> StateSnapshot;

    /// Snapshot the registry and write it to `sink` under the exclusive
    /// barrier. Returns the number of objects written.
    fn write_tracked_state(
        &self,
        sink: &dyn TraceSink,
        context: &dyn Fn() -> SnapshotContext,
    ) -> Result<usize, SinkError>;

    /// Live queues of the direct kind, in creation order.
    fn direct_queues(&self) -> Vec<HandleId>;

    fn count_of_kind(&self, kind: ObjectKind) -> usize;

    fn live_count(&self) -> usize;

    fn audit(&self) -> RegistryAudit;
}

#[derive(Debug, Clone, Copy)]
struct DescriptorRange {
    id: HandleId,
    end: u64,
    increment: u32,
}

#[derive(Debug, Default)]
struct Lifecycle {
    releases: u32,
    removed: bool,
}

pub struct StateTracker {
    allocator: HandleAllocator,
    handles: HandleMap,
    objects: DashMap<HandleId, Arc<LiveObject>>,
    structure: RwLock<()>,
    /// CPU start address -> heap
    descriptor_ranges: RwLock<BTreeMap<u64, DescriptorRange>>,
    direct_queues: Mutex<BTreeSet<HandleId>>,
    lifecycle: DashMap<HandleId, Lifecycle>,
    removed_total: AtomicU64,
    released_total: AtomicU64,
}

impl StateTracker {
    pub fn new() -> Self {
        Self {
            allocator: HandleAllocator::new(),
            handles: HandleMap::new(),
            objects: DashMap::new(),
            structure: RwLock::new(()),
            descriptor_ranges: RwLock::new(BTreeMap::new()),
            direct_queues: Mutex::new(BTreeSet::new()),
            lifecycle: DashMap::new(),
            removed_total: AtomicU64::new(0),
            released_total: AtomicU64::new(0),
        }
    }

    fn index_object(&self, object: &LiveObject) {
        let info = object.info();
        if let Some(heap) = info.as_descriptor_heap() {
            self.descriptor_ranges.write().insert(
                heap.cpu_start.0,
                DescriptorRange {
                    id: object.id,
                    end: heap.cpu_end(),
                    increment: heap.increment,
                },
            );
        }
        if let Some(queue) = info.as_command_queue() {
            if queue.queue_type == CommandListType::Direct {
                self.direct_queues.lock().insert(object.id);
            }
        }
    }

    fn unindex_object(&self, object: &LiveObject) {
        match object.kind {
            ObjectKind::DescriptorHeap => {
                self.descriptor_ranges
                    .write()
                    .retain(|_, range| range.id != object.id);
            }
            ObjectKind::CommandQueue => {
                self.direct_queues.lock().remove(&object.id);
            }
            _ => {}
        }
    }

    fn collect_snapshot(&self, context: SnapshotContext) -> StateSnapshot {
        let mut objects: Vec<Arc<LiveObject>> =
            self.objects.iter().map(|e| Arc::clone(e.value())).collect();
        objects.sort_by_key(|o| o.id);

        let states = objects
            .iter()
            .map(|o| o.to_state(context.residency_priorities.get(&o.id).copied()))
            .collect();

        let mut mapped_resources: Vec<HandleId> = context
            .mapped_resources
            .into_iter()
            .filter(|id| self.objects.contains_key(id))
            .collect();
        mapped_resources.sort();

        StateSnapshot {
            thread_id: context.thread_id,
            frame: context.frame,
            objects: states,
            direct_queues: self.direct_queues(),
            mapped_resources,
            diagnostics: context.diagnostics,
        }
    }
}

impl Default for StateTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl StateTracking for StateTracker {
    fn add_entry(&self, entry: NewEntry) -> Result<Arc<LiveObject>, CaptureError> {
        if entry.native.is_null() {
            return Err(CaptureError::NullHandle(entry.native.0));
        }

        let _structure = self.structure.read_recursive();
        let id = self.allocator.alloc();

        // Claiming the native handle is the atomic step; a racing duplicate
        // loses here before anything else is published.
        if let Err(e) = self.handles.insert(entry.native, id) {
            let existing = match e {
                CoreError::DuplicateHandle(existing) => existing,
                _ => HandleId::NULL,
            };
            error!(
                "{:?} {:#x} is already registered as {}",
                entry.kind, entry.native.0, existing
            );
            debug_assert!(false, "native handle {:#x} already registered", entry.native.0);
            return Err(CaptureError::DuplicateRegistration {
                native: entry.native.0,
                existing,
            });
        }

        let object = Arc::new(LiveObject {
            id,
            kind: entry.kind,
            native: entry.native,
            create_call: entry.create_call,
            create_parameters: entry.create_parameters,
            parent: entry.parent,
            info: Mutex::new(entry.info),
            private_data: Mutex::new(BTreeMap::new()),
        });
        self.index_object(&object);
        self.objects.insert(id, Arc::clone(&object));

        debug!("registered {:?} {} (native={:#x})", object.kind, id, object.native.0);
        Ok(object)
    }

    fn remove_entry(&self, native: NativeHandle) -> Option<Arc<LiveObject>> {
        let _structure = self.structure.read_recursive();

        let Some(id) = self.handles.remove_by_native(native) else {
            warn!("removal of unregistered native handle {:#x}", native.0);
            debug_assert!(false, "native handle {:#x} is not registered", native.0);
            return None;
        };
        let (_, object) = self.objects.remove(&id)?;
        self.unindex_object(&object);
        self.removed_total.fetch_add(1, Ordering::Relaxed);

        let mut record = self.lifecycle.entry(id).or_default();
        record.removed = true;
        let complete = record.releases > 0;
        drop(record);
        if complete {
            self.lifecycle.remove(&id);
        }

        debug!("removed {:?} {} (native={:#x})", object.kind, id, native.0);
        Some(object)
    }

    fn track_release(&self, id: HandleId) {
        self.released_total.fetch_add(1, Ordering::Relaxed);
        let mut record = self.lifecycle.entry(id).or_default();
        record.releases += 1;
        let complete = record.removed;
        drop(record);
        if complete {
            self.lifecycle.remove(&id);
        }
    }

    fn track_command(&self, list: NativeHandle, command: TrackedCommand) -> bool {
        let Some(object) = self.lookup(list) else {
            return false;
        };
        object.with_info(|info| match info.as_command_list_mut() {
            Some(list_info) => {
                list_info.commands.push(command);
                true
            }
            None => false,
        })
    }

    fn lookup(&self, native: NativeHandle) -> Option<Arc<LiveObject>> {
        let id = self.handles.to_id(native)?;
        self.lookup_id(id)
    }

    fn lookup_id(&self, id: HandleId) -> Option<Arc<LiveObject>> {
        self.objects.get(&id).map(|o| Arc::clone(o.value()))
    }

    fn find_descriptor(&self, handle: CpuDescriptorHandle) -> Option<(Arc<LiveObject>, u32)> {
        let (start, range) = {
            let ranges = self.descriptor_ranges.read();
            let (start, range) = ranges.range(..=handle.0).next_back()?;
            (*start, *range)
        };
        if handle.0 >= range.end || range.increment == 0 {
            return None;
        }
        let offset = handle.0 - start;
        if offset % u64::from(range.increment) != 0 {
            return None;
        }
        let index = u32::try_from(offset / u64::from(range.increment)).ok()?;
        Some((self.lookup_id(range.id)?, index))
    }

    fn hold_structure(&self) -> StructuralGuard<'_> {
        StructuralGuard::new(self.structure.read_recursive())
    }

    fn snapshot(&self, context: &dyn Fn() -> SnapshotContext) -> StateSnapshot {
        let _barrier = self.structure.write();
        self.collect_snapshot(context())
    }

    fn write_tracked_state(
        &self,
        sink: &dyn TraceSink,
        context: &dyn Fn() -> SnapshotContext,
    ) -> Result<usize, SinkError> {
        // Held through the write so no creation record can precede the
        // snapshot that omits its object.
        let _barrier = self.structure.write();
        let snapshot = self.collect_snapshot(context());
        let count = snapshot.objects.len();
        sink.write_state(snapshot)?;
        Ok(count)
    }

    fn direct_queues(&self) -> Vec<HandleId> {
        self.direct_queues.lock().iter().copied().collect()
    }

    fn count_of_kind(&self, kind: ObjectKind) -> usize {
        self.objects.iter().filter(|o| o.kind == kind).count()
    }

    fn live_count(&self) -> usize {
        self.objects.len()
    }

    fn audit(&self) -> RegistryAudit {
        let mut audit = RegistryAudit {
            live: self.objects.len(),
            removed: self.removed_total.load(Ordering::Relaxed),
            released: self.released_total.load(Ordering::Relaxed),
            ..RegistryAudit::default()
        };
        for record in self.lifecycle.iter() {
            if record.removed && record.releases == 0 {
                audit.removed_without_release.push(*record.key());
            } else if !record.removed && record.releases > 0 {
                audit.released_while_live.push(*record.key());
            }
        }
        audit.removed_without_release.sort();
        audit.released_while_live.sort();
        audit
    }
}

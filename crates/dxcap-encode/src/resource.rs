//! Resource and heap lifecycle: creation, write watch, CPU mapping,
//! barrier state and residency.

use std::ops::Range;
use std::sync::Arc;

use tracing::{debug, warn};

use dxcap_core::config::MemoryTrackingMode;
use dxcap_protocol::format::{
    BarrierFlags, CpuPageProperty, HResult, HeapDesc, HeapFlags, HeapProperties, HeapType,
    MemoryPool, MemoryRange, ResidencyPriority, ResourceBarrier, ResourceDesc, ResourceDimension,
    ResourceStates,
};
use dxcap_protocol::{HandleId, NativeHandle, ObjectKind};

use crate::call_scope::CallScope;
use crate::capture_manager::CaptureManager;
use crate::object_info::{HeapInfo, ObjectInfo, ResourceInfo};
use crate::state_tracker::LiveObject;

/// Arguments of CreateCommittedResource (and its 1/2 revisions).
#[derive(Debug, Clone, Copy)]
pub struct CommittedResourceArgs<'a> {
    pub device: NativeHandle,
    pub heap_properties: &'a HeapProperties,
    pub heap_flags: HeapFlags,
    pub desc: &'a ResourceDesc,
    pub initial_state: ResourceStates,
}

/// Arguments of CreatePlacedResource (and its 1 revision).
#[derive(Debug, Clone, Copy)]
pub struct PlacedResourceArgs<'a> {
    pub device: NativeHandle,
    pub heap: NativeHandle,
    pub heap_offset: u64,
    pub desc: &'a ResourceDesc,
    pub initial_state: ResourceStates,
}

#[derive(Debug, Clone, Copy, Default)]
struct WriteWatchState {
    active: bool,
    injected: bool,
}

/// Upload heaps, and custom heaps whose pages are CPU-writable.
pub fn is_upload_heap(heap_type: HeapType, page_property: CpuPageProperty) -> bool {
    match heap_type {
        HeapType::Upload => true,
        HeapType::Custom => matches!(
            page_property,
            CpuPageProperty::WriteCombine | CpuPageProperty::WriteBack
        ),
        _ => false,
    }
}

/// Add write watch to an allocation request. Upload heaps cannot carry the
/// flag, so they become the equivalent custom heap.
pub fn enable_write_watch(properties: &mut HeapProperties, flags: &mut HeapFlags) {
    flags.insert(HeapFlags::ALLOW_WRITE_WATCH);
    if properties.heap_type == HeapType::Upload {
        properties.heap_type = HeapType::Custom;
        properties.cpu_page_property = CpuPageProperty::WriteCombine;
        properties.memory_pool_preference = MemoryPool::L0;
    }
}

/// When to pull CPU-written memory into the trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CapturePoint {
    Unmap(Option<MemoryRange>),
    Submit,
}

impl CaptureManager {
    /// Whether the layer should request write watch for this allocation.
    pub fn use_write_watch(
        &self,
        heap_type: HeapType,
        heap_flags: HeapFlags,
        page_property: CpuPageProperty,
    ) -> bool {
        let memory = &self.config().memory;
        self.is_tracking()
            && memory.tracking_mode == MemoryTrackingMode::PageGuard
            && memory.use_write_watch
            && is_upload_heap(heap_type, page_property)
            && !heap_flags.contains(HeapFlags::SHARED)
            && !heap_flags.contains(HeapFlags::ALLOW_WRITE_WATCH)
    }

    /// True when the driver dropped a requested write-watch flag. The object
    /// then falls back to full-range capture.
    pub fn check_write_watch_ignored(&self, heap_flags: HeapFlags, native: NativeHandle) -> bool {
        if heap_flags.contains(HeapFlags::ALLOW_WRITE_WATCH) {
            return false;
        }
        warn!(
            "write watch requested for {:#x} was ignored; mapped writes will be captured in full",
            native.0
        );
        true
    }

    fn resource_info(
        &self,
        device: NativeHandle,
        desc: &ResourceDesc,
        heap: (HeapType, CpuPageProperty, MemoryPool),
        initial_state: ResourceStates,
    ) -> ResourceInfo {
        let mut info = ResourceInfo::new(*desc, heap.0, heap.1, heap.2, initial_state);
        if desc.dimension != ResourceDimension::Buffer {
            if let Ok(table) = self.dispatch().device() {
                let sizes = table.subresource_sizes(device, desc);
                if sizes.len() == info.subresource_sizes.len() {
                    info.subresource_sizes = sizes;
                } else {
                    warn!(
                        "expected {} subresource sizes, driver reported {}",
                        info.subresource_sizes.len(),
                        sizes.len()
                    );
                }
            }
        }
        info
    }

    // ── Committed resources ─────────────────────────────────

    /// CreateCommittedResource with write watch injected when needed.
    pub fn override_create_committed_resource(
        &self,
        scope: CallScope,
        args: CommittedResourceArgs<'_>,
    ) -> Result<NativeHandle, HResult> {
        let table = match self.dispatch().device() {
            Ok(table) => table,
            Err(e) => {
                warn!("{}", e);
                return Err(HResult::E_FAIL);
            }
        };

        let mut properties = *args.heap_properties;
        let mut flags = args.heap_flags;
        let inject = self.use_write_watch(
            properties.heap_type,
            flags,
            properties.cpu_page_property,
        );
        if inject {
            enable_write_watch(&mut properties, &mut flags);
        }

        let created = table.create_committed_resource(
            args.device,
            &properties,
            flags,
            args.desc,
            args.initial_state,
        );

        let (result, handle) = match created {
            Ok(handle) => (HResult::S_OK, Some(handle)),
            Err(hr) => (hr, None),
        };

        let mut watch = WriteWatchState {
            active: args.heap_flags.contains(HeapFlags::ALLOW_WRITE_WATCH),
            injected: false,
        };
        if inject {
            if let Some(handle) = handle {
                let ignored = match table.heap_properties(handle) {
                    Ok((_, actual)) => self.check_write_watch_ignored(actual, handle),
                    Err(_) => true,
                };
                watch = WriteWatchState {
                    active: !ignored,
                    injected: true,
                };
            }
        }

        self.finish_committed_resource(scope, args, result, handle, watch);
        created
    }

    /// Post hook for committed resources created without the override.
    pub fn post_process_create_committed_resource(
        &self,
        scope: CallScope,
        args: CommittedResourceArgs<'_>,
        result: HResult,
        resource: Option<NativeHandle>,
    ) -> Option<HandleId> {
        let watch = WriteWatchState {
            active: args.heap_flags.contains(HeapFlags::ALLOW_WRITE_WATCH),
            injected: false,
        };
        self.finish_committed_resource(scope, args, result, resource, watch)
    }

    fn finish_committed_resource(
        &self,
        scope: CallScope,
        args: CommittedResourceArgs<'_>,
        result: HResult,
        resource: Option<NativeHandle>,
        watch: WriteWatchState,
    ) -> Option<HandleId> {
        let info = if self.is_tracking() && result.succeeded() {
            let props = args.heap_properties;
            let mut info = self.resource_info(
                args.device,
                args.desc,
                (props.heap_type, props.cpu_page_property, props.memory_pool_preference),
                args.initial_state,
            );
            info.has_write_watch = watch.active;
            info.write_watch_injected = watch.injected;
            ObjectInfo::Resource(info)
        } else {
            ObjectInfo::Plain
        };
        self.end_create_call(
            scope,
            result,
            ObjectKind::Resource,
            resource,
            Some(args.device),
            info,
        )
        .map(|o| o.id)
    }

    // ── Placed and reserved resources ───────────────────────

    pub fn post_process_create_placed_resource(
        &self,
        scope: CallScope,
        args: PlacedResourceArgs<'_>,
        result: HResult,
        resource: Option<NativeHandle>,
    ) -> Option<HandleId> {
        let mut info = ObjectInfo::Plain;
        if self.is_tracking() && result.succeeded() {
            let heap = self.lookup(args.heap);
            let placement = heap.as_ref().and_then(|h| {
                h.with_info(|i| {
                    i.as_heap().map(|hi| {
                        (
                            hi.desc.properties,
                            WriteWatchState {
                                active: hi.has_write_watch,
                                injected: hi.write_watch_injected,
                            },
                        )
                    })
                })
            });
            let (props, watch) = placement.unwrap_or_else(|| {
                warn!("placed resource on untracked heap {:#x}", args.heap.0);
                (HeapProperties::default(), WriteWatchState::default())
            });

            let mut resource_info = self.resource_info(
                args.device,
                args.desc,
                (props.heap_type, props.cpu_page_property, props.memory_pool_preference),
                args.initial_state,
            );
            resource_info.heap = heap.map(|h| h.id);
            resource_info.heap_offset = args.heap_offset;
            resource_info.has_write_watch = watch.active;
            resource_info.write_watch_injected = watch.injected;
            info = ObjectInfo::Resource(resource_info);
        }
        self.end_create_call(
            scope,
            result,
            ObjectKind::Resource,
            resource,
            Some(args.device),
            info,
        )
        .map(|o| o.id)
    }

    pub fn post_process_create_reserved_resource(
        &self,
        scope: CallScope,
        device: NativeHandle,
        desc: &ResourceDesc,
        initial_state: ResourceStates,
        result: HResult,
        resource: Option<NativeHandle>,
    ) -> Option<HandleId> {
        let info = if self.is_tracking() && result.succeeded() {
            let mut info = self.resource_info(
                device,
                desc,
                (HeapType::Default, CpuPageProperty::Unknown, MemoryPool::Unknown),
                initial_state,
            );
            info.reserved = true;
            ObjectInfo::Resource(info)
        } else {
            ObjectInfo::Plain
        };
        self.end_create_call(
            scope,
            result,
            ObjectKind::Resource,
            resource,
            Some(device),
            info,
        )
        .map(|o| o.id)
    }

    // ── Heaps ───────────────────────────────────────────────

    /// CreateHeap / CreateHeap1 with write watch injected when needed.
    pub fn override_create_heap(
        &self,
        scope: CallScope,
        device: NativeHandle,
        desc: &HeapDesc,
        protected_session: Option<NativeHandle>,
    ) -> Result<NativeHandle, HResult> {
        let table = match self.dispatch().device() {
            Ok(table) => table,
            Err(e) => {
                warn!("{}", e);
                return Err(HResult::E_FAIL);
            }
        };

        let mut forwarded = *desc;
        let inject = self.use_write_watch(
            forwarded.properties.heap_type,
            forwarded.flags,
            forwarded.properties.cpu_page_property,
        );
        if inject {
            enable_write_watch(&mut forwarded.properties, &mut forwarded.flags);
        }

        let created = table.create_heap(device, &forwarded);
        let (result, handle) = match created {
            Ok(handle) => (HResult::S_OK, Some(handle)),
            Err(hr) => (hr, None),
        };

        let mut watch = WriteWatchState {
            active: desc.flags.contains(HeapFlags::ALLOW_WRITE_WATCH),
            injected: false,
        };
        if inject {
            if let Some(handle) = handle {
                let actual = table.heap_desc(handle);
                watch = WriteWatchState {
                    active: !self.check_write_watch_ignored(actual.flags, handle),
                    injected: true,
                };
            }
        }

        self.finish_heap(scope, device, desc, protected_session, result, handle, watch);
        created
    }

    pub fn post_process_create_heap(
        &self,
        scope: CallScope,
        device: NativeHandle,
        desc: &HeapDesc,
        protected_session: Option<NativeHandle>,
        result: HResult,
        heap: Option<NativeHandle>,
    ) -> Option<HandleId> {
        let watch = WriteWatchState {
            active: desc.flags.contains(HeapFlags::ALLOW_WRITE_WATCH),
            injected: false,
        };
        self.finish_heap(scope, device, desc, protected_session, result, heap, watch)
    }

    #[allow(clippy::too_many_arguments)]
    fn finish_heap(
        &self,
        scope: CallScope,
        device: NativeHandle,
        desc: &HeapDesc,
        protected_session: Option<NativeHandle>,
        result: HResult,
        heap: Option<NativeHandle>,
        watch: WriteWatchState,
    ) -> Option<HandleId> {
        let mut info = HeapInfo::new(*desc);
        info.protected_session = protected_session.and_then(|s| self.lookup_id(s));
        info.has_write_watch = watch.active;
        info.write_watch_injected = watch.injected;
        self.end_create_call(
            scope,
            result,
            ObjectKind::Heap,
            heap,
            Some(device),
            ObjectInfo::Heap(info),
        )
        .map(|o| o.id)
    }

    /// OpenExistingHeapFromAddress: the heap wraps application memory, so
    /// its descriptor comes from the driver.
    pub fn post_process_open_existing_heap_from_address(
        &self,
        scope: CallScope,
        device: NativeHandle,
        address: u64,
        result: HResult,
        heap: Option<NativeHandle>,
    ) -> Option<HandleId> {
        let mut info = ObjectInfo::Plain;
        if let (true, Some(handle), Ok(table)) =
            (result.succeeded(), heap, self.dispatch().device())
        {
            let mut heap_info = HeapInfo::new(table.heap_desc(handle));
            heap_info.open_existing_address = Some(address);
            info = ObjectInfo::Heap(heap_info);
        }
        self.end_create_call(scope, result, ObjectKind::Heap, heap, Some(device), info)
            .map(|o| o.id)
    }

    /// ID3D12Heap::GetDesc: hide injected write watch from the application.
    pub fn post_process_heap_get_desc(&self, heap: NativeHandle, desc: &mut HeapDesc) {
        let Some(object) = self.lookup(heap) else {
            return;
        };
        object.with_info(|info| {
            if let Some(heap_info) = info.as_heap() {
                if heap_info.write_watch_injected {
                    desc.properties = heap_info.desc.properties;
                    desc.flags.remove(HeapFlags::ALLOW_WRITE_WATCH);
                }
            }
        });
    }

    /// ID3D12Resource::GetHeapProperties: hide injected write watch from the
    /// application.
    pub fn post_process_resource_get_heap_properties(
        &self,
        resource: NativeHandle,
        result: HResult,
        properties: &mut HeapProperties,
        flags: &mut HeapFlags,
    ) {
        if result.failed() {
            return;
        }
        let Some(object) = self.lookup(resource) else {
            return;
        };
        object.with_info(|info| {
            if let Some(res) = info.as_resource() {
                if res.write_watch_injected {
                    properties.heap_type = res.heap_type;
                    properties.cpu_page_property = res.page_property;
                    properties.memory_pool_preference = res.memory_pool;
                    flags.remove(HeapFlags::ALLOW_WRITE_WATCH);
                }
            }
        });
    }

    // ── Map / Unmap ─────────────────────────────────────────

    /// ID3D12Resource::Map.
    ///
    /// # Safety
    ///
    /// When `result` succeeded and `data` is non-null, `data` must point to
    /// the mapped subresource and stay readable for the subresource's full
    /// size until the matching [`pre_process_resource_unmap`] call.
    ///
    /// [`pre_process_resource_unmap`]: CaptureManager::pre_process_resource_unmap
    pub unsafe fn post_process_resource_map(
        &self,
        resource: NativeHandle,
        subresource: u32,
        result: HResult,
        data: *mut u8,
    ) {
        if !self.is_tracking() || result.failed() || data.is_null() {
            return;
        }
        let Some(tracker) = self.tracker() else {
            return;
        };
        let Some(object) = self.lookup(resource) else {
            return;
        };
        // The map count and the mapped set change together between snapshots.
        let _structure = tracker.hold_structure();
        let mapped = object.with_info(|info| {
            let res = info.as_resource_mut()?;
            let slot = res.mapped.get_mut(subresource as usize)?;
            slot.count += 1;
            slot.data = data as usize;
            Some(slot.count)
        });
        match mapped {
            Some(count) => {
                self.mapped_resources.lock().insert(object.id);
                debug!("mapped {} subresource {} (count={})", object.id, subresource, count);
            }
            None => warn!("map of {} subresource {} is out of range", object.id, subresource),
        }
    }

    /// ID3D12Resource::Unmap, before the native call. Captures what the
    /// application wrote while the memory is still mapped.
    pub fn pre_process_resource_unmap(
        &self,
        resource: NativeHandle,
        subresource: u32,
        written_range: Option<MemoryRange>,
    ) {
        if !self.is_tracking() {
            return;
        }
        let Some(tracker) = self.tracker() else {
            return;
        };
        let Some(object) = self.lookup(resource) else {
            return;
        };

        let structure = tracker.hold_structure();
        let unmapped = object.with_info(|info| {
            let res = info.as_resource_mut()?;
            let size = res.subresource_size(subresource);
            let has_write_watch = res.has_write_watch;
            let slot = res.mapped.get_mut(subresource as usize)?;
            if slot.count == 0 {
                return None;
            }
            let data = slot.data;
            slot.count -= 1;
            if slot.count == 0 {
                slot.data = 0;
            }
            Some((data, size, has_write_watch, res.is_mapped()))
        });

        let Some((data, size, has_write_watch, still_mapped)) = unmapped else {
            warn!("unmap of {} subresource {} that is not mapped", object.id, subresource);
            return;
        };
        if !still_mapped {
            self.mapped_resources.lock().remove(&object.id);
        }
        drop(structure);
        self.capture_mapped_memory(
            object.id,
            subresource,
            data,
            size,
            has_write_watch,
            CapturePoint::Unmap(written_range),
        );
    }

    /// Capture writes to persistently mapped resources before their
    /// contents can be consumed by a queue submission.
    pub(crate) fn flush_mapped_memory(&self) {
        if self.config().memory.tracking_mode == MemoryTrackingMode::Assisted {
            return;
        }
        let ids: Vec<HandleId> = self.mapped_resources.lock().iter().copied().collect();
        let Some(tracker) = self.tracker() else {
            return;
        };
        for id in ids {
            let Some(object) = tracker.lookup_id(id) else {
                continue;
            };
            for (subresource, data, size, has_write_watch) in mapped_subresources(&object) {
                self.capture_mapped_memory(
                    id,
                    subresource,
                    data,
                    size,
                    has_write_watch,
                    CapturePoint::Submit,
                );
            }
        }
    }

    fn capture_mapped_memory(
        &self,
        id: HandleId,
        subresource: u32,
        data: usize,
        size: u64,
        has_write_watch: bool,
        point: CapturePoint,
    ) {
        if data == 0 {
            return;
        }
        let Ok(size) = usize::try_from(size) else {
            warn!("subresource {} of {} is too large to capture", subresource, id);
            return;
        };
        if size == 0 {
            warn!("size of {} subresource {} is unknown; write not captured", id, subresource);
            return;
        }

        let ranges = self.written_ranges(data, size, has_write_watch, point);
        for range in ranges {
            // SAFETY: `data` was registered by post_process_resource_map, whose
            // contract keeps `size` bytes readable until the matching unmap has
            // been reported, and `range` lies within `size`.
            let bytes = unsafe {
                std::slice::from_raw_parts((data as *const u8).add(range.start), range.len())
            }
            .to_vec();
            self.write_fill_memory(id, subresource, range.start as u64, bytes);
        }
    }

    fn written_ranges(
        &self,
        data: usize,
        size: usize,
        has_write_watch: bool,
        point: CapturePoint,
    ) -> Vec<Range<usize>> {
        let mode = self.config().memory.tracking_mode;
        if mode == MemoryTrackingMode::PageGuard && has_write_watch {
            return match self.write_watch.take_written_ranges(data, size) {
                Some(ranges) => ranges
                    .into_iter()
                    .map(|r| r.start.min(size)..r.end.min(size))
                    .filter(|r| !r.is_empty())
                    .collect(),
                None => {
                    debug!("write watch unavailable for {:#x}; capturing full range", data);
                    vec![0..size]
                }
            };
        }
        match (mode, point) {
            (MemoryTrackingMode::Assisted, CapturePoint::Unmap(Some(range))) => {
                let begin = (range.begin as usize).min(size);
                let end = (range.end as usize).min(size);
                if begin < end {
                    vec![begin..end]
                } else {
                    Vec::new()
                }
            }
            (MemoryTrackingMode::Assisted, CapturePoint::Submit) => Vec::new(),
            _ => vec![0..size],
        }
    }

    // ── Barriers ────────────────────────────────────────────

    /// Apply completed transitions to tracked subresource states.
    pub(crate) fn track_resource_barriers(&self, barriers: &[ResourceBarrier]) {
        for barrier in barriers {
            let ResourceBarrier::Transition {
                resource,
                subresource,
                after,
                flags,
                ..
            } = *barrier
            else {
                continue;
            };
            // The state changes when the end half executes.
            if flags.contains(BarrierFlags::BEGIN_ONLY) {
                continue;
            }
            let Some(object) = self.lookup(resource) else {
                continue;
            };
            let applied = object.with_info(|info| {
                info.as_resource_mut()
                    .map(|res| res.transition(subresource, after))
            });
            if applied == Some(false) {
                warn!("barrier on {} names subresource {} out of range", object.id, subresource);
            }
        }
    }

    // ── Residency ───────────────────────────────────────────

    /// ID3D12Device1::SetResidencyPriority.
    pub fn post_process_set_residency_priority(
        &self,
        result: HResult,
        objects: &[NativeHandle],
        priorities: &[ResidencyPriority],
    ) {
        if !self.is_tracking() || result.failed() {
            return;
        }
        let Some(tracker) = self.tracker() else {
            return;
        };
        let _structure = tracker.hold_structure();
        for (native, priority) in objects.iter().zip(priorities) {
            match self.lookup(*native) {
                Some(object) if object.kind.is_pageable() => {
                    self.residency_priorities.insert(object.id, priority.0);
                }
                Some(object) => {
                    debug!("residency priority on non-pageable {:?} {}", object.kind, object.id)
                }
                None => debug!("residency priority on untracked {:#x}", native.0),
            }
        }
    }

    pub fn residency_priority(&self, resource: NativeHandle) -> Option<ResidencyPriority> {
        let object = self.lookup(resource)?;
        self.residency_priorities
            .get(&object.id)
            .map(|p| ResidencyPriority(*p))
    }
}

/// (subresource, pointer, size, write watch) for every mapped subresource.
fn mapped_subresources(object: &Arc<LiveObject>) -> Vec<(u32, usize, u64, bool)> {
    object.with_info(|info| {
        let Some(res) = info.as_resource() else {
            return Vec::new();
        };
        res.mapped
            .iter()
            .enumerate()
            .filter(|(_, m)| m.count > 0 && m.data != 0)
            .map(|(i, m)| (i as u32, m.data, res.subresource_size(i as u32), res.has_write_watch))
            .collect()
    })
}

//! Queues, submissions, fences and tile mappings. The layer never waits on
//! the GPU; fence bookkeeping only records what the application asked for.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{debug, warn};

use dxcap_protocol::format::{
    CommandQueueDesc, HResult, TileRange, TileRegionSize, TiledResourceCoordinate,
};
use dxcap_protocol::records::{TileMappingState, TileRangeState};
use dxcap_protocol::{HandleId, NativeHandle, ObjectKind};

use crate::call_scope::CallScope;
use crate::capture_manager::CaptureManager;
use crate::object_info::{CommandQueueInfo, FenceInfo, ObjectInfo};
use crate::state_tracker::LiveObject;

impl CaptureManager {
    pub fn post_process_create_command_queue(
        &self,
        scope: CallScope,
        device: NativeHandle,
        desc: &CommandQueueDesc,
        result: HResult,
        queue: Option<NativeHandle>,
    ) -> Option<HandleId> {
        let info = ObjectInfo::CommandQueue(CommandQueueInfo {
            queue_type: desc.queue_type,
            submissions: 0,
        });
        self.end_create_call(
            scope,
            result,
            ObjectKind::CommandQueue,
            queue,
            Some(device),
            info,
        )
        .map(|o| o.id)
    }

    /// Live direct queues, in creation order.
    pub fn direct_queues(&self) -> Vec<HandleId> {
        self.tracker()
            .map(|t| t.direct_queues())
            .unwrap_or_default()
    }

    /// ExecuteCommandLists, before the native call: CPU writes to mapped
    /// memory must be in the trace before the GPU can read them.
    pub fn pre_process_execute_command_lists(&self, _queue: NativeHandle, _lists: &[NativeHandle]) {
        if self.is_tracking() {
            self.flush_mapped_memory();
        }
    }

    pub fn post_process_execute_command_lists(&self, queue: NativeHandle, lists: &[NativeHandle]) {
        let Some(queue_object) = self.lookup(queue) else {
            return;
        };
        let Some(submission) = queue_object.with_info(|info| {
            info.as_command_queue_mut().map(|q| {
                q.submissions += 1;
                q.submissions
            })
        }) else {
            return;
        };

        for list in lists {
            let Some(list_object) = self.lookup(*list) else {
                debug!("untracked command list {:#x} submitted", list.0);
                continue;
            };
            list_object.with_info(|info| {
                if let Some(cl) = info.as_command_list_mut() {
                    if !cl.closed {
                        warn!("command list {} submitted while open", list_object.id);
                    }
                    cl.last_submission = Some((queue_object.id, submission));
                }
            });
        }
    }

    pub fn post_process_create_fence(
        &self,
        scope: CallScope,
        device: NativeHandle,
        initial_value: u64,
        result: HResult,
        fence: Option<NativeHandle>,
    ) -> Option<HandleId> {
        self.end_create_call(
            scope,
            result,
            ObjectKind::Fence,
            fence,
            Some(device),
            ObjectInfo::Fence(FenceInfo::new(initial_value)),
        )
        .map(|o| o.id)
    }

    /// ID3D12Fence::Signal (CPU side).
    pub fn post_process_fence_signal(&self, fence: NativeHandle, result: HResult, value: u64) {
        if result.succeeded() {
            self.record_fence_signal(fence, value);
        }
    }

    /// ID3D12CommandQueue::Signal. Recorded as requested; completion is
    /// never observed.
    pub fn post_process_queue_signal(
        &self,
        _queue: NativeHandle,
        fence: NativeHandle,
        result: HResult,
        value: u64,
    ) {
        if result.succeeded() {
            self.record_fence_signal(fence, value);
        }
    }

    fn record_fence_signal(&self, fence: NativeHandle, value: u64) {
        if let Some(object) = self.lookup(fence) {
            object.with_info(|info| {
                if let Some(f) = info.as_fence_mut() {
                    f.signal(value);
                }
            });
        }
    }

    /// ID3D12Fence::SetEventOnCompletion. A null event blocks inside the
    /// driver and leaves nothing to track.
    pub fn post_process_fence_set_event_on_completion(
        &self,
        fence: NativeHandle,
        result: HResult,
        value: u64,
        event: u64,
    ) {
        if result.failed() || event == 0 {
            return;
        }
        let Some(object) = self.lookup(fence) else {
            return;
        };
        object.with_info(|info| {
            if let Some(f) = info.as_fence_mut() {
                if value > f.last_signaled_value {
                    f.pending_events.entry(value).or_default().push(event);
                }
            }
        });
    }

    // ── Tile mappings ───────────────────────────────────────

    /// ID3D12CommandQueue::UpdateTileMappings. An empty `regions` slice
    /// stands for the whole resource (null coordinate and size arrays).
    pub fn post_process_update_tile_mappings(
        &self,
        queue: NativeHandle,
        resource: NativeHandle,
        regions: &[(TiledResourceCoordinate, TileRegionSize)],
        heap: NativeHandle,
        ranges: &[TileRange],
        flags: u32,
    ) {
        if !self.is_tracking() {
            return;
        }
        let Some(object) = self.lookup(resource) else {
            debug!("tile mapping update on untracked {:#x}", resource.0);
            return;
        };
        let heap = if heap.is_null() {
            None
        } else {
            match self.lookup_id(heap) {
                Some(id) => Some(id),
                None => {
                    warn!("tile mappings of {} point into untracked heap {:#x}", object.id, heap.0);
                    return;
                }
            }
        };
        let op = TileMappingState::Update {
            sequence: self.next_tile_sequence(),
            queue: self.lookup_id(queue).unwrap_or(HandleId::NULL),
            regions: regions.to_vec(),
            heap,
            ranges: ranges
                .iter()
                .map(|r| TileRangeState {
                    flags: r.flags.bits(),
                    heap_start_offset: r.heap_start_offset,
                    tile_count: r.tile_count,
                })
                .collect(),
            flags,
        };
        self.record_tile_mapping(&object, op);
    }

    /// ID3D12CommandQueue::CopyTileMappings.
    #[allow(clippy::too_many_arguments)]
    pub fn post_process_copy_tile_mappings(
        &self,
        queue: NativeHandle,
        dest: NativeHandle,
        dest_start: &TiledResourceCoordinate,
        source: NativeHandle,
        source_start: &TiledResourceCoordinate,
        region: &TileRegionSize,
        flags: u32,
    ) {
        if !self.is_tracking() {
            return;
        }
        let (Some(dest_object), Some(source_id)) = (self.lookup(dest), self.lookup_id(source)) else {
            debug!("tile mapping copy {:#x} -> {:#x} involves an untracked resource", source.0, dest.0);
            return;
        };
        let op = TileMappingState::Copy {
            sequence: self.next_tile_sequence(),
            queue: self.lookup_id(queue).unwrap_or(HandleId::NULL),
            source: source_id,
            source_start: *source_start,
            dest_start: *dest_start,
            region: *region,
            flags,
        };
        self.record_tile_mapping(&dest_object, op);
    }

    fn next_tile_sequence(&self) -> u64 {
        self.tile_sequence.fetch_add(1, Ordering::Relaxed)
    }

    fn record_tile_mapping(&self, object: &Arc<LiveObject>, op: TileMappingState) {
        let recorded = object.with_info(|info| match info.as_resource_mut() {
            Some(res) if res.reserved => {
                res.record_tile_mapping(op);
                true
            }
            _ => false,
        });
        if !recorded {
            warn!("tile mappings changed on {} which is not a reserved resource", object.id);
        }
    }
}

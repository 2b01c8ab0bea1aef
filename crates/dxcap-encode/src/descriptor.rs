//! Descriptor heaps and the views written into them.

use std::sync::Arc;

use tracing::debug;

use dxcap_protocol::format::{
    CpuDescriptorHandle, DescriptorHeapDesc, GpuDescriptorHandle, HResult,
};
use dxcap_protocol::{HandleId, NativeHandle, ObjectKind};

use crate::call_scope::CallScope;
use crate::capture_manager::CaptureManager;
use crate::object_info::{DescriptorHeapInfo, DescriptorSlot, ObjectInfo};
use crate::state_tracker::LiveObject;

type SlotRef = Option<(Arc<LiveObject>, u32)>;

impl CaptureManager {
    pub fn post_process_create_descriptor_heap(
        &self,
        scope: CallScope,
        device: NativeHandle,
        desc: &DescriptorHeapDesc,
        result: HResult,
        heap: Option<NativeHandle>,
    ) -> Option<HandleId> {
        let mut info = ObjectInfo::Plain;
        if let (true, true, Some(handle), Ok(table)) = (
            self.is_tracking(),
            result.succeeded(),
            heap,
            self.dispatch().device(),
        ) {
            let cpu_start = table.cpu_descriptor_handle_for_heap_start(handle);
            let gpu_start = if desc.shader_visible {
                table.gpu_descriptor_handle_for_heap_start(handle)
            } else {
                GpuDescriptorHandle::default()
            };
            let increment = table.descriptor_handle_increment_size(device, desc.heap_type);
            info = ObjectInfo::DescriptorHeap(DescriptorHeapInfo::new(
                *desc, cpu_start, gpu_start, increment,
            ));
        }
        self.end_create_call(
            scope,
            result,
            ObjectKind::DescriptorHeap,
            heap,
            Some(device),
            info,
        )
        .map(|o| o.id)
    }

    /// Finish a view or sampler creation writing the slot at `dest`.
    /// `resources` are the objects the view reads, if any.
    pub fn end_descriptor_call(
        &self,
        scope: CallScope,
        dest: CpuDescriptorHandle,
        resources: &[NativeHandle],
    ) {
        if let Some(tracker) = self.tracker().filter(|_| self.is_tracking()) {
            match tracker.find_descriptor(dest) {
                Some((heap, index)) => {
                    let slot = DescriptorSlot {
                        call_id: scope.call_id(),
                        parameters: scope.parameters(),
                        resources: resources
                            .iter()
                            .filter_map(|r| self.lookup_id(*r))
                            .collect(),
                    };
                    heap.with_info(|info| {
                        if let Some(heap_info) = info.as_descriptor_heap_mut() {
                            heap_info.slots.insert(index, slot);
                        }
                    });
                }
                None => debug!(
                    "{:?} writes descriptor {:#x} outside any tracked heap",
                    scope.call_id(),
                    dest.0
                ),
            }
        }
        self.write_call_record(&scope);
    }

    pub fn post_process_copy_descriptors_simple(
        &self,
        scope: CallScope,
        count: u32,
        dest_start: CpuDescriptorHandle,
        src_start: CpuDescriptorHandle,
    ) {
        if self.is_tracking() {
            self.copy_descriptor_slots(&[(dest_start, count)], &[(src_start, count)]);
        }
        self.end_call(scope);
    }

    /// CopyDescriptors. Ranges are (start, count); the total counts of both
    /// sides match.
    pub fn post_process_copy_descriptors(
        &self,
        scope: CallScope,
        dest_ranges: &[(CpuDescriptorHandle, u32)],
        src_ranges: &[(CpuDescriptorHandle, u32)],
    ) {
        if self.is_tracking() {
            self.copy_descriptor_slots(dest_ranges, src_ranges);
        }
        self.end_call(scope);
    }

    fn copy_descriptor_slots(
        &self,
        dest_ranges: &[(CpuDescriptorHandle, u32)],
        src_ranges: &[(CpuDescriptorHandle, u32)],
    ) {
        let dest = self.expand_descriptor_ranges(dest_ranges);
        let src = self.expand_descriptor_ranges(src_ranges);

        for (dest, src) in dest.into_iter().zip(src) {
            let Some((dest_heap, dest_index)) = dest else {
                continue;
            };
            let slot = src.and_then(|(src_heap, src_index)| {
                src_heap.with_info(|info| {
                    info.as_descriptor_heap()
                        .and_then(|h| h.slots.get(&src_index).cloned())
                })
            });
            dest_heap.with_info(|info| {
                if let Some(heap_info) = info.as_descriptor_heap_mut() {
                    match slot {
                        Some(slot) => {
                            heap_info.slots.insert(dest_index, slot);
                        }
                        None => {
                            heap_info.slots.remove(&dest_index);
                        }
                    }
                }
            });
        }
    }

    fn expand_descriptor_ranges(&self, ranges: &[(CpuDescriptorHandle, u32)]) -> Vec<SlotRef> {
        let Some(tracker) = self.tracker() else {
            return Vec::new();
        };
        let mut slots = Vec::new();
        for (start, count) in ranges {
            match tracker.find_descriptor(*start) {
                Some((heap, first)) => {
                    slots.extend((0..*count).map(|i| Some((Arc::clone(&heap), first + i))));
                }
                None => slots.extend((0..*count).map(|_| None)),
            }
        }
        slots
    }
}

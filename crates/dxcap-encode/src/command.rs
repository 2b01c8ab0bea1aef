use tracing::debug;

use dxcap_protocol::format::{CommandListType, HResult, ResourceBarrier};
use dxcap_protocol::{ApiCallId, HandleId, NativeHandle, ObjectKind};

use crate::call_scope::CallScope;
use crate::capture_manager::CaptureManager;
use crate::command_handles::{CommandArgs, HandleRef};
use crate::object_info::{CommandListInfo, ObjectInfo, TrackedCommand};

impl CaptureManager {
    /// CreateCommandList returns an open list; CreateCommandList1 a closed
    /// one with no allocator.
    pub fn post_process_create_command_list(
        &self,
        scope: CallScope,
        device: NativeHandle,
        list_type: CommandListType,
        allocator: Option<NativeHandle>,
        result: HResult,
        list: Option<NativeHandle>,
    ) -> Option<HandleId> {
        let closed = scope.call_id() == ApiCallId::Device4CreateCommandList1;
        let allocator = allocator.and_then(|a| self.lookup_id(a));
        self.end_create_call(
            scope,
            result,
            ObjectKind::CommandList,
            list,
            Some(device),
            ObjectInfo::CommandList(CommandListInfo::new(list_type, allocator, closed)),
        )
        .map(|o| o.id)
    }

    /// Finish a command recorded into `list`, keeping the objects it
    /// references.
    pub fn end_command_list_call(
        &self,
        scope: CallScope,
        list: NativeHandle,
        args: CommandArgs<'_>,
    ) {
        if let Some(tracker) = self.tracker().filter(|_| self.is_tracking()) {
            let call_id = scope.call_id();
            let refs = self.extractors().extract(call_id, &args).unwrap_or_else(|| {
                debug!("no handle extractor for {:?}", call_id);
                Vec::new()
            });
            let command = TrackedCommand {
                call_id,
                parameters: scope.parameters(),
                handles: self.resolve_handle_refs(&refs),
            };
            if !tracker.track_command(list, command) {
                debug!("{:?} on untracked command list {:#x}", call_id, list.0);
            }
        }
        self.write_call_record(&scope);
    }

    fn resolve_handle_refs(&self, refs: &[HandleRef]) -> Vec<HandleId> {
        let Some(tracker) = self.tracker() else {
            return Vec::new();
        };
        refs.iter()
            .filter_map(|r| match r {
                HandleRef::Object(native) => self.lookup_id(*native),
                HandleRef::Descriptor(cpu) => tracker.find_descriptor(*cpu).map(|(heap, _)| heap.id),
            })
            .collect()
    }

    pub fn post_process_command_list_reset(
        &self,
        scope: CallScope,
        list: NativeHandle,
        result: HResult,
        allocator: NativeHandle,
        initial_state: NativeHandle,
    ) {
        if result.succeeded() {
            if let Some(object) = self.lookup(list) {
                let allocator_id = self.lookup_id(allocator);
                object.with_info(|info| {
                    if let Some(cl) = info.as_command_list_mut() {
                        cl.commands.clear();
                        cl.closed = false;
                        cl.allocator = allocator_id;
                    }
                });
            }
        }
        self.end_command_list_call(
            scope,
            list,
            CommandArgs::Reset {
                allocator,
                initial_state,
            },
        );
    }

    pub fn post_process_command_list_close(&self, scope: CallScope, list: NativeHandle, result: HResult) {
        if result.succeeded() {
            if let Some(object) = self.lookup(list) {
                object.with_info(|info| {
                    if let Some(cl) = info.as_command_list_mut() {
                        cl.closed = true;
                    }
                });
            }
        }
        self.end_call(scope);
    }

    /// ResourceBarrier: subresource states follow the transitions as they
    /// are recorded.
    pub fn post_process_resource_barrier(
        &self,
        scope: CallScope,
        list: NativeHandle,
        barriers: &[ResourceBarrier],
    ) {
        if self.is_tracking() {
            self.track_resource_barriers(barriers);
        }
        self.end_command_list_call(scope, list, CommandArgs::ResourceBarrier(barriers));
    }
}

//! Object references made by recorded commands.
//!
//! Each command-list entry point has an extractor that pulls the objects it
//! references out of its arguments. The recorded command keeps those as
//! capture ids, so the snapshot of a command list names everything replay
//! must recreate before the list can be re-recorded.

use std::collections::HashMap;

use dxcap_protocol::format::{CpuDescriptorHandle, GpuDescriptorHandle, ResourceBarrier};
use dxcap_protocol::{ApiCallId, NativeHandle};

/// Arguments of a command-list call, as far as object references go.
#[derive(Debug, Clone, Copy)]
pub enum CommandArgs<'a> {
    Reset {
        allocator: NativeHandle,
        initial_state: NativeHandle,
    },
    ResourceBarrier(&'a [ResourceBarrier]),
    Copy {
        dst: NativeHandle,
        src: NativeHandle,
    },
    SetDescriptorHeaps(&'a [NativeHandle]),
    SetPipelineState(NativeHandle),
    SetRootDescriptorTable {
        root_parameter: u32,
        base: GpuDescriptorHandle,
    },
    SetRenderTargets {
        render_targets: &'a [CpuDescriptorHandle],
        depth_stencil: Option<CpuDescriptorHandle>,
    },
    ClearRenderTargetView(CpuDescriptorHandle),
    /// Draws, dispatches and anything else without object arguments.
    NoHandles,
}

/// An object reference found in command arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleRef {
    Object(NativeHandle),
    /// Resolved to the descriptor heap containing the handle.
    Descriptor(CpuDescriptorHandle),
}

pub type HandleExtractor = Box<dyn Fn(&CommandArgs<'_>) -> Vec<HandleRef> + Send + Sync>;

/// Extractors keyed by entry point.
pub struct HandleExtractorTable {
    extractors: HashMap<ApiCallId, HandleExtractor>,
}

impl HandleExtractorTable {
    pub fn empty() -> Self {
        Self {
            extractors: HashMap::new(),
        }
    }

    /// Table covering every command-list entry point the layer records.
    pub fn with_defaults() -> Self {
        let mut table = Self::empty();
        table.register(ApiCallId::CommandListReset, reset_handles);
        table.register(ApiCallId::CommandListResourceBarrier, barrier_handles);
        table.register(ApiCallId::CommandListCopyResource, copy_handles);
        table.register(ApiCallId::CommandListCopyBufferRegion, copy_handles);
        table.register(ApiCallId::CommandListCopyTextureRegion, copy_handles);
        table.register(ApiCallId::CommandListSetDescriptorHeaps, |args| match args {
            CommandArgs::SetDescriptorHeaps(heaps) => objects(heaps.iter().copied()),
            _ => Vec::new(),
        });
        table.register(ApiCallId::CommandListSetPipelineState, |args| match args {
            CommandArgs::SetPipelineState(pso) => objects([*pso]),
            _ => Vec::new(),
        });
        table.register(ApiCallId::CommandListOmSetRenderTargets, |args| match args {
            CommandArgs::SetRenderTargets {
                render_targets,
                depth_stencil,
            } => render_targets
                .iter()
                .copied()
                .chain(*depth_stencil)
                .map(HandleRef::Descriptor)
                .collect(),
            _ => Vec::new(),
        });
        table.register(ApiCallId::CommandListClearRenderTargetView, |args| match args {
            CommandArgs::ClearRenderTargetView(rtv) => vec![HandleRef::Descriptor(*rtv)],
            _ => Vec::new(),
        });
        // GPU descriptor handles reference the heap bound by SetDescriptorHeaps.
        table.register(ApiCallId::CommandListSetGraphicsRootDescriptorTable, |_| Vec::new());
        table.register(ApiCallId::CommandListDrawInstanced, |_| Vec::new());
        table.register(ApiCallId::CommandListDispatch, |_| Vec::new());
        table
    }

    pub fn register<F>(&mut self, call_id: ApiCallId, extractor: F)
    where
        F: Fn(&CommandArgs<'_>) -> Vec<HandleRef> + Send + Sync + 'static,
    {
        self.extractors.insert(call_id, Box::new(extractor));
    }

    pub fn contains(&self, call_id: ApiCallId) -> bool {
        self.extractors.contains_key(&call_id)
    }

    /// References made by `args`; `None` when no extractor is registered.
    pub fn extract(&self, call_id: ApiCallId, args: &CommandArgs<'_>) -> Option<Vec<HandleRef>> {
        self.extractors.get(&call_id).map(|f| f(args))
    }
}

impl Default for HandleExtractorTable {
    fn default() -> Self {
        Self::with_defaults()
    }
}

fn objects(handles: impl IntoIterator<Item = NativeHandle>) -> Vec<HandleRef> {
    handles
        .into_iter()
        .filter(|h| !h.is_null())
        .map(HandleRef::Object)
        .collect()
}

fn reset_handles(args: &CommandArgs<'_>) -> Vec<HandleRef> {
    match args {
        CommandArgs::Reset {
            allocator,
            initial_state,
        } => objects([*allocator, *initial_state]),
        _ => Vec::new(),
    }
}

fn copy_handles(args: &CommandArgs<'_>) -> Vec<HandleRef> {
    match args {
        CommandArgs::Copy { dst, src } => objects([*dst, *src]),
        _ => Vec::new(),
    }
}

fn barrier_handles(args: &CommandArgs<'_>) -> Vec<HandleRef> {
    let CommandArgs::ResourceBarrier(barriers) = args else {
        return Vec::new();
    };
    objects(barriers.iter().flat_map(|barrier| match *barrier {
        ResourceBarrier::Transition { resource, .. } => [resource, NativeHandle::NULL],
        ResourceBarrier::Aliasing { before, after } => [before, after],
        ResourceBarrier::Uav { resource } => [resource, NativeHandle::NULL],
    }))
}

use serde::{Deserialize, Serialize};

use crate::format::{
    CommandListType, CpuPageProperty, DescriptorHeapType, DredEnablement, HeapType, MemoryPool,
    ResourceDimension, SwapEffect, TileRegionSize, TiledResourceCoordinate,
};
use crate::handle::{HandleId, ObjectKind, ThreadId};

/// Identifies the intercepted entry point a record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub enum ApiCallId {
    // ── Exported functions ──────────────────────────────────
    CreateDxgiFactory2,
    D3d12CreateDevice,
    D3d12GetDebugInterface,

    // ── DXGI factory / swapchain ────────────────────────────
    FactoryCreateSwapChain,
    Factory2CreateSwapChainForHwnd,
    Factory2CreateSwapChainForCoreWindow,
    Factory2CreateSwapChainForComposition,
    SwapChainPresent,
    SwapChain1Present1,
    SwapChainGetBuffer,
    SwapChainResizeBuffers,
    SwapChain3ResizeBuffers1,

    // ── Device ──────────────────────────────────────────────
    DeviceCreateCommandQueue,
    DeviceCreateCommandAllocator,
    DeviceCreateCommandList,
    Device4CreateCommandList1,
    DeviceCreateDescriptorHeap,
    DeviceCreateHeap,
    Device4CreateHeap1,
    Device3OpenExistingHeapFromAddress,
    DeviceCreateCommittedResource,
    Device4CreateCommittedResource1,
    Device8CreateCommittedResource2,
    DeviceCreatePlacedResource,
    Device8CreatePlacedResource1,
    DeviceCreateReservedResource,
    DeviceCreateFence,
    DeviceCreateRootSignature,
    DeviceCreateGraphicsPipelineState,
    DeviceCreateComputePipelineState,
    DeviceCreateQueryHeap,
    DeviceCreateConstantBufferView,
    DeviceCreateShaderResourceView,
    DeviceCreateUnorderedAccessView,
    DeviceCreateRenderTargetView,
    DeviceCreateDepthStencilView,
    DeviceCreateSampler,
    DeviceCopyDescriptors,
    DeviceCopyDescriptorsSimple,
    Device1SetResidencyPriority,

    // ── Resource / heap ─────────────────────────────────────
    ResourceMap,
    ResourceUnmap,
    ResourceGetHeapProperties,
    HeapGetDesc,

    // ── Queue / fence ───────────────────────────────────────
    CommandQueueExecuteCommandLists,
    CommandQueueSignal,
    CommandQueueWait,
    CommandQueueUpdateTileMappings,
    CommandQueueCopyTileMappings,
    FenceSignal,
    FenceSetEventOnCompletion,

    // ── Command list ────────────────────────────────────────
    CommandListClose,
    CommandListReset,
    CommandListResourceBarrier,
    CommandListCopyResource,
    CommandListCopyBufferRegion,
    CommandListCopyTextureRegion,
    CommandListSetDescriptorHeaps,
    CommandListSetPipelineState,
    CommandListSetGraphicsRootDescriptorTable,
    CommandListOmSetRenderTargets,
    CommandListClearRenderTargetView,
    CommandListDrawInstanced,
    CommandListDispatch,

    // ── Debug / diagnostics ─────────────────────────────────
    DebugEnableDebugLayer,
    Debug1EnableDebugLayer,
    DredSettingsSetAutoBreadcrumbsEnablement,
    DredSettings1SetBreadcrumbContextEnablement,
    DredSettingsSetPageFaultEnablement,

    // ── IUnknown / ID3D12Object ─────────────────────────────
    UnknownRelease,
    ObjectSetPrivateData,
}

/// One intercepted call: id, issuing thread and encoded parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct CallRecord {
    pub call_id: ApiCallId,
    pub thread_id: ThreadId,
    pub parameters: Vec<u8>,
}

/// CPU-written memory content captured for a mapped resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct FillMemoryRecord {
    pub thread_id: ThreadId,
    pub resource: HandleId,
    pub subresource: u32,
    pub offset: u64,
    pub data: Vec<u8>,
}

// ── State snapshot ──────────────────────────────────────────

/// Full-registry snapshot: one [`ObjectState`] per live object, ordered by
/// creation so that parents precede the objects that reference them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct StateSnapshot {
    pub thread_id: ThreadId,
    pub frame: u32,
    pub objects: Vec<ObjectState>,
    pub direct_queues: Vec<HandleId>,
    pub mapped_resources: Vec<HandleId>,
    pub diagnostics: DiagnosticState,
}

impl StateSnapshot {
    pub fn find(&self, id: HandleId) -> Option<&ObjectState> {
        self.objects.iter().find(|o| o.id == id)
    }

    pub fn count_of_kind(&self, kind: ObjectKind) -> usize {
        self.objects.iter().filter(|o| o.kind == kind).count()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct ObjectState {
    pub id: HandleId,
    pub kind: ObjectKind,
    pub parent: Option<HandleId>,
    pub create_call: ApiCallId,
    pub create_parameters: Vec<u8>,
    pub private_data: Vec<PrivateDataState>,
    pub info: ObjectStateInfo,
}

/// One SetPrivateData value still attached to an object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct PrivateDataState {
    pub guid: [u8; 16],
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub enum ObjectStateInfo {
    Plain,
    Resource(ResourceState),
    Heap(HeapState),
    SwapChain(SwapChainState),
    DescriptorHeap(DescriptorHeapState),
    CommandQueue(CommandQueueState),
    CommandList(CommandListState),
    Fence(FenceState),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct ResourceState {
    pub dimension: ResourceDimension,
    pub width: u64,
    pub height: u32,
    pub depth_or_array_size: u16,
    pub mip_levels: u16,
    pub format: u32,
    pub heap_type: HeapType,
    pub page_property: CpuPageProperty,
    pub memory_pool: MemoryPool,
    /// Raw D3D12_RESOURCE_STATES bits.
    pub initial_state: u32,
    /// Current state per subresource, raw bits.
    pub subresource_states: Vec<u32>,
    pub has_write_watch: bool,
    pub write_watch_injected: bool,
    pub heap: Option<HandleId>,
    pub heap_offset: u64,
    pub reserved: bool,
    pub swapchain_buffer: bool,
    pub residency_priority: Option<u32>,
    /// Tile mapping operations on a reserved resource, oldest first.
    pub tile_mappings: Vec<TileMappingState>,
}

/// A tile mapping change applied to a reserved resource. `sequence` orders
/// operations across all resources, so a copy is replayed after the
/// mappings of its source that preceded it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub enum TileMappingState {
    Update {
        sequence: u64,
        queue: HandleId,
        /// Empty means the whole resource.
        regions: Vec<(TiledResourceCoordinate, TileRegionSize)>,
        heap: Option<HandleId>,
        ranges: Vec<TileRangeState>,
        flags: u32,
    },
    Copy {
        sequence: u64,
        queue: HandleId,
        source: HandleId,
        source_start: TiledResourceCoordinate,
        dest_start: TiledResourceCoordinate,
        region: TileRegionSize,
        flags: u32,
    },
}

impl TileMappingState {
    pub fn sequence(&self) -> u64 {
        match self {
            TileMappingState::Update { sequence, .. } | TileMappingState::Copy { sequence, .. } => {
                *sequence
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct TileRangeState {
    /// Raw D3D12_TILE_RANGE_FLAGS bits.
    pub flags: u32,
    pub heap_start_offset: u32,
    pub tile_count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct HeapState {
    pub size_in_bytes: u64,
    pub heap_type: HeapType,
    pub page_property: CpuPageProperty,
    pub memory_pool: MemoryPool,
    pub alignment: u64,
    /// Raw D3D12_HEAP_FLAGS bits.
    pub flags: u32,
    pub protected_session: Option<HandleId>,
    pub open_existing_address: Option<u64>,
    pub has_write_watch: bool,
    pub residency_priority: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct SwapChainState {
    pub buffers: Vec<HandleId>,
    pub width: u32,
    pub height: u32,
    pub format: u32,
    pub swap_effect: SwapEffect,
    pub queue: Option<HandleId>,
    pub frame: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct DescriptorHeapState {
    pub heap_type: DescriptorHeapType,
    pub num_descriptors: u32,
    pub shader_visible: bool,
    pub slots: Vec<DescriptorSlotState>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct DescriptorSlotState {
    pub index: u32,
    pub call_id: ApiCallId,
    pub parameters: Vec<u8>,
    pub resources: Vec<HandleId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct CommandQueueState {
    pub queue_type: CommandListType,
    pub submissions: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct CommandListState {
    pub list_type: CommandListType,
    pub allocator: Option<HandleId>,
    pub closed: bool,
    pub commands: Vec<CommandState>,
    pub last_submission: Option<(HandleId, u64)>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct CommandState {
    pub call_id: ApiCallId,
    pub parameters: Vec<u8>,
    pub handles: Vec<HandleId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct FenceState {
    pub last_signaled_value: u64,
    /// (fence value, event handle) pairs registered through SetEventOnCompletion.
    pub pending_events: Vec<(u64, u64)>,
}

/// Debug-layer and device-removed diagnostics configuration, stored as values.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct DiagnosticState {
    pub debug_layer_object_id: HandleId,
    pub dred: DredInfo,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct DredInfo {
    pub dred_settings_object_id: HandleId,
    pub auto_breadcrumbs: DredEnablement,
    pub breadcrumb_context: DredEnablement,
    pub page_fault: DredEnablement,
}

// ── Trace blocks ────────────────────────────────────────────

/// Unit written to a trace sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub enum TraceBlock {
    Call(CallRecord),
    FillMemory(FillMemoryRecord),
    State(StateSnapshot),
}

impl TraceBlock {
    pub fn thread_id(&self) -> ThreadId {
        match self {
            TraceBlock::Call(r) => r.thread_id,
            TraceBlock::FillMemory(r) => r.thread_id,
            TraceBlock::State(s) => s.thread_id,
        }
    }
}

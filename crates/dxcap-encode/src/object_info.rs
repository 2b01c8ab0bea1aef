//! Kind-specific bookkeeping attached to registry entries.

use std::collections::BTreeMap;

use dxcap_protocol::format::{
    CommandListType, CpuDescriptorHandle, CpuPageProperty, DescriptorHeapDesc, GpuDescriptorHandle,
    HeapDesc, HeapType, MemoryPool, ResourceDesc, ResourceDimension, ResourceStates,
    SwapChainDesc, TileRangeFlags, ALL_SUBRESOURCES,
};
use dxcap_protocol::records::{
    CommandListState, CommandQueueState, CommandState, DescriptorHeapState, DescriptorSlotState,
    FenceState, HeapState, ObjectStateInfo, ResourceState, SwapChainState, TileMappingState,
};
use dxcap_protocol::{ApiCallId, HandleId, NativeHandle};

#[derive(Debug, Clone, Default)]
pub enum ObjectInfo {
    #[default]
    Plain,
    Resource(ResourceInfo),
    Heap(HeapInfo),
    SwapChain(SwapChainInfo),
    DescriptorHeap(DescriptorHeapInfo),
    CommandQueue(CommandQueueInfo),
    CommandList(CommandListInfo),
    Fence(FenceInfo),
}

macro_rules! info_accessors {
    ($($variant:ident => $ty:ty, $get:ident, $get_mut:ident;)*) => {
        impl ObjectInfo {
            $(
                pub fn $get(&self) -> Option<&$ty> {
                    match self {
                        ObjectInfo::$variant(info) => Some(info),
                        _ => None,
                    }
                }

                pub fn $get_mut(&mut self) -> Option<&mut $ty> {
                    match self {
                        ObjectInfo::$variant(info) => Some(info),
                        _ => None,
                    }
                }
            )*
        }
    };
}

info_accessors! {
    Resource => ResourceInfo, as_resource, as_resource_mut;
    Heap => HeapInfo, as_heap, as_heap_mut;
    SwapChain => SwapChainInfo, as_swap_chain, as_swap_chain_mut;
    DescriptorHeap => DescriptorHeapInfo, as_descriptor_heap, as_descriptor_heap_mut;
    CommandQueue => CommandQueueInfo, as_command_queue, as_command_queue_mut;
    CommandList => CommandListInfo, as_command_list, as_command_list_mut;
    Fence => FenceInfo, as_fence, as_fence_mut;
}

impl ObjectInfo {
    /// Snapshot form. `residency` is the object's last successfully set
    /// residency priority, if any.
    pub fn to_state(&self, residency: Option<u32>) -> ObjectStateInfo {
        match self {
            ObjectInfo::Plain => ObjectStateInfo::Plain,
            ObjectInfo::Resource(info) => ObjectStateInfo::Resource(info.to_state(residency)),
            ObjectInfo::Heap(info) => ObjectStateInfo::Heap(info.to_state(residency)),
            ObjectInfo::SwapChain(info) => ObjectStateInfo::SwapChain(info.to_state()),
            ObjectInfo::DescriptorHeap(info) => ObjectStateInfo::DescriptorHeap(info.to_state()),
            ObjectInfo::CommandQueue(info) => ObjectStateInfo::CommandQueue(CommandQueueState {
                queue_type: info.queue_type,
                submissions: info.submissions,
            }),
            ObjectInfo::CommandList(info) => ObjectStateInfo::CommandList(info.to_state()),
            ObjectInfo::Fence(info) => ObjectStateInfo::Fence(info.to_state()),
        }
    }
}

// ── Resources ───────────────────────────────────────────────

/// CPU mapping of one subresource. Map calls nest; the pointer stays valid
/// until the count returns to zero.
#[derive(Debug, Clone, Copy, Default)]
pub struct MappedSubresource {
    pub count: u32,
    pub data: usize,
}

#[derive(Debug, Clone)]
pub struct ResourceInfo {
    pub desc: ResourceDesc,
    /// Heap placement as the application requested it.
    pub heap_type: HeapType,
    pub page_property: CpuPageProperty,
    pub memory_pool: MemoryPool,
    pub initial_state: ResourceStates,
    pub subresource_states: Vec<ResourceStates>,
    pub subresource_sizes: Vec<u64>,
    pub mapped: Vec<MappedSubresource>,
    pub has_write_watch: bool,
    /// The layer added write watch behind the application's back.
    pub write_watch_injected: bool,
    pub heap: Option<HandleId>,
    pub heap_offset: u64,
    pub reserved: bool,
    pub swapchain_buffer: bool,
    pub tile_mappings: Vec<TileMappingState>,
}

impl ResourceInfo {
    pub fn new(
        desc: ResourceDesc,
        heap_type: HeapType,
        page_property: CpuPageProperty,
        memory_pool: MemoryPool,
        initial_state: ResourceStates,
    ) -> Self {
        let count = desc.subresource_count() as usize;
        let subresource_sizes = if desc.dimension == ResourceDimension::Buffer {
            vec![desc.width]
        } else {
            vec![0; count]
        };
        Self {
            desc,
            heap_type,
            page_property,
            memory_pool,
            initial_state,
            subresource_states: vec![initial_state; count],
            subresource_sizes,
            mapped: vec![MappedSubresource::default(); count],
            has_write_watch: false,
            write_watch_injected: false,
            heap: None,
            heap_offset: 0,
            reserved: false,
            swapchain_buffer: false,
            tile_mappings: Vec::new(),
        }
    }

    pub fn subresource_count(&self) -> u32 {
        self.subresource_states.len() as u32
    }

    pub fn state(&self, subresource: u32) -> Option<ResourceStates> {
        self.subresource_states.get(subresource as usize).copied()
    }

    /// Record a completed transition. Returns false for an out-of-range
    /// subresource.
    pub fn transition(&mut self, subresource: u32, after: ResourceStates) -> bool {
        if subresource == ALL_SUBRESOURCES {
            self.subresource_states.iter_mut().for_each(|s| *s = after);
            return true;
        }
        match self.subresource_states.get_mut(subresource as usize) {
            Some(state) => {
                *state = after;
                true
            }
            None => false,
        }
    }

    pub fn subresource_size(&self, subresource: u32) -> u64 {
        self.subresource_sizes
            .get(subresource as usize)
            .copied()
            .unwrap_or(0)
    }

    pub fn is_mapped(&self) -> bool {
        self.mapped.iter().any(|m| m.count > 0)
    }

    /// Append a tile mapping change. An update that unmaps every tile
    /// supersedes everything recorded before it.
    pub fn record_tile_mapping(&mut self, op: TileMappingState) {
        if unmaps_all_tiles(&op) {
            self.tile_mappings.clear();
        }
        self.tile_mappings.push(op);
    }

    fn to_state(&self, residency: Option<u32>) -> ResourceState {
        ResourceState {
            dimension: self.desc.dimension,
            width: self.desc.width,
            height: self.desc.height,
            depth_or_array_size: self.desc.depth_or_array_size,
            mip_levels: self.desc.mip_levels,
            format: self.desc.format.0,
            heap_type: self.heap_type,
            page_property: self.page_property,
            memory_pool: self.memory_pool,
            initial_state: self.initial_state.bits(),
            subresource_states: self.subresource_states.iter().map(|s| s.bits()).collect(),
            has_write_watch: self.has_write_watch,
            write_watch_injected: self.write_watch_injected,
            heap: self.heap,
            heap_offset: self.heap_offset,
            reserved: self.reserved,
            swapchain_buffer: self.swapchain_buffer,
            residency_priority: residency,
            tile_mappings: self.tile_mappings.clone(),
        }
    }
}

fn unmaps_all_tiles(op: &TileMappingState) -> bool {
    match op {
        TileMappingState::Update { regions, ranges, .. } => {
            regions.is_empty()
                && !ranges.is_empty()
                && ranges
                    .iter()
                    .all(|r| TileRangeFlags::from_bits_truncate(r.flags).contains(TileRangeFlags::NULL))
        }
        TileMappingState::Copy { .. } => false,
    }
}

// ── Heaps ───────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct HeapInfo {
    /// Descriptor as the application requested it.
    pub desc: HeapDesc,
    pub protected_session: Option<HandleId>,
    pub open_existing_address: Option<u64>,
    pub has_write_watch: bool,
    pub write_watch_injected: bool,
}

impl HeapInfo {
    pub fn new(desc: HeapDesc) -> Self {
        Self {
            desc,
            protected_session: None,
            open_existing_address: None,
            has_write_watch: false,
            write_watch_injected: false,
        }
    }

    fn to_state(&self, residency: Option<u32>) -> HeapState {
        HeapState {
            size_in_bytes: self.desc.size_in_bytes,
            heap_type: self.desc.properties.heap_type,
            page_property: self.desc.properties.cpu_page_property,
            memory_pool: self.desc.properties.memory_pool_preference,
            alignment: self.desc.alignment,
            flags: self.desc.flags.bits(),
            protected_session: self.protected_session,
            open_existing_address: self.open_existing_address,
            has_write_watch: self.has_write_watch,
            residency_priority: residency,
        }
    }
}

// ── Swapchains ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapChainBuffer {
    pub id: HandleId,
    pub native: NativeHandle,
}

#[derive(Debug, Clone)]
pub struct SwapChainInfo {
    pub desc: SwapChainDesc,
    /// One slot per buffer; blit-model swapchains only expose buffer zero,
    /// so later slots stay empty.
    pub buffers: Vec<Option<SwapChainBuffer>>,
    /// Queue (or device) the swapchain presents through.
    pub queue: Option<HandleId>,
    /// Frames presented through this swapchain.
    pub frame: u32,
}

impl SwapChainInfo {
    pub fn new(desc: SwapChainDesc, queue: Option<HandleId>) -> Self {
        Self {
            desc,
            buffers: vec![None; desc.buffer_count as usize],
            queue,
            frame: 0,
        }
    }

    pub fn buffer_count(&self) -> u32 {
        self.buffers.len() as u32
    }

    fn to_state(&self) -> SwapChainState {
        SwapChainState {
            buffers: self
                .buffers
                .iter()
                .map(|b| b.map_or(HandleId::NULL, |b| b.id))
                .collect(),
            width: self.desc.width,
            height: self.desc.height,
            format: self.desc.format.0,
            swap_effect: self.desc.swap_effect,
            queue: self.queue,
            frame: self.frame,
        }
    }
}

// ── Descriptor heaps ────────────────────────────────────────

/// Last view or copy written to one descriptor slot.
#[derive(Debug, Clone, PartialEq)]
pub struct DescriptorSlot {
    pub call_id: ApiCallId,
    pub parameters: Vec<u8>,
    pub resources: Vec<HandleId>,
}

#[derive(Debug, Clone)]
pub struct DescriptorHeapInfo {
    pub desc: DescriptorHeapDesc,
    pub cpu_start: CpuDescriptorHandle,
    pub gpu_start: GpuDescriptorHandle,
    pub increment: u32,
    /// Written slots only; heaps can hold a million descriptors.
    pub slots: BTreeMap<u32, DescriptorSlot>,
}

impl DescriptorHeapInfo {
    pub fn new(
        desc: DescriptorHeapDesc,
        cpu_start: CpuDescriptorHandle,
        gpu_start: GpuDescriptorHandle,
        increment: u32,
    ) -> Self {
        Self {
            desc,
            cpu_start,
            gpu_start,
            increment,
            slots: BTreeMap::new(),
        }
    }

    /// One past the last CPU handle address inside this heap.
    pub fn cpu_end(&self) -> u64 {
        self.cpu_start.0 + u64::from(self.desc.num_descriptors) * u64::from(self.increment)
    }

    fn to_state(&self) -> DescriptorHeapState {
        DescriptorHeapState {
            heap_type: self.desc.heap_type,
            num_descriptors: self.desc.num_descriptors,
            shader_visible: self.desc.shader_visible,
            slots: self
                .slots
                .iter()
                .map(|(index, slot)| DescriptorSlotState {
                    index: *index,
                    call_id: slot.call_id,
                    parameters: slot.parameters.clone(),
                    resources: slot.resources.clone(),
                })
                .collect(),
        }
    }
}

// ── Queues, command lists, fences ───────────────────────────

#[derive(Debug, Clone)]
pub struct CommandQueueInfo {
    pub queue_type: CommandListType,
    pub submissions: u64,
}

/// A command recorded into a list, with the objects it references.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackedCommand {
    pub call_id: ApiCallId,
    pub parameters: Vec<u8>,
    pub handles: Vec<HandleId>,
}

#[derive(Debug, Clone)]
pub struct CommandListInfo {
    pub list_type: CommandListType,
    pub allocator: Option<HandleId>,
    pub closed: bool,
    /// Commands recorded since the last reset.
    pub commands: Vec<TrackedCommand>,
    /// Queue and queue submission number of the most recent execution.
    pub last_submission: Option<(HandleId, u64)>,
}

impl CommandListInfo {
    pub fn new(list_type: CommandListType, allocator: Option<HandleId>, closed: bool) -> Self {
        Self {
            list_type,
            allocator,
            closed,
            commands: Vec::new(),
            last_submission: None,
        }
    }

    fn to_state(&self) -> CommandListState {
        CommandListState {
            list_type: self.list_type,
            allocator: self.allocator,
            closed: self.closed,
            commands: self
                .commands
                .iter()
                .map(|c| CommandState {
                    call_id: c.call_id,
                    parameters: c.parameters.clone(),
                    handles: c.handles.clone(),
                })
                .collect(),
            last_submission: self.last_submission,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FenceInfo {
    /// Highest value signaled from the CPU or requested on a queue.
    pub last_signaled_value: u64,
    /// fence value -> event handles waiting for it
    pub pending_events: BTreeMap<u64, Vec<u64>>,
}

impl FenceInfo {
    pub fn new(initial_value: u64) -> Self {
        Self {
            last_signaled_value: initial_value,
            pending_events: BTreeMap::new(),
        }
    }

    /// Record a signal; events waiting on values at or below it have fired.
    pub fn signal(&mut self, value: u64) {
        self.last_signaled_value = self.last_signaled_value.max(value);
        match value.checked_add(1) {
            Some(next) => self.pending_events = self.pending_events.split_off(&next),
            None => self.pending_events.clear(),
        }
    }

    fn to_state(&self) -> FenceState {
        FenceState {
            last_signaled_value: self.last_signaled_value,
            pending_events: self
                .pending_events
                .iter()
                .flat_map(|(value, events)| events.iter().map(move |e| (*value, *e)))
                .collect(),
        }
    }
}

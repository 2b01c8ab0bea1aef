//! Shared fixtures: an in-process fake driver and a manager wired to it.

#![allow(dead_code)]

use std::collections::HashMap;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use dxcap_core::config::{CaptureConfig, CaptureModeSetting, MemoryTrackingMode};
use dxcap_encode::object_info::ObjectInfo;
use dxcap_encode::{
    CaptureManager, DeviceDispatch, FrameRenderer, MemoryTraceSink, PresentDispatch, RenderError,
    WriteWatch,
};
use dxcap_protocol::format::{
    CpuDescriptorHandle, DescriptorHeapType, GpuDescriptorHandle, HResult, HeapDesc, HeapFlags,
    HeapProperties, ResourceDesc, ResourceStates, SwapChainDesc,
};
use dxcap_protocol::{ApiCallId, HandleId, NativeHandle, ObjectKind};

/// Driver stand-in. Hands out fresh native handles and remembers what it
/// was asked to create.
pub struct FakeDriver {
    next_handle: AtomicU64,
    /// Heap properties and flags each committed resource was created with.
    pub committed: Mutex<HashMap<NativeHandle, (HeapProperties, HeapFlags)>>,
    pub heaps: Mutex<HashMap<NativeHandle, HeapDesc>>,
    /// Simulates a driver that silently drops ALLOW_WRITE_WATCH.
    pub drop_write_watch: AtomicBool,
    swap_chains: Mutex<HashMap<NativeHandle, (SwapChainDesc, Vec<NativeHandle>)>>,
    pub debug_layer_calls: AtomicU32,
    pub dred_calls: AtomicU32,
}

impl FakeDriver {
    pub fn new() -> Self {
        Self {
            next_handle: AtomicU64::new(0x1000),
            committed: Mutex::new(HashMap::new()),
            heaps: Mutex::new(HashMap::new()),
            drop_write_watch: AtomicBool::new(false),
            swap_chains: Mutex::new(HashMap::new()),
            debug_layer_calls: AtomicU32::new(0),
            dred_calls: AtomicU32::new(0),
        }
    }

    pub fn new_handle(&self) -> NativeHandle {
        NativeHandle(self.next_handle.fetch_add(0x10, Ordering::Relaxed))
    }

    /// Native side of swapchain creation: allocates one buffer per count.
    pub fn create_swap_chain(&self, desc: &SwapChainDesc) -> NativeHandle {
        let swap_chain = self.new_handle();
        let buffers = (0..desc.buffer_count).map(|_| self.new_handle()).collect();
        self.swap_chains.lock().insert(swap_chain, (*desc, buffers));
        swap_chain
    }

    /// Native side of a successful resize: fresh buffers, 0 keeps the count.
    pub fn resize_swap_chain(&self, swap_chain: NativeHandle, buffer_count: u32, width: u32, height: u32) {
        let mut chains = self.swap_chains.lock();
        let Some((desc, buffers)) = chains.get_mut(&swap_chain) else {
            panic!("unknown swapchain {:#x}", swap_chain.0);
        };
        if buffer_count != 0 {
            desc.buffer_count = buffer_count;
        }
        if width != 0 {
            desc.width = width;
        }
        if height != 0 {
            desc.height = height;
        }
        *buffers = (0..desc.buffer_count)
            .map(|_| NativeHandle(self.next_handle.fetch_add(0x10, Ordering::Relaxed)))
            .collect();
    }

    pub fn swap_chain_buffers(&self, swap_chain: NativeHandle) -> Vec<NativeHandle> {
        self.swap_chains
            .lock()
            .get(&swap_chain)
            .map(|(_, b)| b.clone())
            .unwrap_or_default()
    }
}

impl DeviceDispatch for FakeDriver {
    fn create_committed_resource(
        &self,
        _device: NativeHandle,
        heap_properties: &HeapProperties,
        heap_flags: HeapFlags,
        _desc: &ResourceDesc,
        _initial_state: ResourceStates,
    ) -> Result<NativeHandle, HResult> {
        let handle = self.new_handle();
        let mut flags = heap_flags;
        if self.drop_write_watch.load(Ordering::Relaxed) {
            flags.remove(HeapFlags::ALLOW_WRITE_WATCH);
        }
        self.committed.lock().insert(handle, (*heap_properties, flags));
        Ok(handle)
    }

    fn create_heap(&self, _device: NativeHandle, desc: &HeapDesc) -> Result<NativeHandle, HResult> {
        let handle = self.new_handle();
        let mut stored = *desc;
        if self.drop_write_watch.load(Ordering::Relaxed) {
            stored.flags.remove(HeapFlags::ALLOW_WRITE_WATCH);
        }
        self.heaps.lock().insert(handle, stored);
        Ok(handle)
    }

    fn heap_properties(
        &self,
        resource: NativeHandle,
    ) -> Result<(HeapProperties, HeapFlags), HResult> {
        self.committed
            .lock()
            .get(&resource)
            .copied()
            .ok_or(HResult::E_INVALIDARG)
    }

    fn heap_desc(&self, heap: NativeHandle) -> HeapDesc {
        self.heaps.lock().get(&heap).copied().unwrap_or_default()
    }

    fn subresource_sizes(&self, _device: NativeHandle, desc: &ResourceDesc) -> Vec<u64> {
        let mips = desc.mip_count();
        (0..desc.subresource_count())
            .map(|i| {
                let mip = i % mips;
                let w = (desc.width >> mip).max(1);
                let h = u64::from((desc.height >> mip).max(1));
                w * h * 4
            })
            .collect()
    }

    fn descriptor_handle_increment_size(
        &self,
        _device: NativeHandle,
        heap_type: DescriptorHeapType,
    ) -> u32 {
        match heap_type {
            DescriptorHeapType::CbvSrvUav => 32,
            _ => 16,
        }
    }

    fn cpu_descriptor_handle_for_heap_start(&self, heap: NativeHandle) -> CpuDescriptorHandle {
        CpuDescriptorHandle(heap.0 << 16)
    }

    fn gpu_descriptor_handle_for_heap_start(&self, heap: NativeHandle) -> GpuDescriptorHandle {
        GpuDescriptorHandle((heap.0 << 16) | (1 << 48))
    }

    fn enable_debug_layer(&self) -> HResult {
        self.debug_layer_calls.fetch_add(1, Ordering::Relaxed);
        HResult::S_OK
    }

    fn enable_device_removed_diagnostics(&self) -> HResult {
        self.dred_calls.fetch_add(1, Ordering::Relaxed);
        HResult::S_OK
    }
}

impl PresentDispatch for FakeDriver {
    fn swap_chain_buffer(&self, swap_chain: NativeHandle, index: u32) -> Result<NativeHandle, HResult> {
        self.swap_chains
            .lock()
            .get(&swap_chain)
            .and_then(|(_, buffers)| buffers.get(index as usize).copied())
            .ok_or(HResult::DXGI_ERROR_INVALID_CALL)
    }

    fn swap_chain_desc(&self, swap_chain: NativeHandle) -> Result<SwapChainDesc, HResult> {
        self.swap_chains
            .lock()
            .get(&swap_chain)
            .map(|(desc, _)| *desc)
            .ok_or(HResult::DXGI_ERROR_INVALID_CALL)
    }
}

/// Write watch that reports preset ranges once.
#[derive(Default)]
pub struct ScriptedWriteWatch {
    pub ranges: Mutex<Option<Vec<Range<usize>>>>,
    pub queries: AtomicU32,
}

impl WriteWatch for ScriptedWriteWatch {
    fn take_written_ranges(&self, _base: usize, _size: usize) -> Option<Vec<Range<usize>>> {
        self.queries.fetch_add(1, Ordering::Relaxed);
        self.ranges.lock().take()
    }
}

/// Renderer that records what it was asked to capture.
#[derive(Default)]
pub struct RecordingRenderer {
    pub frames: Mutex<Vec<(HandleId, u32)>>,
    pub fail: AtomicBool,
}

impl FrameRenderer for RecordingRenderer {
    fn capture_frame(
        &self,
        swap_chain: HandleId,
        _native: NativeHandle,
        frame: u32,
    ) -> Result<(), RenderError> {
        self.frames.lock().push((swap_chain, frame));
        if self.fail.load(Ordering::Relaxed) {
            return Err(RenderError::Capture("scripted failure".to_string()));
        }
        Ok(())
    }
}

pub struct Harness {
    pub manager: CaptureManager,
    pub sink: Arc<MemoryTraceSink>,
    pub driver: Arc<FakeDriver>,
}

pub fn config(mode: CaptureModeSetting, tracking_mode: MemoryTrackingMode) -> CaptureConfig {
    let mut config = CaptureConfig::default();
    config.capture.mode = mode;
    config.memory.tracking_mode = tracking_mode;
    config
}

pub fn harness_with(config: CaptureConfig) -> Harness {
    harness_from(config, |manager| manager)
}

/// Harness whose manager is customized before dispatch installation.
pub fn harness_from(
    config: CaptureConfig,
    customize: impl FnOnce(CaptureManager) -> CaptureManager,
) -> Harness {
    build(config, None, customize)
}

pub fn harness_with_renderer(config: CaptureConfig, renderer: Arc<dyn FrameRenderer>) -> Harness {
    build(config, Some(renderer), |manager| manager)
}

fn build(
    config: CaptureConfig,
    renderer: Option<Arc<dyn FrameRenderer>>,
    customize: impl FnOnce(CaptureManager) -> CaptureManager,
) -> Harness {
    let sink = Arc::new(MemoryTraceSink::new());
    let driver = Arc::new(FakeDriver::new());
    let manager = customize(CaptureManager::new(config, sink.clone(), renderer));
    manager
        .init_device_dispatch(driver.clone())
        .expect("device dispatch");
    manager
        .init_present_dispatch(driver.clone())
        .expect("present dispatch");
    Harness {
        manager,
        sink,
        driver,
    }
}

pub fn harness() -> Harness {
    harness_with(config(
        CaptureModeSetting::WriteAndTrack,
        MemoryTrackingMode::Unassisted,
    ))
}

impl Harness {
    /// Register an object through the generic creation path.
    pub fn create(&self, call_id: ApiCallId, kind: ObjectKind, parent: Option<NativeHandle>) -> NativeHandle {
        let handle = self.driver.new_handle();
        let scope = self.manager.begin_call(call_id);
        scope.encode(|p| p.push_handle(handle));
        self.manager.end_create_call(
            scope,
            HResult::S_OK,
            kind,
            Some(handle),
            parent,
            ObjectInfo::Plain,
        );
        handle
    }

    pub fn create_device(&self) -> NativeHandle {
        self.create(ApiCallId::D3d12CreateDevice, ObjectKind::Device, None)
    }

    pub fn id_of(&self, native: NativeHandle) -> HandleId {
        self.manager
            .tracker()
            .and_then(|t| t.lookup(native))
            .map(|o| o.id)
            .unwrap_or(HandleId::NULL)
    }
}

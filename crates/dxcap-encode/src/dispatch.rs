//! Native dispatch tables.
//!
//! Only the entry points the capture layer calls on its own behalf appear
//! here; everything else is forwarded by the generated stubs. Tables are
//! installed once at initialization and never change afterwards.

use std::ops::Range;
use std::sync::{Arc, OnceLock};

use dxcap_protocol::format::{
    CpuDescriptorHandle, DescriptorHeapType, GpuDescriptorHandle, HResult, HeapDesc, HeapFlags,
    HeapProperties, ResourceDesc, ResourceStates, SwapChainDesc,
};
use dxcap_protocol::NativeHandle;

use crate::error::CaptureError;

/// Device-layer (D3D12) entry points.
pub trait DeviceDispatch: Send + Sync {
    fn create_committed_resource(
        &self,
        device: NativeHandle,
        heap_properties: &HeapProperties,
        heap_flags: HeapFlags,
        desc: &ResourceDesc,
        initial_state: ResourceStates,
    ) -> Result<NativeHandle, HResult>;

    fn create_heap(&self, device: NativeHandle, desc: &HeapDesc) -> Result<NativeHandle, HResult>;

    /// ID3D12Resource::GetHeapProperties
    fn heap_properties(
        &self,
        resource: NativeHandle,
    ) -> Result<(HeapProperties, HeapFlags), HResult>;

    /// ID3D12Heap::GetDesc
    fn heap_desc(&self, heap: NativeHandle) -> HeapDesc;

    /// Byte size of every subresource, as reported by GetCopyableFootprints.
    fn subresource_sizes(&self, device: NativeHandle, desc: &ResourceDesc) -> Vec<u64>;

    fn descriptor_handle_increment_size(
        &self,
        device: NativeHandle,
        heap_type: DescriptorHeapType,
    ) -> u32;

    fn cpu_descriptor_handle_for_heap_start(&self, heap: NativeHandle) -> CpuDescriptorHandle;

    fn gpu_descriptor_handle_for_heap_start(&self, heap: NativeHandle) -> GpuDescriptorHandle;

    fn enable_debug_layer(&self) -> HResult;

    fn enable_device_removed_diagnostics(&self) -> HResult;
}

/// Presentation-layer (DXGI) entry points.
pub trait PresentDispatch: Send + Sync {
    /// IDXGISwapChain::GetBuffer
    fn swap_chain_buffer(&self, swap_chain: NativeHandle, index: u32)
        -> Result<NativeHandle, HResult>;

    /// IDXGISwapChain::GetDesc
    fn swap_chain_desc(&self, swap_chain: NativeHandle) -> Result<SwapChainDesc, HResult>;
}

/// OS write-watch source for monitored allocations.
pub trait WriteWatch: Send + Sync {
    /// Byte ranges (relative to `base`) written since the previous call, then
    /// resets the watch. `None` means the OS could not report for this range.
    fn take_written_ranges(&self, base: usize, size: usize) -> Option<Vec<Range<usize>>>;
}

/// Write-watch source for platforms without one; every query falls back to
/// full-range capture.
pub struct NoWriteWatch;

impl WriteWatch for NoWriteWatch {
    fn take_written_ranges(&self, _base: usize, _size: usize) -> Option<Vec<Range<usize>>> {
        None
    }
}

/// Resolved dispatch tables, one per intercepted surface.
#[derive(Default)]
pub struct DispatchTables {
    device: OnceLock<Arc<dyn DeviceDispatch>>,
    present: OnceLock<Arc<dyn PresentDispatch>>,
}

impl DispatchTables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn init_device(&self, table: Arc<dyn DeviceDispatch>) -> Result<(), CaptureError> {
        self.device
            .set(table)
            .map_err(|_| CaptureError::DispatchAlreadyInitialized("device"))
    }

    pub fn init_present(&self, table: Arc<dyn PresentDispatch>) -> Result<(), CaptureError> {
        self.present
            .set(table)
            .map_err(|_| CaptureError::DispatchAlreadyInitialized("present"))
    }

    pub fn device(&self) -> Result<&dyn DeviceDispatch, CaptureError> {
        self.device
            .get()
            .map(|t| t.as_ref())
            .ok_or(CaptureError::DispatchNotInitialized("device"))
    }

    pub fn present(&self) -> Result<&dyn PresentDispatch, CaptureError> {
        self.present
            .get()
            .map(|t| t.as_ref())
            .ok_or(CaptureError::DispatchNotInitialized("present"))
    }
}

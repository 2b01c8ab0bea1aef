use serde::{Deserialize, Serialize};

/// Capture-side identifier of a tracked API object.
/// Assigned by the capture layer, stable for the object's capture-visible
/// lifetime and never reused within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default,
         Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct HandleId(pub u64);

impl HandleId {
    /// The id written for absent object references.
    pub const NULL: HandleId = HandleId(0);

    pub fn is_null(&self) -> bool {
        self.0 == 0
    }
}

impl std::fmt::Display for HandleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Raw native interface pointer value, as handed to the application.
/// The capture layer treats it as an opaque key and never dereferences it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default,
         bytemuck::Pod, bytemuck::Zeroable)]
#[repr(transparent)]
pub struct NativeHandle(pub u64);

impl NativeHandle {
    pub const NULL: NativeHandle = NativeHandle(0);

    pub fn is_null(&self) -> bool {
        self.0 == 0
    }

    pub fn from_ptr<T>(ptr: *const T) -> Self {
        NativeHandle(ptr as usize as u64)
    }
}

/// Capture thread identifier. Allocated sequentially on a thread's first
/// intercepted call, unrelated to OS thread ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default,
         Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct ThreadId(pub u32);

/// Interface family of a tracked object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub enum ObjectKind {
    // DXGI objects
    Factory,
    Adapter,
    SwapChain,

    // D3D12 objects
    Device,
    CommandQueue,
    CommandAllocator,
    CommandList,
    Resource,
    Heap,
    DescriptorHeap,
    Fence,
    PipelineState,
    RootSignature,
    QueryHeap,
    ProtectedSession,
    Debug,
    DredSettings,
}

impl ObjectKind {
    /// Whether objects of this kind own GPU-visible memory.
    pub fn is_pageable(&self) -> bool {
        matches!(
            self,
            ObjectKind::Resource
                | ObjectKind::Heap
                | ObjectKind::DescriptorHeap
                | ObjectKind::QueryHeap
                | ObjectKind::PipelineState
        )
    }
}

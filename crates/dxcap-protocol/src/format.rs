//! Native API value types mirrored by the capture layer.
//!
//! These follow the D3D12/DXGI definitions closely enough that a forwarding
//! stub can convert its arguments with plain field copies. Raw values are kept
//! where the driver may hand back values outside the documented set.

use serde::{Deserialize, Serialize};

use crate::handle::NativeHandle;

/// Subresource index meaning "every subresource of the resource".
pub const ALL_SUBRESOURCES: u32 = 0xffff_ffff;

// ── Result codes ────────────────────────────────────────────

/// Native result code (HRESULT).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HResult(pub i32);

impl HResult {
    pub const S_OK: HResult = HResult(0);
    pub const S_FALSE: HResult = HResult(1);
    pub const E_FAIL: HResult = HResult(0x8000_4005_u32 as i32);
    pub const E_INVALIDARG: HResult = HResult(0x8007_0057_u32 as i32);
    pub const E_OUTOFMEMORY: HResult = HResult(0x8007_000E_u32 as i32);
    pub const DXGI_ERROR_INVALID_CALL: HResult = HResult(0x887A_0001_u32 as i32);
    pub const DXGI_ERROR_DEVICE_REMOVED: HResult = HResult(0x887A_0005_u32 as i32);

    pub fn succeeded(&self) -> bool {
        self.0 >= 0
    }

    pub fn failed(&self) -> bool {
        self.0 < 0
    }
}

impl std::fmt::Display for HResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:08X}", self.0 as u32)
    }
}

// ── Heaps ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub enum HeapType {
    #[default]
    Default,
    Upload,
    Readback,
    Custom,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub enum CpuPageProperty {
    #[default]
    Unknown,
    NotAvailable,
    WriteCombine,
    WriteBack,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub enum MemoryPool {
    #[default]
    Unknown,
    L0,
    L1,
}

bitflags::bitflags! {
    /// D3D12_HEAP_FLAGS
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct HeapFlags: u32 {
        const SHARED                  = 0x1;
        const DENY_BUFFERS            = 0x4;
        const ALLOW_DISPLAY           = 0x8;
        const SHARED_CROSS_ADAPTER    = 0x20;
        const DENY_RT_DS_TEXTURES     = 0x40;
        const DENY_NON_RT_DS_TEXTURES = 0x80;
        const HARDWARE_PROTECTED      = 0x100;
        const ALLOW_WRITE_WATCH       = 0x200;
        const ALLOW_SHADER_ATOMICS    = 0x400;
        const CREATE_NOT_RESIDENT     = 0x800;
        const CREATE_NOT_ZEROED       = 0x1000;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeapProperties {
    pub heap_type: HeapType,
    pub cpu_page_property: CpuPageProperty,
    pub memory_pool_preference: MemoryPool,
    pub creation_node_mask: u32,
    pub visible_node_mask: u32,
}

impl HeapProperties {
    pub fn of_type(heap_type: HeapType) -> Self {
        Self {
            heap_type,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeapDesc {
    pub size_in_bytes: u64,
    pub properties: HeapProperties,
    pub alignment: u64,
    pub flags: HeapFlags,
}

// ── Resources ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub enum ResourceDimension {
    #[default]
    Unknown,
    Buffer,
    Texture1D,
    Texture2D,
    Texture3D,
}

/// DXGI_FORMAT, kept as the raw enumerant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Format(pub u32);

impl Format {
    pub const UNKNOWN: Format = Format(0);
    pub const R8G8B8A8_UNORM: Format = Format(28);
    pub const B8G8R8A8_UNORM: Format = Format(87);
    pub const R16G16B16A16_FLOAT: Format = Format(10);
    pub const R10G10B10A2_UNORM: Format = Format(24);
    pub const R32G8X24_TYPELESS: Format = Format(19);
    pub const D32_FLOAT_S8X24_UINT: Format = Format(20);
    pub const D32_FLOAT: Format = Format(40);
    pub const R24G8_TYPELESS: Format = Format(44);
    pub const D24_UNORM_S8_UINT: Format = Format(45);
    pub const NV12: Format = Format(103);
    pub const P010: Format = Format(104);
    pub const P016: Format = Format(105);
    pub const NV11: Format = Format(110);

    /// Planes per subresource: depth plus stencil for the combined
    /// depth-stencil formats, luma plus chroma for the planar video formats.
    pub fn plane_count(&self) -> u32 {
        match *self {
            Format::R32G8X24_TYPELESS
            | Format::D32_FLOAT_S8X24_UINT
            | Format::R24G8_TYPELESS
            | Format::D24_UNORM_S8_UINT
            | Format::NV12
            | Format::P010
            | Format::P016
            | Format::NV11 => 2,
            _ => 1,
        }
    }
}

bitflags::bitflags! {
    /// D3D12_RESOURCE_STATES. `COMMON` and `PRESENT` share the zero value.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ResourceStates: u32 {
        const VERTEX_AND_CONSTANT_BUFFER = 0x1;
        const INDEX_BUFFER               = 0x2;
        const RENDER_TARGET              = 0x4;
        const UNORDERED_ACCESS           = 0x8;
        const DEPTH_WRITE                = 0x10;
        const DEPTH_READ                 = 0x20;
        const NON_PIXEL_SHADER_RESOURCE  = 0x40;
        const PIXEL_SHADER_RESOURCE      = 0x80;
        const STREAM_OUT                 = 0x100;
        const INDIRECT_ARGUMENT          = 0x200;
        const COPY_DEST                  = 0x400;
        const COPY_SOURCE                = 0x800;
        const RESOLVE_DEST               = 0x1000;
        const RESOLVE_SOURCE             = 0x2000;
        const GENERIC_READ = 0x1 | 0x2 | 0x40 | 0x80 | 0x200 | 0x800;
    }
}

impl ResourceStates {
    pub const COMMON: ResourceStates = ResourceStates::empty();
    pub const PRESENT: ResourceStates = ResourceStates::empty();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResourceDesc {
    pub dimension: ResourceDimension,
    pub alignment: u64,
    pub width: u64,
    pub height: u32,
    pub depth_or_array_size: u16,
    pub mip_levels: u16,
    pub format: Format,
    pub sample_count: u32,
    pub layout: u32,
    pub flags: u32,
}

impl ResourceDesc {
    pub fn buffer(width: u64) -> Self {
        Self {
            dimension: ResourceDimension::Buffer,
            width,
            height: 1,
            depth_or_array_size: 1,
            mip_levels: 1,
            sample_count: 1,
            ..Default::default()
        }
    }

    pub fn texture_2d(width: u64, height: u32, format: Format, mip_levels: u16) -> Self {
        Self {
            dimension: ResourceDimension::Texture2D,
            width,
            height,
            depth_or_array_size: 1,
            mip_levels,
            format,
            sample_count: 1,
            ..Default::default()
        }
    }

    /// Mip levels the resource actually has. `mip_levels == 0` asks the
    /// driver for the full chain down to 1x1(x1).
    pub fn mip_count(&self) -> u32 {
        if self.dimension == ResourceDimension::Buffer {
            return 1;
        }
        if self.mip_levels > 0 {
            return u32::from(self.mip_levels);
        }
        let depth = match self.dimension {
            ResourceDimension::Texture3D => u64::from(self.depth_or_array_size),
            _ => 1,
        };
        let largest = self.width.max(u64::from(self.height)).max(depth).max(1);
        largest.ilog2() + 1
    }

    pub fn array_size(&self) -> u32 {
        match self.dimension {
            ResourceDimension::Texture3D | ResourceDimension::Buffer => 1,
            _ => u32::from(self.depth_or_array_size.max(1)),
        }
    }

    /// Number of subresources: mips x array slices x planes, indexed
    /// `mip + slice * mips + plane * mips * slices`.
    pub fn subresource_count(&self) -> u32 {
        let planes = match self.dimension {
            ResourceDimension::Buffer => 1,
            _ => self.format.plane_count(),
        };
        self.mip_count() * self.array_size() * planes
    }
}

bitflags::bitflags! {
    /// D3D12_RESOURCE_BARRIER_FLAGS
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct BarrierFlags: u32 {
        const BEGIN_ONLY = 0x1;
        const END_ONLY   = 0x2;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceBarrier {
    Transition {
        resource: NativeHandle,
        subresource: u32,
        before: ResourceStates,
        after: ResourceStates,
        flags: BarrierFlags,
    },
    Aliasing {
        before: NativeHandle,
        after: NativeHandle,
    },
    Uav {
        resource: NativeHandle,
    },
}

impl ResourceBarrier {
    pub fn transition(
        resource: NativeHandle,
        before: ResourceStates,
        after: ResourceStates,
    ) -> Self {
        ResourceBarrier::Transition {
            resource,
            subresource: ALL_SUBRESOURCES,
            before,
            after,
            flags: BarrierFlags::empty(),
        }
    }
}

/// D3D12_RANGE
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemoryRange {
    pub begin: u64,
    pub end: u64,
}

impl MemoryRange {
    pub fn is_empty(&self) -> bool {
        self.end <= self.begin
    }
}

/// D3D12_RESIDENCY_PRIORITY
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResidencyPriority(pub u32);

impl ResidencyPriority {
    pub const MINIMUM: ResidencyPriority = ResidencyPriority(0x2800_0000);
    pub const LOW: ResidencyPriority = ResidencyPriority(0x5000_0000);
    pub const NORMAL: ResidencyPriority = ResidencyPriority(0x7800_0000);
    pub const HIGH: ResidencyPriority = ResidencyPriority(0xa000_0000);
    pub const MAXIMUM: ResidencyPriority = ResidencyPriority(0xc800_0000);
}

// ── Tiled resources ─────────────────────────────────────────

/// D3D12_TILED_RESOURCE_COORDINATE
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct TiledResourceCoordinate {
    pub x: u32,
    pub y: u32,
    pub z: u32,
    pub subresource: u32,
}

/// D3D12_TILE_REGION_SIZE
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct TileRegionSize {
    pub num_tiles: u32,
    pub use_box: bool,
    pub width: u32,
    pub height: u16,
    pub depth: u16,
}

bitflags::bitflags! {
    /// D3D12_TILE_RANGE_FLAGS
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct TileRangeFlags: u32 {
        const NULL              = 0x1;
        const SKIP              = 0x2;
        const REUSE_SINGLE_TILE = 0x4;
    }
}

/// One heap range of an UpdateTileMappings call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TileRange {
    pub flags: TileRangeFlags,
    pub heap_start_offset: u32,
    pub tile_count: u32,
}

/// Private data key (REFGUID), as its 16 raw bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Guid(pub [u8; 16]);

// ── Queues and command lists ────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub enum CommandListType {
    #[default]
    Direct,
    Bundle,
    Compute,
    Copy,
    VideoDecode,
    VideoProcess,
    VideoEncode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CommandQueueDesc {
    pub queue_type: CommandListType,
    pub priority: i32,
    pub flags: u32,
    pub node_mask: u32,
}

// ── Descriptors ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub enum DescriptorHeapType {
    #[default]
    CbvSrvUav,
    Sampler,
    Rtv,
    Dsv,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DescriptorHeapDesc {
    pub heap_type: DescriptorHeapType,
    pub num_descriptors: u32,
    pub shader_visible: bool,
    pub node_mask: u32,
}

/// D3D12_CPU_DESCRIPTOR_HANDLE
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default,
         bytemuck::Pod, bytemuck::Zeroable)]
#[repr(transparent)]
pub struct CpuDescriptorHandle(pub u64);

impl CpuDescriptorHandle {
    pub fn offset(&self, index: u32, increment: u32) -> Self {
        CpuDescriptorHandle(self.0 + u64::from(index) * u64::from(increment))
    }
}

/// D3D12_GPU_DESCRIPTOR_HANDLE
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default,
         bytemuck::Pod, bytemuck::Zeroable)]
#[repr(transparent)]
pub struct GpuDescriptorHandle(pub u64);

// ── Presentation ────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub enum SwapEffect {
    #[default]
    Discard,
    Sequential,
    FlipSequential,
    FlipDiscard,
}

impl SwapEffect {
    /// Flip-model swapchains expose every buffer to the application;
    /// blit-model swapchains only expose buffer zero.
    pub fn is_flip_model(&self) -> bool {
        matches!(self, SwapEffect::FlipSequential | SwapEffect::FlipDiscard)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SwapChainDesc {
    pub width: u32,
    pub height: u32,
    pub format: Format,
    pub buffer_count: u32,
    pub swap_effect: SwapEffect,
    pub flags: u32,
}

bitflags::bitflags! {
    /// DXGI_PRESENT flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PresentFlags: u32 {
        const TEST                  = 0x1;
        const DO_NOT_SEQUENCE       = 0x2;
        const RESTART               = 0x4;
        const DO_NOT_WAIT           = 0x8;
        const ALLOW_TEARING         = 0x200;
    }
}

// ── Device removed extended data ────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub enum DredEnablement {
    #[default]
    SystemControlled,
    ForcedOff,
    ForcedOn,
}

use serde::{Deserialize, Serialize};

use crate::handle::ObjectHandle;

// ============================================================================
// Callback statuses
// ============================================================================

/// Outcome of a buffer map request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub enum MapAsyncStatus {
    Success,
    ValidationError,
    Unknown,
    DeviceLost,
    DestroyedBeforeCallback,
    UnmappedBeforeCallback,
    MappingAlreadyPending,
    OffsetOutOfRange,
    SizeOutOfRange,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub enum RequestAdapterStatus {
    Success,
    Unavailable,
    Error,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub enum RequestDeviceStatus {
    Success,
    Error,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub enum CreatePipelineAsyncStatus {
    Success,
    ValidationError,
    InternalError,
    DeviceLost,
    DeviceDestroyed,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub enum QueueWorkDoneStatus {
    Success,
    Error,
    Unknown,
    DeviceLost,
}

/// Outcome of popping an error scope. The captured error, if any, is
/// reported separately as an [`ErrorType`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub enum PopErrorScopeStatus {
    Success,
    /// No scope was pushed on the device.
    EmptyStack,
    DeviceLost,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub enum ErrorType {
    NoError,
    Validation,
    OutOfMemory,
    Internal,
    Unknown,
    DeviceLost,
}

/// Which errors an error scope captures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub enum ErrorFilter {
    Validation,
    OutOfMemory,
    Internal,
}

impl ErrorFilter {
    pub fn matches(self, error_type: ErrorType) -> bool {
        matches!(
            (self, error_type),
            (ErrorFilter::Validation, ErrorType::Validation)
                | (ErrorFilter::OutOfMemory, ErrorType::OutOfMemory)
                | (ErrorFilter::Internal, ErrorType::Internal)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub enum DeviceLostReason {
    Unknown,
    Destroyed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub enum LoggingType {
    Verbose,
    Info,
    Warning,
    Error,
}

/// Client-observable mapping state of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BufferMapState {
    Unmapped,
    Pending,
    Mapped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub enum MapMode {
    Read,
    Write,
}

bitflags::bitflags! {
    /// Buffer usage bits, carried on the wire as a raw `u32`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u32 {
        const MAP_READ  = 0x0001;
        const MAP_WRITE = 0x0002;
        const COPY_SRC  = 0x0004;
        const COPY_DST  = 0x0008;
        const INDEX     = 0x0010;
        const VERTEX    = 0x0020;
        const UNIFORM   = 0x0040;
        const STORAGE   = 0x0080;
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TextureUsage: u32 {
        const COPY_SRC          = 0x01;
        const COPY_DST          = 0x02;
        const TEXTURE_BINDING   = 0x04;
        const STORAGE_BINDING   = 0x08;
        const RENDER_ATTACHMENT = 0x10;
    }
}

// ============================================================================
// Descriptors
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct BufferDescriptor {
    pub label: Option<String>,
    pub size: u64,
    /// Raw [`BufferUsage`] bits.
    pub usage: u32,
    pub mapped_at_creation: bool,
}

impl BufferDescriptor {
    pub fn new(size: u64, usage: BufferUsage) -> Self {
        Self {
            label: None,
            size,
            usage: usage.bits(),
            mapped_at_creation: false,
        }
    }

    pub fn usage(&self) -> BufferUsage {
        BufferUsage::from_bits_truncate(self.usage)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub enum TextureFormat {
    Rgba8Unorm,
    Bgra8Unorm,
    R32Float,
    Depth24Plus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct Extent3d {
    pub width: u32,
    pub height: u32,
    pub depth_or_array_layers: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct TextureDescriptor {
    pub label: Option<String>,
    pub size: Extent3d,
    pub format: TextureFormat,
    /// Raw [`TextureUsage`] bits.
    pub usage: u32,
    pub mip_level_count: u32,
    pub sample_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct ShaderModuleDescriptor {
    pub label: Option<String>,
    pub code: String,
}

/// Compute pipeline descriptor with its shader module resolved to a handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct SerializedComputePipelineDescriptor {
    pub label: Option<String>,
    pub module: ObjectHandle,
    pub entry_point: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub enum PowerPreference {
    #[default]
    Undefined,
    LowPower,
    HighPerformance,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct RequestAdapterOptions {
    pub power_preference: PowerPreference,
    pub force_fallback_adapter: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct DeviceDescriptor {
    pub label: Option<String>,
    pub required_limits: Option<Limits>,
}

// ============================================================================
// Adapter and device properties
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub enum BackendType {
    Null,
    Vulkan,
    Metal,
    D3d12,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub enum AdapterType {
    DiscreteGpu,
    IntegratedGpu,
    Cpu,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct AdapterInfo {
    pub vendor: String,
    pub architecture: String,
    pub device: String,
    pub description: String,
    pub backend_type: BackendType,
    pub adapter_type: AdapterType,
    pub vendor_id: u32,
    pub device_id: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct Limits {
    pub max_texture_dimension_2d: u32,
    pub max_bind_groups: u32,
    pub max_buffer_size: u64,
    pub max_storage_buffer_binding_size: u64,
    pub max_compute_workgroup_size_x: u32,
    pub max_compute_invocations_per_workgroup: u32,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_texture_dimension_2d: 8192,
            max_bind_groups: 4,
            max_buffer_size: 256 * 1024 * 1024,
            max_storage_buffer_binding_size: 128 * 1024 * 1024,
            max_compute_workgroup_size_x: 256,
            max_compute_invocations_per_workgroup: 256,
        }
    }
}

use serde::{Deserialize, Serialize};

use crate::handle::{ObjectHandle, ObjectType};
use crate::types::*;

/// Serial number tagging an asynchronous request. Allocated by the client,
/// echoed back by the server in the matching return command.
pub type RequestSerial = u64;

/// A command travelling from the client to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub enum Command {
    // ── Object lifetime ─────────────────────────────────────
    /// The client dropped its last reference to the object.
    DestroyObject {
        object_type: ObjectType,
        handle: ObjectHandle,
    },

    // ── Instance and adapter ────────────────────────────────
    InstanceRequestAdapter {
        instance: ObjectHandle,
        request_serial: RequestSerial,
        /// Pre-allocated client handle for the adapter.
        adapter: ObjectHandle,
        options: RequestAdapterOptions,
    },
    AdapterRequestDevice {
        adapter: ObjectHandle,
        request_serial: RequestSerial,
        /// Pre-allocated client handle for the device.
        device: ObjectHandle,
        descriptor: DeviceDescriptor,
    },

    // ── Device ──────────────────────────────────────────────
    DeviceCreateBuffer {
        device: ObjectHandle,
        buffer: ObjectHandle,
        descriptor: BufferDescriptor,
        /// Write handle create info when the buffer is mapped at creation.
        write_handle_create_info: Option<Vec<u8>>,
    },
    DeviceCreateTexture {
        device: ObjectHandle,
        texture: ObjectHandle,
        descriptor: TextureDescriptor,
    },
    DeviceCreateShaderModule {
        device: ObjectHandle,
        shader_module: ObjectHandle,
        descriptor: ShaderModuleDescriptor,
    },
    DeviceCreateComputePipelineAsync {
        device: ObjectHandle,
        request_serial: RequestSerial,
        pipeline: ObjectHandle,
        descriptor: SerializedComputePipelineDescriptor,
    },
    DeviceGetQueue {
        device: ObjectHandle,
        queue: ObjectHandle,
    },
    DeviceDestroy {
        device: ObjectHandle,
    },
    DeviceInjectError {
        device: ObjectHandle,
        error_type: ErrorType,
        message: String,
    },
    DevicePushErrorScope {
        device: ObjectHandle,
        filter: ErrorFilter,
    },
    DevicePopErrorScope {
        device: ObjectHandle,
        request_serial: RequestSerial,
    },

    // ── Buffer ──────────────────────────────────────────────
    BufferMapAsync {
        buffer: ObjectHandle,
        request_serial: RequestSerial,
        mode: MapMode,
        offset: u64,
        size: u64,
        /// Serialized create info of the client read or write handle.
        handle_create_info: Vec<u8>,
    },
    /// Contents of a write mapping, pushed before unmap.
    BufferUpdateMappedData {
        buffer: ObjectHandle,
        /// Relative to the start of the mapping.
        offset: u64,
        size: u64,
        data_update_info: Vec<u8>,
    },
    BufferUnmap {
        buffer: ObjectHandle,
    },
    BufferDestroy {
        buffer: ObjectHandle,
    },

    // ── Queue ───────────────────────────────────────────────
    QueueWriteBuffer {
        queue: ObjectHandle,
        buffer: ObjectHandle,
        buffer_offset: u64,
        data: Vec<u8>,
    },
    QueueOnSubmittedWorkDone {
        queue: ObjectHandle,
        request_serial: RequestSerial,
    },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::DestroyObject { .. } => "DestroyObject",
            Command::InstanceRequestAdapter { .. } => "InstanceRequestAdapter",
            Command::AdapterRequestDevice { .. } => "AdapterRequestDevice",
            Command::DeviceCreateBuffer { .. } => "DeviceCreateBuffer",
            Command::DeviceCreateTexture { .. } => "DeviceCreateTexture",
            Command::DeviceCreateShaderModule { .. } => "DeviceCreateShaderModule",
            Command::DeviceCreateComputePipelineAsync { .. } => "DeviceCreateComputePipelineAsync",
            Command::DeviceGetQueue { .. } => "DeviceGetQueue",
            Command::DeviceDestroy { .. } => "DeviceDestroy",
            Command::DeviceInjectError { .. } => "DeviceInjectError",
            Command::DevicePushErrorScope { .. } => "DevicePushErrorScope",
            Command::DevicePopErrorScope { .. } => "DevicePopErrorScope",
            Command::BufferMapAsync { .. } => "BufferMapAsync",
            Command::BufferUpdateMappedData { .. } => "BufferUpdateMappedData",
            Command::BufferUnmap { .. } => "BufferUnmap",
            Command::BufferDestroy { .. } => "BufferDestroy",
            Command::QueueWriteBuffer { .. } => "QueueWriteBuffer",
            Command::QueueOnSubmittedWorkDone { .. } => "QueueOnSubmittedWorkDone",
        }
    }
}

/// A command travelling from the server back to the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub enum ReturnCommand {
    // ── Device notifications ────────────────────────────────
    DeviceUncapturedError {
        device: ObjectHandle,
        error_type: ErrorType,
        message: String,
    },
    DeviceLogging {
        device: ObjectHandle,
        logging_type: LoggingType,
        message: String,
    },
    DeviceLost {
        device: ObjectHandle,
        reason: DeviceLostReason,
        message: String,
    },

    // ── Async completions ───────────────────────────────────
    InstanceRequestAdapterCallback {
        instance: ObjectHandle,
        request_serial: RequestSerial,
        status: RequestAdapterStatus,
        message: String,
        /// Present on success.
        info: Option<AdapterInfo>,
    },
    AdapterRequestDeviceCallback {
        adapter: ObjectHandle,
        request_serial: RequestSerial,
        status: RequestDeviceStatus,
        message: String,
        /// Present on success.
        limits: Option<Limits>,
    },
    DeviceCreateComputePipelineAsyncCallback {
        device: ObjectHandle,
        request_serial: RequestSerial,
        status: CreatePipelineAsyncStatus,
        message: String,
    },
    DevicePopErrorScopeCallback {
        device: ObjectHandle,
        request_serial: RequestSerial,
        status: PopErrorScopeStatus,
        /// `NoError` when the scope captured nothing.
        error_type: ErrorType,
        message: String,
    },
    BufferMapAsyncCallback {
        buffer: ObjectHandle,
        request_serial: RequestSerial,
        status: MapAsyncStatus,
        message: String,
        /// Serialized read handle update on a successful read mapping.
        read_data_update_info: Option<Vec<u8>>,
    },
    QueueWorkDoneCallback {
        queue: ObjectHandle,
        request_serial: RequestSerial,
        status: QueueWorkDoneStatus,
    },
}

impl ReturnCommand {
    pub fn name(&self) -> &'static str {
        match self {
            ReturnCommand::DeviceUncapturedError { .. } => "DeviceUncapturedError",
            ReturnCommand::DeviceLogging { .. } => "DeviceLogging",
            ReturnCommand::DeviceLost { .. } => "DeviceLost",
            ReturnCommand::InstanceRequestAdapterCallback { .. } => "InstanceRequestAdapterCallback",
            ReturnCommand::AdapterRequestDeviceCallback { .. } => "AdapterRequestDeviceCallback",
            ReturnCommand::DeviceCreateComputePipelineAsyncCallback { .. } => {
                "DeviceCreateComputePipelineAsyncCallback"
            }
            ReturnCommand::DevicePopErrorScopeCallback { .. } => "DevicePopErrorScopeCallback",
            ReturnCommand::BufferMapAsyncCallback { .. } => "BufferMapAsyncCallback",
            ReturnCommand::QueueWorkDoneCallback { .. } => "QueueWorkDoneCallback",
        }
    }
}

use gpuwire_protocol::types::{
    AdapterInfo, BufferDescriptor, CreatePipelineAsyncStatus, DeviceDescriptor, DeviceLostReason, ErrorFilter,
    ErrorType, Limits, LoggingType, MapAsyncStatus, MapMode, PopErrorScopeStatus, QueueWorkDoneStatus,
    RequestAdapterOptions, RequestAdapterStatus, RequestDeviceStatus, ShaderModuleDescriptor, TextureDescriptor,
};
use gpuwire_protocol::ObjectType;

/// Opaque reference to an object owned by a [`Backend`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NativeHandle(pub u64);

impl std::fmt::Display for NativeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "native#{}", self.0)
    }
}

pub type NativeRequestAdapterCallback = Box<dyn FnOnce(RequestAdapterStatus, Option<NativeHandle>, &str)>;
pub type NativeRequestDeviceCallback = Box<dyn FnOnce(RequestDeviceStatus, Option<NativeHandle>, &str)>;
pub type NativeCreatePipelineCallback = Box<dyn FnOnce(CreatePipelineAsyncStatus, Option<NativeHandle>, &str)>;
pub type NativeMapCallback = Box<dyn FnOnce(MapAsyncStatus, &str)>;
pub type NativeWorkDoneCallback = Box<dyn FnOnce(QueueWorkDoneStatus)>;
pub type NativePopErrorScopeCallback = Box<dyn FnOnce(PopErrorScopeStatus, ErrorType, &str)>;
pub type NativeErrorCallback = Box<dyn FnMut(ErrorType, &str)>;
pub type NativeLoggingCallback = Box<dyn FnMut(LoggingType, &str)>;
pub type NativeDeviceLostCallback = Box<dyn FnOnce(DeviceLostReason, &str)>;

/// The GPU implementation the server drives.
///
/// Native objects are reference counted: every handle the backend returns
/// from a creation call carries one reference owned by the caller.
/// Asynchronous callbacks may run inside the call that registered them or
/// later from [`tick`](Backend::tick); they never re-enter the server.
pub trait Backend {
    fn add_ref(&mut self, object_type: ObjectType, native: NativeHandle);
    fn release(&mut self, object_type: ObjectType, native: NativeHandle);

    fn instance_request_adapter(
        &mut self,
        instance: NativeHandle,
        options: &RequestAdapterOptions,
        callback: NativeRequestAdapterCallback,
    );
    fn adapter_info(&mut self, adapter: NativeHandle) -> AdapterInfo;
    fn adapter_request_device(
        &mut self,
        adapter: NativeHandle,
        descriptor: &DeviceDescriptor,
        callback: NativeRequestDeviceCallback,
    );

    fn device_limits(&mut self, device: NativeHandle) -> Limits;
    /// `None` produces an error object.
    fn device_create_buffer(&mut self, device: NativeHandle, descriptor: &BufferDescriptor) -> Option<NativeHandle>;
    fn device_create_texture(&mut self, device: NativeHandle, descriptor: &TextureDescriptor) -> Option<NativeHandle>;
    fn device_create_shader_module(
        &mut self,
        device: NativeHandle,
        descriptor: &ShaderModuleDescriptor,
    ) -> Option<NativeHandle>;
    fn device_create_compute_pipeline_async(
        &mut self,
        device: NativeHandle,
        module: NativeHandle,
        entry_point: &str,
        callback: NativeCreatePipelineCallback,
    );
    /// Returns a new reference to the device's queue.
    fn device_get_queue(&mut self, device: NativeHandle) -> NativeHandle;
    fn device_destroy(&mut self, device: NativeHandle);
    fn device_inject_error(&mut self, device: NativeHandle, error_type: ErrorType, message: &str);
    fn device_push_error_scope(&mut self, device: NativeHandle, filter: ErrorFilter);
    /// The scope is popped when this is called; `callback` reports the
    /// first error it captured.
    fn device_pop_error_scope(&mut self, device: NativeHandle, callback: NativePopErrorScopeCallback);
    fn device_set_uncaptured_error_callback(&mut self, device: NativeHandle, callback: Option<NativeErrorCallback>);
    fn device_set_logging_callback(&mut self, device: NativeHandle, callback: Option<NativeLoggingCallback>);
    fn device_set_device_lost_callback(&mut self, device: NativeHandle, callback: Option<NativeDeviceLostCallback>);

    fn buffer_map_async(
        &mut self,
        buffer: NativeHandle,
        mode: MapMode,
        offset: u64,
        size: u64,
        callback: NativeMapCallback,
    );
    /// Run `f` over `size` mapped bytes at `offset`. Returns `false` when the
    /// range is not mapped.
    fn buffer_with_mapped_range(
        &mut self,
        buffer: NativeHandle,
        offset: u64,
        size: u64,
        f: &mut dyn FnMut(&mut [u8]),
    ) -> bool;
    fn buffer_unmap(&mut self, buffer: NativeHandle);
    fn buffer_destroy(&mut self, buffer: NativeHandle);

    fn queue_write_buffer(&mut self, queue: NativeHandle, buffer: NativeHandle, buffer_offset: u64, data: &[u8]);
    fn queue_on_submitted_work_done(&mut self, queue: NativeHandle, callback: NativeWorkDoneCallback);

    /// Make progress on outstanding asynchronous work.
    fn tick(&mut self) {}
}

use gpuwire_protocol::types::{
    BufferDescriptor, CreatePipelineAsyncStatus, DeviceLostReason, ErrorFilter, ErrorType, Limits, LoggingType,
    MapAsyncStatus, PopErrorScopeStatus, SerializedComputePipelineDescriptor, ShaderModuleDescriptor,
    TextureDescriptor,
};
use gpuwire_protocol::{Command, ObjectHandle, ObjectType, RequestSerial};
use tracing::{debug, info, warn};

use crate::buffer::{BufferState, MapHandle, Mapping};
use crate::client::{Client, DeferredCallbacks, CONNECTION_LOST_MESSAGE};
use crate::error::ClientError;
use crate::memory_transfer::{MemoryTransferService, WriteHandle};
use crate::objects::{Adapter, Buffer, ChildState, ComputePipeline, Device, Queue, ShaderModule, Texture, WireObject};
use crate::queue::QueueState;
use crate::request_tracker::RequestTracker;

pub type ErrorCallback = Box<dyn FnMut(ErrorType, &str)>;

pub type LoggingCallback = Box<dyn FnMut(LoggingType, &str)>;

/// Fires at most once per device.
pub type DeviceLostCallback<M> = Box<dyn FnOnce(&mut Client<M>, Device, DeviceLostReason, &str)>;

pub type CreateComputePipelineCallback<M> =
    Box<dyn FnOnce(&mut Client<M>, CreatePipelineAsyncStatus, Option<ComputePipeline>, &str)>;

/// Receives the first error the popped scope captured, or `NoError`.
pub type PopErrorScopeCallback<M> = Box<dyn FnOnce(&mut Client<M>, PopErrorScopeStatus, ErrorType, &str)>;

/// Message passed to the lost callback when the last reference to a live
/// device is released.
pub const DEVICE_DESTROYED_MESSAGE: &str = "Device was destroyed.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComputePipelineDescriptor {
    pub label: Option<String>,
    pub module: ShaderModule,
    pub entry_point: String,
}

pub(crate) struct PipelineRequest<M: MemoryTransferService> {
    pipeline: ObjectHandle,
    callback: CreateComputePipelineCallback<M>,
}

pub(crate) struct DeviceState<M: MemoryTransferService> {
    pub(crate) refcount: u32,
    adapter: Option<ObjectHandle>,
    pub(crate) limits: Limits,
    queue: Option<ObjectHandle>,
    lost: bool,
    /// Orders the lost callback among pending requests on disconnect.
    lost_serial: RequestSerial,
    error_callback: Option<ErrorCallback>,
    logging_callback: Option<LoggingCallback>,
    lost_callback: Option<DeviceLostCallback<M>>,
    pipeline_requests: RequestTracker<PipelineRequest<M>>,
    error_scope_requests: RequestTracker<PopErrorScopeCallback<M>>,
}

impl<M: MemoryTransferService> DeviceState<M> {
    pub(crate) fn new(adapter: Option<ObjectHandle>, lost_serial: RequestSerial) -> Self {
        Self {
            refcount: 1,
            adapter,
            limits: Limits::default(),
            queue: None,
            lost: false,
            lost_serial,
            error_callback: None,
            logging_callback: None,
            lost_callback: None,
            pipeline_requests: RequestTracker::default(),
            error_scope_requests: RequestTracker::default(),
        }
    }

    /// Mark the device lost and detach its lost callback, if it had one.
    fn take_lost_callback(&mut self) -> Option<DeviceLostCallback<M>> {
        if self.lost {
            return None;
        }
        self.lost = true;
        self.error_callback = None;
        self.lost_callback.take()
    }

    fn cancel_pipelines(
        &mut self,
        status: CreatePipelineAsyncStatus,
        message: &str,
        orphans: &mut Vec<(ObjectType, ObjectHandle)>,
        deferred: &mut DeferredCallbacks<M>,
    ) {
        for (serial, request) in self.pipeline_requests.drain() {
            orphans.push((ObjectType::ComputePipeline, request.pipeline));
            let message = message.to_owned();
            deferred.push(serial, move |client| (request.callback)(client, status, None, &message));
        }
    }

    fn cancel_error_scopes(&mut self, message: &str, deferred: &mut DeferredCallbacks<M>) {
        for (serial, callback) in self.error_scope_requests.drain() {
            let message = message.to_owned();
            deferred.push(serial, move |client| {
                callback(client, PopErrorScopeStatus::DeviceLost, ErrorType::DeviceLost, &message)
            });
        }
    }

    pub(crate) fn lose_connection(
        &mut self,
        handle: ObjectHandle,
        orphans: &mut Vec<(ObjectType, ObjectHandle)>,
        deferred: &mut DeferredCallbacks<M>,
    ) {
        self.cancel_pipelines(CreatePipelineAsyncStatus::DeviceLost, CONNECTION_LOST_MESSAGE, orphans, deferred);
        self.cancel_error_scopes(CONNECTION_LOST_MESSAGE, deferred);
        if let Some(callback) = self.take_lost_callback() {
            deferred.push(self.lost_serial, move |client| {
                callback(client, Device::from_handle(handle), DeviceLostReason::Unknown, CONNECTION_LOST_MESSAGE)
            });
        }
    }
}

impl<M: MemoryTransferService> Client<M> {
    // ── Callbacks ───────────────────────────────────────────

    pub fn device_set_uncaptured_error_callback(
        &mut self,
        device: Device,
        callback: Option<ErrorCallback>,
    ) -> Result<(), ClientError> {
        self.devices.get_mut(device.handle())?.error_callback = callback;
        Ok(())
    }

    pub fn device_set_logging_callback(
        &mut self,
        device: Device,
        callback: Option<LoggingCallback>,
    ) -> Result<(), ClientError> {
        self.devices.get_mut(device.handle())?.logging_callback = callback;
        Ok(())
    }

    pub fn device_set_device_lost_callback(
        &mut self,
        device: Device,
        callback: Option<DeviceLostCallback<M>>,
    ) -> Result<(), ClientError> {
        self.devices.get_mut(device.handle())?.lost_callback = callback;
        Ok(())
    }

    pub fn device_is_lost(&self, device: Device) -> Result<bool, ClientError> {
        Ok(self.devices.get(device.handle())?.lost)
    }

    /// The adapter the device was requested from. Injected devices have none.
    pub fn device_adapter(&self, device: Device) -> Result<Option<Adapter>, ClientError> {
        Ok(self.devices.get(device.handle())?.adapter.map(Adapter::from_handle))
    }

    pub fn device_limits(&self, device: Device) -> Result<Limits, ClientError> {
        Ok(self.devices.get(device.handle())?.limits)
    }

    pub(crate) fn on_device_uncaptured_error(&mut self, device: ObjectHandle, error_type: ErrorType, message: &str) {
        let Ok(state) = self.devices.get_mut(device) else {
            debug!(%device, "error for a released device ignored");
            return;
        };
        match state.error_callback.as_mut() {
            Some(callback) => callback(error_type, message),
            None => warn!(%device, ?error_type, "uncaptured device error: {}", message),
        }
    }

    pub(crate) fn on_device_logging(&mut self, device: ObjectHandle, logging_type: LoggingType, message: &str) {
        if let Some(callback) = self
            .devices
            .get_mut(device)
            .ok()
            .and_then(|state| state.logging_callback.as_mut())
        {
            callback(logging_type, message);
        }
    }

    pub(crate) fn on_device_lost(&mut self, device: ObjectHandle, reason: DeviceLostReason, message: &str) {
        let Ok(state) = self.devices.get_mut(device) else {
            return;
        };
        if state.lost {
            return;
        }
        let callback = state.take_lost_callback();
        info!(%device, ?reason, "device lost: {}", message);
        if let Some(callback) = callback {
            callback(self, Device::from_handle(device), reason, message);
        }
    }

    // ── Object creation ─────────────────────────────────────

    /// The device's queue. Created on first use and shared afterwards; each
    /// call returns a new reference.
    pub fn device_get_queue(&mut self, device: Device) -> Result<Queue, ClientError> {
        let handle = device.handle();
        if let Some(queue) = self.devices.get(handle)?.queue {
            self.queues.get_mut(queue)?.refcount += 1;
            return Ok(Queue::from_handle(queue));
        }
        let queue = self.queues.allocate(QueueState::new(handle));
        self.devices.get_mut(handle)?.queue = Some(queue);
        self.serialize(&Command::DeviceGetQueue { device: handle, queue });
        Ok(Queue::from_handle(queue))
    }

    /// Create a buffer. With `mapped_at_creation` the buffer starts out
    /// mapped for writing; if no write handle can be created nothing is
    /// sent and an error is returned.
    pub fn device_create_buffer(&mut self, device: Device, descriptor: &BufferDescriptor) -> Result<Buffer, ClientError> {
        let device_handle = device.handle();
        self.devices.get(device_handle)?;

        let mut state = BufferState::new(device_handle, descriptor);
        let mut write_handle_create_info = None;
        if descriptor.mapped_at_creation {
            let len = usize::try_from(descriptor.size).map_err(|_| ClientError::HandleCreationFailed)?;
            let write = self
                .memory_transfer
                .create_write_handle(len)
                .ok_or(ClientError::HandleCreationFailed)?;
            let mut info = vec![0; write.serialize_create_size()];
            write.serialize_create(&mut info);
            write_handle_create_info = Some(info);
            state.mapping = Some(Mapping {
                offset: 0,
                size: descriptor.size,
                handle: MapHandle::Write(write),
            });
        }

        let buffer = self.buffers.allocate(state);
        self.serialize(&Command::DeviceCreateBuffer {
            device: device_handle,
            buffer,
            descriptor: descriptor.clone(),
            write_handle_create_info,
        });
        Ok(Buffer::from_handle(buffer))
    }

    pub fn device_create_texture(&mut self, device: Device, descriptor: &TextureDescriptor) -> Result<Texture, ClientError> {
        self.devices.get(device.handle())?;
        let texture = self.textures.allocate(ChildState::new(device.handle()));
        self.serialize(&Command::DeviceCreateTexture {
            device: device.handle(),
            texture,
            descriptor: descriptor.clone(),
        });
        Ok(Texture::from_handle(texture))
    }

    pub fn device_create_shader_module(
        &mut self,
        device: Device,
        descriptor: &ShaderModuleDescriptor,
    ) -> Result<ShaderModule, ClientError> {
        self.devices.get(device.handle())?;
        let shader_module = self.shader_modules.allocate(ChildState::new(device.handle()));
        self.serialize(&Command::DeviceCreateShaderModule {
            device: device.handle(),
            shader_module,
            descriptor: descriptor.clone(),
        });
        Ok(ShaderModule::from_handle(shader_module))
    }

    /// Create a compute pipeline on the server. The pipeline is only handed
    /// to `callback` on success.
    pub fn device_create_compute_pipeline_async(
        &mut self,
        device: Device,
        descriptor: &ComputePipelineDescriptor,
        callback: impl FnOnce(&mut Client<M>, CreatePipelineAsyncStatus, Option<ComputePipeline>, &str) + 'static,
    ) {
        if self.is_disconnected() {
            return callback(self, CreatePipelineAsyncStatus::DeviceLost, None, CONNECTION_LOST_MESSAGE);
        }
        let device_handle = device.handle();
        if let Err(e) = self.devices.get(device_handle) {
            return callback(self, CreatePipelineAsyncStatus::Unknown, None, &e.to_string());
        }

        let pipeline = self.compute_pipelines.allocate(ChildState::new(device_handle));
        let request_serial = self.next_serial();
        if let Ok(state) = self.devices.get_mut(device_handle) {
            state.pipeline_requests.add(
                request_serial,
                PipelineRequest {
                    pipeline,
                    callback: Box::new(callback),
                },
            );
        }
        self.serialize(&Command::DeviceCreateComputePipelineAsync {
            device: device_handle,
            request_serial,
            pipeline,
            descriptor: SerializedComputePipelineDescriptor {
                label: descriptor.label.clone(),
                module: descriptor.module.handle(),
                entry_point: descriptor.entry_point.clone(),
            },
        });
    }

    pub(crate) fn on_create_compute_pipeline_callback(
        &mut self,
        device: ObjectHandle,
        request_serial: RequestSerial,
        status: CreatePipelineAsyncStatus,
        message: &str,
    ) {
        let request = self
            .devices
            .get_mut(device)
            .ok()
            .and_then(|state| state.pipeline_requests.take(request_serial));
        let Some(request) = request else {
            debug!(%device, request_serial, "stale pipeline response ignored");
            return;
        };

        if status == CreatePipelineAsyncStatus::Success {
            let pipeline = ComputePipeline::from_handle(request.pipeline);
            (request.callback)(self, status, Some(pipeline), message);
        } else {
            self.discard(ObjectType::ComputePipeline, request.pipeline);
            (request.callback)(self, status, None, message);
        }
    }

    // ── Error scopes ────────────────────────────────────────

    pub fn device_push_error_scope(&mut self, device: Device, filter: ErrorFilter) -> Result<(), ClientError> {
        self.devices.get(device.handle())?;
        self.serialize(&Command::DevicePushErrorScope {
            device: device.handle(),
            filter,
        });
        Ok(())
    }

    /// Pop the innermost error scope. `callback` fires exactly once: with
    /// the server's answer, or locally when the device is released or the
    /// connection is lost first.
    pub fn device_pop_error_scope(
        &mut self,
        device: Device,
        callback: impl FnOnce(&mut Client<M>, PopErrorScopeStatus, ErrorType, &str) + 'static,
    ) {
        if self.is_disconnected() {
            return callback(self, PopErrorScopeStatus::DeviceLost, ErrorType::DeviceLost, CONNECTION_LOST_MESSAGE);
        }
        let device_handle = device.handle();
        let request_serial = self.next_serial();
        match self.devices.get_mut(device_handle) {
            Ok(state) => state.error_scope_requests.add(request_serial, Box::new(callback)),
            Err(e) => return callback(self, PopErrorScopeStatus::Unknown, ErrorType::Unknown, &e.to_string()),
        }
        self.serialize(&Command::DevicePopErrorScope {
            device: device_handle,
            request_serial,
        });
    }

    pub(crate) fn on_pop_error_scope_callback(
        &mut self,
        device: ObjectHandle,
        request_serial: RequestSerial,
        status: PopErrorScopeStatus,
        error_type: ErrorType,
        message: &str,
    ) {
        let callback = self
            .devices
            .get_mut(device)
            .ok()
            .and_then(|state| state.error_scope_requests.take(request_serial));
        match callback {
            Some(callback) => callback(self, status, error_type, message),
            None => debug!(%device, request_serial, "stale error scope response ignored"),
        }
    }

    // ── Device operations ───────────────────────────────────

    /// Destroy the device on the server. Pending buffer mappings of the
    /// device resolve right away; loss is reported by the server.
    pub fn device_destroy(&mut self, device: Device) -> Result<(), ClientError> {
        let handle = device.handle();
        self.devices.get(handle)?;
        let mut deferred = DeferredCallbacks::default();
        self.cancel_device_maps(
            handle,
            MapAsyncStatus::DestroyedBeforeCallback,
            "Device destroyed before the mapping was resolved",
            &mut deferred,
        );
        self.serialize(&Command::DeviceDestroy { device: handle });
        deferred.fire(self);
        Ok(())
    }

    pub fn device_inject_error(
        &mut self,
        device: Device,
        error_type: ErrorType,
        message: &str,
    ) -> Result<(), ClientError> {
        self.devices.get(device.handle())?;
        self.serialize(&Command::DeviceInjectError {
            device: device.handle(),
            error_type,
            message: message.to_owned(),
        });
        Ok(())
    }

    pub(crate) fn cancel_device_maps(
        &mut self,
        device: ObjectHandle,
        status: MapAsyncStatus,
        message: &str,
        deferred: &mut DeferredCallbacks<M>,
    ) {
        for (_, buffer) in self.buffers.iter_mut() {
            if buffer.device == device {
                buffer.cancel_map(status, message, deferred);
            }
        }
    }

    pub(crate) fn teardown_device(&mut self, handle: ObjectHandle, deferred: &mut DeferredCallbacks<M>) {
        let Ok(mut state) = self.devices.free(handle) else {
            return;
        };
        if let Some(callback) = state.take_lost_callback() {
            deferred.push(state.lost_serial, move |client| {
                callback(
                    client,
                    Device::from_handle(handle),
                    DeviceLostReason::Destroyed,
                    DEVICE_DESTROYED_MESSAGE,
                )
            });
        }
        state.logging_callback = None;

        let mut orphans = Vec::new();
        state.cancel_pipelines(
            CreatePipelineAsyncStatus::DeviceDestroyed,
            "Device released before the pipeline was created",
            &mut orphans,
            deferred,
        );
        state.cancel_error_scopes("Device released before the error scope was popped", deferred);
        for (object_type, orphan) in orphans {
            self.discard(object_type, orphan);
        }
        self.cancel_device_maps(
            handle,
            MapAsyncStatus::DestroyedBeforeCallback,
            "Device released before the mapping was resolved",
            deferred,
        );
        if let Some(queue) = state.queue {
            if let Err(e) = self.unref(ObjectType::Queue, queue, deferred) {
                warn!(error = %e, "device queue already gone");
            }
        }
    }
}

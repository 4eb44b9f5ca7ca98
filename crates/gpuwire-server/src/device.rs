//! Handlers for instance, adapter, device and queue commands.

use gpuwire_protocol::types::{
    BufferDescriptor, CreatePipelineAsyncStatus, DeviceDescriptor, ErrorFilter, ErrorType, PopErrorScopeStatus,
    QueueWorkDoneStatus,
    RequestAdapterOptions, RequestAdapterStatus, RequestDeviceStatus, SerializedComputePipelineDescriptor,
    ShaderModuleDescriptor, TextureDescriptor,
};
use gpuwire_protocol::{ObjectHandle, ObjectType, ProtocolError, RequestSerial, ReturnCommand};
use tracing::{debug, info, warn};

use crate::backend::{Backend, NativeHandle};
use crate::error::{DispatchError, WrongDeviceError};
use crate::memory_transfer::MemoryTransferService;
use crate::objects::{BufferData, BufferMapping, DeviceData, ObjectData, ObjectState};
use crate::server::{Completion, Server};

impl<B: Backend, M: MemoryTransferService> Server<B, M> {
    // ── Instance and adapter ────────────────────────────────

    pub(crate) fn instance_request_adapter(
        &mut self,
        instance: ObjectHandle,
        request_serial: RequestSerial,
        adapter: ObjectHandle,
        options: &RequestAdapterOptions,
    ) -> Result<(), DispatchError> {
        let native_instance = self.instances.get(instance)?.native;
        self.adapters.allocate_at(adapter, ObjectData::pending(None))?;

        let Some(native_instance) = native_instance else {
            self.adapters.get_mut(adapter)?.state = ObjectState::Error;
            self.send(ReturnCommand::InstanceRequestAdapterCallback {
                instance,
                request_serial,
                status: RequestAdapterStatus::Error,
                message: format!("instance {instance} is invalid"),
                info: None,
            });
            return Ok(());
        };

        let sink = self.sink();
        self.backend.instance_request_adapter(
            native_instance,
            options,
            Box::new(move |status, native, message| {
                sink.push(Completion::RequestAdapter {
                    instance,
                    request_serial,
                    adapter,
                    status,
                    native,
                    message: message.to_owned(),
                })
            }),
        );
        Ok(())
    }

    pub(crate) fn complete_request_adapter(
        &mut self,
        instance: ObjectHandle,
        request_serial: RequestSerial,
        adapter: ObjectHandle,
        status: RequestAdapterStatus,
        native: Option<NativeHandle>,
        message: String,
    ) {
        let Some(slot) = self.pending_slot(ObjectType::Adapter, adapter) else {
            // The client gave up on the adapter before it arrived.
            if let Some(native) = native {
                self.backend.release(ObjectType::Adapter, native);
            }
            debug!(%adapter, request_serial, "adapter request outlived its slot");
            return;
        };

        let (status, message, info) = match (status, native) {
            (RequestAdapterStatus::Success, Some(native)) => {
                *slot = ObjectData::live(native, None);
                let info = self.backend.adapter_info(native);
                info!(%adapter, %native, "adapter ready: {}", info.description);
                (status, message, Some(info))
            }
            (RequestAdapterStatus::Success, None) => {
                slot.state = ObjectState::Error;
                (RequestAdapterStatus::Error, "backend returned no adapter".to_owned(), None)
            }
            (status, native) => {
                slot.state = ObjectState::Error;
                if let Some(native) = native {
                    self.backend.release(ObjectType::Adapter, native);
                }
                (status, message, None)
            }
        };
        self.send(ReturnCommand::InstanceRequestAdapterCallback { instance, request_serial, status, message, info });
    }

    pub(crate) fn adapter_request_device(
        &mut self,
        adapter: ObjectHandle,
        request_serial: RequestSerial,
        device: ObjectHandle,
        descriptor: &DeviceDescriptor,
    ) -> Result<(), DispatchError> {
        let native_adapter = self.adapters.get(adapter)?.native;
        self.devices
            .allocate_at(device, DeviceData::new(ObjectData::pending(None)))?;

        let Some(native_adapter) = native_adapter else {
            self.devices.get_mut(device)?.object.state = ObjectState::Error;
            self.send(ReturnCommand::AdapterRequestDeviceCallback {
                adapter,
                request_serial,
                status: RequestDeviceStatus::Error,
                message: format!("adapter {adapter} is invalid"),
                limits: None,
            });
            return Ok(());
        };

        let sink = self.sink();
        self.backend.adapter_request_device(
            native_adapter,
            descriptor,
            Box::new(move |status, native, message| {
                sink.push(Completion::RequestDevice {
                    adapter,
                    request_serial,
                    device,
                    status,
                    native,
                    message: message.to_owned(),
                })
            }),
        );
        Ok(())
    }

    pub(crate) fn complete_request_device(
        &mut self,
        adapter: ObjectHandle,
        request_serial: RequestSerial,
        device: ObjectHandle,
        status: RequestDeviceStatus,
        native: Option<NativeHandle>,
        message: String,
    ) {
        let Some(slot) = self.pending_slot(ObjectType::Device, device) else {
            if let Some(native) = native {
                self.backend.release(ObjectType::Device, native);
            }
            debug!(%device, request_serial, "device request outlived its slot");
            return;
        };

        let (status, message, limits) = match (status, native) {
            (RequestDeviceStatus::Success, Some(native)) => {
                *slot = ObjectData::live(native, None);
                let limits = self.backend.device_limits(native);
                self.install_device_callbacks(device, native);
                info!(%device, %native, "device ready");
                (status, message, Some(limits))
            }
            (RequestDeviceStatus::Success, None) => {
                slot.state = ObjectState::Error;
                (RequestDeviceStatus::Error, "backend returned no device".to_owned(), None)
            }
            (status, native) => {
                slot.state = ObjectState::Error;
                if let Some(native) = native {
                    self.backend.release(ObjectType::Device, native);
                }
                (status, message, None)
            }
        };
        self.send(ReturnCommand::AdapterRequestDeviceCallback { adapter, request_serial, status, message, limits });
    }

    /// The record behind a pre-allocated handle, if it still waits for its
    /// asynchronous creation.
    fn pending_slot(&mut self, object_type: ObjectType, handle: ObjectHandle) -> Option<&mut ObjectData> {
        self.object_mut(object_type, handle)
            .ok()
            .filter(|object| object.state == ObjectState::Pending)
    }

    // ── Device children ─────────────────────────────────────

    fn device_native(&self, device: ObjectHandle) -> Result<Option<NativeHandle>, DispatchError> {
        Ok(self.devices.get(device)?.object.native)
    }

    fn track_child(&mut self, device: ObjectHandle, object_type: ObjectType, handle: ObjectHandle) {
        if let Ok(data) = self.devices.get_mut(device) {
            data.track_child(object_type, handle);
        }
    }

    pub(crate) fn device_create_buffer(
        &mut self,
        device: ObjectHandle,
        buffer: ObjectHandle,
        descriptor: &BufferDescriptor,
        write_handle_create_info: Option<&[u8]>,
    ) -> Result<(), DispatchError> {
        let device_native = self.device_native(device)?;

        let write_handle = if descriptor.mapped_at_creation {
            let Some(create_info) = write_handle_create_info else {
                return Err(ProtocolError::Malformed(format!(
                    "buffer {buffer} is mapped at creation without a write handle"
                ))
                .into());
            };
            let Some(handle) = self.memory_transfer.deserialize_write_handle(create_info) else {
                return Err(ProtocolError::MemoryTransfer {
                    buffer,
                    reason: "cannot deserialize write handle".into(),
                }
                .into());
            };
            Some(handle)
        } else {
            None
        };

        self.buffers
            .allocate_at(buffer, BufferData::new(ObjectData::pending(Some(device))))?;
        self.track_child(device, ObjectType::Buffer, buffer);

        let native = device_native.and_then(|d| self.backend.device_create_buffer(d, descriptor));
        let data = self.buffers.get_mut(buffer)?;
        data.object = ObjectData::created(native, Some(device));
        if native.is_some() && write_handle.is_some() {
            data.mapping = Some(BufferMapping { offset: 0, size: descriptor.size, write_handle });
        }
        debug!(%buffer, %device, size = descriptor.size, error = native.is_none(), "buffer created");
        Ok(())
    }

    pub(crate) fn device_create_texture(
        &mut self,
        device: ObjectHandle,
        texture: ObjectHandle,
        descriptor: &TextureDescriptor,
    ) -> Result<(), DispatchError> {
        let device_native = self.device_native(device)?;
        self.textures.allocate_at(texture, ObjectData::pending(Some(device)))?;
        self.track_child(device, ObjectType::Texture, texture);

        let native = device_native.and_then(|d| self.backend.device_create_texture(d, descriptor));
        *self.textures.get_mut(texture)? = ObjectData::created(native, Some(device));
        Ok(())
    }

    pub(crate) fn device_create_shader_module(
        &mut self,
        device: ObjectHandle,
        shader_module: ObjectHandle,
        descriptor: &ShaderModuleDescriptor,
    ) -> Result<(), DispatchError> {
        let device_native = self.device_native(device)?;
        self.shader_modules
            .allocate_at(shader_module, ObjectData::pending(Some(device)))?;
        self.track_child(device, ObjectType::ShaderModule, shader_module);

        let native = device_native.and_then(|d| self.backend.device_create_shader_module(d, descriptor));
        *self.shader_modules.get_mut(shader_module)? = ObjectData::created(native, Some(device));
        Ok(())
    }

    pub(crate) fn device_create_compute_pipeline_async(
        &mut self,
        device: ObjectHandle,
        request_serial: RequestSerial,
        pipeline: ObjectHandle,
        descriptor: &SerializedComputePipelineDescriptor,
    ) -> Result<(), DispatchError> {
        let device_native = self.device_native(device)?;
        let module = self.shader_modules.get(descriptor.module)?;
        let (module_device, module_native) = (module.device, module.native);

        self.compute_pipelines
            .allocate_at(pipeline, ObjectData::pending(Some(device)))?;
        self.track_child(device, ObjectType::ComputePipeline, pipeline);

        if module_device != Some(device) {
            self.fail_pipeline(
                device,
                request_serial,
                pipeline,
                CreatePipelineAsyncStatus::ValidationError,
                "shader module belongs to another device".into(),
            );
            return Err(WrongDeviceError {
                object_type: ObjectType::ShaderModule,
                handle: descriptor.module,
                expected: device,
            }
            .into());
        }

        let (Some(device_native), Some(module_native)) = (device_native, module_native) else {
            self.fail_pipeline(
                device,
                request_serial,
                pipeline,
                CreatePipelineAsyncStatus::ValidationError,
                "invalid device or shader module".into(),
            );
            return Ok(());
        };

        let sink = self.sink();
        self.backend.device_create_compute_pipeline_async(
            device_native,
            module_native,
            &descriptor.entry_point,
            Box::new(move |status, native, message| {
                sink.push(Completion::CreateComputePipeline {
                    device,
                    request_serial,
                    pipeline,
                    status,
                    native,
                    message: message.to_owned(),
                })
            }),
        );
        Ok(())
    }

    fn fail_pipeline(
        &mut self,
        device: ObjectHandle,
        request_serial: RequestSerial,
        pipeline: ObjectHandle,
        status: CreatePipelineAsyncStatus,
        message: String,
    ) {
        if let Ok(slot) = self.compute_pipelines.get_mut(pipeline) {
            slot.state = ObjectState::Error;
        }
        self.send(ReturnCommand::DeviceCreateComputePipelineAsyncCallback { device, request_serial, status, message });
    }

    pub(crate) fn complete_create_compute_pipeline(
        &mut self,
        device: ObjectHandle,
        request_serial: RequestSerial,
        pipeline: ObjectHandle,
        status: CreatePipelineAsyncStatus,
        native: Option<NativeHandle>,
        message: String,
    ) {
        let Some(slot) = self.pending_slot(ObjectType::ComputePipeline, pipeline) else {
            // Destroyed, or invalidated along with its device. The client
            // has already resolved the request.
            if let Some(native) = native {
                self.backend.release(ObjectType::ComputePipeline, native);
            }
            debug!(%pipeline, request_serial, "pipeline creation outlived its slot");
            return;
        };

        match (status, native) {
            (CreatePipelineAsyncStatus::Success, Some(native)) => {
                *slot = ObjectData::live(native, Some(device));
                self.send(ReturnCommand::DeviceCreateComputePipelineAsyncCallback {
                    device,
                    request_serial,
                    status,
                    message,
                });
            }
            (CreatePipelineAsyncStatus::Success, None) => {
                self.fail_pipeline(
                    device,
                    request_serial,
                    pipeline,
                    CreatePipelineAsyncStatus::InternalError,
                    "backend returned no pipeline".into(),
                );
            }
            (status, native) => {
                if let Some(native) = native {
                    self.backend.release(ObjectType::ComputePipeline, native);
                }
                self.fail_pipeline(device, request_serial, pipeline, status, message);
            }
        }
    }

    pub(crate) fn device_get_queue(&mut self, device: ObjectHandle, queue: ObjectHandle) -> Result<(), DispatchError> {
        let device_native = self.device_native(device)?;
        self.queues.allocate_at(queue, ObjectData::pending(Some(device)))?;
        self.track_child(device, ObjectType::Queue, queue);

        let native = device_native.map(|d| self.backend.device_get_queue(d));
        *self.queues.get_mut(queue)? = ObjectData::created(native, Some(device));
        Ok(())
    }

    pub(crate) fn device_destroy(&mut self, device: ObjectHandle) -> Result<(), DispatchError> {
        if let Some(native) = self.device_native(device)? {
            info!(%device, "destroying device");
            self.backend.device_destroy(native);
        }
        Ok(())
    }

    pub(crate) fn device_inject_error(
        &mut self,
        device: ObjectHandle,
        error_type: ErrorType,
        message: &str,
    ) -> Result<(), DispatchError> {
        if let Some(native) = self.device_native(device)? {
            self.backend.device_inject_error(native, error_type, message);
        }
        Ok(())
    }

    pub(crate) fn device_push_error_scope(&mut self, device: ObjectHandle, filter: ErrorFilter) -> Result<(), DispatchError> {
        if let Some(native) = self.device_native(device)? {
            self.backend.device_push_error_scope(native, filter);
        }
        Ok(())
    }

    pub(crate) fn device_pop_error_scope(
        &mut self,
        device: ObjectHandle,
        request_serial: RequestSerial,
    ) -> Result<(), DispatchError> {
        let Some(native) = self.device_native(device)? else {
            self.send(ReturnCommand::DevicePopErrorScopeCallback {
                device,
                request_serial,
                status: PopErrorScopeStatus::DeviceLost,
                error_type: ErrorType::DeviceLost,
                message: "Device is invalid".into(),
            });
            return Ok(());
        };

        let sink = self.sink();
        self.backend.device_pop_error_scope(
            native,
            Box::new(move |status, error_type, message| {
                sink.push(Completion::PopErrorScope {
                    device,
                    request_serial,
                    status,
                    error_type,
                    message: message.to_owned(),
                })
            }),
        );
        Ok(())
    }

    // ── Queue ───────────────────────────────────────────────

    pub(crate) fn queue_write_buffer(
        &mut self,
        queue: ObjectHandle,
        buffer: ObjectHandle,
        buffer_offset: u64,
        data: &[u8],
    ) -> Result<(), DispatchError> {
        let queue_data = self.queues.get(queue)?;
        let buffer_data = &self.buffers.get(buffer)?.object;

        if let Some(expected) = queue_data.device {
            if buffer_data.device != Some(expected) {
                return Err(WrongDeviceError { object_type: ObjectType::Buffer, handle: buffer, expected }.into());
            }
        }

        match (queue_data.native, buffer_data.native) {
            (Some(queue_native), Some(buffer_native)) => {
                self.backend
                    .queue_write_buffer(queue_native, buffer_native, buffer_offset, data);
            }
            _ => warn!(%queue, %buffer, "write to an invalid buffer or queue dropped"),
        }
        Ok(())
    }

    pub(crate) fn queue_on_submitted_work_done(
        &mut self,
        queue: ObjectHandle,
        request_serial: RequestSerial,
    ) -> Result<(), DispatchError> {
        let queue_data = self.queues.get(queue)?;
        let native = match (queue_data.state, queue_data.native) {
            (_, Some(native)) => native,
            (ObjectState::Invalidated, None) => {
                self.send(ReturnCommand::QueueWorkDoneCallback {
                    queue,
                    request_serial,
                    status: QueueWorkDoneStatus::DeviceLost,
                });
                return Ok(());
            }
            (_, None) => {
                self.send(ReturnCommand::QueueWorkDoneCallback {
                    queue,
                    request_serial,
                    status: QueueWorkDoneStatus::Error,
                });
                return Ok(());
            }
        };

        let sink = self.sink();
        self.backend.queue_on_submitted_work_done(
            native,
            Box::new(move |status| sink.push(Completion::WorkDone { queue, request_serial, status })),
        );
        Ok(())
    }
}

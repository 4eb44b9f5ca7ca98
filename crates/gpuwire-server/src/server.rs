use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::{Rc, Weak};

use gpuwire_core::{ObjectTable, TableError};
use gpuwire_protocol::types::{
    CreatePipelineAsyncStatus, DeviceLostReason, ErrorType, LoggingType, MapAsyncStatus, PopErrorScopeStatus,
    QueueWorkDoneStatus, RequestAdapterStatus, RequestDeviceStatus,
};
use gpuwire_protocol::wire;
use gpuwire_protocol::{Command, ObjectHandle, ObjectType, RequestSerial, ReturnCommand};
use gpuwire_transport::{write_frame, CommandHandler, CommandSerializer};
use tracing::{debug, error, info, trace, warn};

use crate::backend::{Backend, NativeHandle};
use crate::error::{DispatchError, InjectError, ServerError, WrongDeviceError};
use crate::memory_transfer::{InlineMemoryTransferService, MemoryTransferService};
use crate::objects::{BufferData, DeviceData, ObjectData, ObjectState};

/// A backend callback result waiting to be turned into a return command.
pub(crate) enum Completion {
    UncapturedError {
        device: ObjectHandle,
        error_type: ErrorType,
        message: String,
    },
    Logging {
        device: ObjectHandle,
        logging_type: LoggingType,
        message: String,
    },
    DeviceLost {
        device: ObjectHandle,
        reason: DeviceLostReason,
        message: String,
    },
    RequestAdapter {
        instance: ObjectHandle,
        request_serial: RequestSerial,
        adapter: ObjectHandle,
        status: RequestAdapterStatus,
        native: Option<NativeHandle>,
        message: String,
    },
    RequestDevice {
        adapter: ObjectHandle,
        request_serial: RequestSerial,
        device: ObjectHandle,
        status: RequestDeviceStatus,
        native: Option<NativeHandle>,
        message: String,
    },
    CreateComputePipeline {
        device: ObjectHandle,
        request_serial: RequestSerial,
        pipeline: ObjectHandle,
        status: CreatePipelineAsyncStatus,
        native: Option<NativeHandle>,
        message: String,
    },
    MapAsync {
        buffer: ObjectHandle,
        request_serial: RequestSerial,
        status: MapAsyncStatus,
        message: String,
    },
    WorkDone {
        queue: ObjectHandle,
        request_serial: RequestSerial,
        status: QueueWorkDoneStatus,
    },
    PopErrorScope {
        device: ObjectHandle,
        request_serial: RequestSerial,
        status: PopErrorScopeStatus,
        error_type: ErrorType,
        message: String,
    },
}

impl Completion {
    /// Native object a completion carries, with its type.
    fn native(&self) -> Option<(ObjectType, NativeHandle)> {
        match self {
            Completion::RequestAdapter { native, .. } => native.map(|n| (ObjectType::Adapter, n)),
            Completion::RequestDevice { native, .. } => native.map(|n| (ObjectType::Device, n)),
            Completion::CreateComputePipeline { native, .. } => native.map(|n| (ObjectType::ComputePipeline, n)),
            _ => None,
        }
    }
}

/// Handed to backend callbacks. Completions pushed after the server is
/// gone are dropped.
#[derive(Clone)]
pub(crate) struct CompletionSink(Weak<RefCell<VecDeque<Completion>>>);

impl CompletionSink {
    pub(crate) fn push(&self, completion: Completion) {
        if let Some(queue) = self.0.upgrade() {
            queue.borrow_mut().push_back(completion);
        }
    }
}

/// Server half of the wire.
///
/// Executes client commands against a [`Backend`], keeping one object table
/// per type that mirrors the client's handles, and reports asynchronous
/// results back through return commands.
pub struct Server<B: Backend, M: MemoryTransferService = InlineMemoryTransferService> {
    pub(crate) backend: B,
    serializer: Box<dyn CommandSerializer>,
    pub(crate) memory_transfer: M,
    completions: Rc<RefCell<VecDeque<Completion>>>,
    pub(crate) instances: ObjectTable<ObjectData>,
    pub(crate) adapters: ObjectTable<ObjectData>,
    pub(crate) devices: ObjectTable<DeviceData>,
    pub(crate) queues: ObjectTable<ObjectData>,
    pub(crate) buffers: ObjectTable<BufferData<M>>,
    pub(crate) textures: ObjectTable<ObjectData>,
    pub(crate) swap_chains: ObjectTable<ObjectData>,
    pub(crate) shader_modules: ObjectTable<ObjectData>,
    pub(crate) compute_pipelines: ObjectTable<ObjectData>,
    transport_failed: bool,
}

impl<B: Backend> Server<B, InlineMemoryTransferService> {
    pub fn new(backend: B, serializer: impl CommandSerializer + 'static) -> Self {
        Self::with_memory_transfer(backend, serializer, InlineMemoryTransferService)
    }
}

impl<B: Backend, M: MemoryTransferService> Server<B, M> {
    pub fn with_memory_transfer(backend: B, serializer: impl CommandSerializer + 'static, memory_transfer: M) -> Self {
        Self {
            backend,
            serializer: Box::new(serializer),
            memory_transfer,
            completions: Rc::new(RefCell::new(VecDeque::new())),
            instances: ObjectTable::new(ObjectType::Instance),
            adapters: ObjectTable::new(ObjectType::Adapter),
            devices: ObjectTable::new(ObjectType::Device),
            queues: ObjectTable::new(ObjectType::Queue),
            buffers: ObjectTable::new(ObjectType::Buffer),
            textures: ObjectTable::new(ObjectType::Texture),
            swap_chains: ObjectTable::new(ObjectType::SwapChain),
            shader_modules: ObjectTable::new(ObjectType::ShaderModule),
            compute_pipelines: ObjectTable::new(ObjectType::ComputePipeline),
            transport_failed: false,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub(crate) fn sink(&self) -> CompletionSink {
        CompletionSink(Rc::downgrade(&self.completions))
    }

    // ── Stream handling ─────────────────────────────────────

    /// Execute every complete command at the front of `commands` and return
    /// the unconsumed tail. A protocol violation stops handling and is
    /// returned; the connection must then be dropped.
    pub fn handle_commands<'a>(&mut self, commands: &'a [u8]) -> Result<&'a [u8], ServerError> {
        let mut rest = commands;
        while let Some(frame) = wire::next_frame(rest)? {
            let command = wire::decode_command(&frame)?;
            rest = &rest[frame.frame_len..];

            let name = command.name();
            trace!(command = name, "dispatching command");
            match self.dispatch(command) {
                Ok(()) => {}
                Err(DispatchError::WrongDevice(err)) => self.report_wrong_device(err),
                Err(DispatchError::Fatal(err)) => {
                    error!(command = name, error = %err, "fatal protocol violation");
                    return Err(err.into());
                }
            }
            self.process_completions();
        }
        Ok(rest)
    }

    /// Let the backend make progress and forward whatever completed.
    pub fn process_events(&mut self) {
        self.backend.tick();
        self.process_completions();
    }

    pub fn flush(&mut self) -> Result<(), ServerError> {
        if self.transport_failed || !self.serializer.flush() {
            warn!("wire transport failed");
            self.transport_failed = true;
            return Err(ServerError::TransportFailed);
        }
        Ok(())
    }

    pub(crate) fn send(&mut self, command: ReturnCommand) {
        if self.transport_failed {
            return;
        }
        match wire::encode_return_command(&command) {
            Ok(frame) => {
                trace!(command = command.name(), bytes = frame.len(), "serialized return command");
                if !write_frame(self.serializer.as_mut(), &frame) {
                    warn!(command = command.name(), "transport rejected return command");
                    self.transport_failed = true;
                }
            }
            Err(e) => error!(command = command.name(), error = %e, "failed to encode return command"),
        }
    }

    fn report_wrong_device(&mut self, err: WrongDeviceError) {
        warn!(error = %err, "command mixes objects from different devices");
        self.send(ReturnCommand::DeviceUncapturedError {
            device: err.expected,
            error_type: ErrorType::Validation,
            message: err.to_string(),
        });
    }

    fn dispatch(&mut self, command: Command) -> Result<(), DispatchError> {
        match command {
            Command::DestroyObject { object_type, handle } => self.destroy_object(object_type, handle),
            Command::InstanceRequestAdapter { instance, request_serial, adapter, options } => {
                self.instance_request_adapter(instance, request_serial, adapter, &options)
            }
            Command::AdapterRequestDevice { adapter, request_serial, device, descriptor } => {
                self.adapter_request_device(adapter, request_serial, device, &descriptor)
            }
            Command::DeviceCreateBuffer { device, buffer, descriptor, write_handle_create_info } => {
                self.device_create_buffer(device, buffer, &descriptor, write_handle_create_info.as_deref())
            }
            Command::DeviceCreateTexture { device, texture, descriptor } => {
                self.device_create_texture(device, texture, &descriptor)
            }
            Command::DeviceCreateShaderModule { device, shader_module, descriptor } => {
                self.device_create_shader_module(device, shader_module, &descriptor)
            }
            Command::DeviceCreateComputePipelineAsync { device, request_serial, pipeline, descriptor } => {
                self.device_create_compute_pipeline_async(device, request_serial, pipeline, &descriptor)
            }
            Command::DeviceGetQueue { device, queue } => self.device_get_queue(device, queue),
            Command::DeviceDestroy { device } => self.device_destroy(device),
            Command::DeviceInjectError { device, error_type, message } => {
                self.device_inject_error(device, error_type, &message)
            }
            Command::DevicePushErrorScope { device, filter } => self.device_push_error_scope(device, filter),
            Command::DevicePopErrorScope { device, request_serial } => {
                self.device_pop_error_scope(device, request_serial)
            }
            Command::BufferMapAsync { buffer, request_serial, mode, offset, size, handle_create_info } => {
                self.buffer_map_async(buffer, request_serial, mode, offset, size, &handle_create_info)
            }
            Command::BufferUpdateMappedData { buffer, offset, size, data_update_info } => {
                self.buffer_update_mapped_data(buffer, offset, size, &data_update_info)
            }
            Command::BufferUnmap { buffer } => self.buffer_unmap(buffer),
            Command::BufferDestroy { buffer } => self.buffer_destroy(buffer),
            Command::QueueWriteBuffer { queue, buffer, buffer_offset, data } => {
                self.queue_write_buffer(queue, buffer, buffer_offset, &data)
            }
            Command::QueueOnSubmittedWorkDone { queue, request_serial } => {
                self.queue_on_submitted_work_done(queue, request_serial)
            }
        }
    }

    fn process_completions(&mut self) {
        loop {
            let next = self.completions.borrow_mut().pop_front();
            let Some(completion) = next else {
                break;
            };
            self.complete(completion);
        }
    }

    fn complete(&mut self, completion: Completion) {
        match completion {
            Completion::UncapturedError { device, error_type, message } => {
                if self.devices.contains(device) {
                    self.send(ReturnCommand::DeviceUncapturedError { device, error_type, message });
                }
            }
            Completion::Logging { device, logging_type, message } => {
                if self.devices.contains(device) {
                    self.send(ReturnCommand::DeviceLogging { device, logging_type, message });
                }
            }
            Completion::DeviceLost { device, reason, message } => {
                if self.devices.contains(device) {
                    info!(%device, ?reason, "device lost: {}", message);
                    self.send(ReturnCommand::DeviceLost { device, reason, message });
                }
            }
            Completion::RequestAdapter { instance, request_serial, adapter, status, native, message } => {
                self.complete_request_adapter(instance, request_serial, adapter, status, native, message);
            }
            Completion::RequestDevice { adapter, request_serial, device, status, native, message } => {
                self.complete_request_device(adapter, request_serial, device, status, native, message);
            }
            Completion::CreateComputePipeline { device, request_serial, pipeline, status, native, message } => {
                self.complete_create_compute_pipeline(device, request_serial, pipeline, status, native, message);
            }
            Completion::MapAsync { buffer, request_serial, status, message } => {
                self.complete_map(buffer, request_serial, status, message);
            }
            Completion::WorkDone { queue, request_serial, status } => {
                if self.queues.contains(queue) {
                    self.send(ReturnCommand::QueueWorkDoneCallback { queue, request_serial, status });
                }
            }
            Completion::PopErrorScope { device, request_serial, status, error_type, message } => {
                // A released device's pops were resolved by the client.
                if self.devices.contains(device) {
                    self.send(ReturnCommand::DevicePopErrorScopeCallback {
                        device,
                        request_serial,
                        status,
                        error_type,
                        message,
                    });
                }
            }
        }
    }

    // ── Objects ─────────────────────────────────────────────

    pub(crate) fn object_mut(&mut self, object_type: ObjectType, handle: ObjectHandle) -> Result<&mut ObjectData, TableError> {
        Ok(match object_type {
            ObjectType::Instance => self.instances.get_mut(handle)?,
            ObjectType::Adapter => self.adapters.get_mut(handle)?,
            ObjectType::Device => &mut self.devices.get_mut(handle)?.object,
            ObjectType::Queue => self.queues.get_mut(handle)?,
            ObjectType::Buffer => &mut self.buffers.get_mut(handle)?.object,
            ObjectType::Texture => self.textures.get_mut(handle)?,
            ObjectType::SwapChain => self.swap_chains.get_mut(handle)?,
            ObjectType::ShaderModule => self.shader_modules.get_mut(handle)?,
            ObjectType::ComputePipeline => self.compute_pipelines.get_mut(handle)?,
        })
    }

    /// The server's record of a client object, if it is live.
    pub fn object(&self, object_type: ObjectType, handle: ObjectHandle) -> Option<&ObjectData> {
        match object_type {
            ObjectType::Instance => self.instances.get(handle).ok(),
            ObjectType::Adapter => self.adapters.get(handle).ok(),
            ObjectType::Device => self.devices.get(handle).ok().map(|d| &d.object),
            ObjectType::Queue => self.queues.get(handle).ok(),
            ObjectType::Buffer => self.buffers.get(handle).ok().map(|b| &b.object),
            ObjectType::Texture => self.textures.get(handle).ok(),
            ObjectType::SwapChain => self.swap_chains.get(handle).ok(),
            ObjectType::ShaderModule => self.shader_modules.get(handle).ok(),
            ObjectType::ComputePipeline => self.compute_pipelines.get(handle).ok(),
        }
    }

    pub fn native_handle(&self, object_type: ObjectType, handle: ObjectHandle) -> Option<NativeHandle> {
        self.object(object_type, handle).and_then(|object| object.native)
    }

    pub fn object_state(&self, object_type: ObjectType, handle: ObjectHandle) -> Option<ObjectState> {
        self.object(object_type, handle).map(|object| object.state)
    }

    pub fn object_count(&self, object_type: ObjectType) -> usize {
        match object_type {
            ObjectType::Instance => self.instances.len(),
            ObjectType::Adapter => self.adapters.len(),
            ObjectType::Device => self.devices.len(),
            ObjectType::Queue => self.queues.len(),
            ObjectType::Buffer => self.buffers.len(),
            ObjectType::Texture => self.textures.len(),
            ObjectType::SwapChain => self.swap_chains.len(),
            ObjectType::ShaderModule => self.shader_modules.len(),
            ObjectType::ComputePipeline => self.compute_pipelines.len(),
        }
    }

    /// Whether `device` currently tracks the object as its child.
    pub fn is_device_child(&self, device: ObjectHandle, object_type: ObjectType, handle: ObjectHandle) -> bool {
        self.devices
            .get(device)
            .is_ok_and(|data| data.has_child(object_type, handle))
    }

    fn destroy_object(&mut self, object_type: ObjectType, handle: ObjectHandle) -> Result<(), DispatchError> {
        let object = match object_type {
            ObjectType::Device => {
                let device = self.devices.free(handle)?;
                self.release_device(handle, device);
                return Ok(());
            }
            ObjectType::Buffer => self.buffers.free(handle)?.object,
            ObjectType::Instance => self.instances.free(handle)?,
            ObjectType::Adapter => self.adapters.free(handle)?,
            ObjectType::Queue => self.queues.free(handle)?,
            ObjectType::Texture => self.textures.free(handle)?,
            ObjectType::SwapChain => self.swap_chains.free(handle)?,
            ObjectType::ShaderModule => self.shader_modules.free(handle)?,
            ObjectType::ComputePipeline => self.compute_pipelines.free(handle)?,
        };
        if let Some(device) = object.device {
            if let Ok(data) = self.devices.get_mut(device) {
                data.untrack_child(object_type, handle);
            }
        }
        if let Some(native) = object.native {
            self.backend.release(object_type, native);
        }
        debug!(%object_type, %handle, "object destroyed");
        Ok(())
    }

    /// Drop a device: detach its callbacks, release the native objects of
    /// all its children, then the device itself. Child slots stay behind as
    /// invalidated placeholders until the client destroys them.
    fn release_device(&mut self, handle: ObjectHandle, mut device: DeviceData) {
        if let Some(native) = device.object.native {
            self.backend.device_set_uncaptured_error_callback(native, None);
            self.backend.device_set_logging_callback(native, None);
            self.backend.device_set_device_lost_callback(native, None);
        }
        let children = device.take_children();
        let invalidated = children.len();
        for (object_type, child) in children {
            self.invalidate_child(object_type, child);
        }
        if let Some(native) = device.object.native {
            self.backend.release(ObjectType::Device, native);
        }
        debug!(device = %handle, invalidated, "device released");
    }

    fn invalidate_child(&mut self, object_type: ObjectType, handle: ObjectHandle) {
        let native = if object_type == ObjectType::Buffer {
            let Ok(buffer) = self.buffers.get_mut(handle) else {
                return;
            };
            buffer.mapping = None;
            let pending = std::mem::take(&mut buffer.pending_maps);
            let native = buffer.object.invalidate();
            for request_serial in pending.into_keys() {
                self.send(ReturnCommand::BufferMapAsyncCallback {
                    buffer: handle,
                    request_serial,
                    status: MapAsyncStatus::DeviceLost,
                    message: "Device was released before the mapping was resolved".into(),
                    read_data_update_info: None,
                });
            }
            native
        } else {
            match self.object_mut(object_type, handle) {
                Ok(object) => object.invalidate(),
                Err(_) => return,
            }
        };
        if let Some(native) = native {
            self.backend.release(object_type, native);
        }
    }

    pub(crate) fn install_device_callbacks(&mut self, device: ObjectHandle, native: NativeHandle) {
        let sink = self.sink();
        self.backend.device_set_uncaptured_error_callback(
            native,
            Some(Box::new(move |error_type, message| {
                sink.push(Completion::UncapturedError { device, error_type, message: message.to_owned() })
            })),
        );
        let sink = self.sink();
        self.backend.device_set_logging_callback(
            native,
            Some(Box::new(move |logging_type, message| {
                sink.push(Completion::Logging { device, logging_type, message: message.to_owned() })
            })),
        );
        let sink = self.sink();
        self.backend.device_set_device_lost_callback(
            native,
            Some(Box::new(move |reason, message| {
                sink.push(Completion::DeviceLost { device, reason, message: message.to_owned() })
            })),
        );
    }

    // ── Injection ───────────────────────────────────────────

    /// Register an instance created outside the wire under a handle the
    /// client reserved. The server takes one native reference.
    pub fn inject_instance(&mut self, native: NativeHandle, handle: ObjectHandle) -> Result<(), InjectError> {
        self.instances.allocate_at(handle, ObjectData::live(native, None))?;
        self.backend.add_ref(ObjectType::Instance, native);
        info!(%handle, %native, "instance injected");
        Ok(())
    }

    pub fn inject_device(&mut self, native: NativeHandle, handle: ObjectHandle) -> Result<(), InjectError> {
        self.devices
            .allocate_at(handle, DeviceData::new(ObjectData::live(native, None)))?;
        self.backend.add_ref(ObjectType::Device, native);
        self.install_device_callbacks(handle, native);
        info!(%handle, %native, "device injected");
        Ok(())
    }

    pub fn inject_texture(&mut self, native: NativeHandle, handle: ObjectHandle, device: ObjectHandle) -> Result<(), InjectError> {
        self.check_injection_device(device)?;
        self.textures.allocate_at(handle, ObjectData::live(native, Some(device)))?;
        self.finish_child_injection(ObjectType::Texture, native, handle, device);
        Ok(())
    }

    pub fn inject_swap_chain(&mut self, native: NativeHandle, handle: ObjectHandle, device: ObjectHandle) -> Result<(), InjectError> {
        self.check_injection_device(device)?;
        self.swap_chains.allocate_at(handle, ObjectData::live(native, Some(device)))?;
        self.finish_child_injection(ObjectType::SwapChain, native, handle, device);
        Ok(())
    }

    pub fn inject_buffer(&mut self, native: NativeHandle, handle: ObjectHandle, device: ObjectHandle) -> Result<(), InjectError> {
        self.check_injection_device(device)?;
        self.buffers
            .allocate_at(handle, BufferData::new(ObjectData::live(native, Some(device))))?;
        self.finish_child_injection(ObjectType::Buffer, native, handle, device);
        Ok(())
    }

    fn check_injection_device(&self, device: ObjectHandle) -> Result<(), InjectError> {
        match self.devices.get(device) {
            Ok(data) if data.object.native.is_some() => Ok(()),
            _ => Err(InjectError::UnknownDevice(device)),
        }
    }

    fn finish_child_injection(&mut self, object_type: ObjectType, native: NativeHandle, handle: ObjectHandle, device: ObjectHandle) {
        self.backend.add_ref(object_type, native);
        if let Ok(parent) = self.devices.get_mut(device) {
            parent.track_child(object_type, handle);
        }
        info!(%object_type, %handle, %native, %device, "object injected");
    }
}

impl<B: Backend, M: MemoryTransferService> CommandHandler for Server<B, M> {
    type Error = ServerError;

    fn handle_commands<'a>(&mut self, commands: &'a [u8]) -> Result<&'a [u8], ServerError> {
        Server::handle_commands(self, commands)
    }
}

impl<B: Backend, M: MemoryTransferService> Drop for Server<B, M> {
    /// Release every native reference the server still holds, children
    /// before the objects they depend on.
    fn drop(&mut self) {
        for (_, device) in self.devices.iter() {
            if let Some(native) = device.object.native {
                self.backend.device_set_uncaptured_error_callback(native, None);
                self.backend.device_set_logging_callback(native, None);
                self.backend.device_set_device_lost_callback(native, None);
            }
        }

        let pending: Vec<Completion> = self.completions.borrow_mut().drain(..).collect();
        for (object_type, native) in pending.iter().filter_map(Completion::native) {
            self.backend.release(object_type, native);
        }

        macro_rules! release_all {
            ($server:ident, $table:ident, $object_type:expr) => {
                for (_, data) in $server.$table.drain() {
                    if let Some(native) = AsRef::<ObjectData>::as_ref(&data).native {
                        $server.backend.release($object_type, native);
                    }
                }
            };
        }

        // Pass 1: pipelines and the modules they were built from
        release_all!(self, compute_pipelines, ObjectType::ComputePipeline);
        release_all!(self, shader_modules, ObjectType::ShaderModule);

        // Pass 2: presentable and sampled resources
        release_all!(self, swap_chains, ObjectType::SwapChain);
        release_all!(self, textures, ObjectType::Texture);

        // Pass 3: buffers, mappings included
        release_all!(self, buffers, ObjectType::Buffer);

        // Pass 4: queues, then their devices
        release_all!(self, queues, ObjectType::Queue);
        release_all!(self, devices, ObjectType::Device);

        // Pass 5: adapters and instances
        release_all!(self, adapters, ObjectType::Adapter);
        release_all!(self, instances, ObjectType::Instance);
    }
}

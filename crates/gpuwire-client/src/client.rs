use gpuwire_core::{ObjectTable, TableError};
use gpuwire_protocol::types::{BufferDescriptor, MapAsyncStatus};
use gpuwire_protocol::wire;
use gpuwire_protocol::{Command, ObjectHandle, ObjectType, RequestSerial, ReturnCommand};
use gpuwire_transport::{write_frame, CommandHandler, CommandSerializer};
use tracing::{debug, error, info, trace, warn};

use crate::adapter::{AdapterState, InstanceState};
use crate::buffer::BufferState;
use crate::device::DeviceState;
use crate::error::ClientError;
use crate::memory_transfer::{InlineMemoryTransferService, MemoryTransferService};
use crate::objects::{
    Buffer, ChildState, Device, Instance, Reservation, SwapChain, Texture, WireObject,
};
use crate::queue::QueueState;

/// Message attached to every callback resolved by a disconnect.
pub const CONNECTION_LOST_MESSAGE: &str = "GPU connection lost";

/// A callback detached from client state, waiting to fire.
type Deferred<M> = Box<dyn FnOnce(&mut Client<M>)>;

/// Callbacks collected while client state is being changed. They fire in
/// serial order once every table is consistent again, so a callback may
/// call back into the client.
pub(crate) struct DeferredCallbacks<M: MemoryTransferService> {
    entries: Vec<(RequestSerial, Deferred<M>)>,
}

impl<M: MemoryTransferService> Default for DeferredCallbacks<M> {
    fn default() -> Self {
        Self { entries: Vec::new() }
    }
}

impl<M: MemoryTransferService> DeferredCallbacks<M> {
    pub(crate) fn push(&mut self, serial: RequestSerial, callback: impl FnOnce(&mut Client<M>) + 'static) {
        self.entries.push((serial, Box::new(callback)));
    }

    pub(crate) fn fire(mut self, client: &mut Client<M>) {
        self.entries.sort_by_key(|(serial, _)| *serial);
        for (_, callback) in self.entries {
            callback(client);
        }
    }
}

/// Runs `$body` with `$table` bound to the client table for `$object_type`.
macro_rules! with_table {
    ($client:expr, $object_type:expr, |$table:ident| $body:expr) => {
        match $object_type {
            ObjectType::Instance => {
                let $table = &mut $client.instances;
                $body
            }
            ObjectType::Adapter => {
                let $table = &mut $client.adapters;
                $body
            }
            ObjectType::Device => {
                let $table = &mut $client.devices;
                $body
            }
            ObjectType::Queue => {
                let $table = &mut $client.queues;
                $body
            }
            ObjectType::Buffer => {
                let $table = &mut $client.buffers;
                $body
            }
            ObjectType::Texture => {
                let $table = &mut $client.textures;
                $body
            }
            ObjectType::SwapChain => {
                let $table = &mut $client.swap_chains;
                $body
            }
            ObjectType::ShaderModule => {
                let $table = &mut $client.shader_modules;
                $body
            }
            ObjectType::ComputePipeline => {
                let $table = &mut $client.compute_pipelines;
                $body
            }
        }
    };
}

/// Client half of the wire.
///
/// Records API calls as commands, tracks the objects and pending requests
/// they create, and resolves those requests from the server's return
/// commands. Every asynchronous callback fires exactly once: with the
/// server's answer, or earlier when the owning object goes away or the
/// connection is lost.
pub struct Client<M: MemoryTransferService = InlineMemoryTransferService> {
    serializer: Box<dyn CommandSerializer>,
    pub(crate) memory_transfer: M,
    pub(crate) instances: ObjectTable<InstanceState<M>>,
    pub(crate) adapters: ObjectTable<AdapterState<M>>,
    pub(crate) devices: ObjectTable<DeviceState<M>>,
    pub(crate) queues: ObjectTable<QueueState<M>>,
    pub(crate) buffers: ObjectTable<BufferState<M>>,
    pub(crate) textures: ObjectTable<ChildState>,
    pub(crate) swap_chains: ObjectTable<ChildState>,
    pub(crate) shader_modules: ObjectTable<ChildState>,
    pub(crate) compute_pipelines: ObjectTable<ChildState>,
    next_serial: RequestSerial,
    disconnected: bool,
    transport_failed: bool,
}

impl Client<InlineMemoryTransferService> {
    pub fn new(serializer: impl CommandSerializer + 'static) -> Self {
        Self::with_memory_transfer(serializer, InlineMemoryTransferService)
    }
}

impl<M: MemoryTransferService> Client<M> {
    pub fn with_memory_transfer(serializer: impl CommandSerializer + 'static, memory_transfer: M) -> Self {
        Self {
            serializer: Box::new(serializer),
            memory_transfer,
            instances: ObjectTable::new(ObjectType::Instance),
            adapters: ObjectTable::new(ObjectType::Adapter),
            devices: ObjectTable::new(ObjectType::Device),
            queues: ObjectTable::new(ObjectType::Queue),
            buffers: ObjectTable::new(ObjectType::Buffer),
            textures: ObjectTable::new(ObjectType::Texture),
            swap_chains: ObjectTable::new(ObjectType::SwapChain),
            shader_modules: ObjectTable::new(ObjectType::ShaderModule),
            compute_pipelines: ObjectTable::new(ObjectType::ComputePipeline),
            next_serial: 1,
            disconnected: false,
            transport_failed: false,
        }
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected
    }

    pub fn memory_transfer(&self) -> &M {
        &self.memory_transfer
    }

    pub(crate) fn next_serial(&mut self) -> RequestSerial {
        let serial = self.next_serial;
        self.next_serial += 1;
        serial
    }

    /// Append one command to the outgoing stream. Nothing is sent once the
    /// client is disconnected.
    pub(crate) fn serialize(&mut self, command: &Command) {
        if self.disconnected || self.transport_failed {
            return;
        }
        let frame = match wire::encode_command(command) {
            Ok(frame) => frame,
            Err(e) => {
                error!(command = command.name(), error = %e, "failed to encode command");
                return;
            }
        };
        trace!(command = command.name(), bytes = frame.len(), "serialized command");
        if !write_frame(self.serializer.as_mut(), &frame) {
            warn!(command = command.name(), "transport rejected command");
            self.transport_failed = true;
        }
    }

    /// Hand every serialized command to the transport. A transport failure
    /// disconnects the client.
    pub fn flush(&mut self) -> Result<(), ClientError> {
        if self.disconnected {
            return Ok(());
        }
        if self.transport_failed || !self.serializer.flush() {
            warn!("wire transport failed");
            self.disconnect();
            return Err(ClientError::TransportFailed);
        }
        Ok(())
    }

    /// Handle every complete return command at the front of `commands`.
    /// Returns the unconsumed tail. After a disconnect the input is
    /// consumed and ignored.
    pub fn handle_commands<'a>(&mut self, commands: &'a [u8]) -> Result<&'a [u8], ClientError> {
        let mut rest = commands;
        while !self.disconnected {
            let Some(frame) = wire::next_frame(rest)? else {
                return Ok(rest);
            };
            let command = wire::decode_return_command(&frame)?;
            rest = &rest[frame.frame_len..];
            self.handle_return_command(command)?;
        }
        Ok(&commands[commands.len()..])
    }

    fn handle_return_command(&mut self, command: ReturnCommand) -> Result<(), ClientError> {
        trace!(command = command.name(), "handling return command");
        match command {
            ReturnCommand::DeviceUncapturedError { device, error_type, message } => {
                self.on_device_uncaptured_error(device, error_type, &message);
            }
            ReturnCommand::DeviceLogging { device, logging_type, message } => {
                self.on_device_logging(device, logging_type, &message);
            }
            ReturnCommand::DeviceLost { device, reason, message } => {
                self.on_device_lost(device, reason, &message);
            }
            ReturnCommand::InstanceRequestAdapterCallback { instance, request_serial, status, message, info } => {
                self.on_request_adapter_callback(instance, request_serial, status, &message, info);
            }
            ReturnCommand::AdapterRequestDeviceCallback { adapter, request_serial, status, message, limits } => {
                self.on_request_device_callback(adapter, request_serial, status, &message, limits);
            }
            ReturnCommand::DeviceCreateComputePipelineAsyncCallback { device, request_serial, status, message } => {
                self.on_create_compute_pipeline_callback(device, request_serial, status, &message);
            }
            ReturnCommand::DevicePopErrorScopeCallback { device, request_serial, status, error_type, message } => {
                self.on_pop_error_scope_callback(device, request_serial, status, error_type, &message);
            }
            ReturnCommand::BufferMapAsyncCallback { buffer, request_serial, status, message, read_data_update_info } => {
                self.on_buffer_map_callback(buffer, request_serial, status, &message, read_data_update_info)?;
            }
            ReturnCommand::QueueWorkDoneCallback { queue, request_serial, status } => {
                self.on_queue_work_done(queue, request_serial, status);
            }
        }
        Ok(())
    }

    /// Treat the connection as lost.
    ///
    /// Every pending request resolves with its connection-lost status and
    /// every live device reports loss, in the order the requests were made.
    /// Requests made afterwards resolve immediately the same way. Calling
    /// this again, including from inside one of those callbacks, does
    /// nothing.
    pub fn disconnect(&mut self) {
        if self.disconnected {
            return;
        }
        self.disconnected = true;
        info!("wire client disconnected");

        let mut deferred = DeferredCallbacks::default();
        let mut orphans = Vec::new();
        for (_, instance) in self.instances.iter_mut() {
            instance.cancel_requests(CONNECTION_LOST_MESSAGE, &mut orphans, &mut deferred);
        }
        for (_, adapter) in self.adapters.iter_mut() {
            adapter.cancel_requests(CONNECTION_LOST_MESSAGE, &mut orphans, &mut deferred);
        }
        for (handle, device) in self.devices.iter_mut() {
            device.lose_connection(handle, &mut orphans, &mut deferred);
        }
        for (_, queue) in self.queues.iter_mut() {
            queue.cancel_requests(
                gpuwire_protocol::types::QueueWorkDoneStatus::DeviceLost,
                &mut deferred,
            );
        }
        for (_, buffer) in self.buffers.iter_mut() {
            buffer.cancel_map(MapAsyncStatus::DeviceLost, CONNECTION_LOST_MESSAGE, &mut deferred);
        }

        // Objects the server never handed over are unreachable now.
        for (object_type, handle) in orphans {
            self.free_slot(object_type, handle);
        }
        deferred.fire(self);
    }

    // ── Lifetime ────────────────────────────────────────────

    pub fn add_ref<T: WireObject>(&mut self, object: T) -> Result<(), ClientError> {
        *self.refcount_mut(T::OBJECT_TYPE, object.handle())? += 1;
        Ok(())
    }

    /// Drop one reference. The last release tears the object down, resolves
    /// whatever it still had pending and tells the server to destroy it.
    pub fn release<T: WireObject>(&mut self, object: T) -> Result<(), ClientError> {
        let mut deferred = DeferredCallbacks::default();
        self.unref(T::OBJECT_TYPE, object.handle(), &mut deferred)?;
        deferred.fire(self);
        Ok(())
    }

    fn refcount_mut(&mut self, object_type: ObjectType, handle: ObjectHandle) -> Result<&mut u32, TableError> {
        with_table!(self, object_type, |table| table.get_mut(handle).map(|state| &mut state.refcount))
    }

    pub(crate) fn unref(
        &mut self,
        object_type: ObjectType,
        handle: ObjectHandle,
        deferred: &mut DeferredCallbacks<M>,
    ) -> Result<(), TableError> {
        let refcount = self.refcount_mut(object_type, handle)?;
        *refcount = refcount.saturating_sub(1);
        if *refcount > 0 {
            return Ok(());
        }
        match object_type {
            ObjectType::Instance => self.teardown_instance(handle, deferred),
            ObjectType::Adapter => self.teardown_adapter(handle, deferred),
            ObjectType::Device => self.teardown_device(handle, deferred),
            ObjectType::Queue => self.teardown_queue(handle, deferred),
            ObjectType::Buffer => self.teardown_buffer(handle, deferred),
            _ => self.free_slot(object_type, handle),
        }
        debug!(%object_type, %handle, "object destroyed");
        self.serialize(&Command::DestroyObject { object_type, handle });
        Ok(())
    }

    /// Free a slot the application never saw and tell the server to drop
    /// its side of it.
    pub(crate) fn discard(&mut self, object_type: ObjectType, handle: ObjectHandle) {
        self.free_slot(object_type, handle);
        self.serialize(&Command::DestroyObject { object_type, handle });
    }

    pub(crate) fn free_slot(&mut self, object_type: ObjectType, handle: ObjectHandle) {
        let freed = with_table!(self, object_type, |table| table.free(handle).map(drop));
        if let Err(e) = freed {
            warn!(error = %e, "freeing an object that is not live");
        }
    }

    /// Number of live objects of one type, reservations included.
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

    // ── Reservations ────────────────────────────────────────

    /// Set aside an instance handle for the server to inject.
    pub fn reserve_instance(&mut self) -> Reservation<Instance> {
        let handle = self.instances.reserve(InstanceState::default());
        Reservation { object: Instance::from_handle(handle), handle, device: None }
    }

    pub fn reserve_device(&mut self) -> Reservation<Device> {
        let lost_serial = self.next_serial();
        let handle = self.devices.reserve(DeviceState::new(None, lost_serial));
        Reservation { object: Device::from_handle(handle), handle, device: None }
    }

    pub fn reserve_texture(&mut self, device: Device) -> Result<Reservation<Texture>, ClientError> {
        self.devices.get(device.handle())?;
        let handle = self.textures.reserve(ChildState::new(device.handle()));
        Ok(Reservation { object: Texture::from_handle(handle), handle, device: Some(device.handle()) })
    }

    pub fn reserve_swap_chain(&mut self, device: Device) -> Result<Reservation<SwapChain>, ClientError> {
        self.devices.get(device.handle())?;
        let handle = self.swap_chains.reserve(ChildState::new(device.handle()));
        Ok(Reservation { object: SwapChain::from_handle(handle), handle, device: Some(device.handle()) })
    }

    pub fn reserve_buffer(
        &mut self,
        device: Device,
        descriptor: &BufferDescriptor,
    ) -> Result<Reservation<Buffer>, ClientError> {
        self.devices.get(device.handle())?;
        let handle = self.buffers.reserve(BufferState::new(device.handle(), descriptor));
        Ok(Reservation { object: Buffer::from_handle(handle), handle, device: Some(device.handle()) })
    }

    /// Give back a reservation that was never injected. The handle is
    /// reusable afterwards and no command is sent.
    pub fn reclaim_reservation<T: WireObject>(&mut self, reservation: &Reservation<T>) -> Result<(), ClientError> {
        let handle = reservation.handle;
        with_table!(self, T::OBJECT_TYPE, |table| table.reclaim(handle).map(drop))?;
        debug!(object_type = %T::OBJECT_TYPE, %handle, "reservation reclaimed");
        Ok(())
    }
}

impl<M: MemoryTransferService> CommandHandler for Client<M> {
    type Error = ClientError;

    fn handle_commands<'a>(&mut self, commands: &'a [u8]) -> Result<&'a [u8], ClientError> {
        Client::handle_commands(self, commands)
    }
}

use gpuwire_protocol::types::{
    AdapterInfo, DeviceDescriptor, Limits, RequestAdapterOptions, RequestAdapterStatus, RequestDeviceStatus,
};
use gpuwire_protocol::{Command, ObjectHandle, ObjectType, RequestSerial};
use tracing::debug;

use crate::client::{Client, DeferredCallbacks, CONNECTION_LOST_MESSAGE};
use crate::device::DeviceState;
use crate::error::ClientError;
use crate::memory_transfer::MemoryTransferService;
use crate::objects::{Adapter, Device, Instance, WireObject};
use crate::request_tracker::RequestTracker;

pub type RequestAdapterCallback<M> =
    Box<dyn FnOnce(&mut Client<M>, RequestAdapterStatus, Option<Adapter>, &str)>;

pub type RequestDeviceCallback<M> =
    Box<dyn FnOnce(&mut Client<M>, RequestDeviceStatus, Option<Device>, &str)>;

pub(crate) struct AdapterRequest<M: MemoryTransferService> {
    /// Slot allocated for the adapter before the request was sent.
    adapter: ObjectHandle,
    callback: RequestAdapterCallback<M>,
}

pub(crate) struct DeviceRequest<M: MemoryTransferService> {
    device: ObjectHandle,
    callback: RequestDeviceCallback<M>,
}

pub(crate) struct InstanceState<M: MemoryTransferService> {
    pub(crate) refcount: u32,
    adapter_requests: RequestTracker<AdapterRequest<M>>,
}

impl<M: MemoryTransferService> Default for InstanceState<M> {
    fn default() -> Self {
        Self {
            refcount: 1,
            adapter_requests: RequestTracker::default(),
        }
    }
}

impl<M: MemoryTransferService> InstanceState<M> {
    pub(crate) fn cancel_requests(
        &mut self,
        message: &str,
        orphans: &mut Vec<(ObjectType, ObjectHandle)>,
        deferred: &mut DeferredCallbacks<M>,
    ) {
        for (serial, request) in self.adapter_requests.drain() {
            orphans.push((ObjectType::Adapter, request.adapter));
            let message = message.to_owned();
            deferred.push(serial, move |client| {
                (request.callback)(client, RequestAdapterStatus::Unknown, None, &message)
            });
        }
    }
}

pub(crate) struct AdapterState<M: MemoryTransferService> {
    pub(crate) refcount: u32,
    instance: ObjectHandle,
    info: Option<AdapterInfo>,
    device_requests: RequestTracker<DeviceRequest<M>>,
}

impl<M: MemoryTransferService> AdapterState<M> {
    fn new(instance: ObjectHandle) -> Self {
        Self {
            refcount: 1,
            instance,
            info: None,
            device_requests: RequestTracker::default(),
        }
    }

    pub(crate) fn cancel_requests(
        &mut self,
        message: &str,
        orphans: &mut Vec<(ObjectType, ObjectHandle)>,
        deferred: &mut DeferredCallbacks<M>,
    ) {
        for (serial, request) in self.device_requests.drain() {
            orphans.push((ObjectType::Device, request.device));
            let message = message.to_owned();
            deferred.push(serial, move |client| {
                (request.callback)(client, RequestDeviceStatus::Unknown, None, &message)
            });
        }
    }
}

impl<M: MemoryTransferService> Client<M> {
    /// Ask the server for an adapter. The adapter handle is allocated now
    /// and only handed to `callback` on success.
    pub fn instance_request_adapter(
        &mut self,
        instance: Instance,
        options: &RequestAdapterOptions,
        callback: impl FnOnce(&mut Client<M>, RequestAdapterStatus, Option<Adapter>, &str) + 'static,
    ) {
        if self.is_disconnected() {
            return callback(self, RequestAdapterStatus::Unknown, None, CONNECTION_LOST_MESSAGE);
        }
        if let Err(e) = self.instances.get(instance.handle()) {
            return callback(self, RequestAdapterStatus::Unknown, None, &e.to_string());
        }

        let adapter = self.adapters.allocate(AdapterState::new(instance.handle()));
        let request_serial = self.next_serial();
        if let Ok(state) = self.instances.get_mut(instance.handle()) {
            state.adapter_requests.add(
                request_serial,
                AdapterRequest {
                    adapter,
                    callback: Box::new(callback),
                },
            );
        }
        self.serialize(&Command::InstanceRequestAdapter {
            instance: instance.handle(),
            request_serial,
            adapter,
            options: options.clone(),
        });
    }

    pub(crate) fn on_request_adapter_callback(
        &mut self,
        instance: ObjectHandle,
        request_serial: RequestSerial,
        status: RequestAdapterStatus,
        message: &str,
        info: Option<AdapterInfo>,
    ) {
        let request = self
            .instances
            .get_mut(instance)
            .ok()
            .and_then(|state| state.adapter_requests.take(request_serial));
        let Some(request) = request else {
            debug!(%instance, request_serial, "stale adapter response ignored");
            return;
        };

        if status == RequestAdapterStatus::Success {
            if let Ok(state) = self.adapters.get_mut(request.adapter) {
                state.info = info;
            }
            let adapter = Adapter::from_handle(request.adapter);
            (request.callback)(self, status, Some(adapter), message);
        } else {
            self.discard(ObjectType::Adapter, request.adapter);
            (request.callback)(self, status, None, message);
        }
    }

    pub fn adapter_info(&self, adapter: Adapter) -> Result<AdapterInfo, ClientError> {
        self.adapters
            .get(adapter.handle())?
            .info
            .clone()
            .ok_or_else(|| ClientError::InvalidOperation(format!("{adapter} has no adapter info")))
    }

    pub fn adapter_instance(&self, adapter: Adapter) -> Result<Instance, ClientError> {
        Ok(Instance::from_handle(self.adapters.get(adapter.handle())?.instance))
    }

    /// Ask the server for a device on `adapter`.
    pub fn adapter_request_device(
        &mut self,
        adapter: Adapter,
        descriptor: &DeviceDescriptor,
        callback: impl FnOnce(&mut Client<M>, RequestDeviceStatus, Option<Device>, &str) + 'static,
    ) {
        if self.is_disconnected() {
            return callback(self, RequestDeviceStatus::Unknown, None, CONNECTION_LOST_MESSAGE);
        }
        if let Err(e) = self.adapters.get(adapter.handle()) {
            return callback(self, RequestDeviceStatus::Unknown, None, &e.to_string());
        }

        let lost_serial = self.next_serial();
        let device = self
            .devices
            .allocate(DeviceState::new(Some(adapter.handle()), lost_serial));
        let request_serial = self.next_serial();
        if let Ok(state) = self.adapters.get_mut(adapter.handle()) {
            state.device_requests.add(
                request_serial,
                DeviceRequest {
                    device,
                    callback: Box::new(callback),
                },
            );
        }
        self.serialize(&Command::AdapterRequestDevice {
            adapter: adapter.handle(),
            request_serial,
            device,
            descriptor: descriptor.clone(),
        });
    }

    pub(crate) fn on_request_device_callback(
        &mut self,
        adapter: ObjectHandle,
        request_serial: RequestSerial,
        status: RequestDeviceStatus,
        message: &str,
        limits: Option<Limits>,
    ) {
        let request = self
            .adapters
            .get_mut(adapter)
            .ok()
            .and_then(|state| state.device_requests.take(request_serial));
        let Some(request) = request else {
            debug!(%adapter, request_serial, "stale device response ignored");
            return;
        };

        if status == RequestDeviceStatus::Success {
            if let (Ok(state), Some(limits)) = (self.devices.get_mut(request.device), limits) {
                state.limits = limits;
            }
            let device = Device::from_handle(request.device);
            (request.callback)(self, status, Some(device), message);
        } else {
            self.discard(ObjectType::Device, request.device);
            (request.callback)(self, status, None, message);
        }
    }

    pub(crate) fn teardown_instance(&mut self, handle: ObjectHandle, deferred: &mut DeferredCallbacks<M>) {
        let Ok(mut state) = self.instances.free(handle) else {
            return;
        };
        let mut orphans = Vec::new();
        state.cancel_requests("Instance released before the adapter request completed", &mut orphans, deferred);
        for (object_type, orphan) in orphans {
            self.discard(object_type, orphan);
        }
    }

    pub(crate) fn teardown_adapter(&mut self, handle: ObjectHandle, deferred: &mut DeferredCallbacks<M>) {
        let Ok(mut state) = self.adapters.free(handle) else {
            return;
        };
        let mut orphans = Vec::new();
        state.cancel_requests("Adapter released before the device request completed", &mut orphans, deferred);
        for (object_type, orphan) in orphans {
            self.discard(object_type, orphan);
        }
    }
}

//! Shared fixture: a client and a server joined by loopback transports,
//! with one injected instance and device on a NullBackend.

#![allow(dead_code)]

use std::cell::RefCell;
use std::rc::Rc;

use gpuwire_client::{Client, Device, Instance, WireObject};
use gpuwire_protocol::wire;
use gpuwire_protocol::{Command, ObjectType};
use gpuwire_server::{NativeHandle, NullBackend, Server};
use gpuwire_transport::loopback::{self, LoopbackReceiver};

pub const MAX_ALLOCATION: usize = 64 * 1024;

pub struct WireHarness<CM, SM>
where
    CM: gpuwire_client::MemoryTransferService,
    SM: gpuwire_server::MemoryTransferService,
{
    pub client: Client<CM>,
    pub server: Server<NullBackend, SM>,
    /// Shares state with the server's backend.
    pub backend: NullBackend,
    to_server: LoopbackReceiver,
    to_client: LoopbackReceiver,
    pub instance: Instance,
    pub device: Device,
    pub native_device: NativeHandle,
}

pub type InlineHarness =
    WireHarness<gpuwire_client::InlineMemoryTransferService, gpuwire_server::InlineMemoryTransferService>;

impl InlineHarness {
    pub fn new() -> Self {
        Self::with_memory_transfer(
            gpuwire_client::InlineMemoryTransferService,
            gpuwire_server::InlineMemoryTransferService,
        )
    }
}

impl<CM, SM> WireHarness<CM, SM>
where
    CM: gpuwire_client::MemoryTransferService,
    SM: gpuwire_server::MemoryTransferService,
{
    pub fn with_memory_transfer(client_transfer: CM, server_transfer: SM) -> Self {
        gpuwire_common::try_init_logging();

        let (client_tx, to_server) = loopback::channel(MAX_ALLOCATION);
        let (server_tx, to_client) = loopback::channel(MAX_ALLOCATION);
        let backend = NullBackend::new();
        let mut client = Client::with_memory_transfer(client_tx, client_transfer);
        let mut server = Server::with_memory_transfer(backend.clone(), server_tx, server_transfer);

        let instance = client.reserve_instance();
        let native_instance = backend.create_instance();
        server
            .inject_instance(native_instance, instance.handle)
            .expect("inject instance");

        let device = client.reserve_device();
        let native_device = backend.create_device();
        server
            .inject_device(native_device, device.handle)
            .expect("inject device");

        Self {
            client,
            server,
            backend,
            to_server,
            to_client,
            instance: instance.object,
            device: device.object,
            native_device,
        }
    }

    /// Send the client's commands and let the server handle them.
    pub fn flush_client(&mut self) {
        self.client.flush().expect("client flush");
        self.to_server
            .deliver(&mut self.server)
            .expect("server handles client commands");
    }

    /// Send the server's return commands and let the client handle them.
    pub fn flush_server(&mut self) {
        self.server.flush().expect("server flush");
        self.to_client
            .deliver(&mut self.client)
            .expect("client handles return commands");
    }

    /// One full round trip, letting the backend finish queued work.
    pub fn pump(&mut self) {
        self.flush_client();
        self.server.process_events();
        self.flush_server();
    }

    /// Decode the client's pending commands without handing them to the
    /// server.
    pub fn take_client_commands(&mut self) -> Vec<Command> {
        self.client.flush().expect("client flush");
        let bytes = self.to_server.take_bytes();
        let mut rest = bytes.as_slice();
        let mut commands = Vec::new();
        while let Some(frame) = wire::next_frame(rest).expect("valid frame") {
            commands.push(wire::decode_command(&frame).expect("valid command"));
            rest = &rest[frame.frame_len..];
        }
        commands
    }

    /// Native object behind a client object, once the server created it.
    pub fn native<T: WireObject>(&self, object: T) -> NativeHandle {
        self.server
            .native_handle(T::OBJECT_TYPE, object.handle())
            .unwrap_or_else(|| panic!("{:?} {} has no native object", T::OBJECT_TYPE, object.handle()))
    }

    pub fn server_count(&self, object_type: ObjectType) -> usize {
        self.server.object_count(object_type)
    }
}

/// Shared log of callback results.
#[derive(Clone)]
pub struct Recorder<T>(Rc<RefCell<Vec<T>>>);

impl<T: Clone> Recorder<T> {
    pub fn new() -> Self {
        Self(Rc::new(RefCell::new(Vec::new())))
    }

    pub fn push(&self, value: T) {
        self.0.borrow_mut().push(value);
    }

    pub fn take(&self) -> Vec<T> {
        std::mem::take(&mut *self.0.borrow_mut())
    }

    pub fn len(&self) -> usize {
        self.0.borrow().len()
    }
}

//! Integration test: client without a server
//!
//! The client writes into a loopback transport whose bytes are decoded
//! here, and return commands are crafted by hand. Covers request serials,
//! pre-allocated handles, local validation of map requests, mapped ranges,
//! object lifetime, and connection loss.

use std::cell::RefCell;
use std::rc::Rc;

use gpuwire_client::{
    Adapter, Buffer, Client, ClientError, Device, Instance, Queue, WireObject, CONNECTION_LOST_MESSAGE,
    DEVICE_DESTROYED_MESSAGE, WHOLE_MAP_SIZE,
};
use gpuwire_core::TableError;
use gpuwire_protocol::types::{
    AdapterInfo, AdapterType, BackendType, BufferDescriptor, BufferMapState, BufferUsage, DeviceLostReason,
    ErrorType, Extent3d, MapAsyncStatus, MapMode, QueueWorkDoneStatus, RequestAdapterOptions, RequestAdapterStatus,
    TextureDescriptor, TextureFormat, TextureUsage,
};
use gpuwire_protocol::wire;
use gpuwire_protocol::{Command, ObjectHandle, ObjectType, RequestSerial, ReturnCommand};
use gpuwire_transport::loopback::{self, LoopbackReceiver};

struct Harness {
    client: Client,
    to_server: LoopbackReceiver,
    instance: Instance,
    device: Device,
}

impl Harness {
    fn new() -> Self {
        Self::with_allocation_size(64 * 1024)
    }

    fn with_allocation_size(max_allocation_size: usize) -> Self {
        gpuwire_common::try_init_logging();
        let (tx, to_server) = loopback::channel(max_allocation_size);
        let mut client = Client::new(tx);
        let instance = client.reserve_instance().object;
        let device = client.reserve_device().object;
        Self {
            client,
            to_server,
            instance,
            device,
        }
    }

    /// Flush and decode everything the client sent since the last call.
    fn sent(&mut self) -> Vec<Command> {
        self.client.flush().expect("client flush");
        let bytes = self.to_server.take_bytes();
        let mut rest = bytes.as_slice();
        let mut commands = Vec::new();
        while let Some(frame) = wire::next_frame(rest).expect("valid frame") {
            commands.push(wire::decode_command(&frame).expect("valid command"));
            rest = &rest[frame.frame_len..];
        }
        assert!(rest.is_empty(), "{} trailing bytes", rest.len());
        commands
    }

    fn respond(&mut self, command: ReturnCommand) -> Result<(), ClientError> {
        let frame = wire::encode_return_command(&command).expect("encode return command");
        let rest = self.client.handle_commands(&frame)?;
        assert!(rest.is_empty());
        Ok(())
    }

    fn buffer(&mut self, size: u64, usage: BufferUsage) -> Buffer {
        self.client
            .device_create_buffer(self.device, &BufferDescriptor::new(size, usage))
            .expect("create buffer")
    }

    /// Map `buffer` and return the serial of the request that went out.
    fn map(&mut self, buffer: Buffer, mode: MapMode, offset: u64, size: u64, log: &Log) -> RequestSerial {
        self.client
            .buffer_map_async(buffer, mode, offset, size, log.recorder("map"));
        match self.sent().pop() {
            Some(Command::BufferMapAsync { request_serial, .. }) => request_serial,
            other => panic!("expected BufferMapAsync, got {:?}", other),
        }
    }
}

/// Ordered log of callback invocations.
#[derive(Clone, Default)]
struct Log(Rc<RefCell<Vec<String>>>);

impl Log {
    fn push(&self, entry: String) {
        self.0.borrow_mut().push(entry);
    }

    fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.0.borrow_mut())
    }

    fn recorder(&self, tag: &'static str) -> impl FnOnce(&mut Client, MapAsyncStatus, &str) + 'static {
        let log = self.clone();
        move |_client: &mut Client, status: MapAsyncStatus, _message: &str| log.push(format!("{tag} {status:?}"))
    }
}

fn adapter_info() -> AdapterInfo {
    AdapterInfo {
        vendor: "gpuwire".into(),
        architecture: "test".into(),
        device: "Test Adapter".into(),
        description: String::new(),
        backend_type: BackendType::Null,
        adapter_type: AdapterType::Cpu,
        vendor_id: 0,
        device_id: 0,
    }
}

fn request_adapter(h: &mut Harness, log: &Log) -> (RequestSerial, Rc<RefCell<Option<Adapter>>>) {
    let adapter = Rc::new(RefCell::new(None));
    let slot = adapter.clone();
    let log = log.clone();
    h.client.instance_request_adapter(
        h.instance,
        &RequestAdapterOptions::default(),
        move |_client: &mut Client, status: RequestAdapterStatus, result: Option<Adapter>, _message: &str| {
            log.push(format!("adapter {status:?}"));
            *slot.borrow_mut() = result;
        },
    );
    match h.sent().as_slice() {
        [Command::InstanceRequestAdapter { request_serial, .. }] => (*request_serial, adapter),
        other => panic!("expected InstanceRequestAdapter, got {:?}", other),
    }
}

#[test]
fn test_request_serials_and_preallocated_adapter() {
    let mut h = Harness::new();
    assert_eq!(h.instance.handle(), ObjectHandle::new(0, 0));
    assert_eq!(h.device.handle(), ObjectHandle::new(0, 0));

    let log = Log::default();
    h.client.instance_request_adapter(
        h.instance,
        &RequestAdapterOptions::default(),
        |_: &mut Client, _: RequestAdapterStatus, _: Option<Adapter>, _: &str| {},
    );
    let commands = h.sent();
    match commands.as_slice() {
        [Command::InstanceRequestAdapter { instance, request_serial, adapter, .. }] => {
            assert_eq!(*instance, h.instance.handle());
            // Serial 1 went to the reserved device's lost callback.
            assert_eq!(*request_serial, 2);
            assert_eq!(*adapter, ObjectHandle::new(0, 0));
        }
        other => panic!("expected InstanceRequestAdapter, got {:?}", other),
    }

    let (serial, adapter) = request_adapter(&mut h, &log);
    assert_eq!(serial, 3);
    h.respond(ReturnCommand::InstanceRequestAdapterCallback {
        instance: h.instance.handle(),
        request_serial: serial,
        status: RequestAdapterStatus::Success,
        message: String::new(),
        info: Some(adapter_info()),
    })
    .unwrap();

    assert_eq!(log.take(), vec!["adapter Success"]);
    let adapter = adapter.borrow().expect("adapter handed over");
    assert_eq!(adapter.handle(), ObjectHandle::new(1, 0));
    assert_eq!(h.client.adapter_info(adapter).unwrap().device, "Test Adapter");
    assert_eq!(h.client.adapter_instance(adapter).unwrap(), h.instance);
}

#[test]
fn test_failed_adapter_request_frees_the_handle() {
    let mut h = Harness::new();
    let log = Log::default();
    let (serial, adapter) = request_adapter(&mut h, &log);
    assert_eq!(h.client.object_count(ObjectType::Adapter), 1);

    h.respond(ReturnCommand::InstanceRequestAdapterCallback {
        instance: h.instance.handle(),
        request_serial: serial,
        status: RequestAdapterStatus::Unavailable,
        message: "no adapter".into(),
        info: None,
    })
    .unwrap();

    assert_eq!(log.take(), vec!["adapter Unavailable"]);
    assert!(adapter.borrow().is_none());
    assert_eq!(h.client.object_count(ObjectType::Adapter), 0);
    match h.sent().as_slice() {
        [Command::DestroyObject { object_type: ObjectType::Adapter, handle }] => {
            assert_eq!(*handle, ObjectHandle::new(0, 0));
        }
        other => panic!("expected DestroyObject, got {:?}", other),
    }
}

#[test]
fn test_responses_to_unknown_requests_are_ignored() {
    let mut h = Harness::new();
    let log = Log::default();
    let (serial, _adapter) = request_adapter(&mut h, &log);

    h.respond(ReturnCommand::InstanceRequestAdapterCallback {
        instance: h.instance.handle(),
        request_serial: serial + 100,
        status: RequestAdapterStatus::Success,
        message: String::new(),
        info: Some(adapter_info()),
    })
    .unwrap();
    h.respond(ReturnCommand::QueueWorkDoneCallback {
        queue: ObjectHandle::new(9, 0),
        request_serial: serial,
        status: QueueWorkDoneStatus::Success,
    })
    .unwrap();
    h.respond(ReturnCommand::DeviceUncapturedError {
        device: ObjectHandle::new(3, 0),
        error_type: ErrorType::Validation,
        message: "nobody listens".into(),
    })
    .unwrap();

    assert!(log.take().is_empty());
    assert!(h.sent().is_empty());
}

#[test]
fn test_map_range_is_checked_locally() {
    let mut h = Harness::new();
    let log = Log::default();
    let buffer = h.buffer(16, BufferUsage::MAP_READ);
    h.sent();

    h.client
        .buffer_map_async(buffer, MapMode::Read, 20, 4, log.recorder("past end"));
    h.client
        .buffer_map_async(buffer, MapMode::Read, 8, 16, log.recorder("too long"));
    h.client
        .buffer_map_async(buffer, MapMode::Read, 8, u64::MAX - 4, log.recorder("overflow"));
    assert_eq!(
        log.take(),
        vec!["past end OffsetOutOfRange", "too long SizeOutOfRange", "overflow SizeOutOfRange"]
    );
    assert!(h.sent().is_empty());
    assert_eq!(h.client.buffer_map_state(buffer).unwrap(), BufferMapState::Unmapped);

    h.client
        .buffer_map_async(buffer, MapMode::Read, 8, WHOLE_MAP_SIZE, log.recorder("whole"));
    match h.sent().as_slice() {
        [Command::BufferMapAsync { offset, size, .. }] => assert_eq!((*offset, *size), (8, 8)),
        other => panic!("expected BufferMapAsync, got {:?}", other),
    }
    assert_eq!(h.client.buffer_map_state(buffer).unwrap(), BufferMapState::Pending);

    h.client
        .buffer_map_async(buffer, MapMode::Read, 0, 4, log.recorder("second"));
    assert_eq!(log.take(), vec!["second MappingAlreadyPending"]);
    assert!(h.sent().is_empty());
}

#[test]
fn test_read_mapping_exposes_server_bytes() {
    let mut h = Harness::new();
    let log = Log::default();
    let buffer = h.buffer(16, BufferUsage::MAP_READ);
    assert_eq!(h.client.buffer_size(buffer).unwrap(), 16);
    assert_eq!(h.client.buffer_usage(buffer).unwrap(), BufferUsage::MAP_READ);
    assert_eq!(h.client.buffer_device(buffer).unwrap(), h.device);
    let serial = h.map(buffer, MapMode::Read, 8, 8, &log);

    h.respond(ReturnCommand::BufferMapAsyncCallback {
        buffer: buffer.handle(),
        request_serial: serial,
        status: MapAsyncStatus::Success,
        message: String::new(),
        read_data_update_info: Some((1..=8).collect()),
    })
    .unwrap();
    assert_eq!(log.take(), vec!["map Success"]);
    assert_eq!(h.client.buffer_map_state(buffer).unwrap(), BufferMapState::Mapped);

    assert_eq!(h.client.buffer_get_const_mapped_range(buffer, 8, 8).unwrap(), &[1, 2, 3, 4, 5, 6, 7, 8]);
    assert_eq!(h.client.buffer_get_const_mapped_range(buffer, 12, WHOLE_MAP_SIZE).unwrap(), &[5, 6, 7, 8]);
    assert!(h.client.buffer_get_const_mapped_range(buffer, 0, 4).is_err());
    assert!(h.client.buffer_get_const_mapped_range(buffer, 12, 8).is_err());
    match h.client.buffer_get_mapped_range(buffer, 8, 8) {
        Err(ClientError::InvalidOperation(_)) => {}
        other => panic!("expected InvalidOperation, got {:?}", other),
    }

    h.client.buffer_unmap(buffer).unwrap();
    match h.sent().as_slice() {
        [Command::BufferUnmap { buffer: unmapped }] => assert_eq!(*unmapped, buffer.handle()),
        other => panic!("expected BufferUnmap, got {:?}", other),
    }
    assert!(h.client.buffer_get_const_mapped_range(buffer, 8, 8).is_err());
}

#[test]
fn test_failed_map_leaves_buffer_unmapped() {
    let mut h = Harness::new();
    let log = Log::default();
    let buffer = h.buffer(8, BufferUsage::MAP_WRITE);
    let serial = h.map(buffer, MapMode::Write, 0, 8, &log);

    h.respond(ReturnCommand::BufferMapAsyncCallback {
        buffer: buffer.handle(),
        request_serial: serial,
        status: MapAsyncStatus::ValidationError,
        message: "not mappable".into(),
        read_data_update_info: None,
    })
    .unwrap();
    assert_eq!(log.take(), vec!["map ValidationError"]);
    assert_eq!(h.client.buffer_map_state(buffer).unwrap(), BufferMapState::Unmapped);
}

#[test]
fn test_write_mapping_is_flushed_on_unmap() {
    let mut h = Harness::new();
    let descriptor = BufferDescriptor {
        mapped_at_creation: true,
        ..BufferDescriptor::new(8, BufferUsage::MAP_WRITE)
    };
    let buffer = h.client.device_create_buffer(h.device, &descriptor).unwrap();
    match h.sent().as_slice() {
        [Command::DeviceCreateBuffer { write_handle_create_info: Some(info), .. }] => assert!(info.is_empty()),
        other => panic!("expected DeviceCreateBuffer, got {:?}", other),
    }
    assert_eq!(h.client.buffer_map_state(buffer).unwrap(), BufferMapState::Mapped);

    h.client
        .buffer_get_mapped_range(buffer, 4, 4)
        .unwrap()
        .copy_from_slice(&42u32.to_le_bytes());
    h.client.buffer_unmap(buffer).unwrap();

    match h.sent().as_slice() {
        [Command::BufferUpdateMappedData { offset, size, data_update_info, .. }, Command::BufferUnmap { .. }] => {
            assert_eq!((*offset, *size), (0, 8));
            assert_eq!(data_update_info, &[0, 0, 0, 0, 42, 0, 0, 0]);
        }
        other => panic!("expected update then unmap, got {:?}", other),
    }
}

#[test]
fn test_unmap_and_destroy_resolve_pending_maps() {
    let mut h = Harness::new();
    let log = Log::default();
    let buffer = h.buffer(8, BufferUsage::MAP_READ);
    let serial = h.map(buffer, MapMode::Read, 0, 8, &log);

    h.client.buffer_unmap(buffer).unwrap();
    assert_eq!(log.take(), vec!["map UnmappedBeforeCallback"]);

    // The server's late answer finds nothing to resolve.
    h.respond(ReturnCommand::BufferMapAsyncCallback {
        buffer: buffer.handle(),
        request_serial: serial,
        status: MapAsyncStatus::Success,
        message: String::new(),
        read_data_update_info: Some(vec![0; 8]),
    })
    .unwrap();
    assert!(log.take().is_empty());
    assert_eq!(h.client.buffer_map_state(buffer).unwrap(), BufferMapState::Unmapped);

    h.map(buffer, MapMode::Read, 0, 8, &log);
    h.client.buffer_destroy(buffer).unwrap();
    assert_eq!(log.take(), vec!["map DestroyedBeforeCallback"]);
    assert!(h.client.buffer_is_destroyed(buffer).unwrap());
    assert!(matches!(h.sent().as_slice(), [Command::BufferDestroy { .. }]));
}

#[test]
fn test_large_command_spans_allocations() {
    let mut h = Harness::with_allocation_size(64);
    let buffer = h.buffer(4096, BufferUsage::COPY_DST);
    let queue = h.client.device_get_queue(h.device).unwrap();
    h.sent();

    let data: Vec<u8> = (0..4096u32).map(|i| (i.wrapping_mul(2_654_435_761) >> 24) as u8).collect();
    h.client.queue_write_buffer(queue, buffer, 0, &data).unwrap();
    match h.sent().as_slice() {
        [Command::QueueWriteBuffer { data: sent, .. }] => assert_eq!(sent, &data),
        other => panic!("expected QueueWriteBuffer, got {:?}", other),
    }
}

#[test]
fn test_release_destroys_on_last_reference() {
    let mut h = Harness::new();
    let texture = h
        .client
        .device_create_texture(
            h.device,
            &TextureDescriptor {
                label: None,
                size: Extent3d {
                    width: 4,
                    height: 4,
                    depth_or_array_layers: 1,
                },
                format: TextureFormat::Rgba8Unorm,
                usage: TextureUsage::COPY_DST.bits(),
                mip_level_count: 1,
                sample_count: 1,
            },
        )
        .unwrap();
    h.sent();

    h.client.add_ref(texture).unwrap();
    h.client.release(texture).unwrap();
    assert!(h.sent().is_empty());

    h.client.release(texture).unwrap();
    match h.sent().as_slice() {
        [Command::DestroyObject { object_type: ObjectType::Texture, handle }] => {
            assert_eq!(*handle, texture.handle());
        }
        other => panic!("expected DestroyObject, got {:?}", other),
    }
    match h.client.release(texture) {
        Err(ClientError::InvalidObject(TableError::NotAllocated { .. })) => {}
        other => panic!("expected InvalidObject, got {:?}", other),
    }
}

#[test]
fn test_device_release_fires_lost_and_releases_queue() {
    let mut h = Harness::new();
    let log = Log::default();
    let queue: Queue = h.client.device_get_queue(h.device).unwrap();
    assert_eq!(h.client.device_get_queue(h.device).unwrap(), queue);

    let lost = log.clone();
    h.client
        .device_set_device_lost_callback(
            h.device,
            Some(Box::new(
                move |_: &mut Client, _: Device, reason: DeviceLostReason, message: &str| {
                    lost.push(format!("lost {reason:?} {message}"))
                },
            )),
        )
        .unwrap();
    let work = log.clone();
    h.client
        .queue_on_submitted_work_done(queue, move |_: &mut Client, status: QueueWorkDoneStatus| {
            work.push(format!("work {status:?}"))
        });
    h.sent();

    h.client.release(h.device).unwrap();
    assert_eq!(log.take(), vec![format!("lost Destroyed {DEVICE_DESTROYED_MESSAGE}")]);
    // The caller still holds two queue references.
    assert_eq!(h.client.object_count(ObjectType::Queue), 1);
    assert!(matches!(
        h.sent().as_slice(),
        [Command::DestroyObject { object_type: ObjectType::Device, .. }]
    ));

    h.client.release(queue).unwrap();
    h.client.release(queue).unwrap();
    assert_eq!(log.take(), vec!["work Unknown"]);
    assert_eq!(h.client.object_count(ObjectType::Queue), 0);
}

#[test]
fn test_device_lost_fires_once_and_silences_errors() {
    let mut h = Harness::new();
    let log = Log::default();
    let errors = log.clone();
    h.client
        .device_set_uncaptured_error_callback(
            h.device,
            Some(Box::new(move |error_type: ErrorType, message: &str| {
                errors.push(format!("error {error_type:?} {message}"))
            })),
        )
        .unwrap();
    let lost = log.clone();
    h.client
        .device_set_device_lost_callback(
            h.device,
            Some(Box::new(
                move |_: &mut Client, _: Device, reason: DeviceLostReason, message: &str| {
                    lost.push(format!("lost {reason:?} {message}"))
                },
            )),
        )
        .unwrap();

    let error = |message: &str| ReturnCommand::DeviceUncapturedError {
        device: ObjectHandle::new(0, 0),
        error_type: ErrorType::OutOfMemory,
        message: message.into(),
    };
    let device_lost = ReturnCommand::DeviceLost {
        device: ObjectHandle::new(0, 0),
        reason: DeviceLostReason::Unknown,
        message: "gone".into(),
    };
    h.respond(error("first")).unwrap();
    h.respond(device_lost.clone()).unwrap();
    h.respond(device_lost).unwrap();
    h.respond(error("second")).unwrap();

    assert_eq!(log.take(), vec!["error OutOfMemory first", "lost Unknown gone"]);
    assert!(h.client.device_is_lost(h.device).unwrap());
}

#[test]
fn test_disconnect_resolves_everything_in_request_order() {
    let mut h = Harness::new();
    let log = Log::default();
    let buffer = h.buffer(8, BufferUsage::MAP_READ);
    let queue = h.client.device_get_queue(h.device).unwrap();
    h.sent();

    let (_serial, _adapter) = request_adapter(&mut h, &log);
    h.map(buffer, MapMode::Read, 0, 8, &log);
    let work = log.clone();
    h.client
        .queue_on_submitted_work_done(queue, move |_: &mut Client, status: QueueWorkDoneStatus| {
            work.push(format!("work {status:?}"))
        });
    let lost = log.clone();
    h.client
        .device_set_device_lost_callback(
            h.device,
            Some(Box::new(
                move |_: &mut Client, _: Device, reason: DeviceLostReason, message: &str| {
                    lost.push(format!("lost {reason:?} {message}"))
                },
            )),
        )
        .unwrap();

    h.client.disconnect();
    h.client.disconnect();
    assert_eq!(
        log.take(),
        vec![
            format!("lost Unknown {CONNECTION_LOST_MESSAGE}"),
            "adapter Unknown".to_string(),
            "map DeviceLost".to_string(),
            "work DeviceLost".to_string(),
        ]
    );
    assert!(h.client.is_disconnected());
    assert_eq!(h.client.object_count(ObjectType::Adapter), 0);

    // Later requests resolve on the spot and nothing more is sent.
    h.to_server.take_bytes();
    h.client
        .buffer_map_async(buffer, MapMode::Read, 0, 8, log.recorder("late map"));
    assert_eq!(log.take(), vec!["late map DeviceLost"]);
    assert!(h.client.flush().is_ok());
    assert!(h.to_server.take_bytes().is_empty());

    let frame = wire::encode_return_command(&ReturnCommand::DeviceLost {
        device: h.device.handle(),
        reason: DeviceLostReason::Unknown,
        message: "late".into(),
    })
    .unwrap();
    assert!(h.client.handle_commands(&frame).unwrap().is_empty());
    assert!(log.take().is_empty());
}

#[test]
fn test_transport_failure_disconnects() {
    let (tx, rx) = loopback::channel(1024);
    drop(rx);
    let mut client = Client::new(tx);
    let device = client.reserve_device().object;
    client.device_inject_error(device, ErrorType::Validation, "boom").unwrap();

    match client.flush() {
        Err(ClientError::TransportFailed) => {}
        other => panic!("expected TransportFailed, got {:?}", other),
    }
    assert!(client.is_disconnected());
}

#[test]
fn test_reserved_slots_can_be_reclaimed() {
    let mut h = Harness::new();
    let reservation = h.client.reserve_texture(h.device).unwrap();
    assert_eq!(reservation.device, Some(h.device.handle()));
    assert_eq!(h.client.object_count(ObjectType::Texture), 1);

    h.client.reclaim_reservation(&reservation).unwrap();
    assert_eq!(h.client.object_count(ObjectType::Texture), 0);
    assert!(h.client.reclaim_reservation(&reservation).is_err());
    assert!(h.sent().is_empty());

    let released = Device::from_handle(ObjectHandle::new(5, 0));
    assert!(matches!(
        h.client.reserve_buffer(released, &BufferDescriptor::new(4, BufferUsage::MAP_READ)),
        Err(ClientError::InvalidObject(_))
    ));
}

#[test]
fn test_truncated_return_stream_is_kept() {
    let mut h = Harness::new();
    let frame = wire::encode_return_command(&ReturnCommand::DeviceLost {
        device: h.device.handle(),
        reason: DeviceLostReason::Unknown,
        message: String::new(),
    })
    .unwrap();
    let rest = h.client.handle_commands(&frame[..frame.len() - 1]).unwrap();
    assert_eq!(rest.len(), frame.len() - 1);
    assert!(!h.client.device_is_lost(h.device).unwrap());

    match h.client.handle_commands(b"XXXXXXXX") {
        Err(ClientError::Wire(_)) => {}
        other => panic!("expected Wire, got {:?}", other),
    }
}

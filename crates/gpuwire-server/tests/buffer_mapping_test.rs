//! Integration test: buffer mapping
//!
//! Drives a client and a server over loopback transports on the null
//! backend. Covers read and write mappings, mapped-at-creation buffers,
//! early unmap, destroy and release, and callbacks that re-enter the client.

mod common;

use common::{InlineHarness, Recorder};
use gpuwire_client::{Buffer, Client, WireObject, WHOLE_MAP_SIZE};
use gpuwire_protocol::types::{BufferDescriptor, BufferMapState, BufferUsage, MapAsyncStatus, MapMode};
use gpuwire_protocol::ObjectType;
use gpuwire_server::ObjectState;

fn create_buffer(h: &mut InlineHarness, size: u64, usage: BufferUsage) -> Buffer {
    let buffer = h
        .client
        .device_create_buffer(h.device, &BufferDescriptor::new(size, usage))
        .expect("create buffer");
    h.flush_client();
    buffer
}

fn record_map(recorder: &Recorder<MapAsyncStatus>) -> impl FnOnce(&mut Client, MapAsyncStatus, &str) + 'static {
    let recorder = recorder.clone();
    move |_client: &mut Client, status: MapAsyncStatus, _message: &str| recorder.push(status)
}

#[test]
fn test_map_read_returns_server_contents() {
    let mut h = InlineHarness::new();
    let buffer = create_buffer(&mut h, 4, BufferUsage::MAP_READ | BufferUsage::COPY_DST);
    h.backend
        .set_buffer_contents(h.native(buffer), 0, &31337u32.to_le_bytes());

    let statuses = Recorder::new();
    h.client
        .buffer_map_async(buffer, MapMode::Read, 0, 4, record_map(&statuses));
    assert_eq!(h.client.buffer_map_state(buffer).unwrap(), BufferMapState::Pending);

    h.pump();
    assert_eq!(statuses.take(), vec![MapAsyncStatus::Success]);
    assert_eq!(h.client.buffer_map_state(buffer).unwrap(), BufferMapState::Mapped);

    let bytes = h.client.buffer_get_const_mapped_range(buffer, 0, 4).unwrap();
    assert_eq!(u32::from_le_bytes(bytes.try_into().unwrap()), 31337);

    // A read mapping has no writable range.
    assert!(h.client.buffer_get_mapped_range(buffer, 0, 4).is_err());
}

#[test]
fn test_map_read_with_offset_and_whole_size() {
    let mut h = InlineHarness::new();
    let buffer = create_buffer(&mut h, 16, BufferUsage::MAP_READ);
    let contents: Vec<u8> = (0..16).collect();
    h.backend.set_buffer_contents(h.native(buffer), 0, &contents);

    let statuses = Recorder::new();
    h.client
        .buffer_map_async(buffer, MapMode::Read, 8, WHOLE_MAP_SIZE, record_map(&statuses));
    h.pump();
    assert_eq!(statuses.take(), vec![MapAsyncStatus::Success]);

    let bytes = h.client.buffer_get_const_mapped_range(buffer, 8, 8).unwrap();
    assert_eq!(bytes, &contents[8..]);
    let tail = h.client.buffer_get_const_mapped_range(buffer, 12, WHOLE_MAP_SIZE).unwrap();
    assert_eq!(tail, &contents[12..]);
    // Offsets are buffer offsets; the mapping starts at 8.
    assert!(h.client.buffer_get_const_mapped_range(buffer, 0, 4).is_err());
}

#[test]
fn test_map_write_reaches_server_on_unmap() {
    let mut h = InlineHarness::new();
    let buffer = create_buffer(&mut h, 4, BufferUsage::MAP_WRITE);

    let statuses = Recorder::new();
    h.client
        .buffer_map_async(buffer, MapMode::Write, 0, 4, record_map(&statuses));
    h.pump();
    assert_eq!(statuses.take(), vec![MapAsyncStatus::Success]);

    h.client
        .buffer_get_mapped_range(buffer, 0, 4)
        .unwrap()
        .copy_from_slice(&4242u32.to_le_bytes());
    h.client.buffer_unmap(buffer).unwrap();
    h.flush_client();

    let contents = h.backend.buffer_contents(h.native(buffer)).unwrap();
    assert_eq!(u32::from_le_bytes(contents[..4].try_into().unwrap()), 4242);
    assert!(!h.backend.is_mapped(h.native(buffer)));
    assert_eq!(h.client.buffer_map_state(buffer).unwrap(), BufferMapState::Unmapped);
}

#[test]
fn test_map_write_with_offset_updates_only_the_mapped_range() {
    let mut h = InlineHarness::new();
    let buffer = create_buffer(&mut h, 16, BufferUsage::MAP_WRITE);

    let statuses = Recorder::new();
    h.client
        .buffer_map_async(buffer, MapMode::Write, 8, 8, record_map(&statuses));
    h.pump();
    assert_eq!(statuses.take(), vec![MapAsyncStatus::Success]);

    h.client
        .buffer_get_mapped_range(buffer, 8, 8)
        .unwrap()
        .copy_from_slice(&[9; 8]);
    h.client.buffer_unmap(buffer).unwrap();
    h.flush_client();

    let contents = h.backend.buffer_contents(h.native(buffer)).unwrap();
    assert_eq!(&contents[..8], &[0; 8]);
    assert_eq!(&contents[8..], &[9; 8]);
}

#[test]
fn test_mapped_at_creation_contents_reach_server() {
    let mut h = InlineHarness::new();
    let mut descriptor = BufferDescriptor::new(8, BufferUsage::COPY_SRC);
    descriptor.mapped_at_creation = true;
    let buffer = h.client.device_create_buffer(h.device, &descriptor).unwrap();
    assert_eq!(h.client.buffer_map_state(buffer).unwrap(), BufferMapState::Mapped);

    h.client
        .buffer_get_mapped_range(buffer, 0, WHOLE_MAP_SIZE)
        .unwrap()
        .copy_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
    h.client.buffer_unmap(buffer).unwrap();
    h.flush_client();

    assert_eq!(h.backend.buffer_contents(h.native(buffer)).unwrap(), vec![1, 2, 3, 4, 5, 6, 7, 8]);
}

#[test]
fn test_mapped_at_creation_of_an_error_buffer_is_ignored() {
    let mut h = InlineHarness::new();
    // Both map usages at once make the null backend reject the buffer.
    let mut descriptor = BufferDescriptor::new(4, BufferUsage::MAP_READ | BufferUsage::MAP_WRITE);
    descriptor.mapped_at_creation = true;
    let buffer = h.client.device_create_buffer(h.device, &descriptor).unwrap();
    h.client
        .buffer_get_mapped_range(buffer, 0, 4)
        .unwrap()
        .copy_from_slice(&[1; 4]);
    h.client.buffer_unmap(buffer).unwrap();
    h.flush_client();

    assert_eq!(h.server.object_state(ObjectType::Buffer, buffer.handle()), Some(ObjectState::Error));
}

#[test]
fn test_unmap_before_map_resolves() {
    let mut h = InlineHarness::new();
    let buffer = create_buffer(&mut h, 4, BufferUsage::MAP_READ);

    let statuses = Recorder::new();
    h.client
        .buffer_map_async(buffer, MapMode::Read, 0, 4, record_map(&statuses));
    h.client.buffer_unmap(buffer).unwrap();
    assert_eq!(statuses.take(), vec![MapAsyncStatus::UnmappedBeforeCallback]);

    // The server's late answer is dropped.
    h.pump();
    assert_eq!(statuses.len(), 0);
    assert_eq!(h.client.buffer_map_state(buffer).unwrap(), BufferMapState::Unmapped);
}

#[test]
fn test_destroy_before_map_resolves() {
    let mut h = InlineHarness::new();
    let buffer = create_buffer(&mut h, 4, BufferUsage::MAP_WRITE);

    let statuses = Recorder::new();
    h.client
        .buffer_map_async(buffer, MapMode::Write, 0, 4, record_map(&statuses));
    h.client.buffer_destroy(buffer).unwrap();
    assert_eq!(statuses.take(), vec![MapAsyncStatus::DestroyedBeforeCallback]);
    assert!(h.client.buffer_is_destroyed(buffer).unwrap());

    h.pump();
    assert_eq!(statuses.len(), 0);
}

#[test]
fn test_release_before_map_resolves() {
    let mut h = InlineHarness::new();
    let buffer = create_buffer(&mut h, 4, BufferUsage::MAP_READ);
    let native = h.native(buffer);

    let statuses = Recorder::new();
    h.client
        .buffer_map_async(buffer, MapMode::Read, 0, 4, record_map(&statuses));
    h.client.release(buffer).unwrap();
    assert_eq!(statuses.take(), vec![MapAsyncStatus::DestroyedBeforeCallback]);

    h.pump();
    assert_eq!(statuses.len(), 0);
    assert_eq!(h.server_count(ObjectType::Buffer), 0);
    assert!(!h.backend.is_alive(native));
    assert!(h.client.buffer_map_state(buffer).is_err());
}

#[test]
fn test_map_while_pending_is_rejected() {
    let mut h = InlineHarness::new();
    let buffer = create_buffer(&mut h, 4, BufferUsage::MAP_READ);

    let first = Recorder::new();
    let second = Recorder::new();
    h.client.buffer_map_async(buffer, MapMode::Read, 0, 4, record_map(&first));
    h.client.buffer_map_async(buffer, MapMode::Read, 0, 4, record_map(&second));
    assert_eq!(second.take(), vec![MapAsyncStatus::MappingAlreadyPending]);

    h.pump();
    assert_eq!(first.take(), vec![MapAsyncStatus::Success]);

    // Mapped buffers reject new maps the same way.
    h.client.buffer_map_async(buffer, MapMode::Read, 0, 4, record_map(&second));
    assert_eq!(second.take(), vec![MapAsyncStatus::MappingAlreadyPending]);
}

#[test]
fn test_map_range_is_checked_locally() {
    let mut h = InlineHarness::new();
    let buffer = create_buffer(&mut h, 16, BufferUsage::MAP_READ);

    let statuses = Recorder::new();
    h.client
        .buffer_map_async(buffer, MapMode::Read, 24, 4, record_map(&statuses));
    h.client
        .buffer_map_async(buffer, MapMode::Read, 8, 16, record_map(&statuses));
    h.client
        .buffer_map_async(buffer, MapMode::Read, u64::MAX - 1, 4, record_map(&statuses));
    assert_eq!(
        statuses.take(),
        vec![
            MapAsyncStatus::OffsetOutOfRange,
            MapAsyncStatus::SizeOutOfRange,
            MapAsyncStatus::OffsetOutOfRange,
        ]
    );
    assert_eq!(h.client.buffer_map_state(buffer).unwrap(), BufferMapState::Unmapped);
}

#[test]
fn test_map_of_unknown_buffer() {
    let mut h = InlineHarness::new();
    let buffer = create_buffer(&mut h, 4, BufferUsage::MAP_READ);
    h.client.release(buffer).unwrap();

    let statuses = Recorder::new();
    h.client
        .buffer_map_async(buffer, MapMode::Read, 0, 4, record_map(&statuses));
    assert_eq!(statuses.take(), vec![MapAsyncStatus::Unknown]);
}

#[test]
fn test_server_map_failure_reaches_callback() {
    let mut h = InlineHarness::new();
    let buffer = create_buffer(&mut h, 4, BufferUsage::MAP_READ);
    h.backend.fail_next_map(MapAsyncStatus::ValidationError);

    let statuses = Recorder::new();
    h.client
        .buffer_map_async(buffer, MapMode::Read, 0, 4, record_map(&statuses));
    h.pump();
    assert_eq!(statuses.take(), vec![MapAsyncStatus::ValidationError]);
    assert_eq!(h.client.buffer_map_state(buffer).unwrap(), BufferMapState::Unmapped);

    // The buffer maps fine afterwards.
    h.client
        .buffer_map_async(buffer, MapMode::Read, 0, 4, record_map(&statuses));
    h.pump();
    assert_eq!(statuses.take(), vec![MapAsyncStatus::Success]);
}

#[test]
fn test_map_without_usage_is_a_validation_error() {
    let mut h = InlineHarness::new();
    let buffer = create_buffer(&mut h, 4, BufferUsage::COPY_DST);

    let statuses = Recorder::new();
    h.client
        .buffer_map_async(buffer, MapMode::Write, 0, 4, record_map(&statuses));
    h.pump();
    assert_eq!(statuses.take(), vec![MapAsyncStatus::ValidationError]);
}

#[test]
fn test_buffer_is_mapped_before_success_callback_runs() {
    let mut h = InlineHarness::new();
    let buffer = create_buffer(&mut h, 4, BufferUsage::MAP_READ);

    let inner = Recorder::new();
    let states = Recorder::new();
    let (inner_cb, states_cb) = (inner.clone(), states.clone());
    h.client.buffer_map_async(buffer, MapMode::Read, 0, 4, move |client: &mut Client, status, _| {
        assert_eq!(status, MapAsyncStatus::Success);
        states_cb.push(client.buffer_map_state(buffer).unwrap());
        client.buffer_map_async(buffer, MapMode::Read, 0, 4, record_map(&inner_cb));
    });
    h.pump();

    assert_eq!(states.take(), vec![BufferMapState::Mapped]);
    assert_eq!(inner.take(), vec![MapAsyncStatus::MappingAlreadyPending]);
}

#[test]
fn test_map_inside_callback_before_destroy() {
    let mut h = InlineHarness::new();
    let buffer = create_buffer(&mut h, 4, BufferUsage::MAP_WRITE);

    let statuses = Recorder::new();
    let nested = Recorder::new();
    let (statuses_cb, nested_cb) = (statuses.clone(), nested.clone());
    h.client.buffer_map_async(buffer, MapMode::Write, 0, 4, move |client: &mut Client, status, _| {
        statuses_cb.push(status);
        // The buffer has no pending request anymore, so this one is sent.
        client.buffer_map_async(buffer, MapMode::Write, 0, 4, record_map(&nested_cb));
    });
    h.client.buffer_destroy(buffer).unwrap();

    assert_eq!(statuses.take(), vec![MapAsyncStatus::DestroyedBeforeCallback]);
    h.pump();
    // The nested map reached a destroyed buffer.
    assert_eq!(nested.take(), vec![MapAsyncStatus::DestroyedBeforeCallback]);
}

#[test]
fn test_disconnect_resolves_maps_in_request_order() {
    let mut h = InlineHarness::new();
    let buffers: Vec<Buffer> = (0..10)
        .map(|_| create_buffer(&mut h, 4, BufferUsage::MAP_READ))
        .collect();
    let reentrant_target = buffers[0];

    let order: Recorder<(usize, MapAsyncStatus)> = Recorder::new();
    for (i, buffer) in buffers.iter().enumerate() {
        let order_cb = order.clone();
        h.client.buffer_map_async(*buffer, MapMode::Read, 0, 4, move |client: &mut Client, status, _| {
            order_cb.push((i, status));
            if i == 0 {
                // Disconnecting again from a callback is a no-op.
                client.disconnect();
                let nested = order_cb.clone();
                client.buffer_map_async(reentrant_target, MapMode::Read, 0, 4, move |_: &mut Client, status, _| {
                    nested.push((100, status))
                });
            }
        });
    }
    let late = Recorder::new();
    h.client.disconnect();
    assert!(h.client.is_disconnected());

    let results = order.take();
    assert_eq!(results.len(), 11);
    let indices: Vec<usize> = results.iter().map(|(i, _)| *i).collect();
    assert_eq!(indices, vec![0, 100, 1, 2, 3, 4, 5, 6, 7, 8, 9]);
    assert!(results.iter().all(|(_, status)| *status == MapAsyncStatus::DeviceLost));

    // New requests resolve immediately.
    h.client
        .buffer_map_async(buffers[0], MapMode::Read, 0, 4, record_map(&late));
    assert_eq!(late.take(), vec![MapAsyncStatus::DeviceLost]);
    assert!(h.client.flush().is_ok());
}

#[test]
fn test_map_after_device_release_reports_device_lost() {
    let mut h = InlineHarness::new();
    let buffer = create_buffer(&mut h, 4, BufferUsage::MAP_READ);
    let native = h.native(buffer);

    let statuses = Recorder::new();
    h.client
        .buffer_map_async(buffer, MapMode::Read, 0, 4, record_map(&statuses));
    h.client.release(h.device).unwrap();
    assert_eq!(statuses.take(), vec![MapAsyncStatus::DestroyedBeforeCallback]);

    h.pump();
    assert_eq!(statuses.len(), 0);
    assert_eq!(h.server.object_state(ObjectType::Buffer, buffer.handle()), Some(ObjectState::Invalidated));
    assert!(!h.backend.is_alive(native));

    h.client
        .buffer_map_async(buffer, MapMode::Read, 0, 4, record_map(&statuses));
    h.pump();
    assert_eq!(statuses.take(), vec![MapAsyncStatus::DeviceLost]);
}

#[test]
fn test_device_destroy_resolves_pending_maps() {
    let mut h = InlineHarness::new();
    let buffer = create_buffer(&mut h, 4, BufferUsage::MAP_READ);

    let statuses = Recorder::new();
    h.client
        .buffer_map_async(buffer, MapMode::Read, 0, 4, record_map(&statuses));
    h.client.device_destroy(h.device).unwrap();
    assert_eq!(statuses.take(), vec![MapAsyncStatus::DestroyedBeforeCallback]);

    h.pump();
    assert_eq!(statuses.len(), 0);
    assert!(h.client.device_is_lost(h.device).unwrap());
}

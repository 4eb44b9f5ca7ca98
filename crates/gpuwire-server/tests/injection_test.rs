//! Integration test: injecting server-created objects into client handles
//!
//! The embedding creates native objects itself, reserves handles on the
//! client and injects the natives under them on the server.

mod common;

use common::{InlineHarness, Recorder};
use gpuwire_client::{Client, WireObject};
use gpuwire_core::TableError;
use gpuwire_protocol::types::{
    BufferDescriptor, BufferUsage, Extent3d, MapAsyncStatus, MapMode, TextureDescriptor, TextureFormat, TextureUsage,
};
use gpuwire_protocol::{ObjectHandle, ObjectType};
use gpuwire_server::{InjectError, ObjectState};

fn texture_descriptor() -> TextureDescriptor {
    TextureDescriptor {
        label: None,
        size: Extent3d {
            width: 4,
            height: 4,
            depth_or_array_layers: 1,
        },
        format: TextureFormat::Rgba8Unorm,
        usage: TextureUsage::TEXTURE_BINDING.bits(),
        mip_level_count: 1,
        sample_count: 1,
    }
}

#[test]
fn test_injected_texture_is_released_by_client() {
    let mut h = InlineHarness::new();
    let reservation = h.client.reserve_texture(h.device).unwrap();
    assert_eq!(reservation.device, Some(h.device.handle()));

    let native = h.backend.create_texture(h.native_device);
    h.server
        .inject_texture(native, reservation.handle, h.device.handle())
        .unwrap();
    assert_eq!(h.backend.refcount(native), 2);
    assert!(h.server.is_device_child(h.device.handle(), ObjectType::Texture, reservation.handle));

    h.client.release(reservation.object).unwrap();
    h.flush_client();
    assert_eq!(h.backend.refcount(native), 1);
    assert_eq!(h.server_count(ObjectType::Texture), 0);
}

#[test]
fn test_injected_swap_chain() {
    let mut h = InlineHarness::new();
    let reservation = h.client.reserve_swap_chain(h.device).unwrap();
    let native = h.backend.create_swap_chain(h.native_device);
    h.server
        .inject_swap_chain(native, reservation.handle, h.device.handle())
        .unwrap();
    assert_eq!(h.server.native_handle(ObjectType::SwapChain, reservation.handle), Some(native));
    assert_eq!(h.server.object_state(ObjectType::SwapChain, reservation.handle), Some(ObjectState::Live));
}

#[test]
fn test_inject_under_unknown_device() {
    let mut h = InlineHarness::new();
    let reservation = h.client.reserve_texture(h.device).unwrap();
    let native = h.backend.create_texture(h.native_device);
    let bogus = ObjectHandle::new(42, 0);

    match h.server.inject_texture(native, reservation.handle, bogus) {
        Err(InjectError::UnknownDevice(device)) => assert_eq!(device, bogus),
        other => panic!("expected UnknownDevice, got {:?}", other),
    }
    assert_eq!(h.server_count(ObjectType::Texture), 0);
    assert_eq!(h.backend.refcount(native), 1);
}

#[test]
fn test_double_injection_is_rejected() {
    let mut h = InlineHarness::new();
    let reservation = h.client.reserve_texture(h.device).unwrap();
    let first = h.backend.create_texture(h.native_device);
    let second = h.backend.create_texture(h.native_device);
    h.server
        .inject_texture(first, reservation.handle, h.device.handle())
        .unwrap();

    match h.server.inject_texture(second, reservation.handle, h.device.handle()) {
        Err(InjectError::Table(TableError::AlreadyAllocated { object_type, .. })) => {
            assert_eq!(object_type, ObjectType::Texture)
        }
        other => panic!("expected AlreadyAllocated, got {:?}", other),
    }
    assert_eq!(h.backend.refcount(second), 1);
    assert_eq!(h.server.native_handle(ObjectType::Texture, reservation.handle), Some(first));
}

#[test]
fn test_reclaimed_reservation_is_reused() {
    let mut h = InlineHarness::new();
    let reservation = h.client.reserve_texture(h.device).unwrap();
    let before = h.client.object_count(ObjectType::Texture);
    h.client.reclaim_reservation(&reservation).unwrap();
    assert_eq!(h.client.object_count(ObjectType::Texture), before - 1);

    // Nothing goes over the wire for a reclaimed reservation.
    assert!(h.take_client_commands().is_empty());

    // Reclaiming twice fails.
    assert!(h.client.reclaim_reservation(&reservation).is_err());

    // A texture created at the reused id reaches the server cleanly.
    let texture = h
        .client
        .device_create_texture(h.device, &texture_descriptor())
        .unwrap();
    assert_eq!(texture.handle().id, reservation.handle.id);
    assert_eq!(texture.handle().generation, reservation.handle.generation + 1);
    h.flush_client();
    assert_eq!(h.server.object_state(ObjectType::Texture, texture.handle()), Some(ObjectState::Live));
    assert_eq!(h.server.object_state(ObjectType::Texture, reservation.handle), None);
    assert_eq!(h.server_count(ObjectType::Texture), 1);
    h.native(texture);
}

#[test]
fn test_reinjection_after_client_release() {
    let mut h = InlineHarness::new();
    let first = h.client.reserve_texture(h.device).unwrap();
    let first_native = h.backend.create_texture(h.native_device);
    h.server
        .inject_texture(first_native, first.handle, h.device.handle())
        .unwrap();
    h.client.release(first.object).unwrap();
    h.flush_client();
    assert_eq!(h.server_count(ObjectType::Texture), 0);
    assert_eq!(h.backend.refcount(first_native), 1);

    let second = h.client.reserve_texture(h.device).unwrap();
    assert_eq!(second.handle.id, first.handle.id);
    assert_eq!(second.handle.generation, first.handle.generation + 1);

    let second_native = h.backend.create_texture(h.native_device);
    h.server
        .inject_texture(second_native, second.handle, h.device.handle())
        .unwrap();
    assert_eq!(h.backend.refcount(second_native), 2);
    assert_eq!(h.server.native_handle(ObjectType::Texture, second.handle), Some(second_native));
    assert_eq!(h.server.native_handle(ObjectType::Texture, first.handle), None);

    // The stale handle cannot be injected over the new one.
    match h.server.inject_texture(first_native, first.handle, h.device.handle()) {
        Err(InjectError::Table(_)) => {}
        other => panic!("expected Table, got {:?}", other),
    }
    assert_eq!(h.backend.refcount(first_native), 1);

    h.client.release(second.object).unwrap();
    h.flush_client();
    assert_eq!(h.backend.refcount(second_native), 1);
}

#[test]
fn test_injected_buffer_maps_for_reading() {
    let mut h = InlineHarness::new();
    let descriptor = BufferDescriptor::new(16, BufferUsage::MAP_READ | BufferUsage::COPY_DST);
    let reservation = h.client.reserve_buffer(h.device, &descriptor).unwrap();
    let native = h
        .backend
        .create_buffer(h.native_device, descriptor.size, descriptor.usage());
    h.backend.set_buffer_contents(native, 8, &[9, 8, 7, 6, 5, 4, 3, 2]);
    h.server
        .inject_buffer(native, reservation.handle, h.device.handle())
        .unwrap();

    let buffer = reservation.object;
    assert_eq!(h.client.buffer_size(buffer).unwrap(), 16);
    let mapped = Recorder::new();
    let mapped_cb = mapped.clone();
    h.client
        .buffer_map_async(buffer, MapMode::Read, 8, 8, move |_: &mut Client, status, _| mapped_cb.push(status));
    h.pump();
    assert_eq!(mapped.take(), vec![MapAsyncStatus::Success]);
    assert_eq!(h.client.buffer_get_const_mapped_range(buffer, 12, 4).unwrap(), &[5, 4, 3, 2]);
}

#[test]
fn test_device_release_invalidates_injected_children() {
    let mut h = InlineHarness::new();
    let reservation = h.client.reserve_texture(h.device).unwrap();
    let native = h.backend.create_texture(h.native_device);
    h.server
        .inject_texture(native, reservation.handle, h.device.handle())
        .unwrap();

    h.client.release(h.device).unwrap();
    h.flush_client();
    assert_eq!(
        h.server.object_state(ObjectType::Texture, reservation.handle),
        Some(ObjectState::Invalidated)
    );
    assert_eq!(h.server.native_handle(ObjectType::Texture, reservation.handle), None);
    assert_eq!(h.backend.refcount(native), 1);

    // The handle stays valid until the client lets go of it.
    h.client.release(reservation.object).unwrap();
    h.flush_client();
    assert_eq!(h.server_count(ObjectType::Texture), 0);
    assert_eq!(h.backend.refcount(native), 1);
}

#[test]
fn test_server_drop_releases_every_native() {
    let mut h = InlineHarness::new();
    let buffer = h
        .client
        .device_create_buffer(h.device, &BufferDescriptor::new(16, BufferUsage::MAP_WRITE))
        .unwrap();
    let texture = h.client.reserve_texture(h.device).unwrap();
    let native_texture = h.backend.create_texture(h.native_device);
    h.server
        .inject_texture(native_texture, texture.handle, h.device.handle())
        .unwrap();
    let pending = Recorder::new();
    let pending_cb = pending.clone();
    h.client
        .buffer_map_async(buffer, MapMode::Write, 0, 16, move |_: &mut Client, status, _| pending_cb.push(status));
    h.flush_client();

    let native_buffer = h.native(buffer);
    let native_device = h.native_device;
    let backend = h.backend.clone();
    assert_eq!(backend.refcount(native_texture), 2);
    assert_eq!(backend.pending_work(), 1);

    drop(h);
    assert!(!backend.is_alive(native_buffer));
    assert_eq!(backend.live_objects(ObjectType::Buffer), 0);
    assert_eq!(backend.refcount(native_texture), 1);
    assert_eq!(backend.refcount(native_device), 1);
    assert!(!backend.device_callbacks_installed(native_device));
    assert!(backend.released().contains(&(ObjectType::Buffer, native_buffer)));
}

//! Handlers for buffer mapping commands.

use gpuwire_protocol::types::{MapAsyncStatus, MapMode};
use gpuwire_protocol::{ObjectHandle, ProtocolError, RequestSerial, ReturnCommand};
use tracing::{debug, warn};

use crate::backend::Backend;
use crate::error::DispatchError;
use crate::memory_transfer::{MemoryTransferService, ReadHandle, WriteHandle};
use crate::objects::{BufferMapping, MapHandle, ObjectState, PendingMap};
use crate::server::{Completion, Server};

fn transfer_error(buffer: ObjectHandle, reason: impl Into<String>) -> DispatchError {
    ProtocolError::MemoryTransfer { buffer, reason: reason.into() }.into()
}

impl<B: Backend, M: MemoryTransferService> Server<B, M> {
    fn send_map_callback(
        &mut self,
        buffer: ObjectHandle,
        request_serial: RequestSerial,
        status: MapAsyncStatus,
        message: impl Into<String>,
    ) {
        self.send(ReturnCommand::BufferMapAsyncCallback {
            buffer,
            request_serial,
            status,
            message: message.into(),
            read_data_update_info: None,
        });
    }

    pub(crate) fn buffer_map_async(
        &mut self,
        buffer: ObjectHandle,
        request_serial: RequestSerial,
        mode: MapMode,
        offset: u64,
        size: u64,
        handle_create_info: &[u8],
    ) -> Result<(), DispatchError> {
        let object = &self.buffers.get(buffer)?.object;
        let (state, native) = (object.state, object.native);

        let handle = match mode {
            MapMode::Read => self
                .memory_transfer
                .deserialize_read_handle(handle_create_info)
                .map(MapHandle::Read),
            MapMode::Write => self
                .memory_transfer
                .deserialize_write_handle(handle_create_info)
                .map(MapHandle::Write),
        };
        let Some(handle) = handle else {
            return Err(transfer_error(buffer, format!("cannot deserialize {mode:?} handle")));
        };

        let native = match (state, native) {
            (_, Some(native)) => native,
            (ObjectState::Invalidated, None) => {
                self.send_map_callback(buffer, request_serial, MapAsyncStatus::DeviceLost, "Device was released");
                return Ok(());
            }
            (_, None) => {
                self.send_map_callback(buffer, request_serial, MapAsyncStatus::ValidationError, "Buffer is invalid");
                return Ok(());
            }
        };

        self.buffers
            .get_mut(buffer)?
            .pending_maps
            .insert(request_serial, PendingMap { offset, size, handle });

        let sink = self.sink();
        self.backend.buffer_map_async(
            native,
            mode,
            offset,
            size,
            Box::new(move |status, message| {
                sink.push(Completion::MapAsync { buffer, request_serial, status, message: message.to_owned() })
            }),
        );
        Ok(())
    }

    pub(crate) fn complete_map(
        &mut self,
        buffer: ObjectHandle,
        request_serial: RequestSerial,
        status: MapAsyncStatus,
        message: String,
    ) {
        let Ok(data) = self.buffers.get_mut(buffer) else {
            return;
        };
        let Some(pending) = data.pending_maps.remove(&request_serial) else {
            debug!(%buffer, request_serial, "map result for a forgotten request");
            return;
        };
        if status != MapAsyncStatus::Success {
            self.send_map_callback(buffer, request_serial, status, message);
            return;
        }
        let Some(native) = data.object.native else {
            self.send_map_callback(buffer, request_serial, MapAsyncStatus::DeviceLost, "Device was released");
            return;
        };

        let PendingMap { offset, size, handle } = pending;
        let (read_data_update_info, write_handle) = match handle {
            MapHandle::Read(mut read_handle) => {
                let Ok(len) = usize::try_from(size) else {
                    self.send_map_callback(buffer, request_serial, MapAsyncStatus::SizeOutOfRange, "Mapping is too large");
                    return;
                };
                let mut update = vec![0u8; read_handle.size_of_serialize_data_update(0, len)];
                let mapped = self.backend.buffer_with_mapped_range(native, offset, size, &mut |bytes| {
                    read_handle.serialize_data_update(bytes, 0, len, &mut update)
                });
                if !mapped {
                    warn!(%buffer, offset, size, "mapped range unavailable after a successful map");
                    self.send_map_callback(buffer, request_serial, MapAsyncStatus::Unknown, "Mapped range is unavailable");
                    return;
                }
                (Some(update), None)
            }
            MapHandle::Write(write_handle) => (None, Some(write_handle)),
        };

        if let Ok(data) = self.buffers.get_mut(buffer) {
            data.mapping = Some(BufferMapping { offset, size, write_handle });
        }
        debug!(%buffer, request_serial, offset, size, "buffer mapped");
        self.send(ReturnCommand::BufferMapAsyncCallback {
            buffer,
            request_serial,
            status,
            message,
            read_data_update_info,
        });
    }

    /// Apply the client's copy of a write mapping. `offset` is relative to
    /// the start of the mapping.
    pub(crate) fn buffer_update_mapped_data(
        &mut self,
        buffer: ObjectHandle,
        offset: u64,
        size: u64,
        data_update_info: &[u8],
    ) -> Result<(), DispatchError> {
        let data = self.buffers.get_mut(buffer)?;
        let Some(native) = data.object.native else {
            debug!(%buffer, "update for an invalid buffer dropped");
            return Ok(());
        };
        let Some(mapping) = data.mapping.as_mut() else {
            return Err(ProtocolError::Unexpected(format!("buffer {buffer} is not mapped")).into());
        };
        let mapping_offset = mapping.offset;
        let mapping_size = mapping.size;
        let Some(write_handle) = mapping.write_handle.as_mut() else {
            return Err(ProtocolError::Unexpected(format!("buffer {buffer} is not mapped for writing")).into());
        };
        if offset.checked_add(size).is_none_or(|end| end > mapping_size) {
            return Err(transfer_error(buffer, "update exceeds the mapped range"));
        }
        let (Ok(local_offset), Ok(len)) = (usize::try_from(offset), usize::try_from(size)) else {
            return Err(transfer_error(buffer, "update exceeds the address space"));
        };

        let mut applied = false;
        let mapped = self
            .backend
            .buffer_with_mapped_range(native, mapping_offset + offset, size, &mut |target| {
                applied = write_handle.deserialize_data_update(data_update_info, local_offset, len, target);
            });
        if !mapped {
            warn!(%buffer, offset, size, "mapped range unavailable, update dropped");
            return Ok(());
        }
        if !applied {
            return Err(transfer_error(buffer, "cannot deserialize data update"));
        }
        Ok(())
    }

    pub(crate) fn buffer_unmap(&mut self, buffer: ObjectHandle) -> Result<(), DispatchError> {
        let data = self.buffers.get_mut(buffer)?;
        data.mapping = None;
        if let Some(native) = data.object.native {
            self.backend.buffer_unmap(native);
        }
        Ok(())
    }

    pub(crate) fn buffer_destroy(&mut self, buffer: ObjectHandle) -> Result<(), DispatchError> {
        let data = self.buffers.get_mut(buffer)?;
        data.mapping = None;
        if let Some(native) = data.object.native {
            self.backend.buffer_destroy(native);
        }
        Ok(())
    }
}

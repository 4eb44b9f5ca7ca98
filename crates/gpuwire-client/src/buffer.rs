use gpuwire_protocol::types::{BufferDescriptor, BufferMapState, BufferUsage, MapAsyncStatus, MapMode};
use gpuwire_protocol::{Command, ObjectHandle, ProtocolError, RequestSerial};
use tracing::{debug, warn};

use crate::client::{Client, DeferredCallbacks, CONNECTION_LOST_MESSAGE};
use crate::error::ClientError;
use crate::memory_transfer::{MemoryTransferService, ReadHandle, WriteHandle};
use crate::objects::{Buffer, Device, WireObject};
use crate::request_tracker::RequestTracker;

/// Map size meaning "from the offset to the end of the buffer".
pub const WHOLE_MAP_SIZE: u64 = u64::MAX;

pub type BufferMapCallback<M> = Box<dyn FnOnce(&mut Client<M>, MapAsyncStatus, &str)>;

pub(crate) enum MapHandle<M: MemoryTransferService> {
    Read(M::ReadHandle),
    Write(M::WriteHandle),
}

/// An established mapping. `offset` and `size` are in buffer bytes; the
/// handle covers exactly that range.
pub(crate) struct Mapping<M: MemoryTransferService> {
    pub(crate) offset: u64,
    pub(crate) size: u64,
    pub(crate) handle: MapHandle<M>,
}

impl<M: MemoryTransferService> Mapping<M> {
    /// Translate a buffer range into a range of the handle's bytes.
    fn local_range(&self, offset: u64, size: u64) -> Result<std::ops::Range<usize>, ClientError> {
        let out_of_range = || {
            ClientError::InvalidOperation(format!(
                "range {offset}+{size} is outside the mapped range {}+{}",
                self.offset, self.size
            ))
        };
        let start = offset.checked_sub(self.offset).ok_or_else(out_of_range)?;
        let size = if size == WHOLE_MAP_SIZE {
            self.size.checked_sub(start).ok_or_else(out_of_range)?
        } else {
            size
        };
        let end = start.checked_add(size).filter(|end| *end <= self.size).ok_or_else(out_of_range)?;
        Ok(start as usize..end as usize)
    }
}

pub(crate) struct MapRequest<M: MemoryTransferService> {
    offset: u64,
    size: u64,
    handle: MapHandle<M>,
    callback: BufferMapCallback<M>,
}

pub(crate) struct BufferState<M: MemoryTransferService> {
    pub(crate) refcount: u32,
    pub(crate) device: ObjectHandle,
    size: u64,
    usage: BufferUsage,
    destroyed: bool,
    /// Holds at most one request.
    map_requests: RequestTracker<MapRequest<M>>,
    pub(crate) mapping: Option<Mapping<M>>,
}

impl<M: MemoryTransferService> BufferState<M> {
    pub(crate) fn new(device: ObjectHandle, descriptor: &BufferDescriptor) -> Self {
        Self {
            refcount: 1,
            device,
            size: descriptor.size,
            usage: descriptor.usage(),
            destroyed: false,
            map_requests: RequestTracker::default(),
            mapping: None,
        }
    }

    fn map_state(&self) -> BufferMapState {
        if !self.map_requests.is_empty() {
            BufferMapState::Pending
        } else if self.mapping.is_some() {
            BufferMapState::Mapped
        } else {
            BufferMapState::Unmapped
        }
    }

    /// Resolve the requested map range against the buffer size.
    fn check_map_range(&self, offset: u64, size: u64) -> Result<u64, (MapAsyncStatus, &'static str)> {
        if offset > self.size {
            return Err((MapAsyncStatus::OffsetOutOfRange, "map offset is past the end of the buffer"));
        }
        let size = if size == WHOLE_MAP_SIZE { self.size - offset } else { size };
        let in_range = offset
            .checked_add(size)
            .is_some_and(|end| end <= self.size && usize::try_from(size).is_ok());
        if !in_range {
            return Err((MapAsyncStatus::SizeOutOfRange, "map range extends past the end of the buffer"));
        }
        Ok(size)
    }

    /// Detach a pending map request and schedule its callback.
    pub(crate) fn cancel_map(&mut self, status: MapAsyncStatus, message: &str, deferred: &mut DeferredCallbacks<M>) {
        for (serial, request) in self.map_requests.drain() {
            let message = message.to_owned();
            deferred.push(serial, move |client| (request.callback)(client, status, &message));
        }
    }
}

impl<M: MemoryTransferService> Client<M> {
    pub fn buffer_size(&self, buffer: Buffer) -> Result<u64, ClientError> {
        Ok(self.buffers.get(buffer.handle())?.size)
    }

    pub fn buffer_usage(&self, buffer: Buffer) -> Result<BufferUsage, ClientError> {
        Ok(self.buffers.get(buffer.handle())?.usage)
    }

    pub fn buffer_device(&self, buffer: Buffer) -> Result<Device, ClientError> {
        Ok(Device::from_handle(self.buffers.get(buffer.handle())?.device))
    }

    /// `Pending` until the map callback has run; `Mapped` from inside a
    /// successful callback on.
    pub fn buffer_map_state(&self, buffer: Buffer) -> Result<BufferMapState, ClientError> {
        Ok(self.buffers.get(buffer.handle())?.map_state())
    }

    /// Map `size` bytes at `offset` (or up to the end with
    /// [`WHOLE_MAP_SIZE`]). Local failures resolve `callback` before this
    /// returns and send nothing.
    pub fn buffer_map_async(
        &mut self,
        buffer: Buffer,
        mode: MapMode,
        offset: u64,
        size: u64,
        callback: impl FnOnce(&mut Client<M>, MapAsyncStatus, &str) + 'static,
    ) {
        if self.is_disconnected() {
            return callback(self, MapAsyncStatus::DeviceLost, CONNECTION_LOST_MESSAGE);
        }
        let handle = buffer.handle();
        let state = match self.buffers.get(handle) {
            Ok(state) => state,
            Err(e) => return callback(self, MapAsyncStatus::Unknown, &e.to_string()),
        };
        if state.map_state() != BufferMapState::Unmapped {
            return callback(
                self,
                MapAsyncStatus::MappingAlreadyPending,
                "Buffer is already mapped or has a mapping pending",
            );
        }
        let size = match state.check_map_range(offset, size) {
            Ok(size) => size,
            Err((status, message)) => return callback(self, status, message),
        };

        let len = size as usize;
        let (map_handle, handle_create_info) = match mode {
            MapMode::Read => match self.memory_transfer.create_read_handle(len) {
                Some(read) => {
                    let mut info = vec![0; read.serialize_create_size()];
                    read.serialize_create(&mut info);
                    (MapHandle::Read(read), info)
                }
                None => return callback(self, MapAsyncStatus::DeviceLost, "Failed to create a read handle"),
            },
            MapMode::Write => match self.memory_transfer.create_write_handle(len) {
                Some(write) => {
                    let mut info = vec![0; write.serialize_create_size()];
                    write.serialize_create(&mut info);
                    (MapHandle::Write(write), info)
                }
                None => return callback(self, MapAsyncStatus::DeviceLost, "Failed to create a write handle"),
            },
        };

        let request_serial = self.next_serial();
        if let Ok(state) = self.buffers.get_mut(handle) {
            state.map_requests.add(
                request_serial,
                MapRequest {
                    offset,
                    size,
                    handle: map_handle,
                    callback: Box::new(callback),
                },
            );
        }
        self.serialize(&Command::BufferMapAsync {
            buffer: handle,
            request_serial,
            mode,
            offset,
            size,
            handle_create_info,
        });
    }

    pub(crate) fn on_buffer_map_callback(
        &mut self,
        buffer: ObjectHandle,
        request_serial: RequestSerial,
        status: MapAsyncStatus,
        message: &str,
        read_data_update_info: Option<Vec<u8>>,
    ) -> Result<(), ClientError> {
        let Some(state) = self.buffers.get_mut(buffer).ok() else {
            debug!(%buffer, request_serial, "map response for a released buffer ignored");
            return Ok(());
        };
        let Some(request) = state.map_requests.take(request_serial) else {
            debug!(%buffer, request_serial, "map response for a resolved request ignored");
            return Ok(());
        };
        let MapRequest { offset, size, mut handle, callback } = request;

        if status != MapAsyncStatus::Success {
            callback(self, status, message);
            return Ok(());
        }

        if let MapHandle::Read(read) = &mut handle {
            let applied = read_data_update_info
                .as_deref()
                .is_some_and(|update| read.deserialize_data_update(update, 0, size as usize));
            if !applied {
                warn!(%buffer, "read mapping update could not be applied");
                callback(self, MapAsyncStatus::Unknown, "Failed to deserialize the mapped data");
                return Err(ProtocolError::MemoryTransfer {
                    buffer,
                    reason: "malformed read data update".into(),
                }
                .into());
            }
        }
        state.mapping = Some(Mapping { offset, size, handle });
        callback(self, status, message);
        Ok(())
    }

    /// Writable view of a write mapping. `offset` is in buffer bytes.
    pub fn buffer_get_mapped_range(&mut self, buffer: Buffer, offset: u64, size: u64) -> Result<&mut [u8], ClientError> {
        let mapping = self.buffers.get_mut(buffer.handle())?.mapping.as_mut().ok_or_else(not_mapped)?;
        let range = mapping.local_range(offset, size)?;
        match &mut mapping.handle {
            MapHandle::Write(write) => Ok(&mut write.data_mut()[range]),
            MapHandle::Read(_) => Err(ClientError::InvalidOperation(
                "buffer is mapped for reading, use the const range".into(),
            )),
        }
    }

    /// Read-only view of any mapping. `offset` is in buffer bytes.
    pub fn buffer_get_const_mapped_range(&self, buffer: Buffer, offset: u64, size: u64) -> Result<&[u8], ClientError> {
        let mapping = self.buffers.get(buffer.handle())?.mapping.as_ref().ok_or_else(not_mapped)?;
        let range = mapping.local_range(offset, size)?;
        Ok(match &mapping.handle {
            MapHandle::Read(read) => &read.data()[range],
            MapHandle::Write(write) => &write.data()[range],
        })
    }

    /// Unmap the buffer. A write mapping's contents are sent to the server
    /// first; a pending map resolves with `UnmappedBeforeCallback`.
    pub fn buffer_unmap(&mut self, buffer: Buffer) -> Result<(), ClientError> {
        let handle = buffer.handle();
        let state = self.buffers.get_mut(handle)?;
        let mut deferred = DeferredCallbacks::default();
        state.cancel_map(
            MapAsyncStatus::UnmappedBeforeCallback,
            "Buffer was unmapped before the mapping was resolved",
            &mut deferred,
        );
        let mapping = state.mapping.take();

        if let Some(Mapping { handle: MapHandle::Write(write), size, .. }) = &mapping {
            let len = *size as usize;
            let mut data_update_info = vec![0; write.size_of_serialize_data_update(0, len)];
            write.serialize_data_update(0, len, &mut data_update_info);
            self.serialize(&Command::BufferUpdateMappedData {
                buffer: handle,
                offset: 0,
                size: *size,
                data_update_info,
            });
        }
        self.serialize(&Command::BufferUnmap { buffer: handle });
        drop(mapping);
        deferred.fire(self);
        Ok(())
    }

    /// Destroy the buffer's storage. Any mapping is dropped without sending
    /// its contents.
    pub fn buffer_destroy(&mut self, buffer: Buffer) -> Result<(), ClientError> {
        let handle = buffer.handle();
        let state = self.buffers.get_mut(handle)?;
        let mut deferred = DeferredCallbacks::default();
        state.cancel_map(
            MapAsyncStatus::DestroyedBeforeCallback,
            "Buffer was destroyed before the mapping was resolved",
            &mut deferred,
        );
        state.mapping = None;
        state.destroyed = true;
        self.serialize(&Command::BufferDestroy { buffer: handle });
        deferred.fire(self);
        Ok(())
    }

    pub fn buffer_is_destroyed(&self, buffer: Buffer) -> Result<bool, ClientError> {
        Ok(self.buffers.get(buffer.handle())?.destroyed)
    }

    pub(crate) fn teardown_buffer(&mut self, handle: ObjectHandle, deferred: &mut DeferredCallbacks<M>) {
        let Ok(mut state) = self.buffers.free(handle) else {
            return;
        };
        state.cancel_map(
            MapAsyncStatus::DestroyedBeforeCallback,
            "Buffer was released before the mapping was resolved",
            deferred,
        );
    }
}

fn not_mapped() -> ClientError {
    ClientError::InvalidOperation("buffer is not mapped".into())
}

//! Client side of mapped-memory transfer.
//!
//! A handle is created when a buffer is mapped and covers exactly the
//! mapped range; offsets passed to a handle are relative to the start of
//! that range. The create info a handle serializes is carried by the map
//! command and opened by the server's matching service.

use gpuwire_core::{RegionDescriptor, SharedRegion, SharedRegionPool};
use tracing::warn;

/// Creates the handles that move mapped bytes between client and server.
pub trait MemoryTransferService: 'static {
    type ReadHandle: ReadHandle;
    type WriteHandle: WriteHandle;

    fn create_read_handle(&mut self, size: usize) -> Option<Self::ReadHandle>;

    fn create_write_handle(&mut self, size: usize) -> Option<Self::WriteHandle>;
}

/// Receives the contents of a read mapping.
pub trait ReadHandle: 'static {
    fn serialize_create_size(&self) -> usize;

    fn serialize_create(&self, out: &mut [u8]);

    /// Mapped bytes as seen by the application.
    fn data(&self) -> &[u8];

    /// Apply an update produced by the server's read handle. `false` means
    /// the update is malformed.
    fn deserialize_data_update(&mut self, update: &[u8], offset: usize, size: usize) -> bool;
}

/// Carries the contents of a write mapping back to the server.
pub trait WriteHandle: 'static {
    fn serialize_create_size(&self) -> usize;

    fn serialize_create(&self, out: &mut [u8]);

    fn data(&self) -> &[u8];

    /// Mapped bytes the application writes into. Zeroed on creation.
    fn data_mut(&mut self) -> &mut [u8];

    fn size_of_serialize_data_update(&self, offset: usize, size: usize) -> usize;

    fn serialize_data_update(&self, offset: usize, size: usize, out: &mut [u8]);
}

fn range(len: usize, offset: usize, size: usize) -> Option<std::ops::Range<usize>> {
    let end = offset.checked_add(size)?;
    (end <= len).then_some(offset..end)
}

// ── Inline ──────────────────────────────────────────────────

/// Mapped bytes travel inside the command stream. Create infos are empty.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineMemoryTransferService;

#[derive(Debug)]
pub struct InlineReadHandle {
    data: Vec<u8>,
}

#[derive(Debug)]
pub struct InlineWriteHandle {
    data: Vec<u8>,
}

impl MemoryTransferService for InlineMemoryTransferService {
    type ReadHandle = InlineReadHandle;
    type WriteHandle = InlineWriteHandle;

    fn create_read_handle(&mut self, size: usize) -> Option<InlineReadHandle> {
        Some(InlineReadHandle { data: vec![0; size] })
    }

    fn create_write_handle(&mut self, size: usize) -> Option<InlineWriteHandle> {
        Some(InlineWriteHandle { data: vec![0; size] })
    }
}

impl ReadHandle for InlineReadHandle {
    fn serialize_create_size(&self) -> usize {
        0
    }

    fn serialize_create(&self, _out: &mut [u8]) {}

    fn data(&self) -> &[u8] {
        &self.data
    }

    fn deserialize_data_update(&mut self, update: &[u8], offset: usize, size: usize) -> bool {
        match range(self.data.len(), offset, size) {
            Some(range) if update.len() == size => {
                self.data[range].copy_from_slice(update);
                true
            }
            _ => false,
        }
    }
}

impl WriteHandle for InlineWriteHandle {
    fn serialize_create_size(&self) -> usize {
        0
    }

    fn serialize_create(&self, _out: &mut [u8]) {}

    fn data(&self) -> &[u8] {
        &self.data
    }

    fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    fn size_of_serialize_data_update(&self, _offset: usize, size: usize) -> usize {
        size
    }

    fn serialize_data_update(&self, offset: usize, size: usize, out: &mut [u8]) {
        if let Some(range) = range(self.data.len(), offset, size) {
            out.copy_from_slice(&self.data[range]);
        }
    }
}

// ── Shared region ───────────────────────────────────────────

/// Mapped bytes are exchanged through a [`SharedRegion`] that both sides
/// open from the same pool. Create infos carry the region descriptor and
/// data updates are empty.
#[derive(Debug, Clone, Default)]
pub struct SharedMemoryTransferService {
    pool: SharedRegionPool,
}

impl SharedMemoryTransferService {
    pub fn new(pool: SharedRegionPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SharedRegionPool {
        &self.pool
    }
}

#[derive(Debug)]
pub struct SharedReadHandle {
    region: SharedRegion,
    pool: SharedRegionPool,
    data: Vec<u8>,
}

#[derive(Debug)]
pub struct SharedWriteHandle {
    region: SharedRegion,
    pool: SharedRegionPool,
    data: Vec<u8>,
}

impl MemoryTransferService for SharedMemoryTransferService {
    type ReadHandle = SharedReadHandle;
    type WriteHandle = SharedWriteHandle;

    fn create_read_handle(&mut self, size: usize) -> Option<SharedReadHandle> {
        Some(SharedReadHandle {
            region: self.pool.create(size),
            pool: self.pool.clone(),
            data: vec![0; size],
        })
    }

    fn create_write_handle(&mut self, size: usize) -> Option<SharedWriteHandle> {
        Some(SharedWriteHandle {
            region: self.pool.create(size),
            pool: self.pool.clone(),
            data: vec![0; size],
        })
    }
}

fn write_descriptor(descriptor: RegionDescriptor, out: &mut [u8]) {
    let encoded = descriptor.encode();
    if out.len() == encoded.len() {
        out.copy_from_slice(encoded);
    }
}

impl ReadHandle for SharedReadHandle {
    fn serialize_create_size(&self) -> usize {
        RegionDescriptor::ENCODED_SIZE
    }

    fn serialize_create(&self, out: &mut [u8]) {
        write_descriptor(self.region.descriptor(), out);
    }

    fn data(&self) -> &[u8] {
        &self.data
    }

    fn deserialize_data_update(&mut self, update: &[u8], offset: usize, size: usize) -> bool {
        if !update.is_empty() {
            return false;
        }
        match range(self.data.len(), offset, size) {
            Some(range) => self.region.read(offset, &mut self.data[range]),
            None => false,
        }
    }
}

impl WriteHandle for SharedWriteHandle {
    fn serialize_create_size(&self) -> usize {
        RegionDescriptor::ENCODED_SIZE
    }

    fn serialize_create(&self, out: &mut [u8]) {
        write_descriptor(self.region.descriptor(), out);
    }

    fn data(&self) -> &[u8] {
        &self.data
    }

    fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    fn size_of_serialize_data_update(&self, _offset: usize, _size: usize) -> usize {
        0
    }

    fn serialize_data_update(&self, offset: usize, size: usize, _out: &mut [u8]) {
        let written = range(self.data.len(), offset, size)
            .is_some_and(|range| self.region.write(offset, &self.data[range]));
        if !written {
            warn!(region = self.region.id(), offset, size, "shared write update out of range");
        }
    }
}

impl Drop for SharedReadHandle {
    fn drop(&mut self) {
        self.pool.release(self.region.id());
    }
}

impl Drop for SharedWriteHandle {
    fn drop(&mut self) {
        self.pool.release(self.region.id());
    }
}

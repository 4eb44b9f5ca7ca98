//! Server side of mapped-memory transfer. Each handle is opened from the
//! create info the client's matching handle serialized.

use gpuwire_core::{RegionDescriptor, SharedRegion, SharedRegionPool};
use tracing::warn;

pub trait MemoryTransferService {
    type ReadHandle: ReadHandle;
    type WriteHandle: WriteHandle;

    /// `None` when the create info is malformed.
    fn deserialize_read_handle(&mut self, create_info: &[u8]) -> Option<Self::ReadHandle>;

    fn deserialize_write_handle(&mut self, create_info: &[u8]) -> Option<Self::WriteHandle>;
}

/// Sends the contents of a read mapping to the client.
pub trait ReadHandle {
    fn size_of_serialize_data_update(&self, offset: usize, size: usize) -> usize;

    /// Serialize the mapped bytes `data` destined for `offset` of the
    /// client's handle into `out`.
    fn serialize_data_update(&mut self, data: &[u8], offset: usize, size: usize, out: &mut [u8]);
}

/// Receives the contents of a write mapping from the client.
pub trait WriteHandle {
    /// Apply a client update to the mapped bytes `target`. `false` means the
    /// update is malformed.
    fn deserialize_data_update(&mut self, update: &[u8], offset: usize, size: usize, target: &mut [u8]) -> bool;
}

// ── Inline ──────────────────────────────────────────────────

#[derive(Debug, Default, Clone, Copy)]
pub struct InlineMemoryTransferService;

#[derive(Debug)]
pub struct InlineReadHandle;

#[derive(Debug)]
pub struct InlineWriteHandle;

impl MemoryTransferService for InlineMemoryTransferService {
    type ReadHandle = InlineReadHandle;
    type WriteHandle = InlineWriteHandle;

    fn deserialize_read_handle(&mut self, create_info: &[u8]) -> Option<InlineReadHandle> {
        create_info.is_empty().then_some(InlineReadHandle)
    }

    fn deserialize_write_handle(&mut self, create_info: &[u8]) -> Option<InlineWriteHandle> {
        create_info.is_empty().then_some(InlineWriteHandle)
    }
}

impl ReadHandle for InlineReadHandle {
    fn size_of_serialize_data_update(&self, _offset: usize, size: usize) -> usize {
        size
    }

    fn serialize_data_update(&mut self, data: &[u8], _offset: usize, size: usize, out: &mut [u8]) {
        if data.len() == size && out.len() == size {
            out.copy_from_slice(data);
        }
    }
}

impl WriteHandle for InlineWriteHandle {
    fn deserialize_data_update(&mut self, update: &[u8], _offset: usize, size: usize, target: &mut [u8]) -> bool {
        if update.len() != size || target.len() != size {
            return false;
        }
        target.copy_from_slice(update);
        true
    }
}

// ── Shared region ───────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct SharedMemoryTransferService {
    pool: SharedRegionPool,
}

impl SharedMemoryTransferService {
    pub fn new(pool: SharedRegionPool) -> Self {
        Self { pool }
    }

    fn open(&self, create_info: &[u8]) -> Option<SharedRegion> {
        let descriptor = RegionDescriptor::decode(create_info)?;
        match self.pool.open(&descriptor) {
            Ok(region) => Some(region),
            Err(e) => {
                warn!(error = %e, "cannot open shared region");
                None
            }
        }
    }
}

#[derive(Debug)]
pub struct SharedReadHandle {
    region: SharedRegion,
}

#[derive(Debug)]
pub struct SharedWriteHandle {
    region: SharedRegion,
}

impl MemoryTransferService for SharedMemoryTransferService {
    type ReadHandle = SharedReadHandle;
    type WriteHandle = SharedWriteHandle;

    fn deserialize_read_handle(&mut self, create_info: &[u8]) -> Option<SharedReadHandle> {
        self.open(create_info).map(|region| SharedReadHandle { region })
    }

    fn deserialize_write_handle(&mut self, create_info: &[u8]) -> Option<SharedWriteHandle> {
        self.open(create_info).map(|region| SharedWriteHandle { region })
    }
}

impl ReadHandle for SharedReadHandle {
    fn size_of_serialize_data_update(&self, _offset: usize, _size: usize) -> usize {
        0
    }

    fn serialize_data_update(&mut self, data: &[u8], offset: usize, _size: usize, _out: &mut [u8]) {
        if !self.region.write(offset, data) {
            warn!(region = self.region.id(), offset, "mapped data does not fit the shared region");
        }
    }
}

impl WriteHandle for SharedWriteHandle {
    fn deserialize_data_update(&mut self, update: &[u8], offset: usize, size: usize, target: &mut [u8]) -> bool {
        update.is_empty() && target.len() == size && self.region.read(offset, target)
    }
}

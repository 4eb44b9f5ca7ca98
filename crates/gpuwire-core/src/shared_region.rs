use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::error::CoreError;

/// Fixed-layout description of a region, exchanged as a handle's create info.
#[derive(Debug, Clone, Copy, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable)]
#[repr(C)]
pub struct RegionDescriptor {
    pub id: u64,
    pub size: u64,
}

impl RegionDescriptor {
    pub const ENCODED_SIZE: usize = std::mem::size_of::<RegionDescriptor>();

    pub fn encode(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        bytemuck::try_pod_read_unaligned(bytes).ok()
    }
}

/// A block of memory both sides of the wire can reach.
#[derive(Debug, Clone)]
pub struct SharedRegion {
    id: u64,
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl SharedRegion {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn len(&self) -> usize {
        self.bytes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn descriptor(&self) -> RegionDescriptor {
        RegionDescriptor {
            id: self.id,
            size: self.len() as u64,
        }
    }

    /// Copy `out.len()` bytes starting at `offset` out of the region.
    pub fn read(&self, offset: usize, out: &mut [u8]) -> bool {
        let bytes = self.bytes.lock();
        match offset.checked_add(out.len()) {
            Some(end) if end <= bytes.len() => {
                out.copy_from_slice(&bytes[offset..end]);
                true
            }
            _ => false,
        }
    }

    /// Copy `data` into the region starting at `offset`.
    pub fn write(&self, offset: usize, data: &[u8]) -> bool {
        let mut bytes = self.bytes.lock();
        match offset.checked_add(data.len()) {
            Some(end) if end <= bytes.len() => {
                bytes[offset..end].copy_from_slice(data);
                true
            }
            _ => false,
        }
    }
}

#[derive(Debug)]
struct Registration {
    region: SharedRegion,
    opened: bool,
    released: bool,
}

/// Registry of shared regions, keyed by id. Cloning shares the registry.
///
/// A region stays registered until its creator has released it and its
/// peer has opened it, in either order; the peer may read the descriptor
/// long after the creator dropped its handle.
#[derive(Debug, Clone, Default)]
pub struct SharedRegionPool {
    regions: Arc<DashMap<u64, Registration>>,
    next_id: Arc<AtomicU64>,
}

impl SharedRegionPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a zero-filled region of `size` bytes.
    pub fn create(&self, size: usize) -> SharedRegion {
        // Start from 1 so a zeroed descriptor never names a region
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let region = SharedRegion {
            id,
            bytes: Arc::new(Mutex::new(vec![0; size])),
        };
        self.regions.insert(
            id,
            Registration {
                region: region.clone(),
                opened: false,
                released: false,
            },
        );
        tracing::trace!(id, size, "created shared region");
        region
    }

    /// Open a region described by a peer.
    pub fn open(&self, descriptor: &RegionDescriptor) -> Result<SharedRegion, CoreError> {
        let region = {
            let mut entry = self
                .regions
                .get_mut(&descriptor.id)
                .ok_or(CoreError::RegionNotFound(descriptor.id))?;
            if entry.region.len() as u64 != descriptor.size {
                return Err(CoreError::RegionNotFound(descriptor.id));
            }
            entry.opened = true;
            entry.region.clone()
        };
        self.remove_if_done(descriptor.id);
        Ok(region)
    }

    /// Drop the creator's registration. Holders of a clone keep their access.
    pub fn release(&self, id: u64) {
        let Some(mut entry) = self.regions.get_mut(&id) else {
            return;
        };
        entry.released = true;
        drop(entry);
        self.remove_if_done(id);
    }

    fn remove_if_done(&self, id: u64) {
        if self
            .regions
            .remove_if(&id, |_, entry| entry.opened && entry.released)
            .is_some()
        {
            tracing::trace!(id, "released shared region");
        }
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }
}

use std::collections::{BTreeMap, BTreeSet};

use gpuwire_protocol::{ObjectHandle, ObjectType, RequestSerial};

use crate::backend::NativeHandle;
use crate::memory_transfer::MemoryTransferService;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectState {
    /// Backed by a native object.
    Live,
    /// Asynchronous creation has not finished.
    Pending,
    /// Creation failed. The slot stays until the client destroys it.
    Error,
    /// The owning device was released and the native object with it.
    Invalidated,
}

/// Server-side record of one client object.
#[derive(Debug, Clone)]
pub struct ObjectData {
    pub native: Option<NativeHandle>,
    /// Owning device, for device children.
    pub device: Option<ObjectHandle>,
    pub state: ObjectState,
}

impl ObjectData {
    pub fn live(native: NativeHandle, device: Option<ObjectHandle>) -> Self {
        Self { native: Some(native), device, state: ObjectState::Live }
    }

    pub fn pending(device: Option<ObjectHandle>) -> Self {
        Self { native: None, device, state: ObjectState::Pending }
    }

    pub fn error(device: Option<ObjectHandle>) -> Self {
        Self { native: None, device, state: ObjectState::Error }
    }

    /// Live when `native` is present, an error object otherwise.
    pub fn created(native: Option<NativeHandle>, device: Option<ObjectHandle>) -> Self {
        match native {
            Some(native) => Self::live(native, device),
            None => Self::error(device),
        }
    }

    /// Detach the native object, leaving the slot as a placeholder.
    pub fn invalidate(&mut self) -> Option<NativeHandle> {
        self.state = ObjectState::Invalidated;
        self.native.take()
    }
}

impl AsRef<ObjectData> for ObjectData {
    fn as_ref(&self) -> &ObjectData {
        self
    }
}

/// A device and the objects created on it.
#[derive(Debug, Clone)]
pub struct DeviceData {
    pub object: ObjectData,
    children: BTreeSet<(ObjectType, ObjectHandle)>,
}

impl DeviceData {
    pub fn new(object: ObjectData) -> Self {
        Self { object, children: BTreeSet::new() }
    }

    pub fn track_child(&mut self, object_type: ObjectType, handle: ObjectHandle) {
        self.children.insert((object_type, handle));
    }

    pub fn untrack_child(&mut self, object_type: ObjectType, handle: ObjectHandle) {
        self.children.remove(&(object_type, handle));
    }

    pub fn has_child(&self, object_type: ObjectType, handle: ObjectHandle) -> bool {
        self.children.contains(&(object_type, handle))
    }

    pub fn take_children(&mut self) -> Vec<(ObjectType, ObjectHandle)> {
        std::mem::take(&mut self.children).into_iter().collect()
    }
}

impl AsRef<ObjectData> for DeviceData {
    fn as_ref(&self) -> &ObjectData {
        &self.object
    }
}

pub(crate) enum MapHandle<M: MemoryTransferService> {
    Read(M::ReadHandle),
    Write(M::WriteHandle),
}

/// A map request forwarded to the backend and not answered yet.
pub(crate) struct PendingMap<M: MemoryTransferService> {
    pub(crate) offset: u64,
    pub(crate) size: u64,
    pub(crate) handle: MapHandle<M>,
}

/// The range currently mapped on the backend. Write mappings keep the
/// handle that receives the client's data update.
pub(crate) struct BufferMapping<M: MemoryTransferService> {
    pub(crate) offset: u64,
    pub(crate) size: u64,
    pub(crate) write_handle: Option<M::WriteHandle>,
}

pub struct BufferData<M: MemoryTransferService> {
    pub object: ObjectData,
    pub(crate) mapping: Option<BufferMapping<M>>,
    pub(crate) pending_maps: BTreeMap<RequestSerial, PendingMap<M>>,
}

impl<M: MemoryTransferService> BufferData<M> {
    pub fn new(object: ObjectData) -> Self {
        Self {
            object,
            mapping: None,
            pending_maps: BTreeMap::new(),
        }
    }
}

impl<M: MemoryTransferService> AsRef<ObjectData> for BufferData<M> {
    fn as_ref(&self) -> &ObjectData {
        &self.object
    }
}

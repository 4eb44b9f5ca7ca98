use gpuwire_protocol::{ObjectGeneration, ObjectHandle, ObjectId, ObjectType, ProtocolError};

/// How far past the current end of a table an id may be allocated.
/// Ids arrive out of order when the client reserves objects that are never
/// injected, but never by more than a handful of slots.
pub const MAX_TABLE_GROWTH: usize = 1 << 16;

#[derive(Debug)]
enum SlotState<T> {
    /// Never used. Only appears on tables filled through `allocate_at`.
    Vacant,
    Free,
    /// Freed at the last generation; no handle may name it again.
    Retired,
    Reserved(T),
    Allocated(T),
}

#[derive(Debug)]
struct Slot<T> {
    generation: ObjectGeneration,
    state: SlotState<T>,
}

/// Generation-checked arena mapping `(id, generation)` handles to objects of
/// one type. Client and server each own one table per object type.
#[derive(Debug)]
pub struct ObjectTable<T> {
    object_type: ObjectType,
    slots: Vec<Slot<T>>,
    /// Freed ids, most recently freed last.
    free_list: Vec<ObjectId>,
    live: usize,
}

impl<T> ObjectTable<T> {
    pub fn new(object_type: ObjectType) -> Self {
        Self {
            object_type,
            slots: Vec::new(),
            free_list: Vec::new(),
            live: 0,
        }
    }

    pub fn object_type(&self) -> ObjectType {
        self.object_type
    }

    /// Store `data` under a fresh handle, reusing the most recently freed id.
    pub fn allocate(&mut self, data: T) -> ObjectHandle {
        self.insert_new(SlotState::Allocated(data))
    }

    /// Like [`allocate`](Self::allocate), but the slot stays reclaimable until
    /// it is freed or reclaimed.
    pub fn reserve(&mut self, data: T) -> ObjectHandle {
        self.insert_new(SlotState::Reserved(data))
    }

    fn insert_new(&mut self, state: SlotState<T>) -> ObjectHandle {
        self.live += 1;
        while let Some(id) = self.free_list.pop() {
            let slot = &mut self.slots[id as usize];
            // Ids taken over by `allocate_at` stay in the list until popped.
            if matches!(slot.state, SlotState::Free) {
                slot.state = state;
                return ObjectHandle::new(id, slot.generation);
            }
        }
        let id = self.slots.len() as ObjectId;
        self.slots.push(Slot { generation: 0, state });
        ObjectHandle::new(id, 0)
    }

    /// Store `data` at the exact handle chosen by the other side of the wire.
    ///
    /// Fails if the id is live, or if the generation is older than the
    /// slot's current generation (the handle was already superseded).
    pub fn allocate_at(&mut self, handle: ObjectHandle, data: T) -> Result<(), TableError> {
        let index = handle.id as usize;
        if index >= self.slots.len() + MAX_TABLE_GROWTH {
            return Err(TableError::TooFarAhead {
                object_type: self.object_type,
                id: handle.id,
            });
        }
        while self.slots.len() <= index {
            self.slots.push(Slot { generation: 0, state: SlotState::Vacant });
        }

        let slot = &mut self.slots[index];
        match slot.state {
            SlotState::Allocated(_) | SlotState::Reserved(_) => {
                return Err(TableError::AlreadyAllocated {
                    object_type: self.object_type,
                    id: handle.id,
                });
            }
            SlotState::Free if handle.generation < slot.generation => {
                return Err(TableError::StaleGeneration {
                    object_type: self.object_type,
                    handle,
                    live: slot.generation,
                });
            }
            SlotState::Retired => {
                return Err(TableError::Retired {
                    object_type: self.object_type,
                    id: handle.id,
                });
            }
            SlotState::Free | SlotState::Vacant => {}
        }

        slot.generation = handle.generation;
        slot.state = SlotState::Allocated(data);
        self.live += 1;
        Ok(())
    }

    /// Generation-checked lookup.
    pub fn get(&self, handle: ObjectHandle) -> Result<&T, TableError> {
        let slot = self.slots.get(handle.id as usize).ok_or(TableError::OutOfRange {
            object_type: self.object_type,
            id: handle.id,
        })?;
        match &slot.state {
            SlotState::Allocated(data) | SlotState::Reserved(data) if slot.generation == handle.generation => {
                Ok(data)
            }
            SlotState::Allocated(_) | SlotState::Reserved(_) => Err(TableError::StaleGeneration {
                object_type: self.object_type,
                handle,
                live: slot.generation,
            }),
            SlotState::Free | SlotState::Retired | SlotState::Vacant => Err(TableError::NotAllocated {
                object_type: self.object_type,
                handle,
            }),
        }
    }

    pub fn get_mut(&mut self, handle: ObjectHandle) -> Result<&mut T, TableError> {
        let object_type = self.object_type;
        let slot = self.slots.get_mut(handle.id as usize).ok_or(TableError::OutOfRange {
            object_type,
            id: handle.id,
        })?;
        let live = slot.generation;
        match &mut slot.state {
            SlotState::Allocated(data) | SlotState::Reserved(data) if live == handle.generation => Ok(data),
            SlotState::Allocated(_) | SlotState::Reserved(_) => Err(TableError::StaleGeneration {
                object_type,
                handle,
                live,
            }),
            SlotState::Free | SlotState::Retired | SlotState::Vacant => Err(TableError::NotAllocated { object_type, handle }),
        }
    }

    pub fn contains(&self, handle: ObjectHandle) -> bool {
        self.get(handle).is_ok()
    }

    /// Bounds-checked lookup by id alone. Returns the live handle too.
    pub fn get_by_id(&self, id: ObjectId) -> Option<(ObjectHandle, &T)> {
        let slot = self.slots.get(id as usize)?;
        match &slot.state {
            SlotState::Allocated(data) | SlotState::Reserved(data) => {
                Some((ObjectHandle::new(id, slot.generation), data))
            }
            SlotState::Free | SlotState::Retired | SlotState::Vacant => None,
        }
    }

    pub fn is_reserved(&self, handle: ObjectHandle) -> bool {
        self.get(handle).is_ok()
            && matches!(self.slots[handle.id as usize].state, SlotState::Reserved(_))
    }

    /// Free a live slot and bump its generation so every outstanding copy of
    /// `handle` turns stale.
    pub fn free(&mut self, handle: ObjectHandle) -> Result<T, TableError> {
        self.get(handle)?;
        let slot = &mut self.slots[handle.id as usize];
        let data = match std::mem::replace(&mut slot.state, SlotState::Free) {
            SlotState::Allocated(data) | SlotState::Reserved(data) => data,
            previous => {
                slot.state = previous;
                return Err(TableError::NotAllocated {
                    object_type: self.object_type,
                    handle,
                });
            }
        };
        self.release_slot(handle);
        Ok(data)
    }

    /// Give back a reservation that was never used.
    pub fn reclaim(&mut self, handle: ObjectHandle) -> Result<T, TableError> {
        self.get(handle)?;
        if !self.is_reserved(handle) {
            return Err(TableError::NotReserved {
                object_type: self.object_type,
                handle,
            });
        }
        self.free(handle)
    }

    fn release_slot(&mut self, handle: ObjectHandle) {
        self.live -= 1;
        let slot = &mut self.slots[handle.id as usize];
        if handle.generation == ObjectGeneration::MAX {
            slot.state = SlotState::Retired;
            return;
        }
        slot.generation = handle.generation + 1;
        // Local allocation never hands out the last generation; only the
        // peer may place it with `allocate_at`.
        if slot.generation < ObjectGeneration::MAX {
            self.free_list.push(handle.id);
        }
    }

    /// Handles of every live slot, in id order.
    pub fn handles(&self) -> Vec<ObjectHandle> {
        self.iter().map(|(handle, _)| handle).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ObjectHandle, &T)> + '_ {
        self.slots.iter().enumerate().filter_map(|(id, slot)| match &slot.state {
            SlotState::Allocated(data) | SlotState::Reserved(data) => {
                Some((ObjectHandle::new(id as ObjectId, slot.generation), data))
            }
            SlotState::Free | SlotState::Retired | SlotState::Vacant => None,
        })
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (ObjectHandle, &mut T)> + '_ {
        self.slots.iter_mut().enumerate().filter_map(|(id, slot)| {
            let generation = slot.generation;
            match &mut slot.state {
                SlotState::Allocated(data) | SlotState::Reserved(data) => {
                    Some((ObjectHandle::new(id as ObjectId, generation), data))
                }
                SlotState::Free | SlotState::Retired | SlotState::Vacant => None,
            }
        })
    }

    /// Free every live slot and hand back the contents, in id order.
    pub fn drain(&mut self) -> Vec<(ObjectHandle, T)> {
        let handles = self.handles();
        let mut drained = Vec::with_capacity(handles.len());
        for handle in handles {
            if let Ok(data) = self.free(handle) {
                drained.push((handle, data));
            }
        }
        drained
    }

    /// Number of live (allocated or reserved) slots.
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TableError {
    #[error("{object_type} id {id} is out of range")]
    OutOfRange { object_type: ObjectType, id: ObjectId },

    #[error("{object_type} {handle} is not allocated")]
    NotAllocated { object_type: ObjectType, handle: ObjectHandle },

    #[error("{object_type} {handle} is stale, live generation is {live}")]
    StaleGeneration {
        object_type: ObjectType,
        handle: ObjectHandle,
        live: ObjectGeneration,
    },

    #[error("{object_type} id {id} is already allocated")]
    AlreadyAllocated { object_type: ObjectType, id: ObjectId },

    #[error("{object_type} {handle} is not an unused reservation")]
    NotReserved { object_type: ObjectType, handle: ObjectHandle },

    #[error("{object_type} id {id} is too far past the end of the table")]
    TooFarAhead { object_type: ObjectType, id: ObjectId },

    #[error("{object_type} id {id} ran out of generations")]
    Retired { object_type: ObjectType, id: ObjectId },
}

impl From<TableError> for ProtocolError {
    fn from(err: TableError) -> Self {
        match err {
            TableError::OutOfRange { object_type, id } => ProtocolError::UnknownObject {
                object_type,
                handle: ObjectHandle::new(id, 0),
            },
            TableError::NotAllocated { object_type, handle } => {
                ProtocolError::UnknownObject { object_type, handle }
            }
            TableError::StaleGeneration { object_type, handle, .. } => {
                ProtocolError::GenerationMismatch { object_type, handle }
            }
            TableError::AlreadyAllocated { object_type, id } => ProtocolError::AllocationRejected {
                object_type,
                handle: ObjectHandle::new(id, 0),
                reason: "id is already allocated".to_string(),
            },
            TableError::NotReserved { object_type, handle } => ProtocolError::AllocationRejected {
                object_type,
                handle,
                reason: "not an unused reservation".to_string(),
            },
            TableError::TooFarAhead { object_type, id } => ProtocolError::AllocationRejected {
                object_type,
                handle: ObjectHandle::new(id, 0),
                reason: "id is too far past the end of the table".to_string(),
            },
            TableError::Retired { object_type, id } => ProtocolError::GenerationMismatch {
                object_type,
                handle: ObjectHandle::new(id, ObjectGeneration::MAX),
            },
        }
    }
}

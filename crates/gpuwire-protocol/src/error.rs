use crate::handle::{ObjectHandle, ObjectType};

/// A violation of the wire protocol. Fatal to the connection: the side that
/// observes one must stop handling commands.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("unknown {object_type} {handle}")]
    UnknownObject {
        object_type: ObjectType,
        handle: ObjectHandle,
    },

    #[error("{object_type} {handle} does not match the live generation")]
    GenerationMismatch {
        object_type: ObjectType,
        handle: ObjectHandle,
    },

    #[error("cannot allocate {object_type} {handle}: {reason}")]
    AllocationRejected {
        object_type: ObjectType,
        handle: ObjectHandle,
        reason: String,
    },

    #[error("malformed command: {0}")]
    Malformed(String),

    #[error("memory transfer failed for buffer {buffer}: {reason}")]
    MemoryTransfer {
        buffer: ObjectHandle,
        reason: String,
    },

    #[error("unexpected command: {0}")]
    Unexpected(String),
}

use gpuwire_core::TableError;
use gpuwire_protocol::wire::WireError;
use gpuwire_protocol::{ObjectHandle, ObjectType, ProtocolError};

/// Errors that stop the server from handling the stream.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("wire format error: {0}")]
    Wire(#[from] WireError),

    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("transport failed")]
    TransportFailed,
}

/// A command combined objects from different devices. Reported to the
/// client as a validation error; the stream stays usable.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{object_type} {handle} does not belong to device {expected}")]
pub struct WrongDeviceError {
    pub object_type: ObjectType,
    pub handle: ObjectHandle,
    pub expected: ObjectHandle,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InjectError {
    #[error("device {0} is not live")]
    UnknownDevice(ObjectHandle),

    #[error(transparent)]
    Table(#[from] TableError),
}

/// Outcome of a command that could not be executed.
#[derive(Debug)]
pub(crate) enum DispatchError {
    Fatal(ProtocolError),
    WrongDevice(WrongDeviceError),
}

impl From<ProtocolError> for DispatchError {
    fn from(err: ProtocolError) -> Self {
        DispatchError::Fatal(err)
    }
}

impl From<TableError> for DispatchError {
    fn from(err: TableError) -> Self {
        DispatchError::Fatal(err.into())
    }
}

impl From<WrongDeviceError> for DispatchError {
    fn from(err: WrongDeviceError) -> Self {
        DispatchError::WrongDevice(err)
    }
}

use gpuwire_core::TableError;
use gpuwire_protocol::wire::WireError;
use gpuwire_protocol::ProtocolError;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("wire format error: {0}")]
    Wire(#[from] WireError),

    /// The server sent something the client cannot accept. The stream must
    /// not be handled further.
    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolError),

    /// The application passed a released or unknown object.
    #[error(transparent)]
    InvalidObject(#[from] TableError),

    #[error("transport failed, client disconnected")]
    TransportFailed,

    #[error("memory transfer handle creation failed")]
    HandleCreationFailed,

    #[error("{0}")]
    InvalidOperation(String),
}

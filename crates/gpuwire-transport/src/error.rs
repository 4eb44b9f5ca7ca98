#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("wire format error: {0}")]
    Wire(#[from] gpuwire_protocol::wire::WireError),

    #[error("trace ends inside a frame ({0} trailing bytes)")]
    TruncatedTrace(usize),

    #[error("connection closed")]
    ConnectionClosed,
}

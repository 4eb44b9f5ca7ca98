pub mod backend;
mod buffer;
mod device;
pub mod error;
pub mod memory_transfer;
pub mod null_backend;
pub mod objects;
pub mod server;

pub use backend::{Backend, NativeHandle};
pub use error::{InjectError, ServerError, WrongDeviceError};
pub use memory_transfer::{InlineMemoryTransferService, MemoryTransferService, SharedMemoryTransferService};
pub use null_backend::NullBackend;
pub use objects::{ObjectData, ObjectState};
pub use server::Server;

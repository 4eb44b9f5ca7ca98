pub mod handle;
pub mod commands;
pub mod types;
pub mod wire;
pub mod error;

pub use handle::{ObjectGeneration, ObjectHandle, ObjectId, ObjectType};
pub use commands::{Command, RequestSerial, ReturnCommand};
pub use error::ProtocolError;

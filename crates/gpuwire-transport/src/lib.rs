pub mod serializer;
pub mod loopback;
pub mod trace;
pub mod error;

pub use serializer::{write_frame, CommandHandler, CommandSerializer};
pub use loopback::{LoopbackReceiver, LoopbackSerializer};
pub use trace::TraceSerializer;
pub use error::TransportError;

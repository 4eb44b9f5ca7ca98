//! Tools behind the `gpuwire` binary.

pub mod demo;
pub mod dump;
pub mod replay;

pub use demo::{run_demo, DemoReport};
pub use dump::{dump_trace, Direction, DumpedFrame};
pub use replay::{replay_entries, replay_trace, ReplayReport};

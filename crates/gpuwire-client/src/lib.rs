//! Client half of the gpuwire protocol.
//!
//! The [`Client`] turns API calls into commands for a [`CommandSerializer`]
//! and resolves callbacks from the return commands fed to
//! [`Client::handle_commands`].
//!
//! [`CommandSerializer`]: gpuwire_transport::CommandSerializer

pub mod adapter;
pub mod buffer;
pub mod client;
pub mod device;
pub mod error;
pub mod memory_transfer;
pub mod objects;
pub mod queue;
mod request_tracker;

pub use adapter::{RequestAdapterCallback, RequestDeviceCallback};
pub use buffer::{BufferMapCallback, WHOLE_MAP_SIZE};
pub use client::{Client, CONNECTION_LOST_MESSAGE};
pub use device::{
    ComputePipelineDescriptor, CreateComputePipelineCallback, DeviceLostCallback, ErrorCallback,
    LoggingCallback, PopErrorScopeCallback, DEVICE_DESTROYED_MESSAGE,
};
pub use error::ClientError;
pub use memory_transfer::{
    InlineMemoryTransferService, MemoryTransferService, ReadHandle, SharedMemoryTransferService, WriteHandle,
};
pub use objects::{
    Adapter, Buffer, ComputePipeline, Device, Instance, Queue, Reservation, ShaderModule, SwapChain, Texture,
    WireObject,
};
pub use queue::QueueWorkDoneCallback;

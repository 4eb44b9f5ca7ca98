pub mod config;
pub mod error;
pub mod object_table;
pub mod shared_region;

pub use config::{MemoryTransferMode, WireConfig};
pub use error::CoreError;
pub use object_table::{ObjectTable, TableError};
pub use shared_region::{RegionDescriptor, SharedRegion, SharedRegionPool};

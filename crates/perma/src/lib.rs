pub mod allocator;
pub mod arena;
mod checkpoint;
pub mod config;
pub mod errors;
pub mod header;
pub mod inspect;
mod mapping;
pub mod metadata;
pub mod mode;
pub mod paths;
pub mod reliable_io;
mod restore;
pub mod roots;
pub mod scatter;
pub mod session;

pub use allocator::{ChunkSource, ExternalAllocator, GlobalPause};
pub use arena::BumpArena;
pub use config::HeapConfig;
pub use errors::PermError;
pub use header::HeaderRecord;
pub use inspect::HeapInspector;
pub use metadata::{MetadataAllocator, NodeHandle};
pub use mode::OpenMode;
pub use roots::{RootCell, RootRegistry};
pub use scatter::Region;
pub use session::{PersistentHeap, Phase};

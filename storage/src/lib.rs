pub mod docmap;
pub mod index;
pub mod memory;
pub mod snapshot;
pub mod store;

pub use docmap::{spawn_refresher, start_from_config, DocumentMap, DocumentMapHandle, DocumentMapSource, SnapshotDirSource};
pub use memory::MemoryCorpus;
pub use store::{document_allowed, ChunkStore, Index, PageBlockStore, StoreError};

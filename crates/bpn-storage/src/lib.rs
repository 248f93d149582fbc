//! Multi-disk segmented bundle storage engine.
//!
//! Bundles are striped across fixed-size segments on one or more store
//! files, indexed by destination, priority, and expiration. A hierarchical
//! bitmap allocator owns the segment address space, per-disk worker threads
//! perform the blocking I/O behind single-producer/single-consumer rings,
//! and a restore scan rebuilds the catalog from on-disk segment headers
//! after a restart.

pub mod catalog;
pub mod error;
pub mod io_worker;
pub mod memory_manager;
pub mod ring;
pub mod segment;
pub mod store;

pub use catalog::{Catalog, ChainInfo};
pub use error::StorageError;
pub use memory_manager::MemoryManager;
pub use segment::{SegmentId, PER_SEGMENT_PAYLOAD, SEGMENT_RESERVED_SPACE, SEGMENT_SIZE};
pub use store::{BundleStore, ReadSession, StoreCounters, StoreOptions, WriteSession};

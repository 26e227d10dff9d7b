//! netcache Storage Engine - Persistent network cache
//!
//! This crate implements the on-disk cache storage including:
//! - Versioned directory layout keyed by salted SHA-1 hashes
//! - Self-checking record encoding with inline or blob bodies
//! - Deduplicating blob storage with reference counting
//! - Probabilistic contents filters for fast misses
//! - Prioritized, bounded reads with timeout and delayed batched writes
//! - Background synchronization, random-eviction shrinking and clearing

pub mod blob;
pub mod filter;
pub mod layout;
pub mod maintenance;
pub mod operation;
pub mod record;
mod serial;
pub mod storage;
mod traverse;

// Re-exports
pub use blob::{Blob, BlobStorage, BlobSyncStats};
pub use filter::ContentsFilter;
pub use layout::CacheLayout;
pub use operation::{MappedBodyHandler, Priority, RecordInfo, Retrieved, Timings, TraverseFlags};
pub use record::{Record, STORAGE_VERSION};
pub use storage::{Completion, Storage, StorageStats};

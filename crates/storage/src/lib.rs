//! In-memory model of a cache set's devices.
//!
//! Provides the bucket tables and coarse bucket lock the moving collector
//! selects from, the page buffers it copies through, and a RAM-backed block
//! device implementing [`common::traits::BlockIo`].

pub mod bucket;
pub mod buffer;
pub mod cache_set;
pub mod error;
pub mod mem_io;

pub use bucket::{Bucket, BucketSnapshot, BucketState};
pub use buffer::{BufferPool, BufferPoolStats, PageBuf};
pub use cache_set::{BucketGuard, CacheDevice, CacheSet, DeviceGeometry};
pub use error::{BufferError, StorageError};
pub use mem_io::{IoCountersSnapshot, MemBlockIo, MemIoConfig};

use common::DeviceId;
use thiserror::Error;

/// Failures raised by the bucket table.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("bucket lock poisoned")]
    LockPoisoned,

    #[error("no such device {0}")]
    NoDevice(DeviceId),

    #[error("bucket {bucket} out of range on {device}")]
    NoBucket { device: DeviceId, bucket: u64 },

    #[error("bucket {bucket} on {device} is pinned")]
    Pinned { device: DeviceId, bucket: u64 },
}

/// Page buffer allocation failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BufferError {
    #[error("buffer pool exhausted: requested {requested} pages, {available} available")]
    Exhausted { requested: usize, available: usize },
}

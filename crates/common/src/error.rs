use thiserror::Error;

use crate::DeviceId;

/// Completion status of a failed block request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IoError {
    /// The device reported a media error for the request.
    #[error("I/O error on {device} bucket {bucket}: {reason}")]
    Media {
        device: DeviceId,
        bucket: u64,
        reason: String,
    },

    /// The pointer references a device that is not part of the cache set.
    #[error("no such device {0}")]
    NoDevice(DeviceId),

    /// The request falls outside the bucket it addresses.
    #[error("request of {sectors} sectors at offset {offset} overruns bucket of {bucket_size} sectors")]
    OutOfRange {
        offset: u32,
        sectors: u32,
        bucket_size: u32,
    },

    /// No bucket was available to place the write.
    #[error("no space left in {reserve} reserve")]
    NoSpace { reserve: &'static str },

    /// Bucket state could not be consulted.
    #[error("bucket table unavailable: {0}")]
    Unavailable(String),

    /// The caller's buffer cannot hold the request.
    #[error("buffer of {len} bytes too small for {needed} bytes")]
    ShortBuffer { len: usize, needed: usize },
}

impl IoError {
    pub fn media(device: DeviceId, bucket: u64, reason: impl Into<String>) -> Self {
        IoError::Media {
            device,
            bucket,
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn media_error_message_names_location() {
        let err = IoError::media(DeviceId(2), 17, "injected");
        assert_eq!(err.to_string(), "I/O error on cache2 bucket 17: injected");
    }
}

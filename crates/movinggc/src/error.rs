use common::IoError;
use storage::StorageError;
use thiserror::Error;

/// Failure of a single extent relocation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MoveError {
    /// Reading the source extent failed; nothing was written.
    #[error("Read of source extent failed: {source}")]
    Read {
        #[source]
        source: IoError,
    },

    /// Writing or committing the relocated copy failed.
    #[error("Relocation write failed: {source}")]
    Write {
        #[source]
        source: IoError,
    },
}

impl MoveError {
    pub fn is_read(&self) -> bool {
        matches!(self, MoveError::Read { .. })
    }
}

/// Collector-level failures.
#[derive(Debug, Error)]
pub enum GcError {
    /// Configuration is inconsistent or could not be parsed.
    #[error("Invalid collector configuration: {0}")]
    Config(String),

    #[error("Failed to read configuration file: {0}")]
    ConfigIo(#[from] std::io::Error),

    #[error("Failed to parse configuration: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    /// The bucket lock could not be taken.
    #[error("Bucket state unavailable: {source}")]
    Storage {
        #[from]
        source: StorageError,
    },

    /// The admission limiter was closed while a pass was admitting work.
    #[error("Admission limiter closed")]
    LimiterClosed,
}

pub type GcResult<T> = std::result::Result<T, GcError>;

#[cfg(test)]
mod tests {
    use super::*;
    use common::DeviceId;

    #[test]
    fn move_error_messages() {
        let err = MoveError::Read {
            source: IoError::media(DeviceId(0), 4, "injected read fault"),
        };
        assert!(err.to_string().starts_with("Read of source extent failed"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn storage_errors_convert() {
        let err: GcError = StorageError::LockPoisoned.into();
        assert!(matches!(err, GcError::Storage { .. }));
    }
}

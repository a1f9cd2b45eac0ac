use std::error::Error as StdError;
use std::sync::Arc;

use thiserror::Error;

/// Shared, cloneable handle on a producer failure.
pub type SharedError = Arc<dyn StdError + Send + Sync + 'static>;

/// Error type for history encoding, storage and iteration.
#[derive(Error, Debug)]
pub enum HistoryError {
    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),

    /// A decoded record did not consume exactly the number of bytes it was stored with.
    #[error("length verification failed: expected {expected} bytes, decoded {actual}")]
    LengthVerificationFailed { expected: u64, actual: u64 },

    #[error("Truncated record: {0}")]
    Truncated(String),

    #[error("Corruption detected: {details}")]
    Corruption { details: String },

    #[error("Unknown dictionary index {0}")]
    UnknownDictionaryIndex(u32),

    /// A dictionary delta did not continue the state it was applied to.
    #[error("Dictionary delta out of order: expected first index {expected}, got {got}")]
    DictionaryOutOfOrder { expected: u32, got: u32 },

    /// Failure captured from the source of a buffered iterator. Re-surfaced on every call.
    #[error("Producer failed: {0}")]
    Producer(SharedError),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Configuration Error: {0}")]
    Config(String),

    #[error("Lock acquisition failed: {0}")]
    LockError(String),
}

pub type Result<T> = std::result::Result<T, HistoryError>;

impl HistoryError {
    pub(crate) fn corruption(details: impl Into<String>) -> Self {
        HistoryError::Corruption {
            details: details.into(),
        }
    }

    /// True for errors that signal damaged on-disk data rather than an environmental failure.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            HistoryError::LengthVerificationFailed { .. }
                | HistoryError::Truncated(_)
                | HistoryError::Corruption { .. }
                | HistoryError::UnknownDictionaryIndex(_)
                | HistoryError::DictionaryOutOfOrder { .. }
        )
    }
}

impl<T> From<std::sync::PoisonError<T>> for HistoryError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        HistoryError::LockError(format!("Mutex/RwLock poisoned: {}", err))
    }
}

impl From<config::ConfigError> for HistoryError {
    fn from(err: config::ConfigError) -> Self {
        HistoryError::Config(err.to_string())
    }
}

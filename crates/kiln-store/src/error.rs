use std::time::Duration;

/// Errors from artifact store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// I/O error from the underlying filesystem.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failure.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Compression or decompression failure.
    #[error("compression error: {0}")]
    Compression(String),

    /// A thread holding a reader lock asked for the writer lock on the
    /// same key. Readers must release before writing.
    #[error("cannot upgrade reader lock on {0} to a writer lock")]
    LockUpgrade(String),

    /// A lock could not be acquired within the configured bound.
    #[error("timed out after {waited:?} waiting for lock {key}")]
    LockTimeout { key: String, waited: Duration },

    /// The module name cannot be used as a directory name.
    #[error("invalid module name: {0:?}")]
    InvalidModuleName(String),
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

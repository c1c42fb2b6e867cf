//! Error types for the public rooms directory

use thiserror::Error;

/// Main error type for directory operations
#[derive(Error, Debug)]
pub enum DirectoryError {
    /// The persistence layer is unreachable or failed mid-operation.
    ///
    /// Fatal to the calling request; never retried internally.
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    /// Invalid or incomplete backend wiring at construction
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A single DHT or pubsub operation failed
    ///
    /// Adapters log and swallow this; it never reaches callers of local operations.
    #[error("Peer resolution failure: {0}")]
    PeerResolution(String),

    /// Error during serialization/deserialization
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Room identifier is not of the form `!opaque:server`
    #[error("Invalid room id: {0}")]
    InvalidRoomId(String),
}

/// Result type alias using DirectoryError
pub type DirectoryResult<T> = Result<T, DirectoryError>;

macro_rules! storage_unavailable_from {
    ($($source:ty),* $(,)?) => {
        $(
            impl From<$source> for DirectoryError {
                fn from(err: $source) -> Self {
                    DirectoryError::StorageUnavailable(err.to_string())
                }
            }
        )*
    };
}

storage_unavailable_from!(
    redb::DatabaseError,
    redb::TransactionError,
    redb::TableError,
    redb::StorageError,
    redb::CommitError,
    std::io::Error,
);

impl From<postcard::Error> for DirectoryError {
    fn from(err: postcard::Error) -> Self {
        DirectoryError::Serialization(err.to_string())
    }
}

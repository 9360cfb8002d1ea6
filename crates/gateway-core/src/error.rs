//! Error types for the object storage gateway

use thiserror::Error;

/// Result type alias using the gateway Error
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type shared by every storage adapter and the gRPC layer
///
/// Adapters translate their SDK-specific failures into this enum before
/// returning, so the service never inspects backend error types.
#[derive(Error, Debug)]
pub enum Error {
    // Object identity errors
    #[error("Object not found: {key}")]
    NotFound { key: String },

    #[error("Bucket or container not found: {container}")]
    ContainerNotFound { container: String },

    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    // Transfer errors
    #[error("Storage error: {message}")]
    Storage { message: String },

    #[error("Unexpected end of stream: {message}")]
    UnexpectedEof { message: String },

    #[error("Truncated transfer: {message}")]
    Truncated { message: String },

    #[error("Operation cancelled: {operation}")]
    Cancelled { operation: String },

    #[error("Session already closed")]
    SessionClosed,

    // Configuration errors
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    // Internal errors
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl Error {
    /// Shorthand for an unclassified backend failure
    pub fn storage(message: impl Into<String>) -> Self {
        Error::Storage {
            message: message.into(),
        }
    }

    /// Shorthand for a missing object
    pub fn not_found(key: impl Into<String>) -> Self {
        Error::NotFound { key: key.into() }
    }

    /// Returns true if this error means the addressed object or container is absent
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::NotFound { .. } | Error::ContainerNotFound { .. }
        )
    }

    /// Returns true if the transfer ended because its peer went away
    pub fn is_cancellation(&self) -> bool {
        matches!(
            self,
            Error::Cancelled { .. } | Error::UnexpectedEof { .. }
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

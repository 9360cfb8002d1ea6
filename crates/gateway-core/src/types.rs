//! Core types for the object storage gateway

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Maximum number of bytes sent in a single read-path chunk (1 MiB)
pub const MAX_CHUNK_BYTES: usize = 1024 * 1024;

/// Metadata attached to a stored object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectInfo {
    /// Object size in bytes
    pub size: u64,

    /// Last modification time reported by the backend
    pub last_updated_at: DateTime<Utc>,
}

/// One listing entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectFile {
    /// Logical key, with the configured prefix removed
    pub key: String,

    /// Object metadata
    pub info: ObjectInfo,
}

/// Options for backend initialization
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitOptions {
    /// Create the bucket/container if it does not exist
    pub create: bool,
}

/// Outcome of a finished write or read session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferSummary {
    /// Lowercase hex SHA-256 over every byte transferred
    pub checksum: String,

    /// Number of bytes transferred
    pub bytes: u64,
}

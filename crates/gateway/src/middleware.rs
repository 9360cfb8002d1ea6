//! Request validation for the storage service

use tonic::Status;

/// Default maximum key length in bytes
pub const DEFAULT_MAX_PATH_LEN: usize = 1024;

/// Validator for object keys and listing prefixes
#[derive(Debug, Clone)]
pub struct PathValidator {
    /// Maximum key length in bytes
    max_path_len: usize,
}

impl Default for PathValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl PathValidator {
    /// Create a new path validator with default settings
    pub fn new() -> Self {
        Self {
            max_path_len: DEFAULT_MAX_PATH_LEN,
        }
    }

    /// Create with a custom maximum key length
    pub fn with_max_len(max_path_len: usize) -> Self {
        Self { max_path_len }
    }

    /// Validate a key addressing one object
    pub fn validate_key(&self, path: &str) -> Result<(), Status> {
        if path.is_empty() {
            return Err(Status::invalid_argument("path missing"));
        }
        // object_store backends drop edge slashes, S3 keeps them
        if path.starts_with('/') || path.ends_with('/') {
            return Err(Status::invalid_argument(
                "Path must not start or end with '/'",
            ));
        }
        self.validate_prefix(path)
    }

    /// Validate a listing prefix; the empty prefix lists everything
    pub fn validate_prefix(&self, path: &str) -> Result<(), Status> {
        if path.len() > self.max_path_len {
            return Err(Status::invalid_argument(format!(
                "Path exceeds maximum length of {} bytes",
                self.max_path_len
            )));
        }

        if path.contains('\0') {
            return Err(Status::invalid_argument("Path contains null bytes"));
        }

        if path.split('/').any(|segment| segment == "." || segment == "..") {
            return Err(Status::invalid_argument(
                "Relative path segments are not allowed",
            ));
        }

        Ok(())
    }
}

//! Running SHA-256 and byte count for a transfer session

use gateway_core::{Error, Result, TransferSummary};
use sha2::{Digest, Sha256};

/// Lowercase hex SHA-256 of `data`
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Per-session digest state with a close-once outcome
#[derive(Debug, Default)]
pub struct Tally {
    hasher: Sha256,
    bytes: u64,
    outcome: Option<Option<TransferSummary>>,
}

impl Tally {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes that were accepted or delivered
    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
        self.bytes += data.len() as u64;
    }

    /// Bytes counted so far
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn is_closed(&self) -> bool {
        self.outcome.is_some()
    }

    /// Outcome of an earlier close, if any
    ///
    /// A session whose first close failed reports `SessionClosed`.
    pub fn closed_outcome(&self) -> Option<Result<TransferSummary>> {
        self.outcome
            .as_ref()
            .map(|summary| summary.clone().ok_or(Error::SessionClosed))
    }

    /// Record the result of closing the backing resource
    pub fn finish(&mut self, result: Result<()>) -> Result<TransferSummary> {
        if let Some(previous) = self.closed_outcome() {
            return previous;
        }

        match result {
            Ok(()) => {
                let summary = TransferSummary {
                    checksum: hex::encode(self.hasher.clone().finalize()),
                    bytes: self.bytes,
                };
                self.outcome = Some(Some(summary.clone()));
                Ok(summary)
            }
            Err(e) => {
                self.outcome = Some(None);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EMPTY_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";
    const HELLO_WORLD_SHA256: &str =
        "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";

    #[test]
    fn test_sha256_hex() {
        assert_eq!(sha256_hex(b""), EMPTY_SHA256);
        assert_eq!(sha256_hex(b"hello world"), HELLO_WORLD_SHA256);
    }

    #[test]
    fn test_incremental_matches_one_shot() {
        let mut tally = Tally::new();
        tally.update(b"hello");
        tally.update(b" ");
        tally.update(b"world");

        let summary = tally.finish(Ok(())).unwrap();
        assert_eq!(summary.bytes, 11);
        assert_eq!(summary.checksum, HELLO_WORLD_SHA256);
    }

    #[test]
    fn test_close_twice_returns_first_outcome() {
        let mut tally = Tally::new();
        assert!(!tally.is_closed());
        let first = tally.finish(Ok(())).unwrap();
        assert!(tally.is_closed());

        let second = tally.finish(Err(Error::storage("ignored"))).unwrap();
        assert_eq!(first, second);
        assert_eq!(second.checksum, EMPTY_SHA256);
    }

    #[test]
    fn test_failed_close_is_sticky() {
        let mut tally = Tally::new();
        tally.update(b"partial");
        let err = tally.finish(Err(Error::storage("upload failed"))).unwrap_err();
        assert!(matches!(err, Error::Storage { .. }));

        let again = tally.finish(Ok(())).unwrap_err();
        assert!(matches!(again, Error::SessionClosed));
    }
}

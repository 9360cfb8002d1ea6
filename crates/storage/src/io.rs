//! Backend-agnostic IO contract
//!
//! Every adapter implements [`ObjectIo`]. Sessions returned by `write`,
//! `read` and `list` are owned by a single RPC call; methods take
//! `&mut self`, so the borrow checker serializes access to per-session
//! state without a lock.

use async_trait::async_trait;
use bytes::{Buf, Bytes};
use gateway_core::{Error, InitOptions, ObjectFile, ObjectInfo, Result, TransferSummary};

/// Async interface implemented by every storage backend
#[async_trait]
pub trait ObjectIo: Send + Sync {
    /// Short backend name used in logs ("s3", "gcs", "azure", "filesystem")
    fn backend(&self) -> &'static str;

    /// Verify the bucket/container, creating it when `opts.create` is set
    ///
    /// "Already exists" is never an error.
    async fn init(&self, opts: InitOptions) -> Result<()>;

    /// Open a write session for `key`; an existing object is overwritten
    async fn write(&self, key: &str) -> Result<Box<dyn ObjectWriter>>;

    /// Open a read session for `key`
    ///
    /// A missing key is reported as [`Error::NotFound`], either here or on
    /// the first `read` call depending on the backend.
    async fn read(&self, key: &str) -> Result<Box<dyn ObjectReader>>;

    /// Object metadata, `None` when the key does not exist
    async fn head(&self, key: &str) -> Result<Option<ObjectInfo>>;

    /// Delete `key`, returning whether the key is absent afterwards
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Begin a paginated scan of every key starting with `prefix`
    async fn list(&self, prefix: &str) -> Result<Box<dyn ObjectLister>>;
}

/// Incremental, checksummed write session
#[async_trait]
pub trait ObjectWriter: Send {
    /// Write some prefix of `buf`, returning how many bytes were accepted
    async fn write(&mut self, buf: &[u8]) -> Result<usize>;

    /// Finish the upload and return the checksum over every accepted byte
    ///
    /// Calling `close` again returns the first outcome without touching the
    /// backend a second time.
    async fn close(&mut self) -> Result<TransferSummary>;

    /// Whether `close` has been called
    fn is_closed(&self) -> bool;
}

/// Incremental, checksummed read session
#[async_trait]
pub trait ObjectReader: Send {
    /// Fill a prefix of `buf`; `Ok(0)` means the object is exhausted
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Release the session and return the checksum over the bytes delivered
    async fn close(&mut self) -> Result<TransferSummary>;

    /// Whether `close` has been called
    fn is_closed(&self) -> bool;
}

/// Listing cursor producing batches until the backend is exhausted
#[async_trait]
pub trait ObjectLister: Send {
    /// Next batch of entries, or `None` once the listing is complete
    async fn next_batch(&mut self) -> Result<Option<Vec<ObjectFile>>>;
}

/// Write all of `buf`, retrying short writes
pub async fn write_all(writer: &mut dyn ObjectWriter, mut buf: &[u8]) -> Result<()> {
    while !buf.is_empty() {
        let n = writer.write(buf).await?;
        if n == 0 {
            return Err(Error::storage("writer accepted zero bytes"));
        }
        buf = &buf[n..];
    }
    Ok(())
}

/// Read a session to completion
pub async fn read_to_end(reader: &mut dyn ObjectReader) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(out);
        }
        out.extend_from_slice(&buf[..n]);
    }
}

/// Drain every batch of a listing into one vector
pub async fn collect_listing(lister: &mut dyn ObjectLister) -> Result<Vec<ObjectFile>> {
    let mut files = Vec::new();
    while let Some(batch) = lister.next_batch().await? {
        files.extend(batch);
    }
    Ok(files)
}

/// Copy as much of `pending` into `buf` as fits, advancing `pending`
pub(crate) fn drain_pending(pending: &mut Bytes, buf: &mut [u8]) -> usize {
    let n = pending.len().min(buf.len());
    buf[..n].copy_from_slice(&pending[..n]);
    pending.advance(n);
    n
}

//! Adapter core over the `object_store` crate
//!
//! GCS, Azure and the local filesystem all expose native incremental
//! uploads and streaming downloads through `object_store`, so they share
//! this implementation and differ only in construction, `init`, and (for
//! Azure) the read path.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use gateway_core::{Error, InitOptions, ObjectFile, ObjectInfo, Result, TransferSummary};
use object_store::path::Path;
use object_store::{ObjectMeta, ObjectStore, WriteMultipart};
use tracing::{debug, instrument, warn};

use crate::checksum::Tally;
use crate::io::{drain_pending, ObjectIo, ObjectLister, ObjectReader, ObjectWriter};
use crate::key::KeyPrefix;

/// Part size handed to `WriteMultipart` (8 MiB)
pub const STORE_PART_SIZE: usize = 8 * 1024 * 1024;

/// Parts allowed in flight before `write` waits
const MAX_IN_FLIGHT_PARTS: usize = 2;

/// Translate an `object_store` failure for `key`
pub(crate) fn map_store_error(key: &str, err: object_store::Error) -> Error {
    match err {
        object_store::Error::NotFound { .. } => Error::not_found(key),
        other => Error::storage(format!("{}: {}", key, other)),
    }
}

pub(crate) fn info_from_meta(meta: &ObjectMeta) -> ObjectInfo {
    ObjectInfo {
        size: meta.size,
        last_updated_at: meta.last_modified,
    }
}

/// Backend implemented on top of any [`ObjectStore`]
#[derive(Debug, Clone)]
pub struct StoreBackend {
    name: &'static str,
    store: Arc<dyn ObjectStore>,
    keys: KeyPrefix,
    page_size: usize,
}

impl StoreBackend {
    pub fn new(
        name: &'static str,
        store: Arc<dyn ObjectStore>,
        keys: KeyPrefix,
        page_size: usize,
    ) -> Self {
        Self {
            name,
            store,
            keys,
            page_size: page_size.max(1),
        }
    }

    /// Backend over an in-memory store, for tests and benchmarks
    pub fn in_memory(prefix: Option<&str>, page_size: usize) -> Self {
        Self::new(
            "memory",
            Arc::new(object_store::memory::InMemory::new()),
            KeyPrefix::new(prefix),
            page_size,
        )
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    pub fn keys(&self) -> &KeyPrefix {
        &self.keys
    }

    /// Physical location for a logical key
    pub fn location(&self, key: &str) -> Result<Path> {
        let physical = self.keys.join(key);
        Path::parse(&physical).map_err(|e| Error::InvalidArgument {
            message: format!("invalid key {:?}: {}", key, e),
        })
    }

    /// Start a native download of `key`
    ///
    /// A missing key is reported here, before any bytes flow.
    pub async fn open_stream(
        &self,
        key: &str,
    ) -> Result<BoxStream<'static, object_store::Result<Bytes>>> {
        let location = self.location(key)?;
        let result = self
            .store
            .get(&location)
            .await
            .map_err(|e| map_store_error(key, e))?;
        Ok(result.into_stream())
    }

    /// Check that the store answers a listing request
    pub async fn probe(&self) -> Result<()> {
        let mut entries = self.store.list(None);
        match entries.next().await {
            Some(Err(object_store::Error::NotFound { path, .. })) => {
                Err(Error::ContainerNotFound { container: path })
            }
            Some(Err(e)) => Err(Error::storage(format!("{} probe failed: {}", self.name, e))),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl ObjectIo for StoreBackend {
    fn backend(&self) -> &'static str {
        self.name
    }

    #[instrument(skip(self), fields(backend = self.name))]
    async fn init(&self, _opts: InitOptions) -> Result<()> {
        self.probe().await
    }

    #[instrument(skip(self), fields(backend = self.name))]
    async fn write(&self, key: &str) -> Result<Box<dyn ObjectWriter>> {
        let location = self.location(key)?;
        let upload = self
            .store
            .put_multipart(&location)
            .await
            .map_err(|e| map_store_error(key, e))?;
        debug!(%location, "Opened multipart writer");

        Ok(Box::new(StoreWriter {
            key: key.to_string(),
            upload: Some(WriteMultipart::new_with_chunk_size(upload, STORE_PART_SIZE)),
            tally: Tally::new(),
        }))
    }

    #[instrument(skip(self), fields(backend = self.name))]
    async fn read(&self, key: &str) -> Result<Box<dyn ObjectReader>> {
        let stream = self.open_stream(key).await?;
        Ok(Box::new(StoreReader {
            key: key.to_string(),
            stream: Some(stream),
            pending: Bytes::new(),
            tally: Tally::new(),
        }))
    }

    #[instrument(skip(self), fields(backend = self.name))]
    async fn head(&self, key: &str) -> Result<Option<ObjectInfo>> {
        let location = self.location(key)?;
        match self.store.head(&location).await {
            Ok(meta) => Ok(Some(info_from_meta(&meta))),
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(map_store_error(key, e)),
        }
    }

    #[instrument(skip(self), fields(backend = self.name))]
    async fn delete(&self, key: &str) -> Result<bool> {
        let location = self.location(key)?;
        match self.store.delete(&location).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(true),
            Err(e) => Err(map_store_error(key, e)),
        }
    }

    #[instrument(skip(self), fields(backend = self.name))]
    async fn list(&self, prefix: &str) -> Result<Box<dyn ObjectLister>> {
        Ok(Box::new(StoreLister::new(
            self.store.as_ref(),
            self.keys.clone(),
            prefix,
            self.page_size,
        )?))
    }
}

/// Native incremental writer
struct StoreWriter {
    key: String,
    upload: Option<WriteMultipart>,
    tally: Tally,
}

#[async_trait]
impl ObjectWriter for StoreWriter {
    async fn write(&mut self, buf: &[u8]) -> Result<usize> {
        let upload = self.upload.as_mut().ok_or(Error::SessionClosed)?;
        upload
            .wait_for_capacity(MAX_IN_FLIGHT_PARTS)
            .await
            .map_err(|e| map_store_error(&self.key, e))?;
        upload.write(buf);
        self.tally.update(buf);
        Ok(buf.len())
    }

    async fn close(&mut self) -> Result<TransferSummary> {
        if let Some(outcome) = self.tally.closed_outcome() {
            return outcome;
        }

        let result = match self.upload.take() {
            Some(upload) => upload
                .finish()
                .await
                .map(|_| ())
                .map_err(|e| map_store_error(&self.key, e)),
            None => Err(Error::SessionClosed),
        };
        self.tally.finish(result)
    }

    fn is_closed(&self) -> bool {
        self.tally.is_closed()
    }
}

impl Drop for StoreWriter {
    fn drop(&mut self) {
        let Some(upload) = self.upload.take() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };

        let key = std::mem::take(&mut self.key);
        runtime.spawn(async move {
            if let Err(e) = upload.abort().await {
                warn!(%key, error = %e, "Failed to abort cancelled upload");
            } else {
                debug!(%key, "Aborted cancelled upload");
            }
        });
    }
}

/// Native streaming reader
struct StoreReader {
    key: String,
    stream: Option<BoxStream<'static, object_store::Result<Bytes>>>,
    pending: Bytes,
    tally: Tally,
}

#[async_trait]
impl ObjectReader for StoreReader {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.tally.is_closed() {
            return Err(Error::SessionClosed);
        }

        while self.pending.is_empty() {
            let Some(stream) = self.stream.as_mut() else {
                return Ok(0);
            };
            match stream.next().await {
                Some(Ok(chunk)) => self.pending = chunk,
                Some(Err(e)) => {
                    self.stream = None;
                    return Err(map_store_error(&self.key, e));
                }
                None => {
                    self.stream = None;
                    return Ok(0);
                }
            }
        }

        let n = drain_pending(&mut self.pending, buf);
        self.tally.update(&buf[..n]);
        Ok(n)
    }

    async fn close(&mut self) -> Result<TransferSummary> {
        self.stream = None;
        self.pending = Bytes::new();
        self.tally.finish(Ok(()))
    }

    fn is_closed(&self) -> bool {
        self.tally.is_closed()
    }
}

/// Listing cursor over the store's native pager
///
/// Keys are matched as raw strings, so `a/b` matches both `a/b.txt` and
/// `a/b/c`. The store is asked for everything under the prefix's parent
/// directory and entries are filtered as they stream in; at most
/// `page_size` entries are materialized per batch.
pub struct StoreLister {
    entries: Option<BoxStream<'static, object_store::Result<ObjectMeta>>>,
    physical_prefix: String,
    keys: KeyPrefix,
    page_size: usize,
}

impl StoreLister {
    fn new(
        store: &dyn ObjectStore,
        keys: KeyPrefix,
        prefix: &str,
        page_size: usize,
    ) -> Result<Self> {
        let physical_prefix = keys.join(prefix);
        let parent = match physical_prefix.rfind('/') {
            Some(idx) if idx > 0 => {
                Some(
                    Path::parse(&physical_prefix[..idx]).map_err(|e| Error::InvalidArgument {
                        message: format!("invalid prefix {:?}: {}", prefix, e),
                    })?,
                )
            }
            _ => None,
        };

        Ok(Self {
            entries: Some(store.list(parent.as_ref())),
            physical_prefix,
            keys,
            page_size,
        })
    }
}

#[async_trait]
impl ObjectLister for StoreLister {
    async fn next_batch(&mut self) -> Result<Option<Vec<ObjectFile>>> {
        let Some(entries) = self.entries.as_mut() else {
            return Ok(None);
        };

        let mut batch = Vec::new();
        while batch.len() < self.page_size {
            match entries.next().await {
                Some(Ok(meta)) => {
                    let name = meta.location.as_ref();
                    if !name.starts_with(&self.physical_prefix) {
                        continue;
                    }
                    batch.push(ObjectFile {
                        key: self.keys.strip(name).to_string(),
                        info: info_from_meta(&meta),
                    });
                }
                Some(Err(object_store::Error::NotFound { .. })) | None => {
                    self.entries = None;
                    break;
                }
                Some(Err(e)) => {
                    self.entries = None;
                    return Err(Error::storage(format!(
                        "listing {} failed: {}",
                        self.physical_prefix, e
                    )));
                }
            }
        }

        if batch.is_empty() && self.entries.is_none() {
            return Ok(None);
        }
        Ok(Some(batch))
    }
}

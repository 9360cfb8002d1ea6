//! Storage - Streaming object storage adapters for the gateway
//!
//! Provides a uniform, checksummed, chunk-at-a-time IO contract over:
//! - Amazon S3 / S3-compatible storage (`s3` feature)
//! - Google Cloud Storage (`gcs` feature)
//! - Azure Blob Storage (`azure` feature)
//! - Local filesystem (always available)
//!
//! # Example
//!
//! ```no_run
//! use gateway_core::config::StorageConfig;
//! use storage::io::{read_to_end, write_all};
//!
//! # async fn example() -> gateway_core::Result<()> {
//! let storage = storage::connect(&StorageConfig::default()).await?;
//!
//! let mut writer = storage.write("reports/2026-10.csv").await?;
//! write_all(writer.as_mut(), &[1, 2, 3]).await?;
//! let summary = writer.close().await?;
//!
//! let mut reader = storage.read("reports/2026-10.csv").await?;
//! let data = read_to_end(reader.as_mut()).await?;
//! assert_eq!(data.len() as u64, summary.bytes);
//! # Ok(())
//! # }
//! ```

pub mod bridge;
pub mod checksum;
pub mod io;
pub mod key;
pub mod store;

#[cfg(feature = "s3")]
mod s3;

#[cfg(feature = "gcs")]
mod gcs;

#[cfg(feature = "azure")]
mod azure;

use std::sync::Arc;

use gateway_core::config::{BackendConfig, StorageConfig};
use gateway_core::{Error, Result};
use object_store::local::LocalFileSystem;
use tracing::info;

pub use io::{ObjectIo, ObjectLister, ObjectReader, ObjectWriter};
pub use key::KeyPrefix;
pub use store::StoreBackend;

#[cfg(feature = "s3")]
pub use s3::S3Storage;

#[cfg(feature = "gcs")]
pub use gcs::GcsStorage;

#[cfg(feature = "azure")]
pub use azure::AzureStorage;

/// Listing page size when none is configured
pub const DEFAULT_LIST_PAGE_SIZE: usize = 1000;

/// Construct the configured backend
pub async fn connect(config: &StorageConfig) -> Result<Arc<dyn ObjectIo>> {
    let keys = KeyPrefix::new(config.prefix.as_deref());
    let page_size = config.list_page_size.unwrap_or(DEFAULT_LIST_PAGE_SIZE);
    info!(
        backend = config.backend.kind(),
        prefix = ?config.prefix,
        page_size,
        "Connecting storage backend"
    );

    let io: Arc<dyn ObjectIo> = match &config.backend {
        #[cfg(feature = "s3")]
        BackendConfig::S3(s3) => Arc::new(S3Storage::new(s3, keys, page_size).await?),

        #[cfg(feature = "gcs")]
        BackendConfig::Gcs(gcs) => Arc::new(GcsStorage::new(gcs, keys, page_size)?),

        #[cfg(feature = "azure")]
        BackendConfig::Azure(azure) => Arc::new(AzureStorage::new(azure, keys, page_size)?),

        BackendConfig::Filesystem(fs) => {
            std::fs::create_dir_all(&fs.root)?;
            let local = LocalFileSystem::new_with_prefix(&fs.root).map_err(|e| {
                Error::InvalidConfig {
                    message: format!("filesystem root {}: {}", fs.root.display(), e),
                }
            })?;
            Arc::new(StoreBackend::new(
                "filesystem",
                Arc::new(local),
                keys,
                page_size,
            ))
        }

        #[allow(unreachable_patterns)]
        other => {
            return Err(Error::InvalidConfig {
                message: format!("backend {} is not compiled in", other.kind()),
            })
        }
    };

    Ok(io)
}

#[cfg(test)]
mod tests {
    use super::*;
    use gateway_core::config::FilesystemConfig;
    use gateway_core::InitOptions;

    #[tokio::test]
    async fn test_connect_filesystem() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("objects");
        let config = StorageConfig {
            prefix: Some("tenant".to_string()),
            list_page_size: Some(2),
            backend: BackendConfig::Filesystem(FilesystemConfig { root: root.clone() }),
        };

        let storage = connect(&config).await.unwrap();
        assert_eq!(storage.backend(), "filesystem");
        storage.init(InitOptions::default()).await.unwrap();

        let mut writer = storage.write("a/b").await.unwrap();
        io::write_all(writer.as_mut(), b"payload").await.unwrap();
        writer.close().await.unwrap();

        assert!(root.join("tenant/a/b").exists());
        assert_eq!(storage.head("a/b").await.unwrap().unwrap().size, 7);

        let mut lister = storage.list("a").await.unwrap();
        let files = io::collect_listing(lister.as_mut()).await.unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].key, "a/b");
    }
}

//! Storage gateway gRPC server
//!
//! Exposes one configured object storage backend over the StorageV2 API:
//! - **Transfers**: streaming WriteObject/ReadObject with SHA-256 checksums
//! - **Metadata**: HeadObject, DeleteObject and paged ListObjects
//! - **Provisioning**: Init checks for (and optionally creates) the bucket
//! - **Shutdown**: in-flight transfers drain before the server stops
//!
//! # Example
//!
//! ```ignore
//! use gateway::{GatewayServer, StorageService};
//!
//! #[tokio::main]
//! async fn main() -> gateway_core::Result<()> {
//!     let io = storage::connect(&Default::default()).await?;
//!     GatewayServer::new(StorageService::new(io)).run().await
//! }
//! ```

pub mod middleware;
pub mod server;
pub mod service;
pub mod sessions;

// Re-export generated protobuf types
pub mod proto {
    tonic::include_proto!("storage.v2");
}

pub use server::GatewayServer;
pub use service::StorageService;

pub use proto::storage_v2_client::StorageV2Client as StorageClient;
pub use proto::storage_v2_server::StorageV2Server as StorageServiceServer;

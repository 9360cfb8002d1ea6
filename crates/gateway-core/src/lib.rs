//! Gateway Core - Foundation for the object storage gateway
//!
//! Provides the backend-agnostic data model, error handling and
//! configuration types shared by the storage adapters and the gRPC service.

pub mod config;
pub mod error;
pub mod types;

pub use config::GatewayConfig;
pub use error::{Error, Result};
pub use types::*;

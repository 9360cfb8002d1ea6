//! Gateway configuration types

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{Error, Result};

/// Minimum S3 multipart part size accepted by the service (5 MiB)
pub const MIN_S3_PART_SIZE: usize = 5 * 1024 * 1024;

/// Main gateway configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// gRPC server settings
    pub server: ServerSettings,

    /// Storage backend settings
    pub storage: StorageConfig,
}

impl GatewayConfig {
    /// Load configuration from a JSON file
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: GatewayConfig = serde_json::from_str(&raw)?;
        if let Err(e) = config.validate() {
            warn!(path = %path.as_ref().display(), error = %e, "Rejected configuration");
            return Err(e);
        }
        info!(
            path = %path.as_ref().display(),
            backend = config.storage.backend.kind(),
            port = config.server.port,
            "Loaded configuration"
        );
        Ok(config)
    }

    /// Check the configuration for values no backend can work with
    pub fn validate(&self) -> Result<()> {
        if self.storage.list_page_size == Some(0) {
            return Err(invalid("list_page_size must be greater than zero"));
        }

        match &self.storage.backend {
            BackendConfig::S3(s3) => {
                if s3.bucket.is_empty() {
                    return Err(invalid("s3 bucket must not be empty"));
                }
                if s3.part_size < MIN_S3_PART_SIZE {
                    return Err(invalid(format!(
                        "s3 part_size must be at least {} bytes",
                        MIN_S3_PART_SIZE
                    )));
                }
            }
            BackendConfig::Gcs(gcs) => {
                if gcs.bucket.is_empty() {
                    return Err(invalid("gcs bucket must not be empty"));
                }
            }
            BackendConfig::Azure(azure) => {
                if azure.account_name.is_empty() {
                    return Err(invalid("azure account_name must not be empty"));
                }
                if azure.container.is_empty() {
                    return Err(invalid("azure container must not be empty"));
                }
            }
            BackendConfig::Filesystem(fs) => {
                if fs.root.as_os_str().is_empty() {
                    return Err(invalid("filesystem root must not be empty"));
                }
            }
        }

        Ok(())
    }
}

fn invalid(message: impl Into<String>) -> Error {
    Error::InvalidConfig {
        message: message.into(),
    }
}

/// gRPC server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Address to bind the gRPC server
    pub bind_address: String,

    /// Port for the gRPC server
    pub port: u16,

    /// TCP keepalive interval
    #[serde(with = "humantime_serde")]
    pub tcp_keepalive: Duration,

    /// Per-request timeout; unset for unbounded streaming transfers
    #[serde(with = "humantime_serde::option")]
    pub request_timeout: Option<Duration>,

    /// Maximum encoded/decoded gRPC message size in bytes
    pub max_message_size: usize,

    /// How long shutdown waits for in-flight transfers
    #[serde(with = "humantime_serde")]
    pub shutdown_grace: Duration,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 50051,
            tcp_keepalive: Duration::from_secs(60),
            request_timeout: None,
            max_message_size: 16 * 1024 * 1024, // 16MB
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

/// Storage configuration shared by all backends
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Key prefix joined to every logical key
    pub prefix: Option<String>,

    /// Maximum number of entries per listing page
    pub list_page_size: Option<usize>,

    /// Selected backend
    pub backend: BackendConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            prefix: None,
            list_page_size: None,
            backend: BackendConfig::Filesystem(FilesystemConfig::default()),
        }
    }
}

/// Storage backend selector
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackendConfig {
    /// S3-compatible storage
    S3(S3Config),

    /// Google Cloud Storage
    Gcs(GcsConfig),

    /// Azure Blob Storage
    Azure(AzureConfig),

    /// Local filesystem
    Filesystem(FilesystemConfig),
}

impl BackendConfig {
    /// Short backend name used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            BackendConfig::S3(_) => "s3",
            BackendConfig::Gcs(_) => "gcs",
            BackendConfig::Azure(_) => "azure",
            BackendConfig::Filesystem(_) => "filesystem",
        }
    }
}

/// S3-compatible backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct S3Config {
    /// S3 bucket name
    pub bucket: String,

    /// AWS region (default: "us-east-1")
    pub region: Option<String>,

    /// Optional custom endpoint URL (for MinIO, LocalStack, etc.)
    pub endpoint_url: Option<String>,

    /// Force path-style addressing (required for MinIO)
    pub force_path_style: bool,

    /// Multipart part size and ranged download size in bytes
    pub part_size: usize,

    /// Credential source
    pub credentials: S3Credentials,
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            bucket: String::new(),
            region: Some("us-east-1".to_string()),
            endpoint_url: None,
            force_path_style: false,
            part_size: 8 * 1024 * 1024, // 8MB
            credentials: S3Credentials::default(),
        }
    }
}

/// Where the S3 adapter obtains credentials
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum S3Credentials {
    /// Environment, profile or instance metadata
    #[default]
    Default,

    /// Static access key pair
    Static {
        access_key_id: String,
        secret_access_key: String,
        session_token: Option<String>,
    },

    /// Assume an IAM role on top of the default chain
    AssumeRole {
        role_arn: String,
        session_name: Option<String>,
        external_id: Option<String>,
    },
}

/// Google Cloud Storage backend configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GcsConfig {
    /// GCS bucket name
    pub bucket: String,

    /// Project that owns newly created buckets
    pub project_id: Option<String>,

    /// Inline service account JSON key
    pub service_account_json: Option<String>,

    /// Path to a service account JSON key file
    pub service_account_path: Option<PathBuf>,
}

/// Azure Blob Storage backend configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AzureConfig {
    /// Storage account name
    pub account_name: String,

    /// Blob container name
    pub container: String,

    /// Storage account shared key
    pub account_key: Option<String>,

    /// SAS token (with or without the leading '?')
    pub sas_token: Option<String>,

    /// Azure AD application (client) id
    pub client_id: Option<String>,

    /// Azure AD tenant id
    pub tenant_id: Option<String>,

    /// Azure AD client secret
    pub client_secret: Option<String>,

    /// Blob service endpoint override
    pub endpoint: Option<String>,

    /// Talk to a local Azurite emulator
    pub use_emulator: bool,
}

/// Local filesystem backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FilesystemConfig {
    /// Directory used as the storage root
    pub root: PathBuf,
}

impl Default for FilesystemConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./data"),
        }
    }
}

/// Duration serialization helper for human-readable formats
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }

    pub mod option {
        use super::*;

        pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            match duration {
                Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
        where
            D: Deserializer<'de>,
        {
            let millis = Option::<u64>::deserialize(deserializer)?;
            Ok(millis.map(Duration::from_millis))
        }
    }
}

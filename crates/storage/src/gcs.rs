//! Google Cloud Storage backend
//!
//! Object traffic goes through `object_store`'s native GCS client. Bucket
//! management is not part of that API, so `init` talks to the JSON API
//! directly using the same credentials.

use std::sync::Arc;

use async_trait::async_trait;
use gateway_core::config::GcsConfig;
use gateway_core::{Error, InitOptions, ObjectInfo, Result};
use object_store::gcp::{GoogleCloudStorage, GoogleCloudStorageBuilder};
use object_store::CredentialProvider;
use reqwest::StatusCode;
use tracing::{debug, info, instrument};

use crate::io::{ObjectIo, ObjectLister, ObjectReader, ObjectWriter};
use crate::key::KeyPrefix;
use crate::store::StoreBackend;

/// Base URL of the GCS JSON API
const GCS_API: &str = "https://storage.googleapis.com/storage/v1";

/// Google Cloud Storage backend
#[derive(Debug)]
pub struct GcsStorage {
    inner: StoreBackend,
    gcs: Arc<GoogleCloudStorage>,
    http: reqwest::Client,
    bucket: String,
    project_id: Option<String>,
}

impl GcsStorage {
    /// Build a client from configuration
    ///
    /// Without an explicit service account the ambient application default
    /// credentials are used.
    pub fn new(config: &GcsConfig, keys: KeyPrefix, page_size: usize) -> Result<Self> {
        let mut builder = GoogleCloudStorageBuilder::new().with_bucket_name(&config.bucket);

        if let Some(json) = &config.service_account_json {
            builder = builder.with_service_account_key(json);
            debug!("GCS authentication: inline service account key");
        } else if let Some(path) = &config.service_account_path {
            builder = builder.with_service_account_path(path.to_string_lossy());
            debug!("GCS authentication: service account file");
        } else {
            debug!("GCS authentication: application default credentials");
        }

        let gcs = Arc::new(builder.build().map_err(|e| Error::InvalidConfig {
            message: format!("Failed to create GCS client: {}", e),
        })?);

        info!(bucket = %config.bucket, "Created GCS backend");

        Ok(Self {
            inner: StoreBackend::new("gcs", gcs.clone(), keys, page_size),
            gcs,
            http: reqwest::Client::new(),
            bucket: config.bucket.clone(),
            project_id: config.project_id.clone(),
        })
    }

    async fn bearer_token(&self) -> Result<String> {
        let credential = self
            .gcs
            .credentials()
            .get_credential()
            .await
            .map_err(|e| Error::storage(format!("GCS credentials unavailable: {}", e)))?;
        Ok(credential.bearer.clone())
    }

    async fn bucket_exists(&self, token: &str) -> Result<bool> {
        let response = self
            .http
            .get(bucket_url(GCS_API, &self.bucket))
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| Error::storage(format!("GCS bucket lookup failed: {}", e)))?;

        match response.status() {
            status if status.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => Err(api_error("bucket lookup", status, response).await),
        }
    }

    async fn create_bucket(&self, token: &str) -> Result<()> {
        let project = self.project_id.as_deref().ok_or_else(|| Error::InvalidConfig {
            message: "gcs project_id is required to create a bucket".to_string(),
        })?;

        let response = self
            .http
            .post(format!("{}/b", GCS_API))
            .query(&[("project", project)])
            .bearer_auth(token)
            .json(&serde_json::json!({ "name": self.bucket }))
            .send()
            .await
            .map_err(|e| Error::storage(format!("GCS bucket creation failed: {}", e)))?;

        match response.status() {
            status if status.is_success() => {
                info!(bucket = %self.bucket, project, "Created bucket");
                Ok(())
            }
            StatusCode::CONFLICT => {
                debug!(bucket = %self.bucket, "Bucket already exists");
                Ok(())
            }
            status => Err(api_error("bucket creation", status, response).await),
        }
    }
}

fn bucket_url(api: &str, bucket: &str) -> String {
    format!("{}/b/{}", api, bucket)
}

async fn api_error(operation: &str, status: StatusCode, response: reqwest::Response) -> Error {
    let body = response.text().await.unwrap_or_default();
    Error::storage(format!("GCS {} returned {}: {}", operation, status, body))
}

#[async_trait]
impl ObjectIo for GcsStorage {
    fn backend(&self) -> &'static str {
        "gcs"
    }

    #[instrument(skip(self), fields(backend = "gcs", bucket = %self.bucket))]
    async fn init(&self, opts: InitOptions) -> Result<()> {
        let token = self.bearer_token().await?;
        if self.bucket_exists(&token).await? {
            debug!("Bucket exists");
            return Ok(());
        }
        if !opts.create {
            return Err(Error::ContainerNotFound {
                container: self.bucket.clone(),
            });
        }
        self.create_bucket(&token).await
    }

    async fn write(&self, key: &str) -> Result<Box<dyn ObjectWriter>> {
        self.inner.write(key).await
    }

    async fn read(&self, key: &str) -> Result<Box<dyn ObjectReader>> {
        self.inner.read(key).await
    }

    async fn head(&self, key: &str) -> Result<Option<ObjectInfo>> {
        self.inner.head(key).await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.inner.delete(key).await
    }

    async fn list(&self, prefix: &str) -> Result<Box<dyn ObjectLister>> {
        self.inner.list(prefix).await
    }
}

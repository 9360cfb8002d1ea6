//! Azure Blob Storage backend
//!
//! Uploads, metadata, deletes and listing use `object_store`'s native Azure
//! client. Downloads run through the [`DownloadBridge`] so a missing blob is
//! reported on the first read. Container management goes to the Blob REST
//! API directly.

use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::Utc;
use futures::StreamExt;
use gateway_core::config::AzureConfig;
use gateway_core::{Error, InitOptions, ObjectInfo, Result};
use hmac::{Hmac, Mac};
use object_store::azure::{AzureCredential, MicrosoftAzure, MicrosoftAzureBuilder};
use object_store::CredentialProvider;
use reqwest::header::{AUTHORIZATION, CONTENT_LENGTH};
use reqwest::{Method, StatusCode, Url};
use sha2::Sha256;
use tracing::{debug, info, instrument};

use crate::bridge::DownloadBridge;
use crate::io::{ObjectIo, ObjectLister, ObjectReader, ObjectWriter};
use crate::key::KeyPrefix;
use crate::store::StoreBackend;

/// Blob service REST version sent with management requests
const API_VERSION: &str = "2021-08-06";

/// Well-known Azurite account key
const EMULATOR_ACCOUNT_KEY: &str =
    "Eby8vdM02xNOcqFlqUwJPLlmEtlCDXJ1OUzFT50uSRZ6IFsuFq2UVErCz4I6tq/K1SZFPTOtr/KBHBeksoGMGw==";

/// How a management request is authorized
#[derive(Debug)]
enum Signing {
    SharedKey(String),
    Query(Vec<(String, String)>),
    Bearer(String),
}

/// Azure Blob Storage backend
#[derive(Debug)]
pub struct AzureStorage {
    inner: StoreBackend,
    azure: Arc<MicrosoftAzure>,
    http: reqwest::Client,
    account: String,
    container: String,
    endpoint: String,
    account_key: Option<String>,
}

impl AzureStorage {
    /// Build a client from configuration
    ///
    /// Authentication methods (in order of precedence):
    /// 1. SAS token (`sas_token`)
    /// 2. Storage account key (`account_key`)
    /// 3. Service principal (`client_id` + `client_secret` + `tenant_id`)
    /// 4. Ambient credential chain (environment, managed identity, CLI)
    pub fn new(config: &AzureConfig, keys: KeyPrefix, page_size: usize) -> Result<Self> {
        let mut builder = MicrosoftAzureBuilder::new()
            .with_account(&config.account_name)
            .with_container_name(&config.container);

        if config.use_emulator {
            builder = builder.with_use_emulator(true);
        }
        if let Some(endpoint) = &config.endpoint {
            builder = builder.with_endpoint(endpoint.clone());
        }

        let mut account_key = None;
        if let Some(sas_token) = &config.sas_token {
            builder = builder.with_sas_authorization(sas_pairs(sas_token)?);
            debug!("Azure authentication: SAS token");
        } else if let Some(key) = &config.account_key {
            builder = builder.with_access_key(key);
            account_key = Some(key.clone());
            debug!("Azure authentication: account key");
        } else if config.client_secret.is_some() {
            if let Some(client_id) = &config.client_id {
                builder = builder.with_client_id(client_id);
            }
            if let Some(tenant_id) = &config.tenant_id {
                builder = builder.with_tenant_id(tenant_id);
            }
            if let Some(client_secret) = &config.client_secret {
                builder = builder.with_client_secret(client_secret);
            }
            debug!("Azure authentication: service principal");
        } else if config.use_emulator {
            account_key = Some(EMULATOR_ACCOUNT_KEY.to_string());
            debug!("Azure authentication: emulator key");
        } else {
            debug!("Azure authentication: ambient credential chain");
        }

        let azure = Arc::new(builder.build().map_err(|e| Error::InvalidConfig {
            message: format!("Failed to create Azure client: {}", e),
        })?);

        let endpoint = blob_endpoint(config);
        info!(
            account = %config.account_name,
            container = %config.container,
            %endpoint,
            "Created Azure backend"
        );

        Ok(Self {
            inner: StoreBackend::new("azure", azure.clone(), keys, page_size),
            azure,
            http: reqwest::Client::new(),
            account: config.account_name.clone(),
            container: config.container.clone(),
            endpoint,
            account_key,
        })
    }

    async fn signing(&self) -> Result<Signing> {
        if let Some(key) = &self.account_key {
            return Ok(Signing::SharedKey(key.clone()));
        }

        let credential = self
            .azure
            .credentials()
            .get_credential()
            .await
            .map_err(|e| Error::storage(format!("Azure credentials unavailable: {}", e)))?;

        match credential.as_ref() {
            AzureCredential::SASToken(pairs) => Ok(Signing::Query(pairs.clone())),
            AzureCredential::BearerToken(token) => Ok(Signing::Bearer(token.clone())),
            _ => Err(Error::InvalidConfig {
                message: "azure account_key is required for container management".to_string(),
            }),
        }
    }

    /// Issue a container-level request (`?restype=container`)
    async fn container_request(&self, method: Method) -> Result<reqwest::Response> {
        let signing = self.signing().await?;

        let mut url = Url::parse(&format!("{}/{}", self.endpoint, self.container)).map_err(
            |e| Error::InvalidConfig {
                message: format!("invalid azure endpoint {}: {}", self.endpoint, e),
            },
        )?;
        url.query_pairs_mut().append_pair("restype", "container");
        if let Signing::Query(pairs) = &signing {
            url.query_pairs_mut().extend_pairs(pairs);
        }

        let date = Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string();
        let mut request = self
            .http
            .request(method.clone(), url.clone())
            .header("x-ms-date", &date)
            .header("x-ms-version", API_VERSION);

        if method == Method::PUT {
            request = request.header(CONTENT_LENGTH, 0).body(Vec::new());
        }

        match &signing {
            Signing::SharedKey(key) => {
                let to_sign =
                    container_string_to_sign(method.as_str(), &date, &self.account, url.path());
                let signature = shared_key_signature(key, &to_sign)?;
                request = request.header(
                    AUTHORIZATION,
                    format!("SharedKey {}:{}", self.account, signature),
                );
            }
            Signing::Bearer(token) => request = request.bearer_auth(token),
            Signing::Query(_) => {}
        }

        request
            .send()
            .await
            .map_err(|e| Error::storage(format!("Azure container request failed: {}", e)))
    }

    async fn create_container(&self) -> Result<()> {
        let response = self.container_request(Method::PUT).await?;
        match response.status() {
            status if status.is_success() => {
                info!(container = %self.container, "Created container");
                Ok(())
            }
            StatusCode::CONFLICT => {
                debug!(container = %self.container, "Container already exists");
                Ok(())
            }
            status => Err(api_error("container creation", status, response).await),
        }
    }
}

/// Base URL of the blob service, without a trailing slash
fn blob_endpoint(config: &AzureConfig) -> String {
    if let Some(endpoint) = &config.endpoint {
        endpoint.trim_end_matches('/').to_string()
    } else if config.use_emulator {
        format!("http://127.0.0.1:10000/{}", config.account_name)
    } else {
        format!("https://{}.blob.core.windows.net", config.account_name)
    }
}

/// Decode a SAS token (with or without the leading '?') into query pairs
fn sas_pairs(token: &str) -> Result<Vec<(String, String)>> {
    let url = Url::parse(&format!("http://sas.invalid/?{}", token.trim_start_matches('?')))
        .map_err(|e| Error::InvalidConfig {
            message: format!("invalid azure sas_token: {}", e),
        })?;
    Ok(url
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect())
}

/// Shared Key string-to-sign for a bodiless `?restype=container` request
fn container_string_to_sign(verb: &str, date: &str, account: &str, path: &str) -> String {
    // Eleven standard headers, all empty, follow the verb.
    format!(
        "{}\n\n\n\n\n\n\n\n\n\n\n\nx-ms-date:{}\nx-ms-version:{}\n/{}{}\nrestype:container",
        verb, date, API_VERSION, account, path
    )
}

/// Base64 HMAC-SHA256 of `to_sign` under the base64 account key
fn shared_key_signature(account_key: &str, to_sign: &str) -> Result<String> {
    let key = STANDARD.decode(account_key).map_err(|e| Error::InvalidConfig {
        message: format!("azure account_key is not valid base64: {}", e),
    })?;
    let mut mac = Hmac::<Sha256>::new_from_slice(&key).map_err(|e| Error::InvalidConfig {
        message: format!("azure account_key rejected: {}", e),
    })?;
    mac.update(to_sign.as_bytes());
    Ok(STANDARD.encode(mac.finalize().into_bytes()))
}

async fn api_error(operation: &str, status: StatusCode, response: reqwest::Response) -> Error {
    let body = response.text().await.unwrap_or_default();
    Error::storage(format!("Azure {} returned {}: {}", operation, status, body))
}

/// Download `key` through a [`DownloadBridge`]
///
/// Not-found is reported by the first `read`, not by opening the session.
fn bridged_reader(backend: StoreBackend, key: &str) -> DownloadBridge {
    let key = key.to_string();
    DownloadBridge::spawn(move |pipe| async move {
        let mut stream = backend.open_stream(&key).await?;
        while let Some(chunk) = stream.next().await {
            let chunk =
                chunk.map_err(|e| Error::storage(format!("reading {} failed: {}", key, e)))?;
            pipe.send(chunk).await?;
        }
        Ok(())
    })
}

#[async_trait]
impl ObjectIo for AzureStorage {
    fn backend(&self) -> &'static str {
        "azure"
    }

    #[instrument(skip(self), fields(backend = "azure", container = %self.container))]
    async fn init(&self, opts: InitOptions) -> Result<()> {
        let response = self.container_request(Method::GET).await?;
        match response.status() {
            status if status.is_success() => {
                debug!("Container exists");
                Ok(())
            }
            StatusCode::NOT_FOUND if opts.create => self.create_container().await,
            StatusCode::NOT_FOUND => Err(Error::ContainerNotFound {
                container: self.container.clone(),
            }),
            status => Err(api_error("container lookup", status, response).await),
        }
    }

    async fn write(&self, key: &str) -> Result<Box<dyn ObjectWriter>> {
        self.inner.write(key).await
    }

    #[instrument(skip(self), fields(backend = "azure", container = %self.container))]
    async fn read(&self, key: &str) -> Result<Box<dyn ObjectReader>> {
        Ok(Box::new(bridged_reader(self.inner.clone(), key)))
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

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_KEY: &str = "Z2F0ZXdheS10ZXN0LWFjY291bnQta2V5";
    const TEST_DATE: &str = "Fri, 16 Oct 2026 12:00:00 GMT";

    #[test]
    fn test_shared_key_signature() {
        let get = container_string_to_sign("GET", TEST_DATE, "myaccount", "/backups");
        assert_eq!(
            shared_key_signature(TEST_KEY, &get).unwrap(),
            "8BXo8X0ZaB422eWmoADCcrRjpwqbIvFTV9OaQaXNth0="
        );

        let put = container_string_to_sign("PUT", TEST_DATE, "myaccount", "/backups");
        assert_eq!(
            shared_key_signature(TEST_KEY, &put).unwrap(),
            "wom0ACaBahJQsG2YwH7p6+dmZcYJyEoyVhfXLe/XCcc="
        );
    }

    #[tokio::test]
    async fn test_bridged_read_round_trip() {
        let backend = StoreBackend::in_memory(Some("container"), 10);
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();

        let mut writer = backend.write("blobs/one").await.unwrap();
        crate::io::write_all(writer.as_mut(), &data).await.unwrap();
        let written = writer.close().await.unwrap();

        let mut reader = bridged_reader(backend, "blobs/one");
        let received = crate::io::read_to_end(&mut reader).await.unwrap();
        assert_eq!(received, data);

        let read = ObjectReader::close(&mut reader).await.unwrap();
        assert_eq!(read.bytes, written.bytes);
        assert_eq!(read.checksum, written.checksum);
    }

    #[tokio::test]
    async fn test_bridged_read_missing_blob() {
        let backend = StoreBackend::in_memory(None, 10);

        // opening succeeds; the worker reports the missing blob
        let mut reader = bridged_reader(backend, "absent");
        let mut buf = [0u8; 16];
        let err = ObjectReader::read(&mut reader, &mut buf).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_shared_key_rejects_bad_key() {
        let err = shared_key_signature("not base64!", "x").unwrap_err();
        assert!(matches!(err, Error::InvalidConfig { .. }));
    }

    #[test]
    fn test_string_to_sign_layout() {
        let s = container_string_to_sign("GET", TEST_DATE, "acct", "/c");
        let lines: Vec<&str> = s.split('\n').collect();
        assert_eq!(lines[0], "GET");
        assert!(lines[1..12].iter().all(|l| l.is_empty()));
        assert_eq!(lines[12], format!("x-ms-date:{}", TEST_DATE));
        assert_eq!(lines[13], format!("x-ms-version:{}", API_VERSION));
        assert_eq!(lines[14], "/acct/c");
        assert_eq!(lines[15], "restype:container");
    }

    #[test]
    fn test_sas_pairs_decodes() {
        let pairs = sas_pairs("?sv=2022-11-02&sp=rwdl&sig=abc%2Bdef%3D").unwrap();
        assert_eq!(
            pairs,
            vec![
                ("sv".to_string(), "2022-11-02".to_string()),
                ("sp".to_string(), "rwdl".to_string()),
                ("sig".to_string(), "abc+def=".to_string()),
            ]
        );
    }

    #[test]
    fn test_blob_endpoint() {
        let mut config = AzureConfig {
            account_name: "acct".to_string(),
            container: "c".to_string(),
            ..Default::default()
        };
        assert_eq!(blob_endpoint(&config), "https://acct.blob.core.windows.net");

        config.use_emulator = true;
        assert_eq!(blob_endpoint(&config), "http://127.0.0.1:10000/acct");

        config.endpoint = Some("https://blob.example.net/".to_string());
        assert_eq!(blob_endpoint(&config), "https://blob.example.net");
    }

    #[test]
    fn test_new_with_account_key() {
        let config = AzureConfig {
            account_name: "acct".to_string(),
            container: "backups".to_string(),
            account_key: Some(TEST_KEY.to_string()),
            ..Default::default()
        };
        let storage = AzureStorage::new(&config, KeyPrefix::default(), 100).unwrap();
        assert_eq!(storage.backend(), "azure");
        assert_eq!(storage.account_key.as_deref(), Some(TEST_KEY));
    }
}

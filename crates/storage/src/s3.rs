//! S3 storage backend
//!
//! Provides streaming S3-compatible storage with:
//! - Part-buffered uploads (single PutObject for small objects, multipart otherwise)
//! - Sequential ranged downloads pinned to the object's ETag
//! - Custom endpoint support (for MinIO, LocalStack, etc.)
//!
//! The SDK has no incremental writer or reader, so both directions run
//! through the [`bridge`](crate::bridge) with a background worker.

use async_trait::async_trait;
use aws_config::sts::AssumeRoleProvider;
use aws_config::BehaviorVersion;
use aws_sdk_s3::{
    config::{Builder as S3ConfigBuilder, Credentials, Region},
    error::{DisplayErrorContext, SdkError},
    primitives::{ByteStream, DateTime as S3DateTime},
    types::{
        BucketLocationConstraint, CompletedMultipartUpload, CompletedPart,
        CreateBucketConfiguration,
    },
    Client,
};
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use gateway_core::config::{S3Config, S3Credentials, MIN_S3_PART_SIZE};
use gateway_core::{Error, InitOptions, ObjectFile, ObjectInfo, Result};
use tracing::{debug, info, instrument, warn};

use crate::bridge::{DownloadBridge, PipeReader, PipeWriter, SequentialWriter, UploadBridge};
use crate::io::{ObjectIo, ObjectLister, ObjectReader, ObjectWriter};
use crate::key::KeyPrefix;

/// Region used when none is configured
const DEFAULT_REGION: &str = "us-east-1";

/// ListObjectsV2 refuses more than this many keys per page
const MAX_LIST_KEYS: usize = 1000;

/// Session name for assumed roles when none is configured
const DEFAULT_SESSION_NAME: &str = "storage-gateway";

/// S3-compatible storage backend
///
/// Supports Amazon S3 and S3-compatible services like MinIO.
#[derive(Debug, Clone)]
pub struct S3Storage {
    client: Client,
    bucket: String,
    region: String,
    keys: KeyPrefix,
    part_size: usize,
    page_size: usize,
}

impl S3Storage {
    /// Build a client from configuration
    ///
    /// Credentials come from the default chain unless static keys or a role
    /// to assume are configured.
    pub async fn new(config: &S3Config, keys: KeyPrefix, page_size: usize) -> Result<Self> {
        let region = config
            .region
            .clone()
            .unwrap_or_else(|| DEFAULT_REGION.to_string());

        let loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(region.clone()));

        let loader = match &config.credentials {
            S3Credentials::Default => loader,
            S3Credentials::Static {
                access_key_id,
                secret_access_key,
                session_token,
            } => loader.credentials_provider(Credentials::new(
                access_key_id,
                secret_access_key,
                session_token.clone(),
                None,
                "storage-gateway-static",
            )),
            S3Credentials::AssumeRole {
                role_arn,
                session_name,
                external_id,
            } => {
                let base = aws_config::defaults(BehaviorVersion::latest())
                    .region(Region::new(region.clone()))
                    .load()
                    .await;
                let mut builder = AssumeRoleProvider::builder(role_arn)
                    .session_name(session_name.as_deref().unwrap_or(DEFAULT_SESSION_NAME))
                    .configure(&base);
                if let Some(external_id) = external_id {
                    builder = builder.external_id(external_id);
                }
                loader.credentials_provider(builder.build().await)
            }
        };

        let aws_config = loader.load().await;
        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        if let Some(endpoint) = &config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint);
        }

        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = Client::from_conf(s3_config_builder.build());

        info!(
            bucket = %config.bucket,
            %region,
            endpoint = ?config.endpoint_url,
            part_size = config.part_size,
            "Created S3 backend"
        );

        Ok(Self {
            client,
            bucket: config.bucket.clone(),
            region,
            keys,
            part_size: config.part_size.max(MIN_S3_PART_SIZE),
            page_size: page_size.clamp(1, MAX_LIST_KEYS),
        })
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    fn target(&self, key: &str) -> ObjectTarget {
        ObjectTarget {
            client: self.client.clone(),
            bucket: self.bucket.clone(),
            physical: self.keys.join(key),
            key: key.to_string(),
        }
    }

    async fn create_bucket(&self) -> Result<()> {
        let mut request = self.client.create_bucket().bucket(&self.bucket);

        if self.region != DEFAULT_REGION {
            request = request.create_bucket_configuration(
                CreateBucketConfiguration::builder()
                    .location_constraint(BucketLocationConstraint::from(self.region.as_str()))
                    .build(),
            );
        }

        match request.send().await {
            Ok(_) => {
                info!(bucket = %self.bucket, region = %self.region, "Created bucket");
                Ok(())
            }
            Err(e)
                if e.as_service_error().is_some_and(|se| {
                    se.is_bucket_already_owned_by_you() || se.is_bucket_already_exists()
                }) =>
            {
                debug!(bucket = %self.bucket, "Bucket already exists");
                Ok(())
            }
            Err(e) => Err(sdk_error("create_bucket", &self.bucket, e)),
        }
    }
}

fn sdk_error<E, R>(operation: &str, target: &str, err: SdkError<E, R>) -> Error
where
    E: std::error::Error + 'static,
    R: std::fmt::Debug,
{
    Error::storage(format!(
        "S3 {} failed for {}: {}",
        operation,
        target,
        DisplayErrorContext(&err)
    ))
}

fn to_chrono(time: Option<&S3DateTime>) -> DateTime<Utc> {
    time.and_then(|t| DateTime::from_timestamp(t.secs(), t.subsec_nanos()))
        .unwrap_or_default()
}

fn non_negative(value: Option<i64>) -> u64 {
    value.unwrap_or(0).max(0) as u64
}

/// `Range` header for the part starting at `offset`, and the part length
fn byte_range(offset: u64, part_size: usize, size: u64) -> (String, u64) {
    let end = (offset + part_size as u64).min(size);
    (format!("bytes={}-{}", offset, end - 1), end - offset)
}

/// Everything a background worker needs to address one object
#[derive(Clone)]
struct ObjectTarget {
    client: Client,
    bucket: String,
    physical: String,
    key: String,
}

/// Upload worker state: one buffered part and a lazily created multipart upload
struct PartUploader {
    target: ObjectTarget,
    part_size: usize,
    buffer: BytesMut,
    upload_id: Option<String>,
    parts: Vec<CompletedPart>,
}

impl PartUploader {
    fn new(target: ObjectTarget, part_size: usize) -> Self {
        Self {
            target,
            part_size,
            buffer: BytesMut::with_capacity(part_size),
            upload_id: None,
            parts: Vec::new(),
        }
    }

    async fn run(mut self, mut reader: PipeReader) -> Result<()> {
        let result = self.drive(&mut reader).await;
        if let Err(e) = &result {
            self.abort(e).await;
        }
        result
    }

    async fn drive(&mut self, reader: &mut PipeReader) -> Result<()> {
        while let Some(chunk) = reader.next().await? {
            self.buffer.extend_from_slice(&chunk);
            while self.buffer.len() >= self.part_size {
                let part = self.buffer.split_to(self.part_size).freeze();
                self.upload_part(part).await?;
            }
        }

        if self.upload_id.is_none() {
            return self.put_whole().await;
        }

        if !self.buffer.is_empty() {
            let rest = self.buffer.split().freeze();
            self.upload_part(rest).await?;
        }
        self.complete().await
    }

    async fn put_whole(&mut self) -> Result<()> {
        let body = self.buffer.split().freeze();
        let size = body.len();
        let target = &self.target;

        target
            .client
            .put_object()
            .bucket(&target.bucket)
            .key(&target.physical)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| sdk_error("put_object", &target.physical, e))?;

        debug!(key = %target.physical, size, "Stored object with single put");
        Ok(())
    }

    async fn upload_part(&mut self, data: Bytes) -> Result<()> {
        let target = &self.target;
        let upload_id = match &self.upload_id {
            Some(id) => id.clone(),
            None => {
                let created = target
                    .client
                    .create_multipart_upload()
                    .bucket(&target.bucket)
                    .key(&target.physical)
                    .send()
                    .await
                    .map_err(|e| sdk_error("create_multipart_upload", &target.physical, e))?;
                let id = created
                    .upload_id()
                    .ok_or_else(|| Error::storage("No upload_id returned"))?
                    .to_string();
                debug!(key = %target.physical, upload_id = %id, "Started multipart upload");
                self.upload_id = Some(id.clone());
                id
            }
        };

        let part_number = self.parts.len() as i32 + 1;
        let size = data.len();
        let uploaded = target
            .client
            .upload_part()
            .bucket(&target.bucket)
            .key(&target.physical)
            .upload_id(&upload_id)
            .part_number(part_number)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| sdk_error("upload_part", &target.physical, e))?;

        self.parts.push(
            CompletedPart::builder()
                .part_number(part_number)
                .set_e_tag(uploaded.e_tag().map(String::from))
                .build(),
        );

        debug!(part_number, size, "Uploaded part");
        Ok(())
    }

    async fn complete(&mut self) -> Result<()> {
        let target = &self.target;
        let Some(upload_id) = self.upload_id.as_deref() else {
            return Err(Error::Internal {
                message: "complete called without a multipart upload".to_string(),
            });
        };

        let completed = CompletedMultipartUpload::builder()
            .set_parts(Some(std::mem::take(&mut self.parts)))
            .build();

        target
            .client
            .complete_multipart_upload()
            .bucket(&target.bucket)
            .key(&target.physical)
            .upload_id(upload_id)
            .multipart_upload(completed)
            .send()
            .await
            .map_err(|e| sdk_error("complete_multipart_upload", &target.physical, e))?;

        debug!(key = %target.physical, "Completed multipart upload");
        self.upload_id = None;
        Ok(())
    }

    /// Best-effort cleanup of an unfinished multipart upload
    async fn abort(&mut self, cause: &Error) {
        let Some(upload_id) = self.upload_id.take() else {
            return;
        };
        let target = &self.target;

        warn!(key = %target.physical, %upload_id, error = %cause, "Aborting multipart upload");
        if let Err(e) = target
            .client
            .abort_multipart_upload()
            .bucket(&target.bucket)
            .key(&target.physical)
            .upload_id(&upload_id)
            .send()
            .await
        {
            warn!(key = %target.physical, error = %DisplayErrorContext(&e), "Abort failed");
        }
    }
}

/// Download worker: HeadObject, then sequential ranged GETs into the pipe
async fn download(target: ObjectTarget, part_size: usize, pipe: PipeWriter) -> Result<()> {
    let head = target
        .client
        .head_object()
        .bucket(&target.bucket)
        .key(&target.physical)
        .send()
        .await
        .map_err(|e| {
            if e.as_service_error().is_some_and(|se| se.is_not_found()) {
                Error::not_found(&target.key)
            } else {
                sdk_error("head_object", &target.physical, e)
            }
        })?;

    let size = non_negative(head.content_length());
    let etag = head.e_tag().map(String::from);
    let mut sink = SequentialWriter::new(pipe);

    while sink.written() < size {
        let offset = sink.written();
        let (range, expected) = byte_range(offset, part_size, size);

        let mut request = target
            .client
            .get_object()
            .bucket(&target.bucket)
            .key(&target.physical)
            .range(range);
        if let Some(etag) = &etag {
            request = request.if_match(etag);
        }

        let output = request.send().await.map_err(|e| {
            if e.as_service_error().is_some_and(|se| se.is_no_such_key()) {
                Error::not_found(&target.key)
            } else {
                sdk_error("get_object", &target.physical, e)
            }
        })?;

        let mut body = output.body;
        let mut at = offset;
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| {
                Error::storage(format!("reading {} failed: {}", target.physical, e))
            })?;
            let len = chunk.len() as u64;
            sink.write_at(at, chunk).await?;
            at += len;
        }

        if at - offset != expected {
            return Err(Error::Truncated {
                message: format!(
                    "range at {} of {} returned {} of {} bytes",
                    offset,
                    target.physical,
                    at - offset,
                    expected
                ),
            });
        }
    }

    debug!(key = %target.physical, size, "Download finished");
    Ok(())
}

#[async_trait]
impl ObjectIo for S3Storage {
    fn backend(&self) -> &'static str {
        "s3"
    }

    #[instrument(skip(self), fields(backend = "s3", bucket = %self.bucket))]
    async fn init(&self, opts: InitOptions) -> Result<()> {
        match self.client.head_bucket().bucket(&self.bucket).send().await {
            Ok(_) => {
                debug!("Bucket exists");
                Ok(())
            }
            Err(e) if e.as_service_error().is_some_and(|se| se.is_not_found()) => {
                if !opts.create {
                    return Err(Error::ContainerNotFound {
                        container: self.bucket.clone(),
                    });
                }
                self.create_bucket().await
            }
            Err(e) => Err(sdk_error("head_bucket", &self.bucket, e)),
        }
    }

    #[instrument(skip(self), fields(backend = "s3", bucket = %self.bucket))]
    async fn write(&self, key: &str) -> Result<Box<dyn ObjectWriter>> {
        let uploader = PartUploader::new(self.target(key), self.part_size);
        debug!(key, "Opened upload bridge");
        Ok(Box::new(UploadBridge::spawn(key, move |reader| {
            uploader.run(reader)
        })))
    }

    #[instrument(skip(self), fields(backend = "s3", bucket = %self.bucket))]
    async fn read(&self, key: &str) -> Result<Box<dyn ObjectReader>> {
        let target = self.target(key);
        let part_size = self.part_size;
        debug!(key, "Opened download bridge");
        Ok(Box::new(DownloadBridge::spawn(move |pipe| {
            download(target, part_size, pipe)
        })))
    }

    #[instrument(skip(self), fields(backend = "s3", bucket = %self.bucket))]
    async fn head(&self, key: &str) -> Result<Option<ObjectInfo>> {
        let physical = self.keys.join(key);
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(&physical)
            .send()
            .await
        {
            Ok(output) => Ok(Some(ObjectInfo {
                size: non_negative(output.content_length()),
                last_updated_at: to_chrono(output.last_modified()),
            })),
            Err(e) if e.as_service_error().is_some_and(|se| se.is_not_found()) => Ok(None),
            Err(e) => Err(sdk_error("head_object", &physical, e)),
        }
    }

    #[instrument(skip(self), fields(backend = "s3", bucket = %self.bucket))]
    async fn delete(&self, key: &str) -> Result<bool> {
        let physical = self.keys.join(key);
        // S3 answers 204 for missing keys as well.
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(&physical)
            .send()
            .await
            .map_err(|e| sdk_error("delete_object", &physical, e))?;
        Ok(true)
    }

    #[instrument(skip(self), fields(backend = "s3", bucket = %self.bucket))]
    async fn list(&self, prefix: &str) -> Result<Box<dyn ObjectLister>> {
        Ok(Box::new(S3Lister {
            client: self.client.clone(),
            bucket: self.bucket.clone(),
            physical_prefix: self.keys.join(prefix),
            keys: self.keys.clone(),
            page_size: self.page_size,
            continuation_token: None,
            exhausted: false,
        }))
    }
}

/// Listing cursor over ListObjectsV2 continuation tokens
struct S3Lister {
    client: Client,
    bucket: String,
    physical_prefix: String,
    keys: KeyPrefix,
    page_size: usize,
    continuation_token: Option<String>,
    exhausted: bool,
}

#[async_trait]
impl ObjectLister for S3Lister {
    async fn next_batch(&mut self) -> Result<Option<Vec<ObjectFile>>> {
        if self.exhausted {
            return Ok(None);
        }

        let mut request = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(&self.physical_prefix)
            .max_keys(self.page_size as i32);

        if let Some(token) = self.continuation_token.take() {
            request = request.continuation_token(token);
        }

        let response = request.send().await.map_err(|e| {
            if e.as_service_error().is_some_and(|se| se.is_no_such_bucket()) {
                Error::ContainerNotFound {
                    container: self.bucket.clone(),
                }
            } else {
                sdk_error("list_objects_v2", &self.physical_prefix, e)
            }
        })?;

        let batch: Vec<ObjectFile> = response
            .contents()
            .iter()
            .filter_map(|object| {
                let name = object.key()?;
                Some(ObjectFile {
                    key: self.keys.strip(name).to_string(),
                    info: ObjectInfo {
                        size: non_negative(object.size()),
                        last_updated_at: to_chrono(object.last_modified()),
                    },
                })
            })
            .collect();

        match response.next_continuation_token() {
            Some(token) if response.is_truncated() == Some(true) => {
                self.continuation_token = Some(token.to_string());
            }
            _ => self.exhausted = true,
        }

        debug!(count = batch.len(), exhausted = self.exhausted, "Listed S3 page");
        if batch.is_empty() && self.exhausted {
            return Ok(None);
        }
        Ok(Some(batch))
    }
}

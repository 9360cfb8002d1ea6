//! gRPC service implementation for the storage gateway
//!
//! Implements every method defined in storage.proto on top of a single
//! [`ObjectIo`] backend.

use std::pin::Pin;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use gateway_core::{Error, InitOptions, ObjectInfo, MAX_CHUNK_BYTES};
use storage::io::write_all;
use storage::{ObjectIo, ObjectLister, ObjectReader};
use tokio::sync::mpsc;
use tokio_stream::{wrappers::ReceiverStream, Stream};
use tonic::{Code, Request, Response, Status, Streaming};
use tracing::{debug, info};

use crate::middleware::PathValidator;
use crate::proto::{
    self, storage_v2_server::StorageV2, DeleteObjectRequest, DeleteObjectResponse,
    HeadObjectRequest, HeadObjectResponse, InitRequest, InitResponse, ListObjectsRequest,
    ListObjectsResponse, ReadObjectRequest, ReadObjectResponse, WriteObjectRequest,
    WriteObjectResponse,
};
use crate::sessions::{SessionGuard, SessionKind, SessionRegistry, SessionRegistryHandle};

/// Storage gRPC service
#[derive(Clone)]
pub struct StorageService {
    /// Backend every call is forwarded to
    io: Arc<dyn ObjectIo>,

    /// Active transfer sessions
    sessions: SessionRegistryHandle,

    /// Key validation
    validator: Arc<PathValidator>,
}

impl StorageService {
    /// Create a service over a backend with a fresh session registry
    pub fn new(io: Arc<dyn ObjectIo>) -> Self {
        Self::with_sessions(io, Arc::new(SessionRegistry::new()))
    }

    /// Create a service sharing an existing session registry
    pub fn with_sessions(io: Arc<dyn ObjectIo>, sessions: SessionRegistryHandle) -> Self {
        Self {
            io,
            sessions,
            validator: Arc::new(PathValidator::new()),
        }
    }

    /// Session registry used for graceful drain
    pub fn sessions(&self) -> SessionRegistryHandle {
        self.sessions.clone()
    }

    fn begin_session(&self, kind: SessionKind, key: &str) -> Result<SessionGuard, Status> {
        self.sessions
            .begin(kind, key)
            .ok_or_else(|| Status::unavailable("server is shutting down"))
    }
}

/// Map a gateway error onto the status returned to the client
pub fn status_from(err: Error) -> Status {
    debug!(error = %err, "Request failed");
    match &err {
        Error::NotFound { .. } | Error::ContainerNotFound { .. } => {
            Status::not_found(err.to_string())
        }
        Error::InvalidArgument { message } => Status::invalid_argument(message.clone()),
        Error::UnexpectedEof { .. } | Error::Cancelled { .. } => {
            Status::cancelled("unexpected end of stream")
        }
        Error::SessionClosed | Error::InvalidConfig { .. } => {
            Status::failed_precondition(err.to_string())
        }
        _ => Status::internal(err.to_string()),
    }
}

/// Status for a failure reading the inbound client stream
///
/// A cancelled client ends the upload early; anything else (decode errors,
/// oversized messages, transport resets) is returned unchanged.
fn client_stream_error(status: Status) -> Status {
    if status.code() == Code::Cancelled {
        return status_from(Error::UnexpectedEof {
            message: status.message().to_string(),
        });
    }
    debug!(code = ?status.code(), message = status.message(), "Client stream failed");
    status
}

fn to_timestamp(time: DateTime<Utc>) -> prost_types::Timestamp {
    prost_types::Timestamp {
        seconds: time.timestamp(),
        nanos: time.timestamp_subsec_nanos() as i32,
    }
}

fn to_proto_info(info: ObjectInfo) -> proto::ObjectInfo {
    proto::ObjectInfo {
        size: info.size,
        last_updated: Some(to_timestamp(info.last_updated_at)),
    }
}

/// Fill `buf` until it is full or the reader is exhausted
///
/// Returns the number of bytes filled and whether the end was reached.
async fn fill_chunk(
    reader: &mut dyn ObjectReader,
    buf: &mut [u8],
) -> gateway_core::Result<(usize, bool)> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            return Ok((filled, true));
        }
        filled += n;
    }
    Ok((filled, false))
}

async fn stream_object(
    mut reader: Box<dyn ObjectReader>,
    tx: mpsc::Sender<Result<ReadObjectResponse, Status>>,
    key: String,
    _session: SessionGuard,
) {
    let mut buf = vec![0u8; MAX_CHUNK_BYTES];
    loop {
        match fill_chunk(reader.as_mut(), &mut buf).await {
            Ok((filled, eof)) => {
                if filled > 0 {
                    let response = ReadObjectResponse {
                        chunk: buf[..filled].to_vec(),
                    };
                    if tx.send(Ok(response)).await.is_err() {
                        debug!(key = %key, "Client went away during read");
                        break;
                    }
                }
                if eof {
                    break;
                }
            }
            Err(e) => {
                let _ = tx.send(Err(status_from(e))).await;
                break;
            }
        }
    }

    match reader.close().await {
        Ok(summary) => {
            debug!(key = %key, bytes = summary.bytes, checksum = %summary.checksum, "Read finished")
        }
        Err(e) => debug!(key = %key, error = %e, "Read closed with error"),
    }
}

async fn stream_listing(
    mut lister: Box<dyn ObjectLister>,
    tx: mpsc::Sender<Result<ListObjectsResponse, Status>>,
) {
    loop {
        match lister.next_batch().await {
            Ok(Some(batch)) => {
                if batch.is_empty() {
                    continue;
                }
                let files = batch
                    .into_iter()
                    .map(|file| proto::ObjectFile {
                        path: file.key,
                        info: Some(to_proto_info(file.info)),
                    })
                    .collect();
                if tx.send(Ok(ListObjectsResponse { files })).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                let _ = tx.send(Err(status_from(e))).await;
                break;
            }
        }
    }
}

#[tonic::async_trait]
impl StorageV2 for StorageService {
    async fn write_object(
        &self,
        request: Request<Streaming<WriteObjectRequest>>,
    ) -> Result<Response<WriteObjectResponse>, Status> {
        let mut stream = request.into_inner();

        let first = match stream.message().await {
            Ok(Some(msg)) => msg,
            Ok(None) => return Err(Status::invalid_argument("path missing")),
            Err(e) => return Err(client_stream_error(e)),
        };

        let key = first.path;
        self.validator.validate_key(&key)?;
        let _session = self.begin_session(SessionKind::Write, &key)?;

        let mut writer = self.io.write(&key).await.map_err(status_from)?;
        write_all(writer.as_mut(), &first.chunk)
            .await
            .map_err(status_from)?;

        loop {
            match stream.message().await {
                Ok(Some(msg)) => {
                    if !msg.path.is_empty() && msg.path != key {
                        return Err(Status::invalid_argument("path changed"));
                    }
                    write_all(writer.as_mut(), &msg.chunk)
                        .await
                        .map_err(status_from)?;
                }
                Ok(None) => break,
                Err(e) => return Err(client_stream_error(e)),
            }
        }

        let summary = writer.close().await.map_err(status_from)?;
        info!(key = %key, bytes = summary.bytes, checksum = %summary.checksum, "Object written");

        Ok(Response::new(WriteObjectResponse {
            bytes: summary.bytes as i64,
            checksum: summary.checksum,
        }))
    }

    type ReadObjectStream = Pin<Box<dyn Stream<Item = Result<ReadObjectResponse, Status>> + Send>>;

    async fn read_object(
        &self,
        request: Request<ReadObjectRequest>,
    ) -> Result<Response<Self::ReadObjectStream>, Status> {
        let key = request.into_inner().path;
        self.validator.validate_key(&key)?;
        let session = self.begin_session(SessionKind::Read, &key)?;

        let reader = self.io.read(&key).await.map_err(status_from)?;

        let (tx, rx) = mpsc::channel(2);
        tokio::spawn(stream_object(reader, tx, key, session));

        let output_stream = ReceiverStream::new(rx);
        Ok(Response::new(Box::pin(output_stream) as Self::ReadObjectStream))
    }

    async fn head_object(
        &self,
        request: Request<HeadObjectRequest>,
    ) -> Result<Response<HeadObjectResponse>, Status> {
        let key = request.into_inner().path;
        self.validator.validate_key(&key)?;

        match self.io.head(&key).await.map_err(status_from)? {
            Some(info) => Ok(Response::new(HeadObjectResponse {
                info: Some(to_proto_info(info)),
            })),
            None => Err(Status::not_found("Object Not Found")),
        }
    }

    async fn delete_object(
        &self,
        request: Request<DeleteObjectRequest>,
    ) -> Result<Response<DeleteObjectResponse>, Status> {
        let key = request.into_inner().path;
        self.validator.validate_key(&key)?;

        if !self.io.delete(&key).await.map_err(status_from)? {
            return Err(Status::not_found("Object Not Found"));
        }
        debug!(key = %key, "Object deleted");
        Ok(Response::new(DeleteObjectResponse {}))
    }

    type ListObjectsStream =
        Pin<Box<dyn Stream<Item = Result<ListObjectsResponse, Status>> + Send>>;

    async fn list_objects(
        &self,
        request: Request<ListObjectsRequest>,
    ) -> Result<Response<Self::ListObjectsStream>, Status> {
        let prefix = request.into_inner().path;
        self.validator.validate_prefix(&prefix)?;

        let lister = self.io.list(&prefix).await.map_err(status_from)?;

        let (tx, rx) = mpsc::channel(4);
        tokio::spawn(stream_listing(lister, tx));

        let output_stream = ReceiverStream::new(rx);
        Ok(Response::new(Box::pin(output_stream) as Self::ListObjectsStream))
    }

    async fn init(&self, request: Request<InitRequest>) -> Result<Response<InitResponse>, Status> {
        let create = request.into_inner().create;
        info!(backend = self.io.backend(), create, "Initializing backend");

        self.io
            .init(InitOptions { create })
            .await
            .map_err(status_from)?;
        Ok(Response::new(InitResponse {}))
    }
}

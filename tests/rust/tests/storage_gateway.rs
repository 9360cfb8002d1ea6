//! End-to-end tests of the storage gateway over gRPC
//!
//! Each test starts a gateway on a free port backed by an in-memory store
//! and drives it through the generated client:
//! - Large writes and reads with checksum agreement
//! - Overwrite, delete and not-found handling
//! - Prefix listing across many keys and pages
//! - Argument validation
//! - Graceful drain of an in-flight upload on shutdown

use anyhow::Result;
use gateway::proto::{
    DeleteObjectRequest, HeadObjectRequest, InitRequest, ListObjectsRequest, ReadObjectRequest,
    WriteObjectRequest, WriteObjectResponse,
};
use gateway::{GatewayServer, StorageClient, StorageService, StorageServiceServer};
use gateway_core::config::ServerSettings;
use rand::RngCore;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use storage::checksum::sha256_hex;
use storage::StoreBackend;
use tokio::time::sleep;
use tokio_stream::StreamExt;
use tonic::transport::{Channel, Server};
use tonic::Code;

const ZEROS_4MIB_SHA256: &str = "bb9f8df61474d25e71fa00722318cd387396ca1736605e1248821cc0de3d3af8";

fn backend() -> StorageService {
    StorageService::new(Arc::new(StoreBackend::in_memory(None, 32)))
}

async fn start_gateway() -> Result<(String, tokio::sync::oneshot::Sender<()>)> {
    let port = portpicker::pick_unused_port().expect("No ports free");
    let addr = SocketAddr::from_str(&format!("127.0.0.1:{}", port))?;

    let (tx, rx) = tokio::sync::oneshot::channel();

    let svc = StorageServiceServer::new(backend())
        .max_decoding_message_size(16 * 1024 * 1024)
        .max_encoding_message_size(16 * 1024 * 1024);

    let server = Server::builder()
        .add_service(svc)
        .serve_with_shutdown(addr, async {
            rx.await.ok();
        });

    tokio::spawn(server);
    sleep(Duration::from_millis(100)).await;

    Ok((format!("http://127.0.0.1:{}", port), tx))
}

async fn connect(addr: &str) -> Result<StorageClient<Channel>> {
    Ok(StorageClient::connect(addr.to_string())
        .await?
        .max_decoding_message_size(16 * 1024 * 1024)
        .max_encoding_message_size(16 * 1024 * 1024))
}

/// Upload `data` in 1 MiB messages, the key on the first one only
async fn write(
    client: &mut StorageClient<Channel>,
    path: &str,
    data: &[u8],
) -> std::result::Result<WriteObjectResponse, tonic::Status> {
    let mut messages = vec![WriteObjectRequest {
        path: path.to_string(),
        chunk: Vec::new(),
    }];
    messages.extend(data.chunks(1024 * 1024).map(|chunk| WriteObjectRequest {
        path: String::new(),
        chunk: chunk.to_vec(),
    }));

    client
        .write_object(tokio_stream::iter(messages))
        .await
        .map(|r| r.into_inner())
}

async fn read(
    client: &mut StorageClient<Channel>,
    path: &str,
) -> std::result::Result<Vec<u8>, tonic::Status> {
    let mut stream = client
        .read_object(ReadObjectRequest {
            path: path.to_string(),
        })
        .await?
        .into_inner();

    let mut data = Vec::new();
    while let Some(msg) = stream.next().await {
        data.extend_from_slice(&msg?.chunk);
    }
    Ok(data)
}

async fn list(client: &mut StorageClient<Channel>, prefix: &str) -> Result<Vec<String>> {
    let mut stream = client
        .list_objects(ListObjectsRequest {
            path: prefix.to_string(),
        })
        .await?
        .into_inner();

    let mut paths = Vec::new();
    while let Some(msg) = stream.next().await {
        let files = msg?.files;
        assert!(!files.is_empty(), "listing sent an empty batch");
        assert!(files.len() <= 32, "listing batch exceeds page size");
        paths.extend(files.into_iter().map(|f| f.path));
    }
    paths.sort();
    Ok(paths)
}

#[tokio::test]
async fn test_write_read_4mib() -> Result<()> {
    let (addr, shutdown) = start_gateway().await?;
    let mut client = connect(&addr).await?;

    let data = vec![0u8; 4 * 1024 * 1024];
    let written = write(&mut client, "test.data", &data).await?;
    assert_eq!(written.bytes, data.len() as i64);
    assert_eq!(written.checksum, ZEROS_4MIB_SHA256);

    let received = read(&mut client, "test.data").await?;
    assert_eq!(received.len(), data.len());
    assert_eq!(sha256_hex(&received), ZEROS_4MIB_SHA256);

    let head = client
        .head_object(HeadObjectRequest {
            path: "test.data".to_string(),
        })
        .await?
        .into_inner();
    let info = head.info.expect("head returns info");
    assert_eq!(info.size, data.len() as u64);
    assert!(info.last_updated.is_some());

    shutdown.send(()).ok();
    Ok(())
}

#[tokio::test]
async fn test_missing_object() -> Result<()> {
    let (addr, shutdown) = start_gateway().await?;
    let mut client = connect(&addr).await?;

    let err = client
        .head_object(HeadObjectRequest {
            path: "test.data".to_string(),
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::NotFound);

    let err = read(&mut client, "test.data").await.unwrap_err();
    assert_eq!(err.code(), Code::NotFound);

    shutdown.send(()).ok();
    Ok(())
}

#[tokio::test]
async fn test_overwrite_replaces_content() -> Result<()> {
    let (addr, shutdown) = start_gateway().await?;
    let mut client = connect(&addr).await?;

    let first = write(&mut client, "test.data", b"A").await?;
    assert_eq!(
        first.checksum,
        "559aead08264d5795d3909718cdd05abd49572e84fe55590eef31a88a08fdffd"
    );

    let second = write(&mut client, "test.data", b"B").await?;
    assert_eq!(
        second.checksum,
        "df7e70e5021544f4834bbee64a9e3789febc4be81470df629cad6ddb03320a5c"
    );

    assert_eq!(read(&mut client, "test.data").await?, b"B");

    shutdown.send(()).ok();
    Ok(())
}

#[tokio::test]
async fn test_delete_is_idempotent() -> Result<()> {
    let (addr, shutdown) = start_gateway().await?;
    let mut client = connect(&addr).await?;

    write(&mut client, "test.data", b"hello world").await?;

    for _ in 0..2 {
        client
            .delete_object(DeleteObjectRequest {
                path: "test.data".to_string(),
            })
            .await?;
    }

    let err = client
        .head_object(HeadObjectRequest {
            path: "test.data".to_string(),
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::NotFound);

    // never written
    client
        .delete_object(DeleteObjectRequest {
            path: format!("never/{}", uuid::Uuid::new_v4()),
        })
        .await?;

    shutdown.send(()).ok();
    Ok(())
}

#[tokio::test]
async fn test_list_prefixes() -> Result<()> {
    let (addr, shutdown) = start_gateway().await?;
    let mut client = connect(&addr).await?;

    for i in 0..128 {
        write(&mut client, &format!("prefix/file{:04}", i), b"f").await?;
        write(&mut client, &format!("prefix/path{:04}/file", i), b"p").await?;
    }
    write(&mut client, "elsewhere/file", b"e").await?;

    let all = list(&mut client, "prefix").await?;
    assert_eq!(all.len(), 256);

    let files = list(&mut client, "prefix/file").await?;
    let expected: Vec<String> = (0..128).map(|i| format!("prefix/file{:04}", i)).collect();
    assert_eq!(files, expected);

    let nested = list(&mut client, "prefix/path0007").await?;
    assert_eq!(nested, vec!["prefix/path0007/file".to_string()]);

    assert!(list(&mut client, "missing").await?.is_empty());
    assert_eq!(list(&mut client, "").await?.len(), 257);

    shutdown.send(()).ok();
    Ok(())
}

#[tokio::test]
async fn test_random_sizes() -> Result<()> {
    let (addr, shutdown) = start_gateway().await?;
    let mut client = connect(&addr).await?;

    let mut rng = rand::thread_rng();
    let mut checksums = Vec::new();

    for size in [16usize, 1024, 1024 * 1024, 4 * 1024 * 1024] {
        let mut data = vec![0u8; size];
        rng.fill_bytes(&mut data);
        let path = format!("random/{}", size);

        let written = write(&mut client, &path, &data).await?;
        assert_eq!(written.bytes, size as i64);
        assert_eq!(written.checksum, sha256_hex(&data));

        let received = read(&mut client, &path).await?;
        assert_eq!(sha256_hex(&received), written.checksum);
        checksums.push(written.checksum);
    }

    checksums.sort();
    checksums.dedup();
    assert_eq!(checksums.len(), 4);

    shutdown.send(()).ok();
    Ok(())
}

#[tokio::test]
async fn test_invalid_arguments() -> Result<()> {
    let (addr, shutdown) = start_gateway().await?;
    let mut client = connect(&addr).await?;

    let err = write(&mut client, "", b"data").await.unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);

    let messages = vec![
        WriteObjectRequest {
            path: "one".to_string(),
            chunk: b"a".to_vec(),
        },
        WriteObjectRequest {
            path: "two".to_string(),
            chunk: b"b".to_vec(),
        },
    ];
    let err = client
        .write_object(tokio_stream::iter(messages))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);
    assert_eq!(err.message(), "path changed");

    let err = read(&mut client, "").await.unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);

    let err = client
        .delete_object(DeleteObjectRequest {
            path: "a/../b".to_string(),
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);

    shutdown.send(()).ok();
    Ok(())
}

#[tokio::test]
async fn test_init() -> Result<()> {
    let (addr, shutdown) = start_gateway().await?;
    let mut client = connect(&addr).await?;

    client.init(InitRequest { create: false }).await?;
    client.init(InitRequest { create: true }).await?;

    shutdown.send(()).ok();
    Ok(())
}

#[tokio::test]
async fn test_shutdown_drains_inflight_upload() -> Result<()> {
    let port = portpicker::pick_unused_port().expect("No ports free");
    let settings = ServerSettings {
        bind_address: "127.0.0.1".to_string(),
        port,
        shutdown_grace: Duration::from_secs(10),
        ..Default::default()
    };

    let service = backend();
    let sessions = service.sessions();
    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let server = tokio::spawn(GatewayServer::with_settings(service, settings).run_until(async {
        stop_rx.await.ok();
    }));
    sleep(Duration::from_millis(100)).await;

    let mut client = connect(&format!("http://127.0.0.1:{}", port)).await?;
    let (chunks_tx, chunks_rx) = tokio::sync::mpsc::channel(4);
    chunks_tx
        .send(WriteObjectRequest {
            path: "draining".to_string(),
            chunk: b"first ".to_vec(),
        })
        .await?;

    let mut upload_client = client.clone();
    let upload = tokio::spawn(async move {
        upload_client
            .write_object(tokio_stream::wrappers::ReceiverStream::new(chunks_rx))
            .await
    });
    sleep(Duration::from_millis(100)).await;
    assert_eq!(sessions.active(), 1);

    stop_tx.send(()).ok();
    sleep(Duration::from_millis(100)).await;
    assert!(!sessions.is_accepting());

    let err = read(&mut client, "draining").await.unwrap_err();
    assert_eq!(err.code(), Code::Unavailable);

    chunks_tx
        .send(WriteObjectRequest {
            path: String::new(),
            chunk: b"second".to_vec(),
        })
        .await?;
    drop(chunks_tx);

    let written = upload.await??.into_inner();
    assert_eq!(written.bytes, 12);
    assert_eq!(written.checksum, sha256_hex(b"first second"));

    server.await??;
    Ok(())
}

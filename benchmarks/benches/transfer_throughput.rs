//! Benchmarks for object write and read throughput through the storage adapters

use bytes::Bytes;
use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use gateway_core::config::{BackendConfig, FilesystemConfig, StorageConfig};
use storage::bridge::{pipe, UploadBridge};
use storage::io::{read_to_end, write_all};
use storage::{ObjectIo, StoreBackend};
use std::sync::Arc;
use tempfile::TempDir;

const SIZES: [usize; 3] = [1_000_000, 10_000_000, 100_000_000];

/// Feed `data` to a writer in 1 MiB slices, as the gRPC handler does
async fn upload(io: &dyn ObjectIo, key: &str, data: &[u8]) {
    let mut writer = io.write(key).await.unwrap();
    for chunk in data.chunks(1024 * 1024) {
        write_all(writer.as_mut(), chunk).await.unwrap();
    }
    writer.close().await.unwrap();
}

fn filesystem_backend(rt: &tokio::runtime::Runtime, dir: &TempDir) -> Arc<dyn ObjectIo> {
    let config = StorageConfig {
        prefix: None,
        list_page_size: None,
        backend: BackendConfig::Filesystem(FilesystemConfig {
            root: dir.path().to_path_buf(),
        }),
    };
    rt.block_on(storage::connect(&config)).unwrap()
}

fn object_write_benchmark(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    let mut group = c.benchmark_group("object_write");
    group.sample_size(10);

    for size in SIZES.iter() {
        group.throughput(Throughput::Bytes(*size as u64));
        let data = vec![0u8; *size];

        let memory: Arc<dyn ObjectIo> = Arc::new(StoreBackend::in_memory(None, 1000));
        group.bench_function(format!("memory/{}MB", size / 1_000_000), |b| {
            b.to_async(&rt)
                .iter(|| async { upload(memory.as_ref(), "bench_object", &data).await });
        });

        let temp_dir = TempDir::new().unwrap();
        let filesystem = filesystem_backend(&rt, &temp_dir);
        group.bench_function(format!("filesystem/{}MB", size / 1_000_000), |b| {
            b.to_async(&rt)
                .iter(|| async { upload(filesystem.as_ref(), "bench_object", &data).await });
        });
    }

    group.finish();
}

fn object_read_benchmark(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    let mut group = c.benchmark_group("object_read");
    group.sample_size(10);

    for size in SIZES.iter() {
        group.throughput(Throughput::Bytes(*size as u64));

        // Setup: write the object first
        let temp_dir = TempDir::new().unwrap();
        let filesystem = filesystem_backend(&rt, &temp_dir);
        let data = vec![0u8; *size];
        rt.block_on(upload(filesystem.as_ref(), "bench_object", &data));

        group.bench_function(format!("filesystem/{}MB", size / 1_000_000), |b| {
            b.to_async(&rt).iter(|| async {
                let mut reader = filesystem.read("bench_object").await.unwrap();
                let data = read_to_end(reader.as_mut()).await.unwrap();
                assert_eq!(data.len(), *size);
            });
        });
    }

    group.finish();
}

fn bridge_benchmark(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    let mut group = c.benchmark_group("upload_bridge");
    let size = 10_000_000;
    group.throughput(Throughput::Bytes(size as u64));
    let data = vec![0u8; size];

    group.bench_function("drain_10MB", |b| {
        b.to_async(&rt).iter(|| async {
            let mut bridge = UploadBridge::spawn("bench_object", |mut reader| async move {
                while reader.next().await?.is_some() {}
                Ok(())
            });
            write_all(&mut bridge, &data).await.unwrap();
            storage::ObjectWriter::close(&mut bridge).await.unwrap();
        });
    });

    group.bench_function("pipe_10MB", |b| {
        b.to_async(&rt).iter(|| async {
            let (tx, mut rx) = pipe();
            let payload = Bytes::from(data.clone());
            let producer = tokio::spawn(async move {
                let mut offset = 0;
                while offset < payload.len() {
                    let end = (offset + 64 * 1024).min(payload.len());
                    tx.send(payload.slice(offset..end)).await.unwrap();
                    offset = end;
                }
                tx.finish().await.unwrap();
            });
            while rx.next().await.unwrap().is_some() {}
            producer.await.unwrap();
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    object_write_benchmark,
    object_read_benchmark,
    bridge_benchmark
);
criterion_main!(benches);

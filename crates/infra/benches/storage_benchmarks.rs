use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use jobvault_infra::storage::{DataStorage, StorageConfig};

const PART_SIZE: usize = 64 * 1024;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap()
}

fn storage() -> DataStorage {
    DataStorage::in_memory(StorageConfig::default().with_part_size(PART_SIZE)).unwrap()
}

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn bench_put(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("storage_put");

    for len in [4 * 1024, PART_SIZE, 16 * PART_SIZE + 17] {
        let bytes = payload(len);
        group.throughput(Throughput::Bytes(len as u64));
        group.bench_with_input(BenchmarkId::from_parameter(len), &bytes, |b, bytes| {
            let storage = storage();
            let mut n = 0u64;
            b.to_async(&rt).iter(|| {
                n += 1;
                let key = format!("put-{n}");
                let storage = storage.clone();
                async move {
                    let mut sink = storage.put(&key).await.unwrap();
                    sink.write(black_box(bytes)).await.unwrap();
                    black_box(sink.close().await.unwrap());
                    storage.remove(&key).await.unwrap();
                }
            });
        });
    }

    group.finish();
}

fn bench_get(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("storage_get");

    for len in [4 * 1024, PART_SIZE, 16 * PART_SIZE + 17] {
        let storage = storage();
        rt.block_on(async {
            let mut sink = storage.put("blob").await.unwrap();
            sink.write(&payload(len)).await.unwrap();
            sink.close().await.unwrap();
        });

        group.throughput(Throughput::Bytes(len as u64));
        group.bench_function(BenchmarkId::from_parameter(len), |b| {
            b.to_async(&rt).iter(|| {
                let storage = storage.clone();
                async move {
                    let mut reader = storage.get("blob").await.unwrap().unwrap();
                    let mut out = Vec::with_capacity(len);
                    reader.read_to_end(&mut out).await.unwrap();
                    black_box(out);
                }
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_put, bench_get);
criterion_main!(benches);

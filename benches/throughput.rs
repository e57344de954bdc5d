//! Throughput benchmark for the storage engine.
//!
//! Measures raw engine performance without the HTTP or persistence
//! layers.

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use emberkv::{ShardedStore, StoreOptions};
use std::sync::Arc;

fn unbounded() -> Arc<ShardedStore> {
    Arc::new(ShardedStore::new(StoreOptions {
        max_memory: 0,
        ..StoreOptions::default()
    }))
}

fn bench_set(c: &mut Criterion) {
    let store = unbounded();

    let mut group = c.benchmark_group("set");
    group.throughput(Throughput::Elements(1));

    group.bench_function("set_small", |b| {
        let mut i = 0u64;
        b.iter(|| {
            let key = format!("key:{i}");
            store.set_at(&key, Bytes::from_static(b"small_value"), 0).unwrap();
            i += 1;
        });
    });

    group.bench_function("set_1k", |b| {
        let mut i = 0u64;
        let value = Bytes::from(vec![b'x'; 1024]);
        b.iter(|| {
            let key = format!("key:{i}");
            store.set_at(&key, value.clone(), 0).unwrap();
            i += 1;
        });
    });

    group.finish();
}

fn bench_get(c: &mut Criterion) {
    let store = unbounded();
    for i in 0..100_000 {
        store
            .set_at(&format!("key:{i}"), Bytes::from(format!("value:{i}")), 0)
            .unwrap();
    }

    let mut group = c.benchmark_group("get");
    group.throughput(Throughput::Elements(1));

    group.bench_function("get_existing", |b| {
        let mut i = 0u64;
        b.iter(|| {
            let key = format!("key:{}", i % 100_000);
            black_box(store.get(&key));
            i += 1;
        });
    });

    group.bench_function("get_missing", |b| {
        let mut i = 0u64;
        b.iter(|| {
            let key = format!("missing:{i}");
            black_box(store.get(&key));
            i += 1;
        });
    });

    group.finish();
}

fn bench_mixed(c: &mut Criterion) {
    let store = unbounded();

    let mut group = c.benchmark_group("mixed");
    group.throughput(Throughput::Elements(1));

    group.bench_function("set_get_delete", |b| {
        let mut i = 0u64;
        b.iter(|| {
            let key = format!("key:{}", i % 1024);
            match i % 3 {
                0 => {
                    store.set_at(&key, Bytes::from_static(b"value"), 0).unwrap();
                }
                1 => {
                    black_box(store.get(&key));
                }
                _ => {
                    store.delete(&key);
                }
            }
            i += 1;
        });
    });

    group.finish();
}

criterion_group!(benches, bench_set, bench_get, bench_mixed);
criterion_main!(benches);

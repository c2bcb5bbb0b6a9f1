use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::Arc;
use std::time::Duration;

use txnkv::kv::PutRequest;
use txnkv::server::{BackendKind, Node, ServerConfig};
use txnkv::storage::codec::{decode_key, encode_key, package_value, unpackage_value, ValueFlag};
use txnkv::storage::Revision;
use txnkv::tso::ManualTso;
use txnkv::txn::{IsolationLevel, Mutation, PrewriteRequest};

fn memory_node() -> Node {
    let config = ServerConfig {
        backend: BackendKind::Memory,
        ..ServerConfig::default()
    };
    Node::with_oracle(config, Arc::new(ManualTso::new(1))).expect("open memory node")
}

// ============================================================================
// Benchmark: Codecs
// ============================================================================

fn bench_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("codec");
    group.sample_size(100);

    for key_len in [16usize, 64, 256] {
        let key = vec![b'k'; key_len];
        group.throughput(Throughput::Bytes(key_len as u64));
        group.bench_with_input(BenchmarkId::new("mvcc_key_roundtrip", key_len), &key, |b, key| {
            b.iter(|| {
                let encoded = encode_key(black_box(key), black_box(42));
                decode_key(&encoded).expect("decode")
            })
        });
    }

    let payload = vec![7u8; 128];
    group.bench_function("package_value", |b| {
        b.iter(|| {
            let packaged = package_value(ValueFlag::PutTtl, black_box(1_000), black_box(&payload));
            unpackage_value(&packaged).expect("unpackage")
        })
    });

    group.bench_function("revision_encode", |b| {
        b.iter(|| Revision::decode(&Revision::new(black_box(12345), black_box(3)).encode()).expect("decode"))
    });

    group.finish();
}

// ============================================================================
// Benchmark: Transactions
// ============================================================================

fn bench_txn(c: &mut Criterion) {
    let mut group = c.benchmark_group("txn");
    group.sample_size(50);
    group.measurement_time(Duration::from_secs(10));

    for keys_per_txn in [1usize, 10, 100] {
        let node = memory_node();
        let txn = node.txn();
        let mut start_ts = 0i64;

        group.throughput(Throughput::Elements(keys_per_txn as u64));
        group.bench_with_input(
            BenchmarkId::new("prewrite_commit", keys_per_txn),
            &keys_per_txn,
            |b, &n| {
                b.iter(|| {
                    start_ts += 2;
                    let keys: Vec<Vec<u8>> = (0..n).map(|i| format!("key{:05}", i).into_bytes()).collect();
                    let mutations = keys.iter().map(|k| Mutation::put(k.clone(), b"value".to_vec())).collect();
                    let req = PrewriteRequest::new(mutations, keys[0].clone(), start_ts, 3000);
                    txn.prewrite(&req).expect("prewrite");
                    txn.commit(&keys, start_ts, start_ts + 1).expect("commit");
                })
            },
        );
    }

    let node = memory_node();
    let txn = node.txn();
    let keys: Vec<Vec<u8>> = (0..100).map(|i| format!("read{:03}", i).into_bytes()).collect();
    let mutations = keys.iter().map(|k| Mutation::put(k.clone(), vec![1u8; 64])).collect();
    txn.prewrite(&PrewriteRequest::new(mutations, keys[0].clone(), 10, 3000))
        .expect("prewrite");
    txn.commit(&keys, 10, 11).expect("commit");

    group.throughput(Throughput::Elements(keys.len() as u64));
    group.bench_function("batch_get_100", |b| {
        b.iter(|| {
            txn.batch_get(IsolationLevel::SnapshotIsolation, black_box(20), &keys, &[])
                .expect("batch_get")
        })
    });

    group.finish();
}

// ============================================================================
// Benchmark: Index store
// ============================================================================

fn bench_index_store(c: &mut Criterion) {
    let mut group = c.benchmark_group("index_store");
    group.sample_size(100);

    let node = memory_node();
    let kv = node.kv();
    let mut counter = 0u64;
    group.bench_function("put", |b| {
        b.iter(|| {
            counter += 1;
            kv.kv_put(PutRequest::new(format!("/registry/pods/{}", counter % 1000), "spec"))
                .expect("put")
        })
    });

    group.bench_function("range_prefix", |b| {
        b.iter(|| {
            kv.kv_range(b"/registry/pods/", b"/registry/pods0", black_box(100), false, false)
                .expect("range")
        })
    });

    group.finish();
}

criterion_group!(benches, bench_codec, bench_txn, bench_index_store);
criterion_main!(benches);

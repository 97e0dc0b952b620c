//! Benchmark suite for document reads
//!
//! Covers the read paths of the store against the in-memory backend:
//! - Routing: resolve_many with and without redirects
//! - Fan-out: single-shard fast path vs parallel multi-shard reads
//! - Caching: memoized recent-documents listing
//!
//! Run: cargo bench --bench fanout

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use sharddb::memory::MemoryCluster;
use sharddb::{
    BlockFilter, Document, DocumentId, DocumentStore, IndirectionRecord, Router, ShardDescriptor,
    ShardId, StoreConfig,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn doc_id(shard: u32, n: u32) -> DocumentId {
    let mut bytes = [0u8; 12];
    bytes[..4].copy_from_slice(&shard.to_be_bytes());
    bytes[8..].copy_from_slice(&n.to_be_bytes());
    DocumentId::from_bytes(bytes)
}

/// `shards` shards with `per_shard` documents each.
fn create_cluster(shards: u32, per_shard: u32) -> MemoryCluster {
    let cluster = MemoryCluster::new();
    for s in 1..=shards {
        cluster.add_shard(ShardDescriptor::new(
            ShardId(s),
            ("replica", 20000 + s as u16),
            ("master", 30000 + s as u16),
        ));
        for n in 0..per_shard {
            cluster.insert_document(Document::new(doc_id(s, n), ShardId(s)).with_field("title", format!("doc {}", n)));
        }
    }
    cluster
}

/// `count` ids spread round-robin over `shards` shards.
fn spread_ids(shards: u32, count: u32) -> Vec<DocumentId> {
    (0..count).map(|i| doc_id(i % shards + 1, i / shards)).collect()
}

fn open(cluster: &MemoryCluster) -> DocumentStore {
    DocumentStore::open(StoreConfig::default(), cluster.catalog(), cluster.connector()).unwrap()
}

// ---------------------------------------------------------------------------
// Routing
// ---------------------------------------------------------------------------

fn bench_resolve_many(c: &mut Criterion) {
    let mut group = c.benchmark_group("resolve_many");

    for size in [10, 100, 1000] {
        let cluster = create_cluster(4, 250);
        let router = Router::new(cluster.catalog());
        let ids = spread_ids(4, size);

        group.bench_with_input(BenchmarkId::new("direct", size), &ids, |b, ids| {
            b.iter(|| router.resolve_many(black_box(ids)).unwrap());
        });

        let catalog = cluster.catalog();
        let aliases: Vec<DocumentId> = ids
            .iter()
            .enumerate()
            .map(|(i, target)| {
                let alias = doc_id(100, i as u32);
                catalog.add_indirection(IndirectionRecord::redirect(alias, ShardId(1), *target));
                alias
            })
            .collect();

        group.bench_with_input(BenchmarkId::new("redirected", size), &aliases, |b, ids| {
            b.iter(|| router.resolve_many(black_box(ids)).unwrap());
        });
    }

    group.finish();
}

// ---------------------------------------------------------------------------
// Fan-out
// ---------------------------------------------------------------------------

fn bench_get_documents(c: &mut Criterion) {
    let mut group = c.benchmark_group("get_documents");

    for shards in [1, 2, 4, 8] {
        let cluster = create_cluster(shards, 200);
        let store = open(&cluster);
        let ids = spread_ids(shards, 100);

        group.bench_with_input(BenchmarkId::from_parameter(shards), &ids, |b, ids| {
            b.iter(|| store.get_documents(black_box(ids), BlockFilter::Served).unwrap());
        });
    }

    group.finish();
}

fn bench_get_documents_known_shards(c: &mut Criterion) {
    let mut group = c.benchmark_group("get_documents_on");

    for shards in [1, 4] {
        let cluster = create_cluster(shards, 200);
        let store = open(&cluster);
        let pairs: Vec<(DocumentId, ShardId)> = (0..100)
            .map(|i| (doc_id(i % shards + 1, i / shards), ShardId(i % shards + 1)))
            .collect();

        group.bench_with_input(BenchmarkId::from_parameter(shards), &pairs, |b, pairs| {
            b.iter(|| store.get_documents_on(black_box(pairs), BlockFilter::Served).unwrap());
        });
    }

    group.finish();
}

// ---------------------------------------------------------------------------
// Caching
// ---------------------------------------------------------------------------

fn bench_recent_documents(c: &mut Criterion) {
    let cluster = create_cluster(2, 1000);
    let store = open(&cluster);

    c.bench_function("recent_documents_cached", |b| {
        b.iter(|| black_box(store.recent_documents().unwrap()));
    });
}

// ---------------------------------------------------------------------------
// Criterion group registration
// ---------------------------------------------------------------------------

criterion_group!(
    benches,
    bench_resolve_many,
    bench_get_documents,
    bench_get_documents_known_shards,
    bench_recent_documents,
);
criterion_main!(benches);

//! Recall benchmarks: fallback scoring against stores of increasing size.

use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use engram_core::{
    mock_embedding, EmbeddingClient, Memory, MemoryStore, RecallEngine, RecallQuery,
};
use tempfile::TempDir;

fn populated_engine(count: usize) -> (RecallEngine, TempDir) {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(MemoryStore::new(Some(dir.path().join("bench.db"))).unwrap());
    for i in 0..count {
        let text = format!("benchmark memory number {} about topic {}", i, i % 17);
        let mut memory = Memory::new("bench-agent", &text);
        memory.embedding = mock_embedding(&text);
        store.insert(memory).unwrap();
    }
    let embedder = Arc::new(EmbeddingClient::mock());
    (RecallEngine::new(store, embedder), dir)
}

fn bench_fallback_recall(c: &mut Criterion) {
    let mut group = c.benchmark_group("fallback_recall");
    for size in [100usize, 1_000] {
        let (engine, _dir) = populated_engine(size);
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            let mut query = RecallQuery::new("bench-agent", "benchmark memory about topic");
            query.limit = 10;
            b.iter(|| engine.recall(&query).unwrap());
        });
    }
    group.finish();
}

fn bench_mock_embedding(c: &mut Criterion) {
    c.bench_function("mock_embedding", |b| {
        b.iter(|| mock_embedding("a medium length sentence about benchmark embeddings"));
    });
}

criterion_group!(benches, bench_fallback_recall, bench_mock_embedding);
criterion_main!(benches);

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use serde_json::json;

use polystore::query::execute;
use polystore::storage::local::MemoryAdapter;
use polystore::{
    data_from, NewRecord, Record, SortField, StorageAdapter, StorageQuery, VectorSearch,
    VectorSearchOptions,
};

const RECORDS: usize = 2_000;

fn records() -> Vec<Record> {
    let now = Utc::now();
    (0..RECORDS)
        .map(|i| {
            NewRecord::new(
                "users",
                data_from(json!({
                    "name": format!("user-{i:05}"),
                    "age": i % 90,
                    "city": ["Oslo", "Lima", "Kyoto", "Accra"][i % 4],
                    "profile": {"score": (i * 37) % 1000},
                    "tags": [format!("t{}", i % 7), "all"],
                })),
            )
            .with_id(format!("u{i}"))
            .into_record(now)
            .unwrap()
        })
        .collect()
}

fn bench_reference_engine(c: &mut Criterion) {
    let records = records();
    let now = Utc::now();

    let mut group = c.benchmark_group("query_engine");
    group.throughput(Throughput::Elements(RECORDS as u64));

    let simple = StorageQuery::new("users").filter(json!({"age": {"$gte": 30}})).compile().unwrap();
    group.bench_function("filter_scan", |b| b.iter(|| execute(&records, &simple, now)));

    let compound = StorageQuery::new("users")
        .filter(json!({
            "city": {"$in": ["Oslo", "Kyoto"]},
            "profile.score": {"$gt": 500},
            "name": {"$regex": "^USER-0", "$options": "i"},
            "tags": {"$contains": "all"}
        }))
        .sort_by(SortField::desc("profile.score"))
        .sort_by(SortField::asc("name"))
        .limit(50)
        .compile()
        .unwrap();
    group.bench_function("compound_sorted_page", |b| b.iter(|| execute(&records, &compound, now)));

    group.bench_function("compile_filter", |b| {
        b.iter(|| {
            StorageQuery::new("users")
                .filter(json!({"age": {"$gte": 18, "$lt": 65}, "city": {"$ne": "Lima"}}))
                .compile()
                .unwrap()
        });
    });
    group.finish();
}

fn bench_adapters(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let memory = Arc::new(MemoryAdapter::new());
    #[cfg(feature = "sqlite")]
    let sqlite = Arc::new(polystore::storage::sqlite::SqliteAdapter::open(&polystore::SqliteOptions::default()).unwrap());

    rt.block_on(async {
        for record in records() {
            memory.create(NewRecord::mirror(&record)).await.unwrap();
            #[cfg(feature = "sqlite")]
            sqlite.create(NewRecord::mirror(&record)).await.unwrap();
        }
    });

    let query = StorageQuery::new("users")
        .filter(json!({"city": "Oslo", "age": {"$lt": 40}}))
        .sort_by(SortField::asc("name"))
        .limit(20);

    let mut group = c.benchmark_group("adapter_query");
    group.bench_function("memory", |b| {
        b.iter_custom(|iters| {
            let start = Instant::now();
            rt.block_on(async {
                for _ in 0..iters {
                    memory.query(&query).await.unwrap();
                }
            });
            start.elapsed()
        });
    });
    #[cfg(feature = "sqlite")]
    group.bench_function("sqlite", |b| {
        b.iter_custom(|iters| {
            let start = Instant::now();
            rt.block_on(async {
                for _ in 0..iters {
                    sqlite.query(&query).await.unwrap();
                }
            });
            start.elapsed()
        });
    });
    group.finish();
}

fn bench_vector_search(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let backend = Arc::new(MemoryAdapter::new());
    let search = VectorSearch::new(Arc::clone(&backend));
    rt.block_on(async {
        for i in 0..1_000u32 {
            let id = format!("d{i}");
            backend
                .create(NewRecord::new("docs", data_from(json!({"n": i}))).with_id(&id))
                .await
                .unwrap();
            let embedding: Vec<f32> = (0..64u32).map(|j| ((i * 31 + j * 17) % 97) as f32 / 97.0).collect();
            search.store_embedding("docs", &id, embedding, None).await.unwrap();
        }
    });
    let options = VectorSearchOptions::vector("docs", vec![0.5; 64]).k(10);

    c.bench_function("vector_search/top10_of_1000x64", |b| {
        b.iter_custom(|iters| {
            let start = Instant::now();
            rt.block_on(async {
                for _ in 0..iters {
                    search.vector_search(&options).await.unwrap();
                }
            });
            start.elapsed()
        });
    });
}

criterion_group!(benches, bench_reference_engine, bench_adapters, bench_vector_search);
criterion_main!(benches);

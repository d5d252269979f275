use criterion::{Criterion, criterion_group, criterion_main};
use document_store::{DocumentStore, InMemoryDocumentStore, NativeOp, OrderBy, Query, WriteOp};
use serde_json::json;

async fn seeded_store(count: usize) -> InMemoryDocumentStore {
    let store = InMemoryDocumentStore::new();
    for i in 0..count {
        let status = if i % 3 == 0 { "FAILED" } else { "PROCESSED" };
        let fields = json!({"status": status, "size": i})
            .as_object()
            .cloned()
            .unwrap();
        store.create("images", &i.to_string(), fields).await.unwrap();
    }
    store
}

fn bench_filtered_sorted_query(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let store = rt.block_on(seeded_store(1_000));
    let query = Query::collection("images")
        .filter("status", NativeOp::Equal, json!("FAILED"))
        .order_by(OrderBy::desc("size"))
        .limit(20);

    c.bench_function("document_store/filtered_sorted_query_1000", |b| {
        b.iter(|| {
            rt.block_on(async {
                store.query(&query).await.unwrap();
            });
        });
    });
}

fn bench_count(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let store = rt.block_on(seeded_store(1_000));
    let query = Query::collection("images").filter("status", NativeOp::Equal, json!("FAILED"));

    c.bench_function("document_store/count_1000", |b| {
        b.iter(|| {
            rt.block_on(async {
                store.count(&query).await.unwrap();
            });
        });
    });
}

fn bench_transaction_batch_100(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("document_store/transaction_batch_100", |b| {
        b.iter(|| {
            rt.block_on(async {
                let store = seeded_store(100).await;
                let mut tx = store.begin().await.unwrap();
                for i in 0..100 {
                    tx.apply(WriteOp::delete("images", i.to_string()))
                        .await
                        .unwrap();
                }
                tx.commit().await.unwrap();
            });
        });
    });
}

criterion_group!(
    benches,
    bench_filtered_sorted_query,
    bench_count,
    bench_transaction_batch_100
);
criterion_main!(benches);

use std::sync::Arc;

use async_trait::async_trait;
use criterion::{Criterion, criterion_group, criterion_main};
use event_pipeline::{
    Attributes, BaseEventHandler, BoxError, EVENT_TYPE_ATTRIBUTE, EventHandler, EventRegistry,
    InMemoryTelemetry, Message, RetryConfig,
};

struct Noop;

#[async_trait]
impl EventHandler for Noop {
    fn name(&self) -> &str {
        "noop"
    }

    async fn handle(&self, _message: &Message) -> event_pipeline::Result<()> {
        Ok(())
    }
}

fn bench_handle_with_retry_success(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let handler = BaseEventHandler::new(
        "bench",
        "images.uploaded",
        "images.uploaded.bench",
        RetryConfig::default(),
        Arc::new(InMemoryTelemetry::new()),
    );
    let message = Message::new(br#"{"imageId":"img-1"}"#.to_vec(), Attributes::new());

    c.bench_function("pipeline/handle_with_retry_success", |b| {
        b.iter(|| {
            rt.block_on(async {
                handler
                    .handle_with_retry(&message, || async { Ok::<_, BoxError>(()) })
                    .await
                    .unwrap();
            });
        });
    });
}

fn bench_registry_fan_out(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let registry = EventRegistry::new();
    rt.block_on(async {
        for _ in 0..4 {
            registry.register("ImageUploaded", Arc::new(Noop)).await;
        }
    });
    let message = Message::new(vec![], Attributes::new())
        .with_attribute(EVENT_TYPE_ATTRIBUTE, "ImageUploaded");

    c.bench_function("pipeline/registry_fan_out_4", |b| {
        b.iter(|| {
            rt.block_on(async {
                registry.dispatch(&message).await.unwrap();
            });
        });
    });
}

fn bench_backoff(c: &mut Criterion) {
    let config = RetryConfig::default();
    c.bench_function("pipeline/backoff_0_to_10", |b| {
        b.iter(|| (0..10).map(|attempt| config.backoff(attempt)).max());
    });
}

criterion_group!(
    benches,
    bench_handle_with_retry_success,
    bench_registry_fan_out,
    bench_backoff
);
criterion_main!(benches);

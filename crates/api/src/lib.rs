//! HTTP API server for the image service.
//!
//! Hosts the REST endpoints and the event pipeline that drives images
//! through upload and processing, with structured logging (tracing) and
//! Prometheus metrics.

pub mod auth;
pub mod config;
pub mod error;
pub mod routes;

use std::sync::Arc;

use axum::Router;
use axum::middleware;
use axum::routing::{delete, get, post};
use document_store::DocumentStore;
use event_pipeline::{
    BrokerTelemetry, EventPublisher, EventRegistry, InMemoryBroker, Orchestrator, PipelineError,
};
use imaging::{
    HandlerContext, ImageService, InMemoryBatchJobRunner, InMemoryObjectStorage, SUBSCRIPTIONS,
    image_repository, register_handlers, topic_table,
};
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use config::Config;

/// Shared application state accessible from all handlers.
pub struct AppState {
    pub images: ImageService,
    pub orchestrator: Arc<Orchestrator>,
    pub metrics_handle: PrometheusHandle,
    /// Expected `x-api-key` value; `None` disables the check.
    pub api_key: Option<String>,
}

/// Everything the server runs: handler state plus the broker and the
/// collaborators the handlers call.
pub struct Services {
    pub state: Arc<AppState>,
    pub orchestrator: Arc<Orchestrator>,
    pub broker: InMemoryBroker,
    pub storage: InMemoryObjectStorage,
    pub jobs: InMemoryBatchJobRunner,
}

/// Wires the image service and its event pipeline over `store`.
///
/// Subscriptions are declared on the broker but not started; call
/// [`Orchestrator::start`] once the server is ready.
pub async fn create_services(
    config: &Config,
    store: Arc<dyn DocumentStore>,
    metrics_handle: PrometheusHandle,
) -> Result<Services, PipelineError> {
    config.retry.validate()?;

    let broker = InMemoryBroker::with_settings(config.broker_settings());
    for (topic, subscription) in SUBSCRIPTIONS {
        broker.subscribe(topic, subscription).await?;
    }

    let storage = InMemoryObjectStorage::new();
    let jobs = InMemoryBatchJobRunner::new();
    let publisher = EventPublisher::new(Arc::new(broker.clone()), topic_table());

    let registry = EventRegistry::new();
    register_handlers(
        &registry,
        HandlerContext {
            images: image_repository(Arc::clone(&store)),
            storage: Arc::new(storage.clone()),
            jobs: Arc::new(jobs.clone()),
            publisher: publisher.clone(),
            job_selector: config.batch_job_selector.clone(),
        },
        config.retry,
        Arc::new(BrokerTelemetry::new(Arc::new(broker.clone()))),
    )
    .await;

    let orchestrator = Arc::new(
        Orchestrator::new(
            Arc::new(broker.clone()),
            Arc::new(registry),
            SUBSCRIPTIONS.map(|(_, subscription)| subscription),
        )
        .with_shutdown_timeout(config.shutdown_timeout),
    );

    let state = Arc::new(AppState {
        images: ImageService::new(store, Arc::new(storage.clone()), publisher),
        orchestrator: Arc::clone(&orchestrator),
        metrics_handle,
        api_key: config.api_key.clone(),
    });

    Ok(Services {
        state,
        orchestrator,
        broker,
        storage,
        jobs,
    })
}

/// Creates the Axum application router with all routes and shared state.
pub fn create_app(state: Arc<AppState>) -> Router {
    let protected = Router::new()
        .route(
            "/images",
            get(routes::images::list).post(routes::images::register),
        )
        .route("/images/{id}", get(routes::images::get))
        .route("/images/{id}/process", post(routes::images::process))
        .route("/albums", post(routes::albums::create))
        .route("/albums/{id}", delete(routes::albums::delete))
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            auth::require_api_key,
        ));

    Router::new()
        .route("/health", get(routes::system::health))
        .route("/metrics", get(routes::system::metrics))
        .merge(protected)
        .with_state(state)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}

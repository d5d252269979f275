//! API server entry point.

use std::sync::Arc;

use api::config::{Config, LogFormat};
use document_store::{DocumentStore, InMemoryDocumentStore, PostgresDocumentStore};
use sqlx::postgres::PgPoolOptions;
use tokio::signal;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("received SIGINT, starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("received SIGTERM, starting graceful shutdown");
        }
    }
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match config.log_format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

async fn open_store(config: &Config) -> Result<Arc<dyn DocumentStore>, Box<dyn std::error::Error>> {
    let Some(url) = config.database_url.as_deref() else {
        tracing::warn!("DATABASE_URL not set, documents are kept in memory");
        return Ok(Arc::new(InMemoryDocumentStore::new()));
    };

    let pool = PgPoolOptions::new().max_connections(10).connect(url).await?;
    let store = PostgresDocumentStore::new(pool);
    store.run_migrations().await?;
    tracing::info!("connected to PostgreSQL document store");
    Ok(Arc::new(store))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::from_env();
    init_tracing(&config);

    let metrics_handle = metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder()?;

    let store = open_store(&config).await?;
    let services = api::create_services(&config, store, metrics_handle).await?;
    services.orchestrator.start().await?;

    let app = api::create_app(Arc::clone(&services.state));

    let addr = config.addr();
    tracing::info!(%addr, "starting API server");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    services.orchestrator.stop().await?;
    tracing::info!("server shut down gracefully");
    Ok(())
}

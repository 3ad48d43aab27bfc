use anyhow::Result;
use axum::{routing::get, Router};
use docshield_gateway::observability::{init_logging, init_metrics, metrics_handler};
use docshield_gateway::{routes, DataLayer};
use docshield_storage::MemoryDocumentStore;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;

mod config;

#[tokio::main]
async fn main() -> Result<()> {
    let settings = config::Settings::load()?;

    init_logging(settings.log.clone()).map_err(|e| anyhow::anyhow!(e))?;
    tracing::info!("Starting docshield");

    init_metrics()?;

    let store = Arc::new(MemoryDocumentStore::new());
    let layer = Arc::new(DataLayer::new(store, settings.data_layer()).await?);
    tracing::info!("Data layer ready");

    if settings.server.snapshot_interval_secs > 0 {
        tokio::spawn(log_snapshots(
            layer.clone(),
            Duration::from_secs(settings.server.snapshot_interval_secs),
        ));
    }

    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .merge(routes(layer))
        .layer(TraceLayer::new_for_http());

    let addr = SocketAddr::from(([0, 0, 0, 0], settings.server.port));
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server stopped");
    Ok(())
}

async fn log_snapshots(layer: Arc<DataLayer>, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let snapshot = layer.snapshot().await;
        let open_breakers = snapshot
            .circuit_breakers
            .iter()
            .filter(|b| b.state != docshield_gateway::resilience::CircuitState::Closed)
            .count();

        tracing::info!(
            cache_entries = snapshot.cache.total_entries,
            cache_hit_rate = snapshot.cache.hit_rate,
            operations = snapshot.performance.total_operations,
            avg_duration_ms = snapshot.performance.average_duration_ms,
            error_rate = snapshot.performance.error_rate,
            tracked_errors = snapshot.errors.total_errors,
            open_breakers,
            "Monitoring snapshot"
        );
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}

use std::sync::Arc;
use std::time::Duration;
use switchboard_integration::JobHandler;
use switchboard_server::{config::ServerConfig, router, state};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration from environment
    let config = ServerConfig::from_env().expect("failed to load configuration");
    tracing::info!("Loaded configuration");

    let runtime = state::build(&config)
        .await
        .expect("failed to initialize switchboard");

    // Spawn periodic deduplicator pruning
    let prune_state = runtime.state.clone();
    let retention = Duration::from_secs(config.dispatch.dedup_retention_seconds);
    let prune_interval = Duration::from_secs(config.dispatch.dedup_prune_interval_seconds);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(prune_interval);
        loop {
            interval.tick().await;
            let removed = prune_state.dispatcher.dedup().prune(retention);
            if removed > 0 {
                tracing::debug!(removed, "Pruned seen event ids");
            }
        }
    });

    // Spawn the deferred-turn worker
    if let Some(queue) = runtime.queue.clone().filter(|_| config.dispatch.worker_enabled) {
        let handler: Arc<dyn JobHandler> = runtime.state.dispatcher.clone();
        tokio::spawn(async move {
            loop {
                if let Err(report) = queue.run_worker(handler.clone()).await {
                    tracing::warn!(error = %report, "Job worker stopped, restarting");
                }
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
        });
    }

    let app = router(runtime.state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("failed to bind to address");

    tracing::info!("listening on http://{}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down");
}

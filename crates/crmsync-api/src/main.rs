mod auth;
mod config;
mod error;
mod routes;

use std::sync::Arc;

use config::ApiConfig;
use crmsync_core::services::{SyncService, SyncStore};
use crmsync_core::sync::Scheduler;
use routes::{app_router, AppState};
use tokio::sync::watch;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Only load .env in development; production uses platform-native env injection.
    #[cfg(debug_assertions)]
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("crmsync_api=info".parse()?)
                .add_directive("crmsync_core=info".parse()?),
        )
        .init();

    let config = Arc::new(ApiConfig::from_env()?);
    tracing::info!("Starting crmsync-api with config: {:?}", config);

    let store = SyncStore::open_path(config.engine.database_path.clone()).await?;
    let service = SyncService::from_config(&config.engine, store)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler = if config.run_scheduler {
        let scheduler = Scheduler::new(service.clone(), config.engine.clone());
        Some(tokio::spawn(async move {
            scheduler.run_forever(shutdown_rx).await;
        }))
    } else {
        tracing::info!("Scheduler disabled; recurring jobs must run elsewhere");
        None
    };

    let bind_addr = config.bind_addr.clone();
    let router = app_router(AppState { config, service });

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!("crmsync-api listening on {}", bind_addr);
    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            if let Err(error) = tokio::signal::ctrl_c().await {
                tracing::error!(%error, "Failed to listen for shutdown signal");
            }
            tracing::info!("Shutdown requested");
        })
        .await?;

    let _ = shutdown_tx.send(true);
    if let Some(handle) = scheduler {
        handle.await?;
    }
    Ok(())
}

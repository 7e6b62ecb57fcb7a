//! Flare relay server: a connection registry, a broadcast hub that fans chat
//! messages and distress alerts out to every live connection, and the
//! websocket sessions that feed it.

pub mod auth;
pub mod config;
pub mod error;
pub mod hub;
pub mod registry;
pub mod routes;
pub mod session;
pub mod state;
pub mod store;
pub mod telemetry;
pub mod ws;

use std::{net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::{net::TcpListener, signal};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::{
    config::ServerConfig,
    hub::HubWorker,
    state::AppState,
    store::{AccountStore, MemoryStore, MessageStore, RedisStore, DEFAULT_NAMESPACE},
};

pub use crate::routes::build_router;

pub async fn run(config: ServerConfig, metrics: Option<PrometheusHandle>) -> Result<()> {
    let (messages, accounts) = open_stores(&config).await?;
    let shutdown = CancellationToken::new();
    let (state, worker) = AppState::new(messages, accounts, config.relay, shutdown.clone());
    let state = Arc::new(state.with_metrics(metrics));

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listener")?;
    info!("flare listening on {}", listener.local_addr()?);

    let on_signal = shutdown.clone();
    tokio::spawn(async move {
        let _ = signal::ctrl_c().await;
        info!("shutdown signal received");
        on_signal.cancel();
    });

    serve(listener, state, worker, shutdown).await?;

    info!(
        grace_seconds = config.shutdown_grace.as_secs(),
        "listener closed; sleeping for graceful period"
    );
    tokio::time::sleep(config.shutdown_grace).await;
    info!("graceful shutdown complete");
    Ok(())
}

/// Serves the relay on `listener` until `shutdown` is cancelled. Cancelling
/// also stops the hub worker and closes every open connection.
pub async fn serve(
    listener: TcpListener,
    state: Arc<AppState>,
    worker: HubWorker,
    shutdown: CancellationToken,
) -> Result<()> {
    let hub_task = worker.spawn(shutdown.clone());
    let router = build_router(state);

    let stop = shutdown.clone();
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { stop.cancelled().await })
    .await
    .context("server shutdown with error")?;

    shutdown.cancel();
    hub_task.await.context("hub worker panicked")?;
    Ok(())
}

async fn open_stores(
    config: &ServerConfig,
) -> Result<(Arc<dyn MessageStore>, Arc<dyn AccountStore>)> {
    if config.ephemeral {
        info!("using in-memory store; history and accounts are not persisted");
        let store = Arc::new(MemoryStore::new());
        return Ok((store.clone() as Arc<dyn MessageStore>, store as Arc<dyn AccountStore>));
    }

    let store = Arc::new(
        RedisStore::connect(&config.redis_url, DEFAULT_NAMESPACE)
            .await
            .context("failed to connect to redis")?,
    );
    Ok((store.clone() as Arc<dyn MessageStore>, store as Arc<dyn AccountStore>))
}

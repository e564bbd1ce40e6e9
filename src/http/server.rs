use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{Router, routing::get};
use tower_http::cors::CorsLayer;

use crate::auth::{AllowAll, HttpPermissionOracle, LocalAuth, PermissionOracle};
use crate::bus::MemoryBus;
use crate::config::Settings;
use crate::control::CancelController;
use crate::db::{DbHandle, TaskDb};
use crate::mediator::IoMediator;
use crate::reaper::Reaper;
use crate::scheduler::TaskScheduler;
use crate::storage::LocalStorage;

use super::api::{self, AppState, SharedState};
use super::ws;

/// Interval between reconciler passes when it runs in-process.
const REAPER_INTERVAL: Duration = Duration::from_secs(300);

/// Wire up every component from settings. Fails when the persistence or
/// storage backends cannot be reached.
pub async fn bootstrap(settings: Settings) -> Result<SharedState> {
    settings.ensure_directories()?;

    let db = TaskDb::new(&settings.db_path).context("Failed to open task database")?;
    let db = DbHandle::new(db);
    let bus = Arc::new(MemoryBus::new(settings.max_stream_size));
    let storage = Arc::new(
        LocalStorage::new(&settings.storage_root).context("Failed to initialize storage")?,
    );
    let mediator = IoMediator::new(db.clone(), bus.clone(), settings.socket_dir.clone());

    let oracle: Arc<dyn PermissionOracle> = match (
        settings.permission_verify_url.clone(),
        settings.permission_secret.clone(),
    ) {
        (Some(url), Some(secret)) => Arc::new(HttpPermissionOracle::new(url, secret)),
        _ => Arc::new(AllowAll),
    };

    let auth = LocalAuth::new(db.clone());
    auth.seed_client(&settings.local_client_id, &settings.local_client_secret)
        .await
        .context("Failed to seed local client")?;

    let scheduler = TaskScheduler::new(
        settings.clone(),
        db.clone(),
        bus.clone(),
        storage.clone(),
        mediator.clone(),
        oracle,
    );
    let controller = CancelController::new(db.clone(), bus.clone());

    Ok(Arc::new(AppState {
        settings,
        db,
        bus,
        storage,
        mediator,
        scheduler,
        controller,
        auth: Arc::new(auth),
    }))
}

/// Build the full application router: task API plus the per-task
/// WebSocket gateway.
pub fn build_router(state: SharedState) -> Router {
    let mut router = api::api_router()
        .route(ws::ws_path(), get(ws::ws_handler))
        .with_state(state.clone());

    if !state.settings.trusted_origins.is_empty() {
        let origins: Vec<axum::http::HeaderValue> = state
            .settings
            .trusted_origins
            .iter()
            .filter_map(|origin| origin.parse().ok())
            .collect();
        router = router.layer(
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        );
    }
    router
}

/// Start the HTTP+WS endpoint with `workers` in-process workers and the
/// periodic reconciler. Returns after a clean shutdown.
pub async fn start_server(state: SharedState, workers: usize) -> Result<()> {
    let worker_handles = state.scheduler.spawn_workers(workers);
    tracing::info!(workers, "Worker set started");

    let reaper = Reaper::new(
        state.db.clone(),
        state.bus.clone(),
        state.storage.clone(),
        state.settings.task_retention_days,
        state.settings.max_stream_size,
    );
    let reaper_handle = tokio::spawn(async move { reaper.run_periodic(REAPER_INTERVAL).await });

    let addr = state.settings.listen_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    let local_addr = listener.local_addr()?;
    tracing::info!(addr = %local_addr, "flow-runner listening");

    let app = build_router(state.clone());
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    reaper_handle.abort();
    state.scheduler.shutdown().await;
    for handle in worker_handles {
        let _ = handle.await;
    }
    tracing::info!("Shut down cleanly");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install Ctrl+C handler");
    tracing::info!("Shutdown signal received");
}

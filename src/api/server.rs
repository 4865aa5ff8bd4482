use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Router,
    http::{HeaderName, HeaderValue, Method, header},
    middleware,
    routing::{get, post},
};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::decompression::RequestDecompressionLayer;
use tracing::{info, warn};

use super::{
    auth::{API_KEY_HEADER, require_api_key},
    services::{
        cancel_task, create_task, get_task, get_worker, health, heartbeat, list_tasks,
        list_workers, register_worker, remove_worker, status, update_task,
    },
    state::AppState,
};
use crate::agent::{HttpAgent, HttpAgentConfig};
use crate::config::{Config, CorsConfig};
use crate::dispatcher::Dispatcher;
use crate::observability::Metrics;
use crate::storage;
use crate::supervisor::{Supervisor, SupervisorSettings};

type AnyError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Full route table; everything but `/health` sits behind the API-key filter
pub fn router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/status", get(status))
        .route("/api/status", get(status))
        .route("/tasks", get(list_tasks).post(create_task))
        .route(
            "/tasks/{task_id}",
            get(get_task).put(update_task).delete(cancel_task),
        )
        .route("/workers", get(list_workers).post(register_worker))
        .route("/workers/{worker_id}", get(get_worker).delete(remove_worker))
        .route("/workers/{worker_id}/heartbeat", post(heartbeat))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_api_key));

    let cors = cors_layer(&state.config.cors);

    Router::new()
        .route("/health", get(health))
        .merge(protected)
        .with_state(state)
        // Handles Content-Encoding: gzip transparently
        .layer(RequestDecompressionLayer::new())
        .layer(cors)
}

fn cors_layer(config: &CorsConfig) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers([header::CONTENT_TYPE, HeaderName::from_static(API_KEY_HEADER)]);

    if config.allowed_origins.iter().any(|origin| origin == "*") {
        return layer.allow_origin(AllowOrigin::any());
    }

    let origins: Vec<HeaderValue> = config
        .allowed_origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(%origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    layer.allow_origin(origins)
}

pub async fn run(config: Config, address: Option<SocketAddr>) -> Result<(), AnyError> {
    let address = address.unwrap_or(config.server.bind_addr);

    if config.security.is_misconfigured() {
        warn!("security.api_key_required is set but no API keys are configured; all requests will be admitted");
    }

    let backend = storage::open(&config.storage)
        .map_err(|e| format!("Failed to open storage backend: {}", e))?;

    let agent = HttpAgent::new(HttpAgentConfig::with_timeout(
        config.workers.rpc_timeout.as_duration(),
    ))
    .map_err(|e| format!("Failed to build worker agent: {}", e))?;

    let dispatcher = Arc::new(Dispatcher::new(
        &config,
        backend.clone(),
        Arc::new(agent),
        Arc::new(Metrics::new()),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let supervisor =
        Supervisor::new(dispatcher.clone(), SupervisorSettings::from(&config)).spawn(shutdown_rx);

    let state = AppState::new(Arc::new(config), dispatcher);
    let app = router(state);

    let listener = TcpListener::bind(address).await?;
    info!(%address, "Dispatcher API listening");

    let served = axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await;

    let _ = shutdown_tx.send(true);
    if let Err(e) = supervisor.await {
        warn!(error = %e, "Supervisor task ended abnormally");
    }

    backend
        .flush()
        .await
        .map_err(|e| format!("Failed to flush storage backend: {}", e))?;
    info!("Storage flushed, shutdown complete");

    served?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm = signal(SignalKind::terminate())
            .expect("failed to install signal handler");
        sigterm.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}

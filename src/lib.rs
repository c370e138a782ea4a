//! Handoff server - hands agent deliveries to a human reviewer and collects feedback

pub mod config;
pub mod error;
pub mod hub;
pub mod ids;
pub mod lifecycle;
pub mod metadata;
pub mod models;
pub mod repository;
pub mod routes;
pub mod sessions;
pub mod store;
pub mod websocket;

use axum::Router;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::ServerConfig;
use crate::hub::BroadcastHub;
use crate::repository::DeliveryRepository;
use crate::sessions::AgentSessions;
use crate::store::{LockManager, RecordStore};

/// Application state shared across handlers
pub struct AppState {
    pub config: ServerConfig,
    pub hub: Arc<BroadcastHub>,
    pub repo: Arc<DeliveryRepository>,
    pub sessions: AgentSessions,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(config: ServerConfig) -> Arc<Self> {
        let hub = Arc::new(BroadcastHub::new());
        let store = RecordStore::new(LockManager::new(
            config.lock_timeout(),
            Duration::from_millis(50),
        ));
        let repo = Arc::new(DeliveryRepository::new(
            config.data_dir.clone(),
            store,
            hub.clone(),
            config.project_name(),
        ));
        let sessions = AgentSessions::new(repo.clone());

        Arc::new(Self {
            config,
            hub,
            repo,
            sessions,
            started_at: Instant::now(),
        })
    }
}

/// Build the full router
pub fn app(state: Arc<AppState>) -> Router {
    routes::router()
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

/// Serve on an already-bound listener until `shutdown` resolves
pub async fn serve<F>(listener: TcpListener, state: Arc<AppState>, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    tracing::info!(
        data_dir = %state.config.data_dir.display(),
        "Server listening on {}",
        listener.local_addr()?
    );
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown)
        .await
}

//! HTTP routes

mod agent;
mod deliveries;
mod records;

use axum::body::Bytes;
use axum::extract::State;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;

use crate::error::{AppError, Result};
use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(health))
        .route(
            "/api/deliveries",
            get(deliveries::list).post(deliveries::create),
        )
        .route("/api/deliveries/:id", get(deliveries::detail))
        .route("/api/deliveries/:id/content", put(deliveries::update_content))
        .route("/api/deliveries/:id/feedback", get(deliveries::feedback))
        .route("/api/deliveries/:id/feedback/draft", post(deliveries::draft))
        .route("/api/deliveries/:id/feedback/commit", post(deliveries::commit))
        .route("/api/deliveries/:id/feedback/resolve", post(deliveries::resolve))
        .route("/api/deliveries/:id/feedback/revoke", post(deliveries::revoke))
        .route("/api/deliveries/:id/annotate", post(deliveries::annotate))
        .route(
            "/api/deliveries/:id/execution-events",
            get(deliveries::execution_events).post(deliveries::append_execution_events),
        )
        .route("/api/agent-sessions/upsert", post(agent::upsert))
        .route("/api/agent-sessions/:sid/heartbeat", post(agent::heartbeat))
        .route("/api/agent-sessions/:sid/active", get(agent::active))
        .route("/api/agent-sessions/:sid/cancel", post(agent::cancel))
        .route(
            "/api/settings",
            get(records::get_settings).put(records::put_settings),
        )
        .route(
            "/api/design",
            get(records::get_design).put(records::put_design),
        )
        .route("/ws", get(crate::websocket::handler))
}

#[derive(Debug, Serialize)]
struct Health {
    status: &'static str,
    uptime: f64,
    version: &'static str,
}

async fn health(State(state): State<Arc<AppState>>) -> Json<Health> {
    Json(Health {
        status: "ok",
        uptime: state.started_at.elapsed().as_secs_f64(),
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Parse a JSON body that may be omitted entirely
fn optional_json<T: DeserializeOwned>(body: &Bytes) -> Result<Option<T>> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    serde_json::from_slice(body)
        .map(Some)
        .map_err(|e| AppError::validation("invalid_body", e.to_string()))
}

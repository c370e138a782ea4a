use axum::body::Bytes;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::error::Result;
use crate::sessions::UpsertRequest;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct HeartbeatBody {
    delivery_id: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct CancelBody {
    #[serde(default)]
    delivery_id: Option<String>,
    #[serde(default)]
    reason: Option<String>,
}

pub async fn upsert(
    State(state): State<Arc<AppState>>,
    payload: std::result::Result<Json<UpsertRequest>, JsonRejection>,
) -> Result<Json<Value>> {
    let Json(request) = payload?;
    let outcome = state.sessions.upsert(request).await?;
    Ok(Json(json!({
        "id": outcome.id,
        "url": state.config.delivery_url(&outcome.id),
        "replaced": outcome.replaced,
    })))
}

pub async fn heartbeat(
    State(state): State<Arc<AppState>>,
    Path(sid): Path<String>,
    payload: std::result::Result<Json<HeartbeatBody>, JsonRejection>,
) -> Result<Json<Value>> {
    let Json(body) = payload?;
    let active = state.sessions.heartbeat(&sid, &body.delivery_id).await?;
    Ok(Json(json!({ "active": active })))
}

pub async fn active(
    State(state): State<Arc<AppState>>,
    Path(sid): Path<String>,
) -> Result<Json<Value>> {
    let active = state.sessions.active(&sid).await?;
    Ok(Json(json!({ "active": active })))
}

pub async fn cancel(
    State(state): State<Arc<AppState>>,
    Path(sid): Path<String>,
    body: Bytes,
) -> Result<Json<Value>> {
    let body: CancelBody = super::optional_json(&body)?.unwrap_or_default();
    let reason = body.reason.as_deref().unwrap_or("canceled");
    let canceled = state
        .sessions
        .cancel(&sid, body.delivery_id.as_deref(), reason)
        .await?;
    Ok(Json(json!({ "canceled": canceled })))
}

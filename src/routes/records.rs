//! Opaque settings and design records

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::Json;
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::sync::Arc;

use crate::error::{AppError, Result};
use crate::hub::EventKind;
use crate::AppState;

async fn read(state: &AppState, name: &str) -> Result<Json<Value>> {
    let record: Option<Map<String, Value>> =
        state.repo.store().read_object(record_path(state, name)).await?;
    Ok(Json(Value::Object(record.unwrap_or_default())))
}

async fn replace(
    state: &AppState,
    name: &str,
    event: EventKind,
    payload: std::result::Result<Json<Value>, JsonRejection>,
) -> Result<Json<Value>> {
    let Json(value) = payload?;
    if !value.is_object() {
        return Err(AppError::validation(
            "invalid_body",
            format!("{} must be a JSON object", name),
        ));
    }

    state.repo.store().write(record_path(state, name), &value).await?;
    tracing::info!(record = name, "Record replaced");
    state.hub.emit(event, &value);
    Ok(Json(value))
}

fn record_path(state: &AppState, name: &str) -> PathBuf {
    state.repo.data_dir().join(format!("{}.json", name))
}

pub async fn get_settings(State(state): State<Arc<AppState>>) -> Result<Json<Value>> {
    read(&state, "settings").await
}

pub async fn put_settings(
    State(state): State<Arc<AppState>>,
    payload: std::result::Result<Json<Value>, JsonRejection>,
) -> Result<Json<Value>> {
    replace(&state, "settings", EventKind::SettingsUpdated, payload).await
}

pub async fn get_design(State(state): State<Arc<AppState>>) -> Result<Json<Value>> {
    read(&state, "design").await
}

pub async fn put_design(
    State(state): State<Arc<AppState>>,
    payload: std::result::Result<Json<Value>, JsonRejection>,
) -> Result<Json<Value>> {
    replace(&state, "design", EventKind::DesignUpdated, payload).await
}

use axum::body::Bytes;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::error::Result;
use crate::models::{
    CreateDeliveryRequest, DeliveryContent, DeliveryDetail, DeliveryMode, DeliveryStatus,
    ExecutionEventInput, FeedbackInput, IndexEntry, ListFilter, Page,
};
use crate::repository::NewDelivery;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    status: Option<DeliveryStatus>,
    mode: Option<DeliveryMode>,
    limit: Option<usize>,
    offset: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct FeedbackQuery {
    handled: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct ItemsBody {
    #[serde(default)]
    items: Vec<FeedbackInput>,
}

#[derive(Debug, Deserialize)]
pub struct ResolveBody {
    #[serde(alias = "ids")]
    feedback_ids: Vec<String>,
    #[serde(default)]
    handled_by: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RevokeBody {
    #[serde(alias = "ids")]
    feedback_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct ContentBody {
    content: Value,
    #[serde(default)]
    title: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct EventsBody {
    events: Vec<ExecutionEventInput>,
}

pub async fn create(
    State(state): State<Arc<AppState>>,
    payload: std::result::Result<Json<CreateDeliveryRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Value>)> {
    let Json(request) = payload?;
    let content = DeliveryContent::try_from(request.content)?;

    let delivery = state
        .repo
        .create(NewDelivery {
            mode: request.mode.unwrap_or_default(),
            title: request.title,
            content,
            metadata: request.metadata,
            agent_session_id: None,
            thread_id: None,
        })
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "id": delivery.id,
            "url": state.config.delivery_url(&delivery.id),
        })),
    ))
}

pub async fn list(
    State(state): State<Arc<AppState>>,
    query: std::result::Result<Query<ListQuery>, QueryRejection>,
) -> Result<Json<Page<IndexEntry>>> {
    let Query(query) = query?;
    let filter = ListFilter {
        status: query.status,
        mode: query.mode,
    };
    let page = state.repo.list(&filter, query.limit, query.offset).await?;
    Ok(Json(page))
}

pub async fn detail(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<DeliveryDetail>> {
    Ok(Json(state.repo.detail(&id).await?))
}

pub async fn update_content(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    payload: std::result::Result<Json<ContentBody>, JsonRejection>,
) -> Result<Json<Value>> {
    let Json(body) = payload?;
    let content = DeliveryContent::try_from(body.content)?;
    let delivery = state.repo.update_content(&id, content, body.title).await?;
    Ok(Json(json!({ "delivery": delivery })))
}

pub async fn feedback(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    query: std::result::Result<Query<FeedbackQuery>, QueryRejection>,
) -> Result<Json<Value>> {
    let Query(query) = query?;
    let mut feedback = state.repo.feedback(&id).await?;
    if let Some(handled) = query.handled {
        feedback.retain(|item| item.handled == handled);
    }
    Ok(Json(json!({ "feedback": feedback })))
}

pub async fn draft(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    payload: std::result::Result<Json<ItemsBody>, JsonRejection>,
) -> Result<Json<Value>> {
    let Json(body) = payload?;
    let drafts = state.repo.save_drafts(&id, body.items).await?;
    Ok(Json(json!({ "drafts": drafts })))
}

pub async fn annotate(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    payload: std::result::Result<Json<ItemsBody>, JsonRejection>,
) -> Result<Json<Value>> {
    let Json(body) = payload?;
    let drafts = state.repo.annotate(&id, body.items).await?;
    Ok(Json(json!({ "drafts": drafts })))
}

pub async fn commit(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<Value>> {
    // No items commits the stored drafts
    let items = super::optional_json::<ItemsBody>(&body)?
        .map(|body| body.items)
        .unwrap_or_default();
    let feedback_ids = state.repo.commit_feedback(&id, items).await?;
    Ok(Json(json!({ "feedback_ids": feedback_ids })))
}

pub async fn resolve(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    payload: std::result::Result<Json<ResolveBody>, JsonRejection>,
) -> Result<Json<Value>> {
    let Json(body) = payload?;
    let resolved = state
        .repo
        .resolve_feedback(&id, &body.feedback_ids, body.handled_by.as_deref())
        .await?;
    Ok(Json(json!({ "resolved": resolved })))
}

pub async fn revoke(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    payload: std::result::Result<Json<RevokeBody>, JsonRejection>,
) -> Result<Json<Value>> {
    let Json(body) = payload?;
    let revoked = state.repo.revoke_feedback(&id, &body.feedback_ids).await?;
    Ok(Json(json!({ "revoked": revoked })))
}

pub async fn execution_events(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>> {
    let events = state.repo.execution_events(&id).await?;
    Ok(Json(json!({ "events": events })))
}

pub async fn append_execution_events(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    payload: std::result::Result<Json<EventsBody>, JsonRejection>,
) -> Result<Json<Value>> {
    let Json(body) = payload?;
    let events = state.repo.append_execution_events(&id, body.events).await?;
    Ok(Json(json!({ "events": events })))
}

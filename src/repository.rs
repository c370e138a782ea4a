//! Delivery repository
//!
//! Layout under the data directory:
//!
//! ```text
//! index.json
//! deliveries/<id>/delivery.json
//! deliveries/<id>/feedback.json
//! deliveries/<id>/drafts.json
//! deliveries/<id>/execution-events.json
//! ```
//!
//! Lock order inside one operation is drafts, feedback, delivery, index.
//! The delivery record is authoritative; the index may briefly lag it.

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{AppError, Result};
use crate::hub::{BroadcastHub, EventKind};
use crate::ids::{IdGenerator, DELIVERY_PREFIX, EVENT_PREFIX};
use crate::lifecycle;
use crate::metadata;
use crate::models::{
    Delivery, DeliveryContent, DeliveryDetail, DeliveryMode, DeliveryStatus, DraftItem,
    ExecutionEvent, ExecutionEventInput, FeedbackInput, FeedbackItem, FeedbackKind, IndexEntry,
    ListFilter, Page,
};
use crate::store::RecordStore;

pub const DEFAULT_PAGE_LIMIT: usize = 50;
pub const MAX_PAGE_LIMIT: usize = 200;

/// Fields needed to create a delivery
#[derive(Debug, Clone)]
pub struct NewDelivery {
    pub mode: DeliveryMode,
    pub title: String,
    pub content: DeliveryContent,
    pub metadata: Option<Value>,
    pub agent_session_id: Option<String>,
    pub thread_id: Option<String>,
}

/// Payload of `update_delivery` frames
#[derive(Debug, Serialize)]
struct DeliveryChange<'a> {
    delivery: IndexEntry,
    change: &'a str,
    pending_feedback_count: usize,
}

/// Payload of `feedback_received` frames
#[derive(Debug, Serialize)]
struct FeedbackReceived<'a> {
    delivery: IndexEntry,
    feedback_ids: &'a [String],
    pending_feedback_count: usize,
}

/// Payload of `execution_events_updated` frames
#[derive(Debug, Serialize)]
struct ExecutionEventsUpdated<'a> {
    delivery_id: &'a str,
    events: &'a [ExecutionEvent],
}

pub struct DeliveryRepository {
    data_dir: PathBuf,
    store: RecordStore,
    ids: IdGenerator,
    hub: Arc<BroadcastHub>,
    project_name: String,
}

impl DeliveryRepository {
    pub fn new(
        data_dir: impl Into<PathBuf>,
        store: RecordStore,
        hub: Arc<BroadcastHub>,
        project_name: impl Into<String>,
    ) -> Self {
        Self {
            data_dir: data_dir.into(),
            store,
            ids: IdGenerator::new(),
            hub,
            project_name: project_name.into(),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    pub fn hub(&self) -> &Arc<BroadcastHub> {
        &self.hub
    }

    // Paths

    pub fn index_path(&self) -> PathBuf {
        self.data_dir.join("index.json")
    }

    fn deliveries_dir(&self) -> PathBuf {
        self.data_dir.join("deliveries")
    }

    pub fn delivery_dir(&self, id: &str) -> PathBuf {
        self.deliveries_dir().join(id)
    }

    pub fn delivery_path(&self, id: &str) -> PathBuf {
        self.delivery_dir(id).join("delivery.json")
    }

    pub fn feedback_path(&self, id: &str) -> PathBuf {
        self.delivery_dir(id).join("feedback.json")
    }

    pub fn drafts_path(&self, id: &str) -> PathBuf {
        self.delivery_dir(id).join("drafts.json")
    }

    pub fn events_path(&self, id: &str) -> PathBuf {
        self.delivery_dir(id).join("execution-events.json")
    }

    // Reads

    pub async fn get(&self, id: &str) -> Result<Option<Delivery>> {
        if !is_valid_id(id) {
            return Ok(None);
        }
        self.store.read_object(self.delivery_path(id)).await
    }

    /// Like [`get`](Self::get) but unknown ids are an error
    pub async fn require(&self, id: &str) -> Result<Delivery> {
        self.get(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Delivery {} not found", id)))
    }

    pub async fn detail(&self, id: &str) -> Result<DeliveryDetail> {
        let delivery = self.require(id).await?;
        let feedback = self.feedback(id).await?;
        let drafts = self.drafts(id).await?;
        let execution_events = self.execution_events(id).await?;

        Ok(DeliveryDetail {
            pending_feedback_count: lifecycle::pending_count(&feedback),
            delivery,
            feedback,
            drafts,
            execution_events,
        })
    }

    pub async fn feedback(&self, id: &str) -> Result<Vec<FeedbackItem>> {
        self.require(id).await?;
        self.store.read_array(self.feedback_path(id)).await
    }

    pub async fn drafts(&self, id: &str) -> Result<Vec<DraftItem>> {
        self.require(id).await?;
        self.store.read_array(self.drafts_path(id)).await
    }

    pub async fn execution_events(&self, id: &str) -> Result<Vec<ExecutionEvent>> {
        self.require(id).await?;
        self.store.read_array(self.events_path(id)).await
    }

    /// Newest first
    pub async fn list(
        &self,
        filter: &ListFilter,
        limit: Option<usize>,
        offset: Option<usize>,
    ) -> Result<Page<IndexEntry>> {
        let mut entries: Vec<IndexEntry> = self.store.read_array(self.index_path()).await?;
        entries.retain(|entry| {
            filter.status.map_or(true, |s| entry.status == s)
                && filter.mode.map_or(true, |m| entry.mode == m)
        });
        entries.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.id.cmp(&a.id))
        });

        let total = entries.len();
        let limit = limit.unwrap_or(DEFAULT_PAGE_LIMIT).min(MAX_PAGE_LIMIT);
        let items = entries
            .into_iter()
            .skip(offset.unwrap_or(0))
            .take(limit)
            .collect();

        Ok(Page { items, total })
    }

    // Mutations

    pub async fn create(&self, new: NewDelivery) -> Result<Delivery> {
        let title = new.title.trim().to_string();
        if title.is_empty() {
            return Err(AppError::validation("missing_title", "title is required"));
        }

        let now = Utc::now();
        let metadata = metadata::normalize(new.metadata, &self.project_name, &title, now)?;
        let id = self.allocate_delivery_dir().await?;

        let delivery = Delivery {
            id: id.clone(),
            mode: new.mode,
            status: DeliveryStatus::Normal,
            title,
            content: new.content,
            metadata,
            agent_session_id: new.agent_session_id,
            thread_id: new.thread_id,
            created_at: now,
            updated_at: now,
        };

        let empty: Vec<Value> = Vec::new();
        self.store.write(self.feedback_path(&id), &empty).await?;
        self.store.write(self.drafts_path(&id), &empty).await?;
        self.store.write(self.events_path(&id), &empty).await?;
        self.store.write(self.delivery_path(&id), &delivery).await?;
        let entry = self.sync_index(&delivery).await?;

        tracing::info!(
            delivery_id = %id,
            mode = delivery.mode.as_str(),
            content = delivery.content.kind(),
            "Delivery created"
        );
        self.hub.emit(EventKind::NewDelivery, &entry);

        Ok(delivery)
    }

    pub async fn update_content(
        &self,
        id: &str,
        content: DeliveryContent,
        title: Option<String>,
    ) -> Result<Delivery> {
        let title = match title.map(|t| t.trim().to_string()) {
            Some(t) if t.is_empty() => {
                return Err(AppError::validation("missing_title", "title cannot be empty"))
            }
            other => other,
        };
        self.require(id).await?;

        let feedback_file = self.store.lock(self.feedback_path(id)).await?;
        let feedback: Vec<FeedbackItem> = feedback_file.read_array().await?;
        let delivery = self
            .sync_delivery(id, &feedback, |delivery| {
                delivery.content = content;
                if let Some(title) = title {
                    delivery.title = title;
                }
            })
            .await?;
        drop(feedback_file);

        tracing::info!(delivery_id = %id, "Delivery content updated");
        self.announce(&delivery, "content", &feedback);
        Ok(delivery)
    }

    pub async fn append_execution_events(
        &self,
        id: &str,
        inputs: Vec<ExecutionEventInput>,
    ) -> Result<Vec<ExecutionEvent>> {
        if inputs.is_empty() {
            return Err(AppError::validation(
                "empty_events",
                "at least one execution event is required",
            ));
        }
        self.require(id).await?;

        let now = Utc::now();
        let events = self
            .store
            .update_array(self.events_path(id), |existing: &mut Vec<ExecutionEvent>| {
                let events: Vec<ExecutionEvent> = inputs
                    .into_iter()
                    .map(|input| ExecutionEvent {
                        id: self
                            .ids
                            .next_unused(EVENT_PREFIX, |c| existing.iter().any(|e| e.id == c)),
                        feedback_id: input.feedback_id,
                        stage: input.stage.unwrap_or_default(),
                        message: input.message,
                        actor: input.actor,
                        meta: input.meta,
                        created_at: now,
                    })
                    .collect();
                existing.extend(events.iter().cloned());
                Ok(events)
            })
            .await?;

        let feedback_file = self.store.lock(self.feedback_path(id)).await?;
        let feedback: Vec<FeedbackItem> = feedback_file.read_array().await?;
        self.sync_delivery(id, &feedback, |_| {}).await?;
        drop(feedback_file);

        tracing::debug!(delivery_id = %id, count = events.len(), "Execution events appended");
        self.hub.emit(
            EventKind::ExecutionEventsUpdated,
            ExecutionEventsUpdated {
                delivery_id: id,
                events: &events,
            },
        );
        Ok(events)
    }

    /// Replace the draft set wholesale
    pub async fn save_drafts(&self, id: &str, inputs: Vec<FeedbackInput>) -> Result<Vec<DraftItem>> {
        self.write_drafts(id, inputs, None, false).await
    }

    /// Append annotation drafts to the existing set
    pub async fn annotate(&self, id: &str, inputs: Vec<FeedbackInput>) -> Result<Vec<DraftItem>> {
        self.write_drafts(id, inputs, Some(FeedbackKind::Annotation), true)
            .await
    }

    async fn write_drafts(
        &self,
        id: &str,
        inputs: Vec<FeedbackInput>,
        force_kind: Option<FeedbackKind>,
        append: bool,
    ) -> Result<Vec<DraftItem>> {
        self.require(id).await?;

        let now = Utc::now();
        let drafts = self
            .store
            .update_array(self.drafts_path(id), |drafts: &mut Vec<DraftItem>| {
                if !append {
                    drafts.clear();
                }
                let fresh =
                    lifecycle::make_drafts(&self.ids, drafts.as_slice(), inputs, force_kind, now);
                drafts.extend(fresh);
                Ok(drafts.clone())
            })
            .await?;

        let feedback_file = self.store.lock(self.feedback_path(id)).await?;
        let feedback: Vec<FeedbackItem> = feedback_file.read_array().await?;
        let delivery = self.sync_delivery(id, &feedback, |_| {}).await?;
        drop(feedback_file);

        self.announce(&delivery, "drafts", &feedback);
        Ok(drafts)
    }

    /// Commit `inputs`, or the stored drafts when `inputs` is empty. The draft
    /// set is cleared either way. Returns the new feedback ids.
    pub async fn commit_feedback(&self, id: &str, inputs: Vec<FeedbackInput>) -> Result<Vec<String>> {
        self.require(id).await?;
        let now = Utc::now();

        let drafts_file = self.store.lock(self.drafts_path(id)).await?;
        let stored: Vec<DraftItem> = drafts_file.read_array().await?;
        let drafts = if inputs.is_empty() {
            stored
        } else {
            lifecycle::make_drafts(&self.ids, &stored, inputs, None, now)
        };

        let feedback_file = self.store.lock(self.feedback_path(id)).await?;
        let mut feedback: Vec<FeedbackItem> = feedback_file.read_array().await?;
        let committed = lifecycle::commit_drafts(&self.ids, &feedback, drafts, now)?;
        let feedback_ids: Vec<String> = committed.iter().map(|item| item.id.clone()).collect();
        feedback.extend(committed);
        feedback_file.write(&feedback).await?;
        drafts_file.write(&Vec::<DraftItem>::new()).await?;

        let delivery = self.sync_delivery(id, &feedback, |_| {}).await?;
        drop(feedback_file);
        drop(drafts_file);

        let pending_feedback_count = lifecycle::pending_count(&feedback);
        tracing::info!(
            delivery_id = %id,
            committed = feedback_ids.len(),
            pending = pending_feedback_count,
            "Feedback committed"
        );
        self.hub.emit(
            EventKind::FeedbackReceived,
            FeedbackReceived {
                delivery: IndexEntry::from(&delivery),
                feedback_ids: &feedback_ids,
                pending_feedback_count,
            },
        );
        Ok(feedback_ids)
    }

    pub async fn resolve_feedback(
        &self,
        id: &str,
        feedback_ids: &[String],
        handled_by: Option<&str>,
    ) -> Result<usize> {
        self.require(id).await?;

        let feedback_file = self.store.lock(self.feedback_path(id)).await?;
        let mut feedback: Vec<FeedbackItem> = feedback_file.read_array().await?;
        let resolved = lifecycle::resolve(&mut feedback, feedback_ids, handled_by, Utc::now());
        if resolved == 0 {
            return Ok(0);
        }
        feedback_file.write(&feedback).await?;
        let delivery = self.sync_delivery(id, &feedback, |_| {}).await?;
        drop(feedback_file);

        tracing::info!(delivery_id = %id, resolved, "Feedback resolved");
        self.announce(&delivery, "feedback_resolved", &feedback);
        Ok(resolved)
    }

    pub async fn revoke_feedback(&self, id: &str, feedback_ids: &[String]) -> Result<usize> {
        self.require(id).await?;

        let feedback_file = self.store.lock(self.feedback_path(id)).await?;
        let mut feedback: Vec<FeedbackItem> = feedback_file.read_array().await?;
        let revoked = lifecycle::revoke(&mut feedback, feedback_ids);
        if revoked == 0 {
            return Ok(0);
        }
        feedback_file.write(&feedback).await?;
        let delivery = self.sync_delivery(id, &feedback, |_| {}).await?;
        drop(feedback_file);

        tracing::info!(delivery_id = %id, revoked, "Feedback revoked");
        self.announce(&delivery, "feedback_revoked", &feedback);
        Ok(revoked)
    }

    // Internals

    /// Create a fresh delivery directory, skipping ids already on disk
    async fn allocate_delivery_dir(&self) -> Result<String> {
        tokio::fs::create_dir_all(self.deliveries_dir()).await?;
        loop {
            let id = self.ids.next(DELIVERY_PREFIX);
            match tokio::fs::create_dir(self.delivery_dir(&id)).await {
                Ok(()) => return Ok(id),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    tracing::debug!(delivery_id = %id, "Delivery id already on disk, skipping");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Apply `edit`, recompute status from `feedback`, refresh `updated_at`,
    /// persist the delivery record and then its index entry.
    ///
    /// Callers hold the feedback lock so the status cannot go stale.
    async fn sync_delivery<F>(&self, id: &str, feedback: &[FeedbackItem], edit: F) -> Result<Delivery>
    where
        F: FnOnce(&mut Delivery),
    {
        let status = lifecycle::derive_status(feedback);
        let now = Utc::now();

        let delivery = self
            .store
            .update_object(self.delivery_path(id), |record: &mut Option<Delivery>| {
                let delivery = record
                    .as_mut()
                    .ok_or_else(|| AppError::NotFound(format!("Delivery {} not found", id)))?;
                edit(delivery);
                delivery.status = status;
                delivery.updated_at = lifecycle::touch(delivery.updated_at, now);
                Ok(delivery.clone())
            })
            .await?;

        self.sync_index(&delivery).await?;
        Ok(delivery)
    }

    async fn sync_index(&self, delivery: &Delivery) -> Result<IndexEntry> {
        let entry = IndexEntry::from(delivery);
        let updated = entry.clone();
        self.store
            .update_array(self.index_path(), move |entries: &mut Vec<IndexEntry>| {
                match entries.iter_mut().find(|e| e.id == updated.id) {
                    Some(existing) => *existing = updated,
                    None => entries.push(updated),
                }
                Ok(())
            })
            .await?;
        Ok(entry)
    }

    /// Broadcast `update_delivery` for a change recorded elsewhere
    pub async fn notify_change(&self, id: &str, change: &str) -> Result<()> {
        let delivery = self.require(id).await?;
        let feedback: Vec<FeedbackItem> = self.store.read_array(self.feedback_path(id)).await?;
        self.announce(&delivery, change, &feedback);
        Ok(())
    }

    pub(crate) fn announce(&self, delivery: &Delivery, change: &str, feedback: &[FeedbackItem]) {
        self.hub.emit(
            EventKind::UpdateDelivery,
            DeliveryChange {
                delivery: IndexEntry::from(delivery),
                change,
                pending_feedback_count: lifecycle::pending_count(feedback),
            },
        );
    }
}

/// Ids become directory names, so only a safe character set is accepted
pub fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 128
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn setup() -> (TempDir, DeliveryRepository) {
        let dir = TempDir::new().unwrap();
        let repo = DeliveryRepository::new(
            dir.path(),
            RecordStore::default(),
            Arc::new(BroadcastHub::new()),
            "test-project",
        );
        (dir, repo)
    }

    fn ui_spec() -> DeliveryContent {
        DeliveryContent::try_from(json!({"type": "ui_spec", "ui_spec": {"root": "page"}})).unwrap()
    }

    fn new_delivery(title: &str) -> NewDelivery {
        NewDelivery {
            mode: DeliveryMode::Async,
            title: title.to_string(),
            content: ui_spec(),
            metadata: None,
            agent_session_id: None,
            thread_id: None,
        }
    }

    fn note(text: &str) -> FeedbackInput {
        FeedbackInput {
            kind: FeedbackKind::Annotation,
            payload: json!({"text": text}),
            target: Some(json!({"selector": "#header"})),
        }
    }

    #[tokio::test]
    async fn test_create_writes_layout() {
        let (dir, repo) = setup();
        let delivery = repo.create(new_delivery("Landing page")).await.unwrap();

        let base = dir.path().join("deliveries").join(&delivery.id);
        for file in ["delivery.json", "feedback.json", "drafts.json", "execution-events.json"] {
            assert!(base.join(file).exists(), "missing {}", file);
        }
        assert_eq!(delivery.status, DeliveryStatus::Normal);
        assert_eq!(delivery.metadata["project_name"], "test-project");
        assert_eq!(delivery.metadata["task_name"], "Landing page");

        let page = repo.list(&ListFilter::default(), None, None).await.unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.items[0].id, delivery.id);
    }

    #[tokio::test]
    async fn test_create_requires_title() {
        let (_dir, repo) = setup();
        let err = repo.create(new_delivery("   ")).await.unwrap_err();
        assert_eq!(err.code(), "missing_title");
    }

    #[tokio::test]
    async fn test_get_unknown_and_unsafe_ids() {
        let (_dir, repo) = setup();
        assert!(repo.get("dlv_missing").await.unwrap().is_none());
        assert!(repo.get("../etc").await.unwrap().is_none());
        assert!(matches!(
            repo.require("nope").await.unwrap_err(),
            AppError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_restarted_server_keeps_feedback_ids_unique() {
        let (dir, repo) = setup();
        let delivery = repo.create(new_delivery("Review")).await.unwrap();
        let first = repo
            .commit_feedback(&delivery.id, vec![note("one"), note("two")])
            .await
            .unwrap();

        // Same data dir, fresh id counter
        let restarted = DeliveryRepository::new(
            dir.path(),
            RecordStore::default(),
            Arc::new(BroadcastHub::new()),
            "test-project",
        );
        let second = restarted
            .commit_feedback(&delivery.id, vec![note("three")])
            .await
            .unwrap();
        assert!(!first.contains(&second[0]), "{} reissued", second[0]);

        let resolved = restarted
            .resolve_feedback(&delivery.id, &second, Some("agent"))
            .await
            .unwrap();
        assert_eq!(resolved, 1);
        let detail = restarted.detail(&delivery.id).await.unwrap();
        assert_eq!(detail.pending_feedback_count, 2);
    }

    #[tokio::test]
    async fn test_commit_resolve_lifecycle() {
        let (_dir, repo) = setup();
        let delivery = repo.create(new_delivery("Review")).await.unwrap();

        repo.save_drafts(&delivery.id, vec![note("one"), note("two")])
            .await
            .unwrap();
        let ids = repo.commit_feedback(&delivery.id, Vec::new()).await.unwrap();
        assert_eq!(ids.len(), 2);

        let detail = repo.detail(&delivery.id).await.unwrap();
        assert_eq!(detail.delivery.status, DeliveryStatus::PendingFeedback);
        assert_eq!(detail.pending_feedback_count, 2);
        assert!(detail.drafts.is_empty());

        let resolved = repo
            .resolve_feedback(&delivery.id, &ids[..1], Some("agent"))
            .await
            .unwrap();
        assert_eq!(resolved, 1);
        let detail = repo.detail(&delivery.id).await.unwrap();
        assert_eq!(detail.pending_feedback_count, 1);
        assert_eq!(detail.delivery.status, DeliveryStatus::PendingFeedback);

        repo.resolve_feedback(&delivery.id, &ids[1..], None)
            .await
            .unwrap();
        let detail = repo.detail(&delivery.id).await.unwrap();
        assert_eq!(detail.delivery.status, DeliveryStatus::Normal);
        assert_eq!(detail.pending_feedback_count, 0);

        let page = repo
            .list(
                &ListFilter {
                    status: Some(DeliveryStatus::Normal),
                    mode: None,
                },
                None,
                None,
            )
            .await
            .unwrap();
        assert_eq!(page.total, 1);
    }

    #[tokio::test]
    async fn test_commit_with_explicit_items_clears_drafts() {
        let (_dir, repo) = setup();
        let delivery = repo.create(new_delivery("Review")).await.unwrap();
        repo.annotate(&delivery.id, vec![note("staged")]).await.unwrap();

        let ids = repo
            .commit_feedback(&delivery.id, vec![note("direct")])
            .await
            .unwrap();
        assert_eq!(ids.len(), 1);
        assert!(repo.drafts(&delivery.id).await.unwrap().is_empty());
        let feedback = repo.feedback(&delivery.id).await.unwrap();
        assert_eq!(feedback[0].payload["text"], "direct");
    }

    #[tokio::test]
    async fn test_empty_commit_rejected_without_changes() {
        let (_dir, repo) = setup();
        let delivery = repo.create(new_delivery("Review")).await.unwrap();
        let err = repo.commit_feedback(&delivery.id, Vec::new()).await.unwrap_err();
        assert_eq!(err.code(), "empty_commit");
        assert!(repo.feedback(&delivery.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_annotate_appends_and_draft_replaces() {
        let (_dir, repo) = setup();
        let delivery = repo.create(new_delivery("Review")).await.unwrap();

        repo.annotate(&delivery.id, vec![note("a")]).await.unwrap();
        let drafts = repo.annotate(&delivery.id, vec![note("b")]).await.unwrap();
        assert_eq!(drafts.len(), 2);

        let drafts = repo.save_drafts(&delivery.id, vec![note("c")]).await.unwrap();
        assert_eq!(drafts.len(), 1);
        assert_eq!(drafts[0].payload["text"], "c");
    }

    #[tokio::test]
    async fn test_revoke_only_unhandled() {
        let (_dir, repo) = setup();
        let delivery = repo.create(new_delivery("Review")).await.unwrap();
        let ids = repo
            .commit_feedback(&delivery.id, vec![note("a"), note("b")])
            .await
            .unwrap();
        repo.resolve_feedback(&delivery.id, &ids[..1], None)
            .await
            .unwrap();

        assert_eq!(repo.revoke_feedback(&delivery.id, &ids[..1]).await.unwrap(), 0);
        assert_eq!(repo.revoke_feedback(&delivery.id, &ids).await.unwrap(), 1);

        let detail = repo.detail(&delivery.id).await.unwrap();
        assert_eq!(detail.feedback.len(), 1);
        assert_eq!(detail.delivery.status, DeliveryStatus::Normal);
    }

    #[tokio::test]
    async fn test_execution_events_append_only() {
        let (_dir, repo) = setup();
        let delivery = repo.create(new_delivery("Review")).await.unwrap();

        repo.append_execution_events(
            &delivery.id,
            vec![ExecutionEventInput {
                message: "queued".into(),
                stage: Some(crate::models::ExecutionStage::Queued),
                ..Default::default()
            }],
        )
        .await
        .unwrap();
        repo.append_execution_events(
            &delivery.id,
            vec![ExecutionEventInput {
                message: "no stage".into(),
                ..Default::default()
            }],
        )
        .await
        .unwrap();

        let events = repo.execution_events(&delivery.id).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].stage, crate::models::ExecutionStage::Info);
        assert_ne!(events[0].id, events[1].id);
    }

    #[tokio::test]
    async fn test_update_content_refreshes_updated_at() {
        let (_dir, repo) = setup();
        let delivery = repo.create(new_delivery("Review")).await.unwrap();

        let html = DeliveryContent::GeneratedHtml {
            html: "<h1>v2</h1>".into(),
        };
        let updated = repo
            .update_content(&delivery.id, html.clone(), Some("Review v2".into()))
            .await
            .unwrap();
        assert_eq!(updated.content, html);
        assert_eq!(updated.title, "Review v2");
        assert!(updated.updated_at >= delivery.updated_at);

        let page = repo.list(&ListFilter::default(), None, None).await.unwrap();
        assert_eq!(page.items[0].title, "Review v2");
    }

    #[tokio::test]
    async fn test_corrupted_feedback_recovers_empty() {
        let (dir, repo) = setup();
        let delivery = repo.create(new_delivery("Review")).await.unwrap();
        let feedback_path = repo.feedback_path(&delivery.id);
        std::fs::write(&feedback_path, b"{ not valid").unwrap();

        let detail = repo.detail(&delivery.id).await.unwrap();
        assert!(detail.feedback.is_empty());

        let backups: Vec<_> = std::fs::read_dir(dir.path().join("deliveries").join(&delivery.id))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("feedback.json.corrupted."))
            .collect();
        assert_eq!(backups.len(), 1);
    }

    #[tokio::test]
    async fn test_list_paging_and_mode_filter() {
        let (_dir, repo) = setup();
        for n in 0..3 {
            repo.create(new_delivery(&format!("async {}", n))).await.unwrap();
        }
        let mut blocking = new_delivery("blocking");
        blocking.mode = DeliveryMode::Blocking;
        repo.create(blocking).await.unwrap();

        let page = repo
            .list(&ListFilter::default(), Some(2), Some(1))
            .await
            .unwrap();
        assert_eq!(page.total, 4);
        assert_eq!(page.items.len(), 2);

        let page = repo
            .list(
                &ListFilter {
                    status: None,
                    mode: Some(DeliveryMode::Blocking),
                },
                None,
                None,
            )
            .await
            .unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.items[0].title, "blocking");
    }

    #[tokio::test]
    async fn test_mutations_broadcast() {
        let (_dir, repo) = setup();
        let mut sub = repo.hub().connect();

        let delivery = repo.create(new_delivery("Review")).await.unwrap();
        repo.commit_feedback(&delivery.id, vec![note("a")])
            .await
            .unwrap();

        assert_eq!(sub.recv().await.unwrap().event, EventKind::NewDelivery);
        let frame = sub.recv().await.unwrap();
        assert_eq!(frame.event, EventKind::FeedbackReceived);
        assert_eq!(frame.data["pending_feedback_count"], 1);
    }
}

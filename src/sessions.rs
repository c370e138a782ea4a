//! Agent session registry
//!
//! Maps an agent session to the blocking delivery it is currently waiting on.
//! Entries live in `agent-sessions.json` and are only touched through the
//! record store, never while a delivery file lock is held.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;

use crate::error::{AppError, Result};
use crate::lifecycle;
use crate::models::{
    DeliveryContent, DeliveryMode, DeliveryStatus, ExecutionEventInput, ExecutionStage,
    FeedbackItem, IndexEntry,
};
use crate::repository::{DeliveryRepository, NewDelivery};

/// Heartbeats older than this no longer count as a waiting agent
pub const HEARTBEAT_FRESHNESS_SECS: i64 = 60;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEntry {
    pub agent_session_id: String,
    #[serde(default)]
    pub thread_id: Option<String>,
    pub delivery_id: String,
    pub created_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
}

/// Request to create or replace a session's active delivery
#[derive(Debug, Clone, Deserialize)]
pub struct UpsertRequest {
    pub agent_session_id: String,
    #[serde(default)]
    pub thread_id: Option<String>,
    pub title: String,
    pub content: Value,
    #[serde(default)]
    pub metadata: Option<Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UpsertOutcome {
    pub id: String,
    pub replaced: Option<String>,
}

/// What a waiting agent polls for
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveDelivery {
    pub delivery_id: String,
    pub thread_id: Option<String>,
    pub status: DeliveryStatus,
    pub pending_feedback: Vec<FeedbackItem>,
    pub pending_feedback_count: usize,
    pub last_heartbeat_at: DateTime<Utc>,
}

pub struct AgentSessions {
    path: PathBuf,
    repo: Arc<DeliveryRepository>,
}

impl AgentSessions {
    pub fn new(repo: Arc<DeliveryRepository>) -> Self {
        Self {
            path: repo.data_dir().join("agent-sessions.json"),
            repo,
        }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    pub async fn entries(&self) -> Result<Vec<SessionEntry>> {
        self.repo.store().read_array(&self.path).await
    }

    async fn entry(&self, agent_session_id: &str) -> Result<Option<SessionEntry>> {
        Ok(self
            .entries()
            .await?
            .into_iter()
            .find(|e| e.agent_session_id == agent_session_id))
    }

    /// Create a blocking delivery and make it the session's active one
    pub async fn upsert(&self, request: UpsertRequest) -> Result<UpsertOutcome> {
        let agent_session_id = request.agent_session_id.trim().to_string();
        if agent_session_id.is_empty() {
            return Err(AppError::validation(
                "missing_agent_session_id",
                "agent_session_id is required",
            ));
        }
        let content = DeliveryContent::try_from(request.content)?;
        let thread_id = request.thread_id.filter(|t| !t.trim().is_empty());

        let delivery = self
            .repo
            .create(NewDelivery {
                mode: DeliveryMode::Blocking,
                title: request.title,
                content,
                metadata: request.metadata,
                agent_session_id: Some(agent_session_id.clone()),
                thread_id: thread_id.clone(),
            })
            .await?;

        let now = Utc::now();
        let entry = SessionEntry {
            agent_session_id: agent_session_id.clone(),
            thread_id,
            delivery_id: delivery.id.clone(),
            created_at: now,
            last_heartbeat_at: now,
        };
        let replaced = self
            .repo
            .store()
            .update_array(&self.path, move |entries: &mut Vec<SessionEntry>| {
                let previous = entries
                    .iter()
                    .position(|e| e.agent_session_id == entry.agent_session_id)
                    .map(|i| entries.remove(i).delivery_id);
                entries.push(entry);
                Ok(previous)
            })
            .await?;

        if let Some(previous) = &replaced {
            tracing::info!(
                agent_session_id = %agent_session_id,
                replaced = %previous,
                delivery_id = %delivery.id,
                "Session delivery replaced"
            );
            self.record(
                previous,
                format!("Replaced by {}", delivery.id),
                json!({"replaced_by": delivery.id}),
            )
            .await;
        }

        Ok(UpsertOutcome {
            id: delivery.id,
            replaced,
        })
    }

    /// Refresh the heartbeat. Returns whether `delivery_id` is still active.
    pub async fn heartbeat(&self, agent_session_id: &str, delivery_id: &str) -> Result<bool> {
        let now = Utc::now();
        self.repo
            .store()
            .update_array(&self.path, |entries: &mut Vec<SessionEntry>| {
                let entry = entries.iter_mut().find(|e| {
                    e.agent_session_id == agent_session_id && e.delivery_id == delivery_id
                });
                match entry {
                    Some(entry) => {
                        entry.last_heartbeat_at = lifecycle::touch(entry.last_heartbeat_at, now);
                        Ok(true)
                    }
                    None => Ok(false),
                }
            })
            .await
    }

    pub async fn active(&self, agent_session_id: &str) -> Result<Option<ActiveDelivery>> {
        let Some(entry) = self.entry(agent_session_id).await? else {
            return Ok(None);
        };
        let Some(delivery) = self.repo.get(&entry.delivery_id).await? else {
            tracing::warn!(
                agent_session_id = %agent_session_id,
                delivery_id = %entry.delivery_id,
                "Session points at a missing delivery"
            );
            return Ok(None);
        };

        let feedback = self.repo.feedback(&delivery.id).await?;
        let pending_feedback = lifecycle::pending(&feedback);
        Ok(Some(ActiveDelivery {
            delivery_id: delivery.id,
            thread_id: entry.thread_id,
            status: lifecycle::derive_status(&feedback),
            pending_feedback_count: pending_feedback.len(),
            pending_feedback,
            last_heartbeat_at: entry.last_heartbeat_at,
        }))
    }

    /// Clear the session entry if it still points at `delivery_id` (or at
    /// anything, when no id is given). Returns whether an entry was cleared.
    pub async fn cancel(
        &self,
        agent_session_id: &str,
        delivery_id: Option<&str>,
        reason: &str,
    ) -> Result<bool> {
        let cleared = self
            .repo
            .store()
            .update_array(&self.path, |entries: &mut Vec<SessionEntry>| {
                let position = entries.iter().position(|e| {
                    e.agent_session_id == agent_session_id
                        && delivery_id.map_or(true, |id| e.delivery_id == id)
                });
                Ok(position.map(|i| entries.remove(i).delivery_id))
            })
            .await?;

        let target = match (&cleared, delivery_id) {
            (Some(id), _) => id.clone(),
            (None, Some(id)) => id.to_string(),
            (None, None) => return Ok(false),
        };

        tracing::info!(
            agent_session_id = %agent_session_id,
            delivery_id = %target,
            reason,
            cleared = cleared.is_some(),
            "Session canceled"
        );
        self.record(
            &target,
            format!("Agent session ended: {}", reason),
            json!({"reason": reason, "agent_session_id": agent_session_id}),
        )
        .await;
        if let Err(e) = self.repo.notify_change(&target, "session_canceled").await {
            tracing::debug!(delivery_id = %target, "No update broadcast after cancel: {}", e);
        }

        Ok(cleared.is_some())
    }

    /// Deliveries an agent is actively blocking on, as index entries
    pub async fn blocking_pending(&self) -> Result<Vec<IndexEntry>> {
        let cutoff = Utc::now() - Duration::seconds(HEARTBEAT_FRESHNESS_SECS);
        let mut pending = Vec::new();
        for entry in self.entries().await? {
            if entry.last_heartbeat_at < cutoff {
                continue;
            }
            match self.repo.get(&entry.delivery_id).await? {
                Some(delivery) if delivery.mode == DeliveryMode::Blocking => {
                    pending.push(IndexEntry::from(&delivery));
                }
                _ => {}
            }
        }
        Ok(pending)
    }

    /// Best-effort info event on a delivery
    async fn record(&self, delivery_id: &str, message: String, meta: Value) {
        let event = ExecutionEventInput {
            stage: Some(ExecutionStage::Info),
            message,
            actor: Some("handoff".to_string()),
            meta: Some(meta),
            ..Default::default()
        };
        if let Err(e) = self
            .repo
            .append_execution_events(delivery_id, vec![event])
            .await
        {
            tracing::warn!(delivery_id = %delivery_id, "Failed to record session event: {}", e);
        }
    }
}

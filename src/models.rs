//! Data models for deliveries, feedback and execution events

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::AppError;

/// A delivery is a unit of work handed from an agent to a human reviewer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delivery {
    pub id: String,
    #[serde(default)]
    pub mode: DeliveryMode,
    #[serde(default)]
    pub status: DeliveryStatus,
    pub title: String,
    pub content: DeliveryContent,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Derived status of a delivery
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    #[default]
    Normal,
    PendingFeedback,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Normal => "normal",
            DeliveryStatus::PendingFeedback => "pending_feedback",
        }
    }
}

impl std::str::FromStr for DeliveryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "normal" => Ok(DeliveryStatus::Normal),
            "pending_feedback" => Ok(DeliveryStatus::PendingFeedback),
            _ => Err(format!("Invalid delivery status: {}", s)),
        }
    }
}

/// Whether an agent is synchronously waiting on the delivery
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    Blocking,
    #[default]
    Async,
}

impl DeliveryMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryMode::Blocking => "blocking",
            DeliveryMode::Async => "async",
        }
    }
}

impl std::str::FromStr for DeliveryMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "blocking" => Ok(DeliveryMode::Blocking),
            "async" => Ok(DeliveryMode::Async),
            _ => Err(format!("Invalid delivery mode: {}", s)),
        }
    }
}

/// Content shown to the reviewer.
///
/// Deserialization goes through [`DeliveryContent::try_from`] so that only the
/// two exact shapes are accepted:
/// `{"type": "ui_spec", "ui_spec": {..}}` or `{"type": "generated_html", "html": ".."}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", try_from = "Value")]
pub enum DeliveryContent {
    UiSpec { ui_spec: Map<String, Value> },
    GeneratedHtml { html: String },
}

impl DeliveryContent {
    pub fn kind(&self) -> &'static str {
        match self {
            DeliveryContent::UiSpec { .. } => "ui_spec",
            DeliveryContent::GeneratedHtml { .. } => "generated_html",
        }
    }
}

impl TryFrom<Value> for DeliveryContent {
    type Error = AppError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        let invalid = |message: String| AppError::validation("invalid_content", message);

        let Value::Object(mut fields) = value else {
            return Err(invalid("content must be an object".to_string()));
        };

        let kind = match fields.remove("type") {
            Some(Value::String(kind)) => kind,
            _ => return Err(invalid("content.type must be a string".to_string())),
        };

        let (expected, content) = match kind.as_str() {
            "ui_spec" => match fields.remove("ui_spec") {
                Some(Value::Object(ui_spec)) => ("ui_spec", DeliveryContent::UiSpec { ui_spec }),
                _ => return Err(invalid("content.ui_spec must be an object".to_string())),
            },
            "generated_html" => match fields.remove("html") {
                Some(Value::String(html)) if !html.trim().is_empty() => {
                    ("html", DeliveryContent::GeneratedHtml { html })
                }
                _ => {
                    return Err(invalid(
                        "content.html must be a non-empty string".to_string(),
                    ))
                }
            },
            other => return Err(invalid(format!("unsupported content type: {}", other))),
        };

        if let Some(extra) = fields.keys().next() {
            return Err(invalid(format!(
                "unexpected field content.{} alongside content.{}",
                extra, expected
            )));
        }

        Ok(content)
    }
}

/// Kind of reviewer feedback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackKind {
    Annotation,
    Interactive,
}

/// Committed reviewer feedback
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackItem {
    pub id: String,
    pub kind: FeedbackKind,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub target: Option<Value>,
    #[serde(default)]
    pub handled: bool,
    #[serde(default)]
    pub handled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub handled_by: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Staged feedback that has not been committed yet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DraftItem {
    pub id: String,
    pub kind: FeedbackKind,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub target: Option<Value>,
    pub created_at: DateTime<Utc>,
}

/// Feedback as submitted by the reviewer UI, before ids are assigned
#[derive(Debug, Clone, Deserialize)]
pub struct FeedbackInput {
    pub kind: FeedbackKind,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub target: Option<Value>,
}

/// Stage of an execution event.
///
/// Unknown stage strings deserialize as [`ExecutionStage::Info`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", from = "String")]
pub enum ExecutionStage {
    Queued,
    InProgress,
    Completed,
    Failed,
    #[default]
    Info,
}

impl From<String> for ExecutionStage {
    fn from(s: String) -> Self {
        match s.as_str() {
            "queued" => ExecutionStage::Queued,
            "in_progress" => ExecutionStage::InProgress,
            "completed" => ExecutionStage::Completed,
            "failed" => ExecutionStage::Failed,
            _ => ExecutionStage::Info,
        }
    }
}

/// Append-only audit entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionEvent {
    pub id: String,
    #[serde(default)]
    pub feedback_id: Option<String>,
    #[serde(default)]
    pub stage: ExecutionStage,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub actor: Option<String>,
    #[serde(default)]
    pub meta: Option<Value>,
    pub created_at: DateTime<Utc>,
}

/// Execution event as submitted, before an id is assigned
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExecutionEventInput {
    #[serde(default)]
    pub feedback_id: Option<String>,
    #[serde(default)]
    pub stage: Option<ExecutionStage>,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub actor: Option<String>,
    #[serde(default)]
    pub meta: Option<Value>,
}

/// Listing projection of a delivery, kept in `index.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub id: String,
    #[serde(default)]
    pub mode: DeliveryMode,
    #[serde(default)]
    pub status: DeliveryStatus,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_session_id: Option<String>,
}

impl From<&Delivery> for IndexEntry {
    fn from(delivery: &Delivery) -> Self {
        IndexEntry {
            id: delivery.id.clone(),
            mode: delivery.mode,
            status: delivery.status,
            title: delivery.title.clone(),
            created_at: delivery.created_at,
            updated_at: delivery.updated_at,
            metadata: delivery.metadata.clone(),
            agent_session_id: delivery.agent_session_id.clone(),
        }
    }
}

/// A delivery together with all of its sub-records
#[derive(Debug, Clone, Serialize)]
pub struct DeliveryDetail {
    #[serde(flatten)]
    pub delivery: Delivery,
    pub feedback: Vec<FeedbackItem>,
    pub drafts: Vec<DraftItem>,
    pub execution_events: Vec<ExecutionEvent>,
    pub pending_feedback_count: usize,
}

/// Listing filter
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListFilter {
    pub status: Option<DeliveryStatus>,
    pub mode: Option<DeliveryMode>,
}

/// A page of results
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: usize,
}

/// Request to create a new delivery
#[derive(Debug, Deserialize)]
pub struct CreateDeliveryRequest {
    #[serde(default)]
    pub mode: Option<DeliveryMode>,
    pub title: String,
    pub content: Value,
    #[serde(default)]
    pub metadata: Option<Value>,
}

//! Message types shared with the handoff server

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Body of `POST /api/agent-sessions/upsert`
#[derive(Debug, Clone, Serialize)]
pub struct UpsertRequest {
    pub agent_session_id: String,
    pub thread_id: Option<String>,
    pub title: String,
    pub content: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpsertResponse {
    pub id: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub replaced: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ActiveResponse {
    pub active: Option<ActiveDelivery>,
}

/// The delivery a session is currently waiting on
#[derive(Debug, Clone, Deserialize)]
pub struct ActiveDelivery {
    pub delivery_id: String,
    #[serde(default)]
    pub thread_id: Option<String>,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub pending_feedback: Vec<FeedbackItem>,
    #[serde(default)]
    pub pending_feedback_count: usize,
    #[serde(default)]
    pub last_heartbeat_at: Option<DateTime<Utc>>,
}

/// Committed reviewer feedback, passed through to the agent verbatim
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackItem {
    pub id: String,
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<Value>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HeartbeatResponse {
    pub active: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResolveResponse {
    pub resolved: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CancelResponse {
    pub canceled: bool,
}

/// Server error envelope
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    NoActiveDelivery,
    Interrupted,
}

/// The single JSON line printed when the CLI exits
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Responded {
        delivery_id: String,
        feedback: Vec<FeedbackItem>,
    },
    Canceled {
        delivery_id: String,
        reason: CancelReason,
    },
    Replaced {
        delivery_id: String,
        replaced_by: String,
    },
    Timeout {
        delivery_id: String,
        timeout_secs: u64,
    },
    Error {
        code: String,
        message: String,
    },
}

impl Outcome {
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Outcome::Error {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            Outcome::Error { .. } => 1,
            _ => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_outcome_lines() {
        let line = serde_json::to_value(Outcome::Canceled {
            delivery_id: "dlv_1".into(),
            reason: CancelReason::NoActiveDelivery,
        })
        .unwrap();
        assert_eq!(
            line,
            json!({"status": "canceled", "delivery_id": "dlv_1", "reason": "no_active_delivery"})
        );

        let line = serde_json::to_value(Outcome::Timeout {
            delivery_id: "dlv_1".into(),
            timeout_secs: 300,
        })
        .unwrap();
        assert_eq!(line["status"], "timeout");
        assert_eq!(line["timeout_secs"], 300);
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(Outcome::error("validation_error", "x").exit_code(), 1);
        let replaced = Outcome::Replaced {
            delivery_id: "a".into(),
            replaced_by: "b".into(),
        };
        assert_eq!(replaced.exit_code(), 0);
    }

    #[test]
    fn test_active_response_parses_server_shape() {
        let response: ActiveResponse = serde_json::from_value(json!({
            "active": {
                "delivery_id": "dlv_1",
                "thread_id": null,
                "status": "pending_feedback",
                "pending_feedback": [{
                    "id": "fb_1",
                    "kind": "annotation",
                    "payload": {"text": "x"},
                    "target": null,
                    "handled": false,
                    "handled_at": null,
                    "handled_by": null,
                    "created_at": "2026-10-17T10:00:00Z"
                }],
                "pending_feedback_count": 1,
                "last_heartbeat_at": "2026-10-17T10:00:01Z"
            }
        }))
        .unwrap();
        let active = response.active.unwrap();
        assert_eq!(active.pending_feedback[0].id, "fb_1");

        let none: ActiveResponse = serde_json::from_value(json!({"active": null})).unwrap();
        assert!(none.active.is_none());
    }
}

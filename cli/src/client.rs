//! HTTP client for the handoff server

use reqwest::{RequestBuilder, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde_json::json;
use std::time::Duration;
use thiserror::Error;

use crate::messages::{
    ActiveDelivery, ActiveResponse, CancelResponse, ErrorResponse, HeartbeatResponse,
    ResolveResponse, UpsertRequest, UpsertResponse,
};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Server unreachable: {0}")]
    ServerUnreachable(String),

    #[error("Server returned {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Unexpected response: {0}")]
    Decode(String),
}

impl ClientError {
    /// Code reported in the CLI's error line
    pub fn code(&self) -> String {
        match self {
            ClientError::ServerUnreachable(_) => "server_unreachable".to_string(),
            ClientError::Http { body, .. } => serde_json::from_str::<ErrorResponse>(body)
                .map(|e| e.error.code)
                .unwrap_or_else(|_| "http_error".to_string()),
            ClientError::Validation(_) => "validation_error".to_string(),
            ClientError::Decode(_) => "decode_error".to_string(),
        }
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            ClientError::Decode(e.to_string())
        } else {
            ClientError::ServerUnreachable(e.to_string())
        }
    }
}

/// Client for the agent-facing endpoints
#[derive(Debug, Clone)]
pub struct HandoffClient {
    http: reqwest::Client,
    base_url: String,
}

impl HandoffClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ClientError::Validation(e.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Base URL with `segments` appended, each percent-encoded as one path
    /// segment. Session ids are free-form and may contain `/`, `#` or `?`.
    fn url(&self, segments: &[&str]) -> Result<Url, ClientError> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|e| ClientError::Validation(format!("{}: {}", self.base_url, e)))?;
        url.path_segments_mut()
            .map_err(|_| ClientError::Validation(format!("{} cannot be a base URL", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    pub async fn health(&self) -> Result<(), ClientError> {
        let response = self.http.get(self.url(&["health"])?).send().await?;
        if response.status() != StatusCode::OK {
            return Err(ClientError::Http {
                status: response.status().as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }
        Ok(())
    }

    /// Health check with exponential backoff. Every failure counts as the
    /// server being unreachable.
    pub async fn health_with_retry(
        &self,
        attempts: u32,
        base_backoff: Duration,
    ) -> Result<(), ClientError> {
        let mut backoff = base_backoff;
        let mut last_error = String::from("no attempts made");

        for attempt in 1..=attempts.max(1) {
            match self.health().await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    tracing::warn!(attempt, "Health check failed: {}", e);
                    last_error = e.to_string();
                }
            }
            if attempt < attempts {
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
        }

        Err(ClientError::ServerUnreachable(format!(
            "{} unreachable after {} attempts: {}",
            self.base_url, attempts, last_error
        )))
    }

    pub async fn upsert(&self, request: &UpsertRequest) -> Result<UpsertResponse, ClientError> {
        send_json(
            self.http
                .post(self.url(&["api", "agent-sessions", "upsert"])?)
                .json(request),
        )
        .await
    }

    /// Returns whether `delivery_id` is still the session's active delivery
    pub async fn heartbeat(&self, session_id: &str, delivery_id: &str) -> Result<bool, ClientError> {
        let response: HeartbeatResponse = send_json(
            self.http
                .post(self.url(&["api", "agent-sessions", session_id, "heartbeat"])?)
                .json(&json!({ "delivery_id": delivery_id })),
        )
        .await?;
        Ok(response.active)
    }

    pub async fn active(&self, session_id: &str) -> Result<Option<ActiveDelivery>, ClientError> {
        let response: ActiveResponse = send_json(
            self.http
                .get(self.url(&["api", "agent-sessions", session_id, "active"])?),
        )
        .await?;
        Ok(response.active)
    }

    pub async fn resolve(
        &self,
        delivery_id: &str,
        feedback_ids: &[String],
        handled_by: &str,
    ) -> Result<usize, ClientError> {
        let response: ResolveResponse = send_json(
            self.http
                .post(self.url(&["api", "deliveries", delivery_id, "feedback", "resolve"])?)
                .json(&json!({ "feedback_ids": feedback_ids, "handled_by": handled_by })),
        )
        .await?;
        Ok(response.resolved)
    }

    pub async fn cancel(
        &self,
        session_id: &str,
        delivery_id: &str,
        reason: &str,
    ) -> Result<bool, ClientError> {
        let response: CancelResponse = send_json(
            self.http
                .post(self.url(&["api", "agent-sessions", session_id, "cancel"])?)
                .json(&json!({ "delivery_id": delivery_id, "reason": reason })),
        )
        .await?;
        Ok(response.canceled)
    }
}

async fn send_json<T: DeserializeOwned>(request: RequestBuilder) -> Result<T, ClientError> {
    let response = request.send().await?;
    let status = response.status();
    let body = response.text().await?;

    if !status.is_success() {
        return Err(ClientError::Http {
            status: status.as_u16(),
            body,
        });
    }

    serde_json::from_str(&body).map_err(|e| ClientError::Decode(format!("{}: {}", e, body)))
}

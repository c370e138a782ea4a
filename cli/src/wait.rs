//! Agent-side wait protocol
//!
//! `creating` health-checks the server and upserts the delivery; `waiting`
//! heartbeats and polls until the reviewer responds, the delivery is replaced
//! or canceled, the deadline passes or the process is interrupted.

use serde_json::Value;
use std::future::Future;
use std::io::Write;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};

use crate::client::{ClientError, HandoffClient};
use crate::messages::{CancelReason, Outcome, UpsertRequest};

/// Timing knobs of the protocol
#[derive(Debug, Clone)]
pub struct WaitConfig {
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
    pub timeout: Duration,
    pub health_attempts: u32,
    pub health_backoff: Duration,
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            heartbeat_interval: Duration::from_secs(2),
            timeout: Duration::from_secs(300),
            health_attempts: 3,
            health_backoff: Duration::from_secs(1),
        }
    }
}

/// What the agent is handing off
#[derive(Debug, Clone)]
pub struct WaitRequest {
    pub agent_session_id: String,
    pub thread_id: String,
    pub title: String,
    pub content: Value,
    pub metadata: Option<Value>,
}

/// Emits the terminal line at most once
#[derive(Debug, Default)]
pub struct Finalizer {
    done: AtomicBool,
}

impl Finalizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write `outcome` as one JSON line. Returns false if a result was
    /// already emitted.
    pub fn finalize<W: Write>(&self, outcome: &Outcome, mut out: W) -> std::io::Result<bool> {
        if self.done.swap(true, Ordering::SeqCst) {
            return Ok(false);
        }
        let line = serde_json::to_string(outcome)?;
        writeln!(out, "{}", line)?;
        out.flush()?;
        Ok(true)
    }

    pub fn is_finalized(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }
}

/// Background heartbeat, stopped when dropped
struct Heartbeat(JoinHandle<()>);

impl Heartbeat {
    fn start(client: HandoffClient, session_id: String, delivery_id: String, every: Duration) -> Self {
        Self(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                if let Err(e) = client.heartbeat(&session_id, &delivery_id).await {
                    tracing::debug!("Heartbeat failed: {}", e);
                }
            }
        }))
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.0.abort();
    }
}

pub struct Waiter {
    client: HandoffClient,
    config: WaitConfig,
}

impl Waiter {
    pub fn new(client: HandoffClient, config: WaitConfig) -> Self {
        Self { client, config }
    }

    /// Run the protocol to a terminal outcome. `interrupt` resolving while
    /// waiting cancels the delivery; resolving while the delivery is still
    /// being created ends with an `interrupted` error.
    pub async fn run<I>(&self, request: WaitRequest, interrupt: I) -> Outcome
    where
        I: Future<Output = ()>,
    {
        let started = Instant::now();
        let deadline = started + self.config.timeout;
        tokio::pin!(interrupt);

        let created = tokio::select! {
            _ = &mut interrupt => {
                tracing::info!("Interrupted before the delivery was created");
                return Outcome::error("interrupted", "interrupted before the delivery was created");
            }
            created = self.create(request.clone()) => created,
        };
        let delivery_id = match created {
            Ok(id) => id,
            Err(e) => {
                tracing::error!("Could not create delivery: {}", e);
                return Outcome::error(e.code(), e.to_string());
            }
        };
        tracing::info!(delivery_id = %delivery_id, "Waiting for reviewer");

        self.wait(&request.agent_session_id, delivery_id, deadline, interrupt)
            .await
    }

    async fn create(&self, request: WaitRequest) -> Result<String, ClientError> {
        if request.title.trim().is_empty() {
            return Err(ClientError::Validation("--title is required".to_string()));
        }
        if request.agent_session_id.trim().is_empty() {
            return Err(ClientError::Validation(
                "--agent-session-id is required".to_string(),
            ));
        }

        self.client
            .health_with_retry(self.config.health_attempts, self.config.health_backoff)
            .await?;

        let response = self
            .client
            .upsert(&UpsertRequest {
                agent_session_id: request.agent_session_id,
                thread_id: Some(request.thread_id),
                title: request.title,
                content: request.content,
                metadata: request.metadata,
            })
            .await?;

        if let Some(replaced) = &response.replaced {
            tracing::info!(replaced = %replaced, "Superseded an earlier delivery");
        }
        Ok(response.id)
    }

    async fn wait<I>(
        &self,
        session_id: &str,
        delivery_id: String,
        deadline: Instant,
        mut interrupt: Pin<&mut I>,
    ) -> Outcome
    where
        I: Future<Output = ()>,
    {
        let _heartbeat = Heartbeat::start(
            self.client.clone(),
            session_id.to_string(),
            delivery_id.clone(),
            self.config.heartbeat_interval,
        );

        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = &mut interrupt => {
                    tracing::info!(delivery_id = %delivery_id, "Interrupted");
                    self.cancel_quietly(session_id, &delivery_id, "interrupted").await;
                    return Outcome::Canceled {
                        delivery_id,
                        reason: CancelReason::Interrupted,
                    };
                }
                _ = sleep_until(deadline) => {
                    tracing::info!(delivery_id = %delivery_id, "Timed out waiting for feedback");
                    self.cancel_quietly(session_id, &delivery_id, "timeout").await;
                    return Outcome::Timeout {
                        delivery_id,
                        timeout_secs: self.config.timeout.as_secs(),
                    };
                }
                _ = ticker.tick() => {
                    if let Some(outcome) = self.poll(session_id, &delivery_id).await {
                        return outcome;
                    }
                }
            }
        }
    }

    /// One poll. `None` keeps waiting.
    async fn poll(&self, session_id: &str, delivery_id: &str) -> Option<Outcome> {
        let active = match self.client.active(session_id).await {
            Ok(active) => active,
            Err(e) => {
                tracing::warn!("Poll failed: {}", e);
                return None;
            }
        };

        let Some(active) = active else {
            return Some(Outcome::Canceled {
                delivery_id: delivery_id.to_string(),
                reason: CancelReason::NoActiveDelivery,
            });
        };

        if active.delivery_id != delivery_id {
            return Some(Outcome::Replaced {
                delivery_id: delivery_id.to_string(),
                replaced_by: active.delivery_id,
            });
        }

        if active.pending_feedback.is_empty() {
            return None;
        }

        let ids: Vec<String> = active.pending_feedback.iter().map(|f| f.id.clone()).collect();
        if let Err(e) = self.client.resolve(delivery_id, &ids, session_id).await {
            tracing::warn!("Could not resolve feedback, retrying: {}", e);
            return None;
        }
        self.cancel_quietly(session_id, delivery_id, "responded").await;

        Some(Outcome::Responded {
            delivery_id: delivery_id.to_string(),
            feedback: active.pending_feedback,
        })
    }

    async fn cancel_quietly(&self, session_id: &str, delivery_id: &str, reason: &str) {
        if let Err(e) = self.client.cancel(session_id, delivery_id, reason).await {
            tracing::debug!("Cancel ({}) failed: {}", reason, e);
        }
    }
}

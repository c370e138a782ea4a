//! Real-time channel for reviewer UIs
//!
//! Each socket is one hub subscriber. Frames are `{"event", "data"}` objects;
//! the only client message understood is `{"type": "ping"}`.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

use crate::hub::{EventKind, HubEvent};
use crate::AppState;

/// Messages a viewer may send
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    Ping,
}

/// WebSocket handler
pub async fn handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    // Subscribe before loading the replay set so nothing emitted in between is lost
    let mut subscription = state.hub.connect();
    match state.sessions.blocking_pending().await {
        Ok(entries) => subscription.replay(
            entries
                .into_iter()
                .map(|entry| HubEvent::new(EventKind::NewDelivery, entry))
                .collect(),
        ),
        Err(e) => tracing::warn!("Could not load blocking deliveries for replay: {}", e),
    }

    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            event = subscription.recv() => {
                let Some(event) = event else { break };
                if let Err(e) = send(&mut sender, &event).await {
                    tracing::debug!(subscriber = subscription.id, "Send failed: {}", e);
                    break;
                }
            }
            msg = receiver.next() => {
                let text = match msg {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        tracing::debug!(subscriber = subscription.id, "WebSocket error: {}", e);
                        break;
                    }
                };

                match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(ClientMessage::Ping) => {
                        let pong = HubEvent::new(EventKind::Pong, json!({}));
                        if send(&mut sender, &pong).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::debug!(subscriber = subscription.id, "Ignoring client message: {}", e);
                    }
                }
            }
        }
    }

    state.hub.disconnect(subscription.id);
}

async fn send(
    sender: &mut SplitSink<WebSocket, Message>,
    event: &HubEvent,
) -> Result<(), axum::Error> {
    let text = serde_json::to_string(event).map_err(axum::Error::new)?;
    sender.send(Message::Text(text)).await
}

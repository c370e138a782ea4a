//! Wait protocol tests, against scripted responses and a live server

use handoff::config::ServerConfig;
use handoff::models::{FeedbackInput, FeedbackKind};
use handoff::sessions::UpsertRequest;
use handoff::AppState;
use handoff_cli::{CancelReason, HandoffClient, Outcome, WaitConfig, WaitRequest, Waiter};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn fast_config(timeout: Duration) -> WaitConfig {
    WaitConfig {
        poll_interval: Duration::from_millis(50),
        heartbeat_interval: Duration::from_millis(50),
        timeout,
        health_attempts: 3,
        health_backoff: Duration::from_millis(10),
    }
}

fn request(session: &str) -> WaitRequest {
    WaitRequest {
        agent_session_id: session.to_string(),
        thread_id: "thread-1".to_string(),
        title: "Which layout?".to_string(),
        content: json!({"type": "generated_html", "html": "<p>A or B</p>"}),
        metadata: Some(json!({"project_name": "cli-tests"})),
    }
}

async fn scripted_server(active: serde_json::Value) -> MockServer {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "ok"})))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/agent-sessions/upsert"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "dlv_mine",
            "url": "http://localhost/deliveries/dlv_mine",
            "replaced": null
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/agent-sessions/agent-1/heartbeat"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"active": true})))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/agent-sessions/agent-1/active"))
        .respond_with(ResponseTemplate::new(200).set_body_json(active))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/agent-sessions/agent-1/cancel"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"canceled": true})))
        .mount(&server)
        .await;

    server
}

async fn live_server() -> (Arc<AppState>, HandoffClient, TempDir) {
    let dir = TempDir::new().unwrap();
    let state = AppState::new(ServerConfig::with_data_dir(dir.path()));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server_state = state.clone();
    tokio::spawn(async move {
        handoff::serve(listener, server_state, std::future::pending())
            .await
            .unwrap();
    });

    let client = HandoffClient::new(format!("http://{}", addr)).unwrap();
    (state, client, dir)
}

/// Wait until the session has an active delivery and return its id
async fn active_delivery(state: &AppState, session: &str) -> String {
    for _ in 0..100 {
        if let Some(active) = state.sessions.active(session).await.unwrap() {
            return active.delivery_id;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("session {} never became active", session);
}

#[tokio::test]
async fn test_no_active_delivery_cancels() {
    let server = scripted_server(json!({"active": null})).await;
    let waiter = Waiter::new(
        HandoffClient::new(server.uri()).unwrap(),
        fast_config(Duration::from_secs(5)),
    );

    let outcome = waiter.run(request("agent-1"), std::future::pending()).await;
    assert_eq!(
        outcome,
        Outcome::Canceled {
            delivery_id: "dlv_mine".into(),
            reason: CancelReason::NoActiveDelivery,
        }
    );
}

#[tokio::test]
async fn test_other_active_delivery_means_replaced() {
    let server = scripted_server(json!({
        "active": {"delivery_id": "dlv_newer", "pending_feedback": [], "pending_feedback_count": 0}
    }))
    .await;
    let waiter = Waiter::new(
        HandoffClient::new(server.uri()).unwrap(),
        fast_config(Duration::from_secs(5)),
    );

    let outcome = waiter.run(request("agent-1"), std::future::pending()).await;
    assert_eq!(
        outcome,
        Outcome::Replaced {
            delivery_id: "dlv_mine".into(),
            replaced_by: "dlv_newer".into(),
        }
    );
}

#[tokio::test]
async fn test_unreachable_server_is_an_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(503))
        .expect(3)
        .mount(&server)
        .await;

    let waiter = Waiter::new(
        HandoffClient::new(server.uri()).unwrap(),
        fast_config(Duration::from_secs(5)),
    );
    let outcome = waiter.run(request("agent-1"), std::future::pending()).await;

    match &outcome {
        Outcome::Error { code, .. } => assert_eq!(code, "server_unreachable"),
        other => panic!("expected error, got {:?}", other),
    }
    assert_eq!(outcome.exit_code(), 1);
}

#[tokio::test]
async fn test_upsert_rejection_is_reported() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/agent-sessions/upsert"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": {"code": "invalid_content", "message": "content.html must be a non-empty string"}
        })))
        .mount(&server)
        .await;

    let waiter = Waiter::new(
        HandoffClient::new(server.uri()).unwrap(),
        fast_config(Duration::from_secs(5)),
    );
    let outcome = waiter.run(request("agent-1"), std::future::pending()).await;
    assert!(matches!(outcome, Outcome::Error { ref code, .. } if code == "invalid_content"));
}

#[tokio::test]
async fn test_times_out_not_before_deadline() {
    let (state, client, _dir) = live_server().await;
    let timeout = Duration::from_millis(800);
    let waiter = Waiter::new(client, fast_config(timeout));

    let started = Instant::now();
    let outcome = waiter.run(request("agent-1"), std::future::pending()).await;
    let elapsed = started.elapsed();

    assert!(matches!(outcome, Outcome::Timeout { .. }), "got {:?}", outcome);
    assert!(elapsed >= timeout, "returned after {:?}", elapsed);

    // Timed-out session is released server-side
    assert!(state.sessions.active("agent-1").await.unwrap().is_none());
}

#[tokio::test]
async fn test_responded_with_feedback() {
    let (state, client, _dir) = live_server().await;
    let waiter = Waiter::new(client, fast_config(Duration::from_secs(10)));

    let wait = tokio::spawn(async move { waiter.run(request("agent-1"), std::future::pending()).await });

    let delivery_id = active_delivery(&state, "agent-1").await;
    let ids = state
        .repo
        .commit_feedback(
            &delivery_id,
            vec![FeedbackInput {
                kind: FeedbackKind::Interactive,
                payload: json!({"choice": "B"}),
                target: None,
            }],
        )
        .await
        .unwrap();

    let outcome = wait.await.unwrap();
    match outcome {
        Outcome::Responded {
            delivery_id: responded,
            feedback,
        } => {
            assert_eq!(responded, delivery_id);
            assert_eq!(feedback.len(), 1);
            assert_eq!(feedback[0].id, ids[0]);
            assert_eq!(feedback[0].payload["choice"], "B");
        }
        other => panic!("expected responded, got {:?}", other),
    }

    let detail = state.repo.detail(&delivery_id).await.unwrap();
    assert_eq!(detail.pending_feedback_count, 0);
    assert_eq!(detail.feedback[0].handled_by.as_deref(), Some("agent-1"));
    assert!(state.sessions.active("agent-1").await.unwrap().is_none());
}

#[tokio::test]
async fn test_second_upsert_replaces_waiting_process() {
    let (state, client, _dir) = live_server().await;
    let waiter = Waiter::new(client, fast_config(Duration::from_secs(10)));

    let wait = tokio::spawn(async move { waiter.run(request("agent-1"), std::future::pending()).await });
    let first = active_delivery(&state, "agent-1").await;

    let second = state
        .sessions
        .upsert(UpsertRequest {
            agent_session_id: "agent-1".to_string(),
            thread_id: Some("thread-1".to_string()),
            title: "Which layout? (v2)".to_string(),
            content: json!({"type": "generated_html", "html": "<p>A, B or C</p>"}),
            metadata: None,
        })
        .await
        .unwrap();

    let outcome = wait.await.unwrap();
    assert_eq!(
        outcome,
        Outcome::Replaced {
            delivery_id: first,
            replaced_by: second.id,
        }
    );
}

#[tokio::test]
async fn test_interrupt_cancels_delivery() {
    let (state, client, _dir) = live_server().await;
    let waiter = Waiter::new(client, fast_config(Duration::from_secs(10)));
    let (tx, rx) = tokio::sync::oneshot::channel::<()>();

    let wait = tokio::spawn(async move {
        waiter
            .run(request("agent-1"), async {
                let _ = rx.await;
            })
            .await
    });
    let delivery_id = active_delivery(&state, "agent-1").await;
    tx.send(()).unwrap();

    let outcome = wait.await.unwrap();
    assert_eq!(
        outcome,
        Outcome::Canceled {
            delivery_id: delivery_id.clone(),
            reason: CancelReason::Interrupted,
        }
    );
    assert!(state.sessions.active("agent-1").await.unwrap().is_none());

    let events = state.repo.execution_events(&delivery_id).await.unwrap();
    assert_eq!(
        events.last().unwrap().meta.as_ref().unwrap()["reason"],
        "interrupted"
    );
}

#[tokio::test]
async fn test_session_id_with_reserved_characters() {
    let (state, client, _dir) = live_server().await;
    let session = "team/1#x ?%";
    let waiter = Waiter::new(client, fast_config(Duration::from_secs(10)));

    let wait = tokio::spawn(async move { waiter.run(request(session), std::future::pending()).await });

    let delivery_id = active_delivery(&state, session).await;
    state
        .repo
        .commit_feedback(
            &delivery_id,
            vec![FeedbackInput {
                kind: FeedbackKind::Interactive,
                payload: json!({"choice": "A"}),
                target: None,
            }],
        )
        .await
        .unwrap();

    let outcome = wait.await.unwrap();
    assert!(
        matches!(outcome, Outcome::Responded { delivery_id: ref responded, .. } if *responded == delivery_id),
        "got {:?}",
        outcome
    );

    let detail = state.repo.detail(&delivery_id).await.unwrap();
    assert_eq!(detail.feedback[0].handled_by.as_deref(), Some(session));
    assert!(state.sessions.active(session).await.unwrap().is_none());
}

#[tokio::test]
async fn test_interrupt_during_health_check() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/agent-sessions/upsert"))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&server)
        .await;

    let waiter = Waiter::new(
        HandoffClient::new(server.uri()).unwrap(),
        fast_config(Duration::from_secs(30)),
    );
    let started = Instant::now();
    let outcome = waiter
        .run(
            request("agent-1"),
            tokio::time::sleep(Duration::from_millis(100)),
        )
        .await;

    assert!(started.elapsed() < Duration::from_secs(2), "interrupt was not observed");
    match &outcome {
        Outcome::Error { code, .. } => assert_eq!(code, "interrupted"),
        other => panic!("expected interrupted error, got {:?}", other),
    }
    assert_eq!(outcome.exit_code(), 1);
}

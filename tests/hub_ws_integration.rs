//! Integration tests for the hub's agent socket.
//!
//! Each test spins up the hub router on a random port, connects fake agents
//! via tokio-tungstenite, and exercises the real wire contract.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use secrecy::SecretString;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use uuid::Uuid;

use agent_link::config::HubConfig;
use agent_link::error::HubError;
use agent_link::hub::{AgentHub, ChannelEvents, CompletionStatus, HubEvent};

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(5);

type Ws = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

fn test_config() -> HubConfig {
    HubConfig {
        ack_timeout: Duration::from_secs(2),
        disconnect_grace: Duration::from_millis(200),
        ..HubConfig::default()
    }
}

/// Start the hub on a random port, return (port, hub, events).
async fn start_hub(config: HubConfig) -> (u16, Arc<AgentHub>, mpsc::UnboundedReceiver<HubEvent>) {
    let (events, rx) = ChannelEvents::new();
    let hub = AgentHub::new(config, Arc::new(events));
    let app = hub.router();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    // Give the server a moment to start accepting connections.
    tokio::time::sleep(Duration::from_millis(50)).await;

    (port, hub, rx)
}

async fn send_json(ws: &mut Ws, value: Value) {
    ws.send(Message::Text(value.to_string().into())).await.unwrap();
}

/// Next text frame as JSON; `None` on close.
async fn recv_json(ws: &mut Ws) -> Option<Value> {
    while let Some(frame) = ws.next().await {
        match frame.unwrap() {
            Message::Text(text) => return Some(serde_json::from_str(text.as_str()).unwrap()),
            Message::Close(_) => return None,
            _ => {}
        }
    }
    None
}

/// Connect and register; returns the socket and the hub's reply.
async fn register(port: u16, name: &str, secret: &str) -> (Ws, Value) {
    let url = format!("ws://127.0.0.1:{}/ws/agent", port);
    let (mut ws, _) = connect_async(&url).await.unwrap();
    send_json(
        &mut ws,
        json!({
            "type": "register",
            "name": name,
            "secret": secret,
            "cwd": "/home/dev",
            "projects": ["/home/dev/app"],
            "version": 1
        }),
    )
    .await;
    let reply = recv_json(&mut ws).await.unwrap();
    (ws, reply)
}

/// Fake agent side of a dispatch: read the task frame and ack it.
async fn ack_next_task(ws: &mut Ws) -> Uuid {
    let task = recv_json(ws).await.unwrap();
    assert_eq!(task["type"], "task");
    let task_id: Uuid = task["task_id"].as_str().unwrap().parse().unwrap();
    send_json(ws, json!({"type": "ack", "task_id": task_id})).await;
    task_id
}

async fn next_completion(events: &mut mpsc::UnboundedReceiver<HubEvent>) -> agent_link::hub::TaskCompletion {
    loop {
        if let HubEvent::Completed(c) = events.recv().await.unwrap() {
            return c;
        }
    }
}

#[tokio::test]
async fn register_then_listed() {
    timeout(TEST_TIMEOUT, async {
        let (port, hub, _events) = start_hub(test_config()).await;
        let (_ws, reply) = register(port, "mac", "").await;

        assert_eq!(reply["type"], "registered");
        assert_eq!(reply["version"], 1);

        let agents = hub.list_connections().await;
        assert_eq!(agents.len(), 1);
        assert_eq!(agents[0].name, "mac");
        assert_eq!(agents[0].cwd, "/home/dev");
        assert_eq!(agents[0].projects, vec!["/home/dev/app".to_string()]);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn wrong_secret_is_rejected_and_closed() {
    timeout(TEST_TIMEOUT, async {
        let config = HubConfig {
            secret: Some(SecretString::from("right".to_string())),
            ..test_config()
        };
        let (port, hub, _events) = start_hub(config).await;
        let (mut ws, reply) = register(port, "mac", "wrong").await;

        assert_eq!(reply["type"], "rejected");
        assert_eq!(reply["reason"], "invalid secret");
        assert!(recv_json(&mut ws).await.is_none());
        assert!(hub.list_connections().await.is_empty());
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn first_frame_must_be_register() {
    timeout(TEST_TIMEOUT, async {
        let (port, hub, _events) = start_hub(test_config()).await;
        let url = format!("ws://127.0.0.1:{}/ws/agent", port);
        let (mut ws, _) = connect_async(&url).await.unwrap();

        send_json(&mut ws, json!({"type": "heartbeat", "task_id": Uuid::new_v4()})).await;
        let reply = recv_json(&mut ws).await.unwrap();
        assert_eq!(reply["type"], "rejected");
        assert!(hub.list_connections().await.is_empty());
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn dispatch_ack_result_roundtrip() {
    timeout(TEST_TIMEOUT, async {
        let (port, hub, mut events) = start_hub(test_config()).await;
        let (mut ws, _) = register(port, "mac", "").await;

        let dispatch = {
            let hub = Arc::clone(&hub);
            tokio::spawn(async move { hub.dispatch("mac", "run the tests", "app").await })
        };
        let task_id = ack_next_task(&mut ws).await;
        assert_eq!(dispatch.await.unwrap().unwrap(), task_id);

        match events.recv().await.unwrap() {
            HubEvent::Started {
                task_id: id,
                agent,
                prompt_preview,
            } => {
                assert_eq!(id, task_id);
                assert_eq!(agent, "mac");
                assert_eq!(prompt_preview, "run the tests");
            }
            other => panic!("expected started, got {other:?}"),
        }

        send_json(&mut ws, json!({"type": "heartbeat", "task_id": task_id})).await;
        send_json(
            &mut ws,
            json!({
                "type": "result",
                "task_id": task_id,
                "output": "all green",
                "exit_code": 0,
                "duration_ms": 1200
            }),
        )
        .await;

        let completion = next_completion(&mut events).await;
        assert_eq!(completion.task_id, task_id);
        assert_eq!(completion.status, CompletionStatus::Succeeded);
        assert_eq!(completion.output, "all green");
        assert!(!completion.orphaned);
        assert_eq!(hub.list_connections().await[0].active_tasks, 0);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn spawn_failure_ack_fails_dispatch() {
    timeout(TEST_TIMEOUT, async {
        let (port, hub, _events) = start_hub(test_config()).await;
        let (mut ws, _) = register(port, "mac", "").await;

        let dispatch = {
            let hub = Arc::clone(&hub);
            tokio::spawn(async move { hub.dispatch("mac", "x", "/nope").await })
        };
        let task = recv_json(&mut ws).await.unwrap();
        send_json(
            &mut ws,
            json!({"type": "ack", "task_id": task["task_id"], "error": "directory not found"}),
        )
        .await;

        match dispatch.await.unwrap() {
            Err(HubError::SpawnFailure { reason, .. }) => assert_eq!(reason, "directory not found"),
            other => panic!("expected spawn failure, got {other:?}"),
        }
        assert_eq!(hub.list_connections().await[0].active_tasks, 0);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn concurrent_tasks_are_counted() {
    timeout(TEST_TIMEOUT, async {
        let (port, hub, mut events) = start_hub(test_config()).await;
        let (mut ws, _) = register(port, "mac", "").await;
        let active = || {
            let hub = Arc::clone(&hub);
            async move { hub.list_connections().await[0].active_tasks }
        };
        assert_eq!(active().await, 0);

        let mut ids = Vec::new();
        for prompt in ["first", "second"] {
            let hub = Arc::clone(&hub);
            let dispatch = tokio::spawn(async move { hub.dispatch("mac", prompt, "").await });
            ids.push(ack_next_task(&mut ws).await);
            dispatch.await.unwrap().unwrap();
            assert_eq!(active().await, ids.len());
        }

        for (done, id) in ids.iter().enumerate() {
            send_json(
                &mut ws,
                json!({"type": "result", "task_id": id, "output": "ok", "exit_code": 0}),
            )
            .await;
            assert_eq!(next_completion(&mut events).await.task_id, *id);
            assert_eq!(active().await, ids.len() - done - 1);
        }
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn kill_produces_killed_completion() {
    timeout(TEST_TIMEOUT, async {
        let (port, hub, mut events) = start_hub(test_config()).await;
        let (mut ws, _) = register(port, "mac", "").await;

        let dispatch = {
            let hub = Arc::clone(&hub);
            tokio::spawn(async move { hub.dispatch("mac", "long job", "").await })
        };
        let task_id = ack_next_task(&mut ws).await;
        dispatch.await.unwrap().unwrap();

        hub.kill(task_id).await.unwrap();
        let kill = recv_json(&mut ws).await.unwrap();
        assert_eq!(kill["type"], "kill");
        assert_eq!(kill["task_id"], task_id.to_string());

        send_json(&mut ws, json!({"type": "killed", "task_id": task_id})).await;
        let completion = next_completion(&mut events).await;
        assert_eq!(completion.status, CompletionStatus::Killed);

        assert!(matches!(
            hub.kill(task_id).await,
            Err(HubError::TaskNotFound { .. })
        ));
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn reconnect_replaces_old_connection() {
    timeout(TEST_TIMEOUT, async {
        let (port, hub, mut events) = start_hub(test_config()).await;
        let (mut old, _) = register(port, "mac", "").await;

        let dispatch = {
            let hub = Arc::clone(&hub);
            tokio::spawn(async move { hub.dispatch("mac", "stranded", "").await })
        };
        let task_id = ack_next_task(&mut old).await;
        dispatch.await.unwrap().unwrap();

        let (mut new, reply) = register(port, "mac", "").await;
        assert_eq!(reply["type"], "registered");

        // Old socket gets closed by the hub.
        assert!(recv_json(&mut old).await.is_none());

        let agents = hub.list_connections().await;
        assert_eq!(agents.len(), 1);
        assert_eq!(agents[0].active_tasks, 0);

        let orphans = hub.registry().orphans().await;
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].task_id, task_id);

        // A late result for the stranded task arrives on the new socket.
        send_json(
            &mut new,
            json!({"type": "result", "task_id": task_id, "output": "late", "exit_code": 0}),
        )
        .await;
        let completion = next_completion(&mut events).await;
        assert_eq!(completion.task_id, task_id);
        assert!(completion.orphaned);
        assert!(hub.registry().orphans().await.is_empty());
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn hub_sends_transport_pings() {
    timeout(TEST_TIMEOUT, async {
        let config = HubConfig {
            ping_interval: Duration::from_millis(100),
            ..test_config()
        };
        let (port, _hub, _events) = start_hub(config).await;
        let (mut ws, _) = register(port, "mac", "").await;

        loop {
            match ws.next().await.unwrap().unwrap() {
                Message::Ping(_) => break,
                other => panic!("unexpected frame {other:?}"),
            }
        }
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn unknown_frames_are_skipped() {
    timeout(TEST_TIMEOUT, async {
        let (port, hub, _events) = start_hub(test_config()).await;
        let (mut ws, _) = register(port, "mac", "").await;

        send_json(&mut ws, json!({"type": "from_the_future", "x": 1})).await;
        ws.send(Message::Text("not json".into())).await.unwrap();
        send_json(&mut ws, json!({"type": "ping"})).await;

        let reply = recv_json(&mut ws).await.unwrap();
        assert_eq!(reply["type"], "pong");
        assert_eq!(hub.list_connections().await.len(), 1);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn disconnect_alert_after_grace() {
    timeout(TEST_TIMEOUT, async {
        let (port, hub, mut events) = start_hub(test_config()).await;
        let (mut ws, _) = register(port, "mac", "").await;
        ws.close(None).await.unwrap();

        match events.recv().await.unwrap() {
            HubEvent::Connection(text) => assert!(text.contains("mac")),
            other => panic!("expected connection event, got {other:?}"),
        }
        assert!(hub.list_connections().await.is_empty());
    })
    .await
    .expect("test timed out");
}

//! Agent WebSocket endpoint.
//!
//! Each socket gets a reader loop (this task) and a single writer task fed by
//! an mpsc queue. Nothing but the writer touches the sink.

use std::sync::Arc;

use axum::{
    Router,
    extract::{
        State,
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade, close_code},
    },
    response::IntoResponse,
    routing::get,
};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::AgentHub;
use super::coordinator::TaskResult;
use super::registry::AgentConnection;
use crate::error::HubError;
use crate::protocol::{AgentMessage, MAX_FRAME_BYTES, Outbound, PROTOCOL_VERSION};
use crate::transport::{WireFrame, write_loop};

/// Outbound queue depth per connection.
const OUTBOUND_BUFFER: usize = 64;

pub fn socket_routes(hub: Arc<AgentHub>) -> Router {
    Router::new()
        .route("/ws/agent", get(agent_ws_handler))
        .with_state(hub)
}

async fn agent_ws_handler(
    ws: WebSocketUpgrade,
    State(hub): State<Arc<AgentHub>>,
) -> impl IntoResponse {
    debug!("Agent socket connecting");
    ws.max_message_size(MAX_FRAME_BYTES)
        .max_frame_size(MAX_FRAME_BYTES)
        .on_upgrade(move |socket| handle_agent_socket(socket, hub))
}

struct Registration {
    name: String,
    secret: String,
    cwd: String,
    projects: Vec<String>,
    version: u32,
}

async fn handle_agent_socket(socket: WebSocket, hub: Arc<AgentHub>) {
    let config = hub.config().clone();
    let (mut sink, mut stream) = socket.split();

    let reg = match timeout(config.register_timeout, read_registration(&mut stream)).await {
        Ok(Ok(reg)) => reg,
        Ok(Err(reason)) => {
            warn!(reason = %reason, "Agent handshake failed");
            reject(&mut sink, &reason).await;
            return;
        }
        Err(_) => {
            warn!(
                timeout_secs = config.register_timeout.as_secs(),
                "No register frame in time, closing socket"
            );
            reject(&mut sink, "registration timed out").await;
            return;
        }
    };

    let version = if reg.version == 0 { PROTOCOL_VERSION } else { reg.version };
    if version != PROTOCOL_VERSION {
        warn!(
            agent = %reg.name,
            agent_version = version,
            hub_version = PROTOCOL_VERSION,
            "Protocol version mismatch, continuing"
        );
    }

    let (tx, rx) = mpsc::channel(OUTBOUND_BUFFER);
    let conn = Arc::new(AgentConnection::new(
        hub.registry().next_conn_id(),
        reg.name,
        reg.cwd,
        reg.projects,
        tx,
    ));

    // Queued ahead of anything the registry can route once the name is live.
    if conn
        .send(AgentMessage::Registered {
            version: PROTOCOL_VERSION,
        })
        .await
        .is_err()
    {
        return;
    }

    if let Err(e) = hub.registry().register(Arc::clone(&conn), &reg.secret).await {
        let reason = match e {
            HubError::AuthRejected { reason, .. } => reason,
            other => other.to_string(),
        };
        warn!(agent = %conn.name, reason = %reason, "Agent registration rejected");
        reject(&mut sink, &reason).await;
        return;
    }

    let mut writer = tokio::spawn(write_loop::<_, Message>(
        sink,
        rx,
        conn.name.clone(),
        config.ping_interval,
        config.write_timeout,
    ));

    loop {
        tokio::select! {
            frame = timeout(config.read_timeout, stream.next()) => {
                let frame = match frame {
                    Ok(Some(Ok(frame))) => frame,
                    Ok(Some(Err(e))) => {
                        warn!(agent = %conn.name, error = %e, "Agent socket error");
                        break;
                    }
                    Ok(None) => break,
                    Err(_) => {
                        warn!(
                            agent = %conn.name,
                            timeout_secs = config.read_timeout.as_secs(),
                            "Agent read deadline expired"
                        );
                        break;
                    }
                };

                match frame {
                    Message::Text(text) => handle_frame(&hub, &conn, text.as_str()).await,
                    Message::Ping(data) => {
                        conn.enqueue(Outbound::Pong(data.to_vec())).await;
                    }
                    Message::Pong(_) => {}
                    Message::Close(_) => break,
                    Message::Binary(_) => {
                        debug!(agent = %conn.name, "Ignoring binary frame");
                    }
                }
            }

            _ = &mut writer => {
                debug!(agent = %conn.name, "Writer finished, closing reader");
                break;
            }
        }
    }

    hub.registry().unregister(&conn).await;
    writer.abort();
    info!(agent = %conn.name, conn_id = conn.id(), "Agent socket closed");
}

/// Wait for the first text frame and require it to be `register`.
async fn read_registration(
    stream: &mut SplitStream<WebSocket>,
) -> std::result::Result<Registration, String> {
    loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => {
                return match AgentMessage::from_json(text.as_str()) {
                    Ok(AgentMessage::Register {
                        name,
                        secret,
                        cwd,
                        projects,
                        version,
                    }) => {
                        if name.trim().is_empty() {
                            Err("agent name is empty".to_string())
                        } else {
                            Ok(Registration {
                                name,
                                secret,
                                cwd,
                                projects,
                                version,
                            })
                        }
                    }
                    Ok(other) => Err(format!("expected register, got {}", other.kind())),
                    Err(e) => Err(format!("invalid register frame: {e}")),
                };
            }
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            Some(Ok(Message::Close(_))) | None => return Err("closed before register".to_string()),
            Some(Ok(Message::Binary(_))) => return Err("expected register, got binary".to_string()),
            Some(Err(e)) => return Err(e.to_string()),
        }
    }
}

/// Send `rejected` and a close frame straight on the sink. Only used before
/// the writer task exists.
async fn reject(sink: &mut SplitSink<WebSocket, Message>, reason: &str) {
    let msg = AgentMessage::Rejected {
        reason: reason.to_string(),
    };
    if let Ok(json) = msg.to_json() {
        let _ = sink.send(Message::Text(json.into())).await;
    }
    let _ = sink
        .send(Message::Close(Some(CloseFrame {
            code: close_code::POLICY,
            reason: reason.to_string().into(),
        })))
        .await;
}

impl WireFrame for Message {
    fn text(json: String) -> Self {
        Message::Text(json.into())
    }

    fn ping() -> Self {
        Message::Ping(Vec::new().into())
    }

    fn pong(data: Vec<u8>) -> Self {
        Message::Pong(data.into())
    }

    fn close(reason: String) -> Self {
        Message::Close(Some(CloseFrame {
            code: close_code::NORMAL,
            reason: reason.into(),
        }))
    }
}

/// Route one inbound text frame. Never fails the connection.
async fn handle_frame(hub: &Arc<AgentHub>, conn: &Arc<AgentConnection>, text: &str) {
    let msg = match AgentMessage::from_json(text) {
        Ok(msg) => msg,
        Err(e) => {
            debug!(agent = %conn.name, error = %e, "Unrecognized frame from agent");
            return;
        }
    };

    let coordinator = hub.coordinator();
    match msg {
        AgentMessage::Ack { task_id, error } => {
            coordinator.handle_ack(conn, task_id, error).await;
        }
        AgentMessage::Heartbeat { task_id } => {
            coordinator.handle_heartbeat(conn, task_id).await;
        }
        AgentMessage::Result {
            task_id,
            output,
            exit_code,
            error,
            duration_ms,
            killed,
        } => {
            coordinator
                .handle_result(
                    conn,
                    TaskResult {
                        task_id,
                        output,
                        exit_code,
                        error,
                        duration_ms,
                        killed,
                    },
                )
                .await;
        }
        AgentMessage::Killed { task_id } => {
            coordinator.handle_killed(conn, task_id).await;
        }
        AgentMessage::Projects {
            request_id,
            projects,
        } => {
            coordinator.handle_projects(request_id, projects).await;
        }
        AgentMessage::FileUpload {
            task_id,
            filename,
            size,
            content,
        } => {
            debug!(agent = %conn.name, task_id = %task_id, filename = %filename, size, "File upload");
            // Awaited inline so artifacts land before the task's result.
            hub.uploads()
                .store(&conn.name, task_id, &filename, &content)
                .await;
        }
        AgentMessage::Ping => {
            let _ = conn.send(AgentMessage::Pong).await;
        }
        AgentMessage::Pong => {}
        other => {
            debug!(agent = %conn.name, kind = other.kind(), "Unexpected message from agent");
        }
    }
}

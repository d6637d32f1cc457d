//! Worker runtime: hub connection loop and per-task supervisors.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::stream::SplitStream;
use futures::{SinkExt, StreamExt};
use secrecy::ExposeSecret;
use tokio::net::TcpStream;
use tokio::sync::{RwLock, mpsc, oneshot};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::artifacts;
use super::delivery::deliver_with_retry;
use super::link::HubLink;
use super::process::{TaskProcess, resolve_dir};
use super::projects::discover_projects;
use crate::config::WorkerConfig;
use crate::error::WorkerError;
use crate::protocol::{AgentMessage, Outbound, PROTOCOL_VERSION};
use crate::transport::{WireFrame, write_loop};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Outbound queue depth.
const OUTBOUND_BUFFER: usize = 64;

/// Per-frame write deadline.
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Handle on a running task, held until the task ends or is killed.
struct RunningTask {
    kill_tx: oneshot::Sender<()>,
}

pub struct WorkerRuntime {
    config: WorkerConfig,
    link: HubLink,
    /// Active set. Whoever removes an entry decides the task's terminal message.
    tasks: RwLock<HashMap<Uuid, RunningTask>>,
    generation: AtomicU64,
}

impl WorkerRuntime {
    pub fn new(config: WorkerConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            link: HubLink::new(),
            tasks: RwLock::new(HashMap::new()),
            generation: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub async fn running_count(&self) -> usize {
        self.tasks.read().await.len()
    }

    pub async fn is_connected(&self) -> bool {
        self.link.is_connected().await
    }

    /// Connect and serve until the hub rejects this worker. Transport
    /// failures reconnect after a fixed delay.
    pub async fn run(self: Arc<Self>) -> Result<(), WorkerError> {
        info!(
            name = %self.config.name,
            url = %self.config.hub_url,
            workdir = %self.config.workdir.display(),
            "Worker starting"
        );
        loop {
            match self.connect_once().await {
                Ok(()) => info!("Hub connection closed"),
                Err(WorkerError::AuthRejected { reason }) => {
                    error!(reason = %reason, "Hub rejected registration, not reconnecting");
                    return Err(WorkerError::AuthRejected { reason });
                }
                Err(e) => warn!(error = %e, "Hub connection lost"),
            }
            info!(
                delay_secs = self.config.reconnect_delay.as_secs(),
                "Reconnecting"
            );
            tokio::time::sleep(self.config.reconnect_delay).await;
        }
    }

    /// One connection lifetime: handshake, then read until the socket ends.
    pub async fn connect_once(self: &Arc<Self>) -> Result<(), WorkerError> {
        let (ws, _) = connect_async(self.config.hub_url.as_str()).await?;
        let (mut sink, mut stream) = ws.split();

        let roots = self.config.project_roots.clone();
        let projects = tokio::task::spawn_blocking(move || discover_projects(&roots))
            .await
            .unwrap_or_default();

        let register = AgentMessage::Register {
            name: self.config.name.clone(),
            secret: self
                .config
                .secret
                .as_ref()
                .map(|s| s.expose_secret().to_string())
                .unwrap_or_default(),
            cwd: self.config.workdir.display().to_string(),
            projects,
            version: PROTOCOL_VERSION,
        };
        sink.send(Message::Text(register.to_json()?.into())).await?;

        let reply = timeout(self.config.read_timeout, next_message(&mut stream))
            .await
            .map_err(|_| WorkerError::Protocol("no reply to register".to_string()))??;
        match reply {
            AgentMessage::Registered { version } => {
                if version != PROTOCOL_VERSION {
                    warn!(hub_version = version, worker_version = PROTOCOL_VERSION, "Protocol version mismatch");
                }
                info!(name = %self.config.name, "Registered with hub");
            }
            AgentMessage::Rejected { reason } => return Err(WorkerError::AuthRejected { reason }),
            other => {
                return Err(WorkerError::Protocol(format!(
                    "expected registered, got {}",
                    other.kind()
                )));
            }
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = mpsc::channel(OUTBOUND_BUFFER);
        self.link.attach(generation, tx).await;
        let mut writer = tokio::spawn(write_loop::<_, Message>(
            sink,
            rx,
            "hub".to_string(),
            self.config.ping_interval,
            WRITE_TIMEOUT,
        ));

        let result = loop {
            tokio::select! {
                frame = timeout(self.config.read_timeout, stream.next()) => {
                    let frame = match frame {
                        Ok(Some(Ok(frame))) => frame,
                        Ok(Some(Err(e))) => break Err(WorkerError::from(e)),
                        Ok(None) => break Ok(()),
                        Err(_) => break Err(WorkerError::Transport("read deadline expired".to_string())),
                    };
                    match frame {
                        Message::Text(text) => match AgentMessage::from_json(text.as_str()) {
                            Ok(msg) => self.handle_message(msg).await,
                            Err(e) => debug!(error = %e, "Unrecognized frame from hub"),
                        },
                        Message::Ping(data) => {
                            let _ = self.link.enqueue(Outbound::Pong(data.to_vec())).await;
                        }
                        Message::Close(_) => break Ok(()),
                        _ => {}
                    }
                }

                _ = &mut writer => {
                    break Err(WorkerError::Transport("writer stopped".to_string()));
                }
            }
        };

        self.link.detach(generation).await;
        writer.abort();
        result
    }

    async fn handle_message(self: &Arc<Self>, msg: AgentMessage) {
        match msg {
            AgentMessage::Task {
                task_id,
                prompt,
                dir,
            } => self.start_task(task_id, prompt, dir).await,
            AgentMessage::Kill { task_id } => self.kill_task(task_id).await,
            AgentMessage::ListProjects { request_id } => {
                let roots = self.config.project_roots.clone();
                let projects = tokio::task::spawn_blocking(move || discover_projects(&roots))
                    .await
                    .unwrap_or_default();
                let _ = self
                    .link
                    .send(AgentMessage::Projects {
                        request_id,
                        projects,
                    })
                    .await;
            }
            AgentMessage::Ping => {
                let _ = self.link.send(AgentMessage::Pong).await;
            }
            AgentMessage::Pong | AgentMessage::Registered { .. } => {}
            other => debug!(kind = other.kind(), "Unexpected message from hub"),
        }
    }

    async fn start_task(self: &Arc<Self>, task_id: Uuid, prompt: String, dir: String) {
        if self.tasks.read().await.contains_key(&task_id) {
            debug!(task_id = %task_id, "Duplicate task ignored");
            return;
        }

        let workdir = resolve_dir(&self.config.workdir, &dir);
        let process = match TaskProcess::spawn(&self.config.command, &prompt, &workdir, task_id) {
            Ok(process) => process,
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "Task failed to start");
                let _ = self
                    .link
                    .send(AgentMessage::Ack {
                        task_id,
                        error: Some(e.to_string()),
                    })
                    .await;
                return;
            }
        };

        let (kill_tx, kill_rx) = oneshot::channel();
        self.tasks
            .write()
            .await
            .insert(task_id, RunningTask { kill_tx });

        // Queued before the supervisor exists, so heartbeats and the result
        // always follow the ack.
        if let Err(e) = self.link.send(AgentMessage::Ack { task_id, error: None }).await {
            warn!(task_id = %task_id, error = %e, "Ack not sent");
        }
        info!(task_id = %task_id, dir = %workdir.display(), "Task started");

        tokio::spawn(Arc::clone(self).supervise(task_id, process, kill_rx));
    }

    async fn kill_task(&self, task_id: Uuid) {
        match self.tasks.write().await.remove(&task_id) {
            Some(task) => {
                info!(task_id = %task_id, "Kill requested");
                let _ = task.kill_tx.send(());
            }
            None => debug!(task_id = %task_id, "Kill for unknown or finished task"),
        }
    }

    /// Terminate every running task, e.g. on shutdown.
    pub async fn kill_all(&self) {
        let ids: Vec<Uuid> = self.tasks.read().await.keys().copied().collect();
        for id in ids {
            self.kill_task(id).await;
        }
    }

    async fn supervise(
        self: Arc<Self>,
        task_id: Uuid,
        mut process: TaskProcess,
        mut kill_rx: oneshot::Receiver<()>,
    ) {
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        // Skip immediate first tick
        heartbeat.tick().await;

        let status = loop {
            tokio::select! {
                status = process.wait() => break status,
                _ = &mut kill_rx => return self.finish_killed(task_id, process).await,
                _ = heartbeat.tick() => self.send_heartbeat(task_id).await,
            }
        };

        // The entry stays in the active set while output drains, so a kill
        // in this window still terminates the group and reports Killed.
        let drained = {
            let collect = process.collect(status, self.config.output_drain);
            tokio::pin!(collect);
            loop {
                tokio::select! {
                    out = &mut collect => break Some(out),
                    _ = &mut kill_rx => break None,
                    _ = heartbeat.tick() => self.send_heartbeat(task_id).await,
                }
            }
        };
        let Some(out) = drained else {
            return self.finish_killed(task_id, process).await;
        };

        let output_dir = process.output_dir().to_path_buf();

        // Natural exit racing a kill: the kill already removed the entry.
        if self.tasks.write().await.remove(&task_id).is_none() {
            info!(task_id = %task_id, "Task exited while being killed");
            artifacts::cleanup(&output_dir).await;
            self.deliver(AgentMessage::Killed { task_id }).await;
            return;
        }

        for upload in artifacts::collect_uploads(task_id, &output_dir).await {
            if let Err(e) = self.link.send(upload).await {
                warn!(task_id = %task_id, error = %e, "Artifact upload not sent");
            }
        }
        artifacts::cleanup(&output_dir).await;

        info!(
            task_id = %task_id,
            exit_code = out.exit_code,
            duration_ms = out.duration.as_millis() as u64,
            "Task finished"
        );
        self.deliver(AgentMessage::Result {
            task_id,
            output: out.output,
            exit_code: out.exit_code,
            error: out.error,
            duration_ms: out.duration.as_millis() as u64,
            killed: false,
        })
        .await;
    }

    /// Kill path: the entry is already gone from the active set.
    async fn finish_killed(&self, task_id: Uuid, mut process: TaskProcess) {
        process.terminate(self.config.kill_grace).await;
        let status = process.wait().await;
        let out = process.collect(status, self.config.output_drain).await;
        info!(task_id = %task_id, duration_ms = out.duration.as_millis() as u64, "Task killed");
        artifacts::cleanup(process.output_dir()).await;
        self.deliver(AgentMessage::Killed { task_id }).await;
    }

    async fn send_heartbeat(&self, task_id: Uuid) {
        if let Err(e) = self.link.send(AgentMessage::Heartbeat { task_id }).await {
            debug!(task_id = %task_id, error = %e, "Heartbeat not sent");
        }
    }

    async fn deliver(&self, msg: AgentMessage) {
        let _ = deliver_with_retry(
            &self.link,
            msg,
            self.config.result_attempts,
            self.config.result_retry_base,
        )
        .await;
    }
}

/// Next protocol message, skipping control and unparseable frames.
async fn next_message(stream: &mut SplitStream<WsStream>) -> Result<AgentMessage, WorkerError> {
    loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => match AgentMessage::from_json(text.as_str()) {
                Ok(msg) => return Ok(msg),
                Err(e) => debug!(error = %e, "Unrecognized frame from hub"),
            },
            Some(Ok(Message::Close(_))) | None => {
                return Err(WorkerError::Transport("hub closed connection".to_string()));
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(e.into()),
        }
    }
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
            code: CloseCode::Normal,
            reason: reason.into(),
        }))
    }
}

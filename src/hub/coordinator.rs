//! Task coordinator — dispatch, ack correlation, results, kills.
//!
//! Locks are only held for map lookups. Waiting on an ack or a project list
//! happens on a oneshot receiver with no lock held.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::events::{CompletionStatus, HubEvents, TaskCompletion};
use super::registry::{AgentConnection, ConnectionRegistry};
use super::task::{TaskState, TrackedTask};
use crate::error::HubError;
use crate::protocol::AgentMessage;

/// Reply delivered to a waiting request.
#[derive(Debug)]
enum PendingReply {
    Ack { error: Option<String> },
    Projects(Vec<String>),
}

/// Terminal report for one task, as read off the wire.
#[derive(Debug, Clone, Default)]
pub struct TaskResult {
    pub task_id: Uuid,
    pub output: String,
    pub exit_code: i32,
    pub error: Option<String>,
    pub duration_ms: u64,
    pub killed: bool,
}

/// Routes tasks to agents and correlates their replies.
pub struct TaskCoordinator {
    registry: Arc<ConnectionRegistry>,
    events: Arc<dyn HubEvents>,
    /// Correlation id → single-use reply slot.
    pending: Mutex<HashMap<Uuid, oneshot::Sender<PendingReply>>>,
    ack_timeout: Duration,
    list_timeout: Duration,
}

impl TaskCoordinator {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        events: Arc<dyn HubEvents>,
        ack_timeout: Duration,
        list_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            events,
            pending: Mutex::new(HashMap::new()),
            ack_timeout,
            list_timeout,
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Send a task to `agent` and wait until it confirms the process started.
    ///
    /// Fails with `AgentNotFound` before anything is sent, `SpawnFailure` when
    /// the agent acks with an error, and `DispatchTimeout` when no ack arrives.
    /// In every failure case the task is no longer tracked afterwards.
    pub async fn dispatch(&self, agent: &str, prompt: &str, dir: &str) -> Result<Uuid, HubError> {
        let conn = self
            .registry
            .get(agent)
            .await
            .ok_or_else(|| HubError::AgentNotFound {
                name: agent.to_string(),
            })?;

        let task_id = Uuid::new_v4();
        conn.track(TrackedTask::new(task_id, agent, prompt, dir))
            .await;
        let rx = self.register_pending(task_id).await;

        let msg = AgentMessage::Task {
            task_id,
            prompt: prompt.to_string(),
            dir: dir.to_string(),
        };
        if let Err(e) = conn.send(msg).await {
            self.pending.lock().await.remove(&task_id);
            conn.take_task(task_id).await;
            return Err(e);
        }
        info!(agent = %agent, task_id = %task_id, dir = %dir, "Task dispatched");

        match self.wait_pending(task_id, rx, self.ack_timeout).await {
            Some(PendingReply::Ack { error: None }) => Ok(task_id),
            Some(PendingReply::Ack { error: Some(reason) }) => Err(HubError::SpawnFailure {
                name: agent.to_string(),
                reason,
            }),
            Some(other) => {
                warn!(task_id = %task_id, reply = ?other, "Unexpected reply to task dispatch");
                conn.take_task(task_id).await;
                Err(HubError::Transport {
                    name: agent.to_string(),
                    reason: "unexpected reply to task".to_string(),
                })
            }
            None => {
                conn.take_task(task_id).await;
                warn!(agent = %agent, task_id = %task_id, "Dispatch timed out waiting for ack");
                Err(HubError::DispatchTimeout {
                    name: agent.to_string(),
                    timeout: self.ack_timeout,
                })
            }
        }
    }

    /// Ask `agent` for its candidate project directories.
    pub async fn list_projects(&self, agent: &str) -> Result<Vec<String>, HubError> {
        let conn = self
            .registry
            .get(agent)
            .await
            .ok_or_else(|| HubError::AgentNotFound {
                name: agent.to_string(),
            })?;

        let request_id = Uuid::new_v4();
        let rx = self.register_pending(request_id).await;
        if let Err(e) = conn.send(AgentMessage::ListProjects { request_id }).await {
            self.pending.lock().await.remove(&request_id);
            return Err(e);
        }

        match self.wait_pending(request_id, rx, self.list_timeout).await {
            Some(PendingReply::Projects(projects)) => Ok(projects),
            Some(other) => {
                warn!(request_id = %request_id, reply = ?other, "Unexpected reply to project listing");
                Err(HubError::Transport {
                    name: agent.to_string(),
                    reason: "unexpected reply to list_projects".to_string(),
                })
            }
            None => Err(HubError::DispatchTimeout {
                name: agent.to_string(),
                timeout: self.list_timeout,
            }),
        }
    }

    /// Request termination of a running task.
    ///
    /// The task is marked killed locally before the agent confirms, so a
    /// result racing the kill is still reported as killed.
    pub async fn kill(&self, task_id: Uuid) -> Result<(), HubError> {
        let conn = self
            .registry
            .find_task_owner(task_id)
            .await
            .ok_or(HubError::TaskNotFound { id: task_id })?;

        conn.update_task(task_id, |task| task.killed = true).await;
        conn.send(AgentMessage::Kill { task_id }).await?;
        info!(agent = %conn.name, task_id = %task_id, "Kill requested");
        Ok(())
    }

    /// Ack from the agent. Marks the task started and releases `dispatch`.
    pub async fn handle_ack(&self, conn: &AgentConnection, task_id: Uuid, error: Option<String>) {
        let Some(tx) = self.pending.lock().await.remove(&task_id) else {
            debug!(agent = %conn.name, task_id = %task_id, "Ack with no waiter dropped");
            return;
        };

        match error {
            None => {
                let preview = conn
                    .update_task(task_id, |task| {
                        if let Err(e) = task.transition_to(TaskState::Acked) {
                            warn!("{e}");
                        }
                        task.prompt_preview.clone()
                    })
                    .await;
                if let Some(preview) = preview {
                    info!(agent = %conn.name, task_id = %task_id, "Task acknowledged");
                    self.events
                        .on_task_started(task_id, &conn.name, &preview)
                        .await;
                }
                let _ = tx.send(PendingReply::Ack { error: None });
            }
            Some(reason) => {
                warn!(agent = %conn.name, task_id = %task_id, error = %reason, "Agent failed to start task");
                conn.take_task(task_id).await;
                let _ = tx.send(PendingReply::Ack {
                    error: Some(reason),
                });
            }
        }
    }

    /// Project list reply.
    pub async fn handle_projects(&self, request_id: Uuid, projects: Vec<String>) {
        match self.pending.lock().await.remove(&request_id) {
            Some(tx) => {
                let _ = tx.send(PendingReply::Projects(projects));
            }
            None => debug!(request_id = %request_id, "Projects reply with no waiter dropped"),
        }
    }

    /// Heartbeat for a running task.
    pub async fn handle_heartbeat(&self, conn: &AgentConnection, task_id: Uuid) {
        let found = conn
            .update_task(task_id, |task| task.last_heartbeat = std::time::Instant::now())
            .await;
        if found.is_none() {
            debug!(agent = %conn.name, task_id = %task_id, "Heartbeat for unknown task");
        }
    }

    /// Terminal result for a task.
    pub async fn handle_result(&self, conn: &AgentConnection, result: TaskResult) {
        let status = if result.killed {
            CompletionStatus::Killed
        } else if result.exit_code != 0 || result.error.as_deref().is_some_and(|e| !e.is_empty()) {
            CompletionStatus::Errored
        } else {
            CompletionStatus::Succeeded
        };

        let completion = match conn.take_task(result.task_id).await {
            Some(mut task) => {
                let status = if task.killed {
                    CompletionStatus::Killed
                } else {
                    status
                };
                let target = match status {
                    CompletionStatus::Succeeded => TaskState::Completed,
                    CompletionStatus::Errored => TaskState::Failed,
                    CompletionStatus::Killed => TaskState::Killed,
                };
                if let Err(e) = task.transition_to(target) {
                    debug!("{e}");
                }
                TaskCompletion {
                    task_id: task.id,
                    agent: conn.name.clone(),
                    status,
                    output: result.output,
                    error: result.error,
                    exit_code: exit_code_for(status, result.exit_code),
                    duration: task.elapsed(),
                    prompt_preview: task.prompt_preview,
                    orphaned: false,
                }
            }
            None => match self.registry.take_orphan(&conn.name, result.task_id).await {
                Some(orphan) => {
                    warn!(agent = %conn.name, task_id = %result.task_id, "Result for orphaned task");
                    TaskCompletion {
                        task_id: orphan.task_id,
                        agent: conn.name.clone(),
                        status,
                        output: result.output,
                        error: result.error,
                        exit_code: exit_code_for(status, result.exit_code),
                        duration: orphan
                            .started
                            .map(|s| s.elapsed())
                            .unwrap_or_else(|| Duration::from_millis(result.duration_ms)),
                        prompt_preview: orphan.prompt_preview,
                        orphaned: true,
                    }
                }
                None => {
                    debug!(
                        agent = %conn.name,
                        task_id = %result.task_id,
                        "Result for unknown task dropped (duplicate or superseded)"
                    );
                    return;
                }
            },
        };

        info!(
            agent = %conn.name,
            task_id = %completion.task_id,
            status = ?completion.status,
            duration_ms = completion.duration.as_millis() as u64,
            "Task finished"
        );
        self.events.on_result(completion).await;
    }

    /// Kill confirmation from the agent.
    pub async fn handle_killed(&self, conn: &AgentConnection, task_id: Uuid) {
        self.handle_result(
            conn,
            TaskResult {
                task_id,
                killed: true,
                ..Default::default()
            },
        )
        .await;
    }

    async fn register_pending(&self, id: Uuid) -> oneshot::Receiver<PendingReply> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);
        rx
    }

    /// Wait for a reply. On timeout the pending entry is removed, unless a
    /// reply claimed it first, in which case that reply wins.
    async fn wait_pending(
        &self,
        id: Uuid,
        mut rx: oneshot::Receiver<PendingReply>,
        timeout: Duration,
    ) -> Option<PendingReply> {
        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(reply)) => Some(reply),
            Ok(Err(_)) => None,
            Err(_) => {
                if self.pending.lock().await.remove(&id).is_some() {
                    return None;
                }
                // The responder removed the entry; its send is imminent.
                rx.await.ok()
            }
        }
    }

    /// Number of requests awaiting a reply.
    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }
}

/// Killed processes have no meaningful exit code.
fn exit_code_for(status: CompletionStatus, code: i32) -> Option<i32> {
    match status {
        CompletionStatus::Killed => None,
        _ => Some(code),
    }
}

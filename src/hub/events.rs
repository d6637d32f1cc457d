//! Callbacks from the hub into the outer application.
//!
//! The coordinator reports through exactly three hooks: a task finished, a
//! connection-level event happened (disconnects, orphans, stuck tasks), and a
//! task started.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::task::short_id;

/// How a task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionStatus {
    Succeeded,
    Errored,
    Killed,
}

/// Structured completion report passed to [`HubEvents::on_result`].
#[derive(Debug, Clone, Serialize)]
pub struct TaskCompletion {
    pub task_id: Uuid,
    pub agent: String,
    pub status: CompletionStatus,
    pub output: String,
    pub error: Option<String>,
    pub exit_code: Option<i32>,
    /// Hub-side duration from dispatch to terminal message.
    pub duration: Duration,
    pub prompt_preview: String,
    /// The task's connection was replaced or lost before this arrived.
    pub orphaned: bool,
}

impl TaskCompletion {
    /// Human-readable rendering for notification channels.
    pub fn summary(&self) -> String {
        let secs = self.duration.as_secs();
        let elapsed = if secs >= 60 {
            format!("{}m{}s", secs / 60, secs % 60)
        } else {
            format!("{secs}s")
        };
        let orphan = if self.orphaned { " [orphaned]" } else { "" };
        let header = format!(
            "[{}] task {} ({}){orphan}",
            self.agent,
            short_id(self.task_id),
            self.prompt_preview
        );

        match self.status {
            CompletionStatus::Succeeded => {
                format!("{header} finished in {elapsed}\n\n{}", self.output)
            }
            CompletionStatus::Errored => {
                let mut text = format!("{header} failed after {elapsed}");
                if let Some(code) = self.exit_code {
                    text.push_str(&format!(" (exit {code})"));
                }
                if let Some(ref err) = self.error {
                    text.push_str(&format!(": {err}"));
                }
                if !self.output.is_empty() {
                    text.push_str(&format!("\n\n{}", self.output));
                }
                text
            }
            CompletionStatus::Killed => format!("{header} killed after {elapsed}"),
        }
    }
}

/// Hooks the outer dispatch surface implements.
#[async_trait]
pub trait HubEvents: Send + Sync {
    /// A task reached a terminal state.
    async fn on_result(&self, completion: TaskCompletion);

    /// Connection-level notice: disconnects, orphaned tasks, stuck tasks.
    async fn on_connection_event(&self, text: String);

    /// The agent confirmed the task's process launched.
    async fn on_task_started(&self, task_id: Uuid, agent: &str, prompt_preview: &str);
}

/// Events as values, for consumers that prefer a channel to a trait.
#[derive(Debug, Clone)]
pub enum HubEvent {
    Completed(TaskCompletion),
    Connection(String),
    Started {
        task_id: Uuid,
        agent: String,
        prompt_preview: String,
    },
}

/// [`HubEvents`] implementation that forwards into an unbounded channel.
#[derive(Clone)]
pub struct ChannelEvents {
    tx: mpsc::UnboundedSender<HubEvent>,
}

impl ChannelEvents {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<HubEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn emit(&self, event: HubEvent) {
        // No receiver means nobody is listening; dropping is fine.
        let _ = self.tx.send(event);
    }
}

#[async_trait]
impl HubEvents for ChannelEvents {
    async fn on_result(&self, completion: TaskCompletion) {
        self.emit(HubEvent::Completed(completion));
    }

    async fn on_connection_event(&self, text: String) {
        self.emit(HubEvent::Connection(text));
    }

    async fn on_task_started(&self, task_id: Uuid, agent: &str, prompt_preview: &str) {
        self.emit(HubEvent::Started {
            task_id,
            agent: agent.to_string(),
            prompt_preview: prompt_preview.to_string(),
        });
    }
}

/// [`HubEvents`] implementation that only logs.
pub struct LogEvents;

#[async_trait]
impl HubEvents for LogEvents {
    async fn on_result(&self, completion: TaskCompletion) {
        tracing::info!(
            task_id = %completion.task_id,
            agent = %completion.agent,
            status = ?completion.status,
            "{}",
            completion.summary()
        );
    }

    async fn on_connection_event(&self, text: String) {
        tracing::warn!("{text}");
    }

    async fn on_task_started(&self, task_id: Uuid, agent: &str, prompt_preview: &str) {
        tracing::info!(task_id = %task_id, agent = %agent, prompt = %prompt_preview, "Task started");
    }
}

//! Hub-side task record and its state machine.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::protocol::{PROMPT_PREVIEW_CHARS, truncate_preview};

/// State of a dispatched task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Sent to the agent, waiting for its ack.
    Dispatched,
    /// The agent confirmed the process launched.
    Acked,
    /// Finished and reported a result.
    Completed,
    /// Never started, or finished with an error.
    Failed,
    /// Terminated on request.
    Killed,
}

impl TaskState {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: TaskState) -> bool {
        use TaskState::*;

        matches!(
            (self, target),
            (Dispatched, Acked) | (Dispatched, Failed) | (Dispatched, Killed) |
            (Acked, Completed) | (Acked, Failed) | (Acked, Killed)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Killed)
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Dispatched => "dispatched",
            Self::Acked => "acked",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Killed => "killed",
        };
        write!(f, "{s}")
    }
}

/// A task tracked on its owning connection.
#[derive(Debug, Clone)]
pub struct TrackedTask {
    pub id: Uuid,
    /// Name of the owning agent.
    pub agent: String,
    pub prompt_preview: String,
    pub dir: String,
    pub state: TaskState,
    pub created_at: DateTime<Utc>,
    pub started: Instant,
    pub last_heartbeat: Instant,
    /// Set as soon as a kill is requested, before the agent confirms.
    pub killed: bool,
    /// Opaque handle the outer layer may attach (e.g. a status message id).
    pub ui_handle: Option<String>,
}

impl TrackedTask {
    pub fn new(id: Uuid, agent: impl Into<String>, prompt: &str, dir: impl Into<String>) -> Self {
        let now = Instant::now();
        Self {
            id,
            agent: agent.into(),
            prompt_preview: truncate_preview(prompt, PROMPT_PREVIEW_CHARS),
            dir: dir.into(),
            state: TaskState::Dispatched,
            created_at: Utc::now(),
            started: now,
            last_heartbeat: now,
            killed: false,
            ui_handle: None,
        }
    }

    /// Transition to a new state, refusing non-monotonic moves.
    pub fn transition_to(&mut self, target: TaskState) -> Result<(), String> {
        if !self.state.can_transition_to(target) {
            return Err(format!(
                "Cannot transition task {} from {} to {}",
                self.id, self.state, target
            ));
        }
        self.state = target;
        Ok(())
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn since_heartbeat(&self) -> Duration {
        self.last_heartbeat.elapsed()
    }
}

/// A task that lost its connection before reporting a terminal message.
#[derive(Debug, Clone, Serialize)]
pub struct OrphanedTask {
    pub task_id: Uuid,
    pub agent: String,
    pub prompt_preview: String,
    pub state: TaskState,
    pub dispatched_at: DateTime<Utc>,
    pub orphaned_at: DateTime<Utc>,
    #[serde(skip)]
    pub started: Option<Instant>,
}

impl From<&TrackedTask> for OrphanedTask {
    fn from(task: &TrackedTask) -> Self {
        Self {
            task_id: task.id,
            agent: task.agent.clone(),
            prompt_preview: task.prompt_preview.clone(),
            state: task.state,
            dispatched_at: task.created_at,
            orphaned_at: Utc::now(),
            started: Some(task.started),
        }
    }
}

/// One-line digest of orphaned tasks, for alerts.
pub fn orphan_digest(tasks: &[OrphanedTask]) -> String {
    tasks
        .iter()
        .map(|t| format!("{} ({})", short_id(t.task_id), t.prompt_preview))
        .collect::<Vec<_>>()
        .join(", ")
}

/// First 8 hex characters of a task id.
pub fn short_id(id: Uuid) -> String {
    id.simple().to_string()[..8].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_transitions_valid() {
        assert!(TaskState::Dispatched.can_transition_to(TaskState::Acked));
        assert!(TaskState::Dispatched.can_transition_to(TaskState::Failed));
        assert!(TaskState::Acked.can_transition_to(TaskState::Completed));
        assert!(TaskState::Acked.can_transition_to(TaskState::Killed));
    }

    #[test]
    fn kill_before_ack_is_killed() {
        let mut task = TrackedTask::new(Uuid::new_v4(), "mac", "build", "/src");
        task.transition_to(TaskState::Killed).unwrap();
        assert_eq!(task.state, TaskState::Killed);
        assert!(task.transition_to(TaskState::Acked).is_err());
    }

    #[test]
    fn never_reenters_dispatched() {
        for state in [
            TaskState::Dispatched,
            TaskState::Acked,
            TaskState::Completed,
            TaskState::Failed,
            TaskState::Killed,
        ] {
            assert!(!state.can_transition_to(TaskState::Dispatched));
        }
    }

    #[test]
    fn terminal_states_are_final() {
        for state in [TaskState::Completed, TaskState::Failed, TaskState::Killed] {
            assert!(state.is_terminal());
            assert!(!state.can_transition_to(TaskState::Acked));
        }
        assert!(!TaskState::Acked.is_terminal());
    }

    #[test]
    fn tracked_task_lifecycle() {
        let mut task = TrackedTask::new(Uuid::new_v4(), "mac", "build the thing", "/src");
        assert_eq!(task.state, TaskState::Dispatched);
        task.transition_to(TaskState::Acked).unwrap();
        assert!(task.transition_to(TaskState::Dispatched).is_err());
        task.transition_to(TaskState::Completed).unwrap();
        assert_eq!(task.state, TaskState::Completed);
    }

    #[test]
    fn preview_is_truncated() {
        let prompt = "x".repeat(500);
        let task = TrackedTask::new(Uuid::new_v4(), "mac", &prompt, "");
        assert_eq!(task.prompt_preview.chars().count(), PROMPT_PREVIEW_CHARS + 3);
    }

    #[test]
    fn digest_lists_short_ids() {
        let task = TrackedTask::new(Uuid::new_v4(), "mac", "deploy", "");
        let orphan = OrphanedTask::from(&task);
        let digest = orphan_digest(&[orphan]);
        assert!(digest.contains("deploy"));
        assert!(digest.starts_with(&short_id(task.id)));
    }

    #[test]
    fn state_display() {
        assert_eq!(TaskState::Acked.to_string(), "acked");
        assert_eq!(
            serde_json::to_string(&TaskState::Killed).unwrap(),
            "\"killed\""
        );
    }
}

//! Wire protocol shared by the hub and its agents.
//!
//! One JSON object per WebSocket text frame, discriminated by `type`. Unknown
//! fields are ignored and optional fields default, so either side can add
//! fields without breaking the other.

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use uuid::Uuid;

/// Current protocol version, announced in `register` / `registered`.
pub const PROTOCOL_VERSION: u32 = 1;

/// Largest artifact a worker will upload.
pub const MAX_UPLOAD_BYTES: u64 = 50 * 1024 * 1024;

/// Largest single frame the hub will read (base64 of a max-size upload fits).
pub const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

/// Length of the prompt preview kept for diagnostics.
pub const PROMPT_PREVIEW_CHARS: usize = 80;

fn default_version() -> u32 {
    PROTOCOL_VERSION
}

/// Every message exchanged between hub and agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentMessage {
    /// Agent → hub: first frame on every connection.
    Register {
        name: String,
        #[serde(default)]
        secret: String,
        #[serde(default)]
        cwd: String,
        #[serde(default)]
        projects: Vec<String>,
        #[serde(default = "default_version")]
        version: u32,
    },
    /// Hub → agent: registration accepted.
    Registered {
        #[serde(default = "default_version")]
        version: u32,
    },
    /// Hub → agent: registration refused; the hub closes afterwards.
    Rejected { reason: String },
    /// Hub → agent: run a prompt in a directory.
    Task {
        task_id: Uuid,
        prompt: String,
        #[serde(default)]
        dir: String,
    },
    /// Agent → hub: the process launched (or failed to, when `error` is set).
    Ack {
        task_id: Uuid,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Agent → hub: the task's process is still running.
    Heartbeat { task_id: Uuid },
    /// Agent → hub: the task's process exited.
    Result {
        task_id: Uuid,
        #[serde(default)]
        output: String,
        #[serde(default)]
        exit_code: i32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(default)]
        duration_ms: u64,
        #[serde(default)]
        killed: bool,
    },
    /// Hub → agent: terminate a running task.
    Kill { task_id: Uuid },
    /// Agent → hub: the task was terminated on request.
    Killed { task_id: Uuid },
    /// Hub → agent: list candidate project directories.
    ListProjects { request_id: Uuid },
    /// Agent → hub: reply to `list_projects`.
    Projects {
        request_id: Uuid,
        #[serde(default)]
        projects: Vec<String>,
    },
    /// Agent → hub: an output artifact produced by a task.
    FileUpload {
        task_id: Uuid,
        filename: String,
        size: u64,
        /// Base64 (standard alphabet) file content.
        content: String,
    },
    /// Application-level keepalive for relays that swallow control frames.
    Ping,
    Pong,
}

impl AgentMessage {
    /// Wire name of the message, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Register { .. } => "register",
            Self::Registered { .. } => "registered",
            Self::Rejected { .. } => "rejected",
            Self::Task { .. } => "task",
            Self::Ack { .. } => "ack",
            Self::Heartbeat { .. } => "heartbeat",
            Self::Result { .. } => "result",
            Self::Kill { .. } => "kill",
            Self::Killed { .. } => "killed",
            Self::ListProjects { .. } => "list_projects",
            Self::Projects { .. } => "projects",
            Self::FileUpload { .. } => "file_upload",
            Self::Ping => "ping",
            Self::Pong => "pong",
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}

/// Items queued for a connection's single writer task.
///
/// Read paths never touch the socket; they enqueue one of these instead.
#[derive(Debug)]
pub enum Outbound {
    Message(AgentMessage),
    /// A message whose sender waits for the socket write. The writer fires
    /// the channel only after the frame went out; dropping it means lost.
    Confirmed(AgentMessage, oneshot::Sender<()>),
    /// Transport-level ping frame.
    Ping,
    /// Reply to a transport-level ping, echoing its payload.
    Pong(Vec<u8>),
    /// Send a close frame and stop writing.
    Close(String),
}

/// Truncate to at most `max` characters, appending `...` when cut.
pub fn truncate_preview(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        None => s.to_string(),
        Some((end, _)) => format!("{}...", &s[..end]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_wire_shape() {
        let id = Uuid::new_v4();
        let msg = AgentMessage::Task {
            task_id: id,
            prompt: "build".into(),
            dir: "/src/app".into(),
        };
        let json: serde_json::Value = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "task");
        assert_eq!(json["task_id"], id.to_string());
        assert_eq!(json["prompt"], "build");
    }

    #[test]
    fn ack_without_error_omits_field() {
        let msg = AgentMessage::Ack {
            task_id: Uuid::new_v4(),
            error: None,
        };
        let json = msg.to_json().unwrap();
        assert!(!json.contains("error"));
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let id = Uuid::new_v4();
        let text = format!(
            r#"{{"type":"heartbeat","task_id":"{id}","cpu":0.4,"extra":{{"a":1}}}}"#
        );
        let msg = AgentMessage::from_json(&text).unwrap();
        assert_eq!(msg, AgentMessage::Heartbeat { task_id: id });
    }

    #[test]
    fn register_defaults_missing_fields() {
        let msg = AgentMessage::from_json(r#"{"type":"register","name":"mac"}"#).unwrap();
        match msg {
            AgentMessage::Register {
                name,
                secret,
                projects,
                version,
                ..
            } => {
                assert_eq!(name, "mac");
                assert!(secret.is_empty());
                assert!(projects.is_empty());
                assert_eq!(version, PROTOCOL_VERSION);
            }
            other => panic!("expected register, got {other:?}"),
        }
    }

    #[test]
    fn result_defaults() {
        let id = Uuid::new_v4();
        let msg =
            AgentMessage::from_json(&format!(r#"{{"type":"result","task_id":"{id}"}}"#)).unwrap();
        match msg {
            AgentMessage::Result {
                output,
                exit_code,
                error,
                killed,
                ..
            } => {
                assert!(output.is_empty());
                assert_eq!(exit_code, 0);
                assert!(error.is_none());
                assert!(!killed);
            }
            other => panic!("expected result, got {other:?}"),
        }
    }

    #[test]
    fn unknown_type_is_an_error() {
        assert!(AgentMessage::from_json(r#"{"type":"teleport"}"#).is_err());
    }

    #[test]
    fn unit_variants() {
        assert_eq!(AgentMessage::Ping.to_json().unwrap(), r#"{"type":"ping"}"#);
        assert_eq!(
            AgentMessage::from_json(r#"{"type":"pong"}"#).unwrap(),
            AgentMessage::Pong
        );
    }

    #[test]
    fn preview_truncates_on_char_boundary() {
        assert_eq!(truncate_preview("hello", 10), "hello");
        assert_eq!(truncate_preview("hello world", 5), "hello...");
        assert_eq!(truncate_preview("héllo wörld", 2), "hé...");
    }
}

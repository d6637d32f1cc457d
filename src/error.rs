//! Error types for the agent link.

use std::time::Duration;

use uuid::Uuid;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Hub error: {0}")]
    Hub(#[from] HubError),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors surfaced by the hub to the outer dispatch layer.
///
/// Transport failures never reach callers of `dispatch`/`kill` except when the
/// socket dies between lookup and send, which is reported as `Transport`.
#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("Agent {name} rejected: {reason}")]
    AuthRejected { name: String, reason: String },

    #[error("Agent {name} is not connected")]
    AgentNotFound { name: String },

    #[error("Task {id} not found on any agent")]
    TaskNotFound { id: Uuid },

    #[error("Agent {name} did not acknowledge within {timeout:?}")]
    DispatchTimeout { name: String, timeout: Duration },

    #[error("Agent {name} failed to start task: {reason}")]
    SpawnFailure { name: String, reason: String },

    #[error("Connection to agent {name} failed: {reason}")]
    Transport { name: String, reason: String },
}

/// Worker-side errors.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("Hub rejected registration: {reason}")]
    AuthRejected { reason: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Failed to spawn task process: {0}")]
    Spawn(String),

    #[error("Result for task {task_id} lost after {attempts} delivery attempts")]
    ResultDelivery { task_id: Uuid, attempts: u32 },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<tokio_tungstenite::tungstenite::Error> for WorkerError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Transport(e.to_string())
    }
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;

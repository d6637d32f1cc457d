//! Configuration types.
//!
//! Both sides are configured from the environment. Unparseable numeric values
//! fall back to their defaults.

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Port for the agent socket and REST API.
    pub port: u16,
    /// Shared secret agents must present. `None` accepts every registration.
    pub secret: Option<SecretString>,
    /// Where uploaded task artifacts are written.
    pub upload_dir: PathBuf,
    /// How long `dispatch` waits for the agent's ack.
    pub ack_timeout: Duration,
    /// How long a project listing request waits for its reply.
    pub list_timeout: Duration,
    /// Grace window before a disconnect is reported.
    pub disconnect_grace: Duration,
    /// Stale-task scan interval.
    pub watchdog_interval: Duration,
    /// Heartbeat age after which a task is reported as stuck.
    pub stale_after: Duration,
    /// Interval between transport pings.
    pub ping_interval: Duration,
    /// Read deadline; any inbound frame resets it.
    pub read_timeout: Duration,
    /// Per-frame write deadline.
    pub write_timeout: Duration,
    /// Time a fresh socket has to send its `register` frame.
    pub register_timeout: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            port: 8090,
            secret: None,
            upload_dir: PathBuf::from("./data/uploads"),
            ack_timeout: Duration::from_secs(30),
            list_timeout: Duration::from_secs(10),
            disconnect_grace: Duration::from_secs(10),
            watchdog_interval: Duration::from_secs(120), // 2 minutes
            stale_after: Duration::from_secs(600),       // 10 minutes
            ping_interval: Duration::from_secs(30),
            read_timeout: Duration::from_secs(90),
            write_timeout: Duration::from_secs(10),
            register_timeout: Duration::from_secs(10),
        }
    }
}

impl HubConfig {
    /// Build from `AGENT_LINK_*` environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            port: env_parse("AGENT_LINK_PORT").unwrap_or(defaults.port),
            secret: env_secret("AGENT_LINK_SECRET"),
            upload_dir: std::env::var("AGENT_LINK_UPLOAD_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.upload_dir),
            ack_timeout: env_secs("AGENT_LINK_ACK_TIMEOUT_SECS").unwrap_or(defaults.ack_timeout),
            list_timeout: env_secs("AGENT_LINK_LIST_TIMEOUT_SECS")
                .unwrap_or(defaults.list_timeout),
            disconnect_grace: env_secs("AGENT_LINK_DISCONNECT_GRACE_SECS")
                .unwrap_or(defaults.disconnect_grace),
            watchdog_interval: env_secs("AGENT_LINK_WATCHDOG_INTERVAL_SECS")
                .unwrap_or(defaults.watchdog_interval),
            stale_after: env_secs("AGENT_LINK_STALE_AFTER_SECS").unwrap_or(defaults.stale_after),
            ping_interval: env_secs("AGENT_LINK_PING_INTERVAL_SECS")
                .unwrap_or(defaults.ping_interval),
            read_timeout: env_secs("AGENT_LINK_READ_TIMEOUT_SECS")
                .unwrap_or(defaults.read_timeout),
            ..defaults
        }
    }

    /// Whether registrations are accepted without a secret.
    pub fn is_insecure(&self) -> bool {
        self.secret.is_none()
    }
}

/// Worker (agent side) configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Hub socket URL, e.g. `ws://hub:8090/ws/agent`.
    pub hub_url: String,
    /// Name this worker registers under.
    pub name: String,
    pub secret: Option<SecretString>,
    /// Program and leading arguments; the prompt is appended last.
    pub command: Vec<String>,
    /// Base directory; relative task directories resolve against it.
    pub workdir: PathBuf,
    /// Directories scanned for candidate projects.
    pub project_roots: Vec<PathBuf>,
    pub heartbeat_interval: Duration,
    pub reconnect_delay: Duration,
    /// Delay between SIGTERM and SIGKILL.
    pub kill_grace: Duration,
    /// How long output pipes may stay open after the process exits.
    pub output_drain: Duration,
    pub result_attempts: u32,
    /// Backoff before the second delivery attempt; doubles each retry.
    pub result_retry_base: Duration,
    pub ping_interval: Duration,
    pub read_timeout: Duration,
}

impl WorkerConfig {
    /// A config with defaults for everything except the hub URL and name.
    pub fn new(hub_url: impl Into<String>, name: impl Into<String>) -> Self {
        let workdir = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        Self {
            hub_url: hub_url.into(),
            name: name.into(),
            secret: None,
            command: vec!["claude".to_string(), "--print".to_string()],
            project_roots: vec![workdir.clone()],
            workdir,
            heartbeat_interval: Duration::from_secs(120),
            reconnect_delay: Duration::from_secs(5),
            kill_grace: Duration::from_secs(5),
            output_drain: Duration::from_secs(2),
            result_attempts: 5,
            result_retry_base: Duration::from_secs(1),
            ping_interval: Duration::from_secs(30),
            read_timeout: Duration::from_secs(90),
        }
    }

    /// Build from `AGENT_LINK_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let hub_url = std::env::var("AGENT_LINK_URL")
            .map_err(|_| ConfigError::MissingEnvVar("AGENT_LINK_URL".to_string()))?;
        let name = std::env::var("AGENT_LINK_NAME")
            .or_else(|_| std::env::var("HOSTNAME"))
            .unwrap_or_else(|_| "agent".to_string());

        let mut config = Self::new(hub_url, name);
        config.secret = env_secret("AGENT_LINK_SECRET");

        if let Ok(cmd) = std::env::var("AGENT_LINK_COMMAND") {
            let parts: Vec<String> = cmd.split_whitespace().map(str::to_string).collect();
            if parts.is_empty() {
                return Err(ConfigError::InvalidValue {
                    key: "AGENT_LINK_COMMAND".to_string(),
                    message: "command is empty".to_string(),
                });
            }
            config.command = parts;
        }

        if let Ok(dir) = std::env::var("AGENT_LINK_WORKDIR") {
            config.workdir = PathBuf::from(dir);
            config.project_roots = vec![config.workdir.clone()];
        }

        if let Ok(roots) = std::env::var("AGENT_LINK_PROJECT_ROOTS") {
            let roots: Vec<PathBuf> = roots
                .split(',')
                .map(|s| s.trim())
                .filter(|s| !s.is_empty())
                .map(PathBuf::from)
                .collect();
            if !roots.is_empty() {
                config.project_roots = roots;
            }
        }

        if let Some(d) = env_secs("AGENT_LINK_HEARTBEAT_SECS") {
            config.heartbeat_interval = d;
        }
        if let Some(d) = env_secs("AGENT_LINK_RECONNECT_SECS") {
            config.reconnect_delay = d;
        }
        if let Some(d) = env_secs("AGENT_LINK_KILL_GRACE_SECS") {
            config.kill_grace = d;
        }
        if let Some(d) = env_secs("AGENT_LINK_OUTPUT_DRAIN_SECS") {
            config.output_drain = d;
        }
        if let Some(n) = env_parse::<u32>("AGENT_LINK_RESULT_ATTEMPTS") {
            config.result_attempts = n.max(1);
        }

        Ok(config)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

fn env_secs(key: &str) -> Option<Duration> {
    env_parse::<u64>(key).map(Duration::from_secs)
}

fn env_secret(key: &str) -> Option<SecretString> {
    std::env::var(key)
        .ok()
        .filter(|s| !s.is_empty())
        .map(SecretString::from)
}

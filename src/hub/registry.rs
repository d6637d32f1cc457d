//! Connection registry — one live connection per agent name.
//!
//! Each name moves through a small state machine:
//!
//! ```text
//! Connected ──unregister──▶ GracePeriod ──timer──▶ Disconnected
//!     ▲                          │                      │
//!     └────────register──────────┴──────────────────────┘
//! ```
//!
//! A registration under a name that is already connected replaces the old
//! connection without a disconnect alert. A disconnect is only reported if the
//! name is still in the same grace epoch when the timer fires.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use subtle::ConstantTimeEq;
use tokio::sync::{Mutex, RwLock, mpsc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::events::HubEvents;
use super::task::{OrphanedTask, TrackedTask, orphan_digest};
use crate::error::HubError;
use crate::protocol::{AgentMessage, Outbound};

/// Orphan ledger capacity.
const MAX_ORPHANS: usize = 100;

/// A registered agent connection.
#[derive(Debug)]
pub struct AgentConnection {
    id: u64,
    pub name: String,
    pub connected_at: DateTime<Utc>,
    pub cwd: String,
    pub projects: Vec<String>,
    outbound: mpsc::Sender<Outbound>,
    tasks: Mutex<HashMap<Uuid, TrackedTask>>,
}

impl AgentConnection {
    pub fn new(
        id: u64,
        name: impl Into<String>,
        cwd: impl Into<String>,
        projects: Vec<String>,
        outbound: mpsc::Sender<Outbound>,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            connected_at: Utc::now(),
            cwd: cwd.into(),
            projects,
            outbound,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Instance id, unique per socket for the life of the registry.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Queue a message for the writer task.
    pub async fn send(&self, msg: AgentMessage) -> Result<(), HubError> {
        self.outbound
            .send(Outbound::Message(msg))
            .await
            .map_err(|_| HubError::Transport {
                name: self.name.clone(),
                reason: "connection writer closed".to_string(),
            })
    }

    /// Queue a raw item for the writer task.
    pub async fn enqueue(&self, item: Outbound) -> bool {
        self.outbound.send(item).await.is_ok()
    }

    /// Ask the writer to send a close frame.
    pub fn close(&self, reason: &str) {
        if self
            .outbound
            .try_send(Outbound::Close(reason.to_string()))
            .is_err()
        {
            debug!(agent = %self.name, conn_id = self.id, "Close not queued, writer gone or full");
        }
    }

    pub async fn track(&self, task: TrackedTask) {
        self.tasks.lock().await.insert(task.id, task);
    }

    /// Remove a task from the active set.
    pub async fn take_task(&self, id: Uuid) -> Option<TrackedTask> {
        self.tasks.lock().await.remove(&id)
    }

    /// Apply `f` to a tracked task, if present.
    pub async fn update_task<F, R>(&self, id: Uuid, f: F) -> Option<R>
    where
        F: FnOnce(&mut TrackedTask) -> R,
    {
        self.tasks.lock().await.get_mut(&id).map(f)
    }

    pub async fn has_task(&self, id: Uuid) -> bool {
        self.tasks.lock().await.contains_key(&id)
    }

    pub async fn active_count(&self) -> usize {
        self.tasks.lock().await.len()
    }

    pub async fn tasks(&self) -> Vec<TrackedTask> {
        self.tasks.lock().await.values().cloned().collect()
    }

    async fn drain_tasks(&self) -> Vec<TrackedTask> {
        self.tasks.lock().await.drain().map(|(_, t)| t).collect()
    }
}

/// Per-name link state.
enum LinkState {
    Connected(Arc<AgentConnection>),
    GracePeriod {
        epoch: u64,
        since: Instant,
        orphaned: Vec<OrphanedTask>,
    },
    Disconnected,
}

/// Coarse view of a name's link state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkStatus {
    Connected,
    GracePeriod,
    Disconnected,
}

/// Snapshot row for `list_connections`.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub name: String,
    pub connected_at: DateTime<Utc>,
    pub active_tasks: usize,
    pub cwd: String,
    pub projects: Vec<String>,
}

/// Tracks live connections by agent name.
pub struct ConnectionRegistry {
    links: RwLock<HashMap<String, LinkState>>,
    orphans: RwLock<VecDeque<OrphanedTask>>,
    secret: Option<SecretString>,
    grace: Duration,
    events: Arc<dyn HubEvents>,
    next_conn_id: AtomicU64,
    next_epoch: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new(
        secret: Option<SecretString>,
        grace: Duration,
        events: Arc<dyn HubEvents>,
    ) -> Arc<Self> {
        if secret.is_none() {
            warn!("No agent secret configured: accepting every registration (insecure mode)");
        }
        Arc::new(Self {
            links: RwLock::new(HashMap::new()),
            orphans: RwLock::new(VecDeque::new()),
            secret,
            grace,
            events,
            next_conn_id: AtomicU64::new(0),
            next_epoch: AtomicU64::new(0),
        })
    }

    pub fn next_conn_id(&self) -> u64 {
        self.next_conn_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Check a presented credential against the configured secret.
    pub fn authorize(&self, name: &str, credential: &str) -> Result<(), HubError> {
        let Some(ref secret) = self.secret else {
            warn!(agent = %name, "Accepting agent without authentication (insecure mode)");
            return Ok(());
        };

        let ok: bool = credential
            .as_bytes()
            .ct_eq(secret.expose_secret().as_bytes())
            .into();
        if ok {
            Ok(())
        } else {
            Err(HubError::AuthRejected {
                name: name.to_string(),
                reason: if credential.is_empty() {
                    "missing secret".to_string()
                } else {
                    "invalid secret".to_string()
                },
            })
        }
    }

    /// Authorize and install `conn` under its name.
    ///
    /// Returns the connection it replaced, if any. The replaced connection is
    /// closed; its active tasks move to the orphan ledger.
    pub async fn register(
        &self,
        conn: Arc<AgentConnection>,
        credential: &str,
    ) -> Result<Option<Arc<AgentConnection>>, HubError> {
        self.authorize(&conn.name, credential)?;

        let previous = self
            .links
            .write()
            .await
            .insert(conn.name.clone(), LinkState::Connected(Arc::clone(&conn)));

        info!(
            agent = %conn.name,
            conn_id = conn.id(),
            projects = conn.projects.len(),
            "Agent registered"
        );

        match previous {
            Some(LinkState::Connected(old)) => {
                warn!(
                    agent = %conn.name,
                    old_conn = old.id(),
                    new_conn = conn.id(),
                    "Replacing existing connection"
                );
                old.close("replaced by a new connection");

                let orphaned: Vec<OrphanedTask> =
                    old.drain_tasks().await.iter().map(OrphanedTask::from).collect();
                if !orphaned.is_empty() {
                    let digest = orphan_digest(&orphaned);
                    self.push_orphans(orphaned.clone()).await;
                    self.events
                        .on_connection_event(format!(
                            "Agent {} reconnected; {} task(s) from the previous connection are orphaned: {}",
                            conn.name,
                            orphaned.len(),
                            digest
                        ))
                        .await;
                }
                Ok(Some(old))
            }
            Some(LinkState::GracePeriod {
                since, orphaned, ..
            }) => {
                info!(
                    agent = %conn.name,
                    after_ms = since.elapsed().as_millis() as u64,
                    orphaned = orphaned.len(),
                    "Agent reconnected within grace period"
                );
                self.push_orphans(orphaned).await;
                Ok(None)
            }
            Some(LinkState::Disconnected) | None => Ok(None),
        }
    }

    /// Remove `conn` if it is still the registered instance for its name.
    ///
    /// Starts the disconnect grace period; the alert fires only if nothing
    /// re-registers before it ends.
    pub async fn unregister(self: &Arc<Self>, conn: &AgentConnection) {
        let epoch = self.next_epoch.fetch_add(1, Ordering::SeqCst) + 1;
        {
            let mut links = self.links.write().await;
            match links.get(&conn.name) {
                Some(LinkState::Connected(current)) if current.id() == conn.id() => {}
                _ => {
                    debug!(agent = %conn.name, conn_id = conn.id(), "Stale unregister ignored");
                    return;
                }
            }

            let orphaned: Vec<OrphanedTask> =
                conn.drain_tasks().await.iter().map(OrphanedTask::from).collect();
            info!(
                agent = %conn.name,
                conn_id = conn.id(),
                active_tasks = orphaned.len(),
                grace_secs = self.grace.as_secs_f32(),
                "Agent disconnected, grace period started"
            );
            links.insert(
                conn.name.clone(),
                LinkState::GracePeriod {
                    epoch,
                    since: Instant::now(),
                    orphaned,
                },
            );
        }

        let registry = Arc::clone(self);
        let name = conn.name.clone();
        let grace = self.grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            registry.expire_grace(&name, epoch).await;
        });
    }

    /// Grace timer callback. Returns true if a disconnect was reported.
    pub async fn expire_grace(&self, name: &str, epoch: u64) -> bool {
        let orphaned = {
            let mut links = self.links.write().await;
            match links.get(name) {
                Some(LinkState::GracePeriod { epoch: current, .. }) if *current == epoch => {}
                _ => {
                    debug!(agent = %name, epoch, "Grace timer superseded, no alert");
                    return false;
                }
            }
            match links.insert(name.to_string(), LinkState::Disconnected) {
                Some(LinkState::GracePeriod { orphaned, .. }) => orphaned,
                _ => Vec::new(),
            }
        };

        let mut text = format!("Agent {name} disconnected");
        if !orphaned.is_empty() {
            text.push_str(&format!(
                "; {} task(s) orphaned: {}",
                orphaned.len(),
                orphan_digest(&orphaned)
            ));
            self.push_orphans(orphaned).await;
        }
        warn!(agent = %name, "{text}");
        self.events.on_connection_event(text).await;
        true
    }

    /// The live connection for `name`.
    pub async fn get(&self, name: &str) -> Option<Arc<AgentConnection>> {
        match self.links.read().await.get(name) {
            Some(LinkState::Connected(conn)) => Some(Arc::clone(conn)),
            _ => None,
        }
    }

    pub async fn link_status(&self, name: &str) -> Option<LinkStatus> {
        self.links.read().await.get(name).map(|state| match state {
            LinkState::Connected(_) => LinkStatus::Connected,
            LinkState::GracePeriod { .. } => LinkStatus::GracePeriod,
            LinkState::Disconnected => LinkStatus::Disconnected,
        })
    }

    /// All live connections.
    pub async fn connections(&self) -> Vec<Arc<AgentConnection>> {
        self.links
            .read()
            .await
            .values()
            .filter_map(|state| match state {
                LinkState::Connected(conn) => Some(Arc::clone(conn)),
                _ => None,
            })
            .collect()
    }

    /// Read-only snapshot, sorted by name.
    pub async fn list_connections(&self) -> Vec<ConnectionInfo> {
        let mut rows = Vec::new();
        for conn in self.connections().await {
            rows.push(ConnectionInfo {
                name: conn.name.clone(),
                connected_at: conn.connected_at,
                active_tasks: conn.active_count().await,
                cwd: conn.cwd.clone(),
                projects: conn.projects.clone(),
            });
        }
        rows.sort_by(|a, b| a.name.cmp(&b.name));
        rows
    }

    /// The connection currently owning `task_id`.
    pub async fn find_task_owner(&self, task_id: Uuid) -> Option<Arc<AgentConnection>> {
        for conn in self.connections().await {
            if conn.has_task(task_id).await {
                return Some(conn);
            }
        }
        None
    }

    /// Remove and return a ledger entry, only for the agent that owned it.
    pub async fn take_orphan(&self, agent: &str, task_id: Uuid) -> Option<OrphanedTask> {
        let mut orphans = self.orphans.write().await;
        let idx = orphans
            .iter()
            .position(|o| o.task_id == task_id && o.agent == agent)?;
        orphans.remove(idx)
    }

    pub async fn orphans(&self) -> Vec<OrphanedTask> {
        self.orphans.read().await.iter().cloned().collect()
    }

    async fn push_orphans(&self, tasks: Vec<OrphanedTask>) {
        if tasks.is_empty() {
            return;
        }
        let mut orphans = self.orphans.write().await;
        for task in tasks {
            debug!(task_id = %task.task_id, agent = %task.agent, "Task orphaned");
            orphans.push_back(task);
        }
        while orphans.len() > MAX_ORPHANS {
            orphans.pop_front();
        }
    }
}

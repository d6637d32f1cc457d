//! Hub side — tracks agent connections and routes tasks to them.
//!
//! Core components:
//! - `registry`: one live connection per agent name, disconnect debounce
//! - `coordinator`: dispatch with ack, result correlation, kill
//! - `watchdog`: stale-heartbeat alerts
//! - `socket`: per-connection reader/writer loops and keepalive
//! - `routes`: thin REST surface for the outer application
//! - `uploads`: artifact sink

pub mod coordinator;
pub mod events;
pub mod registry;
pub mod routes;
pub mod socket;
pub mod task;
pub mod uploads;
pub mod watchdog;

use std::sync::Arc;

use axum::Router;
use uuid::Uuid;

pub use coordinator::{TaskCoordinator, TaskResult};
pub use events::{ChannelEvents, CompletionStatus, HubEvent, HubEvents, LogEvents, TaskCompletion};
pub use registry::{AgentConnection, ConnectionInfo, ConnectionRegistry, LinkStatus};
pub use task::{OrphanedTask, TaskState, TrackedTask};
pub use uploads::UploadStore;
pub use watchdog::{StaleTask, Watchdog};

use crate::config::HubConfig;
use crate::error::HubError;

/// The assembled hub: registry, coordinator, watchdog and artifact sink.
pub struct AgentHub {
    config: HubConfig,
    registry: Arc<ConnectionRegistry>,
    coordinator: Arc<TaskCoordinator>,
    watchdog: Arc<Watchdog>,
    uploads: UploadStore,
}

impl AgentHub {
    pub fn new(config: HubConfig, events: Arc<dyn HubEvents>) -> Arc<Self> {
        let registry = ConnectionRegistry::new(
            config.secret.clone(),
            config.disconnect_grace,
            Arc::clone(&events),
        );
        let coordinator = Arc::new(TaskCoordinator::new(
            Arc::clone(&registry),
            Arc::clone(&events),
            config.ack_timeout,
            config.list_timeout,
        ));
        let watchdog = Arc::new(Watchdog::new(
            Arc::clone(&registry),
            events,
            config.stale_after,
        ));
        let uploads = UploadStore::new(config.upload_dir.clone());

        Arc::new(Self {
            config,
            registry,
            coordinator,
            watchdog,
            uploads,
        })
    }

    /// Agent socket plus REST API.
    pub fn router(self: &Arc<Self>) -> Router {
        socket::socket_routes(Arc::clone(self)).merge(routes::api_routes(Arc::clone(self)))
    }

    /// Start the periodic stale-task scan.
    pub fn spawn_watchdog(&self) -> tokio::task::JoinHandle<()> {
        watchdog::spawn_watchdog(Arc::clone(&self.watchdog), self.config.watchdog_interval)
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn coordinator(&self) -> &Arc<TaskCoordinator> {
        &self.coordinator
    }

    pub fn watchdog(&self) -> &Arc<Watchdog> {
        &self.watchdog
    }

    pub fn uploads(&self) -> &UploadStore {
        &self.uploads
    }

    pub async fn dispatch(&self, agent: &str, prompt: &str, dir: &str) -> Result<Uuid, HubError> {
        self.coordinator.dispatch(agent, prompt, dir).await
    }

    pub async fn kill(&self, task_id: Uuid) -> Result<(), HubError> {
        self.coordinator.kill(task_id).await
    }

    pub async fn list_connections(&self) -> Vec<ConnectionInfo> {
        self.registry.list_connections().await
    }
}

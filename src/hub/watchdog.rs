//! Liveness watchdog — flags tasks whose heartbeat has gone stale.
//!
//! Advisory only: a stale task is reported, never killed.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

use super::events::HubEvents;
use super::registry::ConnectionRegistry;
use super::task::short_id;

/// A task reported as stuck.
#[derive(Debug, Clone)]
pub struct StaleTask {
    pub task_id: Uuid,
    pub agent: String,
    pub prompt_preview: String,
    pub since_heartbeat: Duration,
    pub running_for: Duration,
}

pub struct Watchdog {
    registry: Arc<ConnectionRegistry>,
    events: Arc<dyn HubEvents>,
    stale_after: Duration,
    /// Tasks alerted in their current stale episode.
    alerted: Mutex<HashSet<Uuid>>,
}

impl Watchdog {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        events: Arc<dyn HubEvents>,
        stale_after: Duration,
    ) -> Self {
        Self {
            registry,
            events,
            stale_after,
            alerted: Mutex::new(HashSet::new()),
        }
    }

    /// Run one scan. Returns the tasks newly alerted on.
    pub async fn check(&self) -> Vec<StaleTask> {
        let mut active = HashSet::new();
        let mut stale = Vec::new();
        for conn in self.registry.connections().await {
            for task in conn.tasks().await {
                active.insert(task.id);
                if task.since_heartbeat() > self.stale_after {
                    stale.push(StaleTask {
                        task_id: task.id,
                        agent: task.agent.clone(),
                        prompt_preview: task.prompt_preview.clone(),
                        since_heartbeat: task.since_heartbeat(),
                        running_for: task.elapsed(),
                    });
                }
            }
        }

        let fresh: Vec<StaleTask> = {
            let mut alerted = self.alerted.lock().await;
            let stale_ids: HashSet<Uuid> = stale.iter().map(|s| s.task_id).collect();
            // Episode over: task finished, or heartbeats resumed.
            alerted.retain(|id| active.contains(id) && stale_ids.contains(id));
            stale
                .into_iter()
                .filter(|s| alerted.insert(s.task_id))
                .collect()
        };

        for task in &fresh {
            warn!(
                agent = %task.agent,
                task_id = %task.task_id,
                since_heartbeat_secs = task.since_heartbeat.as_secs(),
                "Task looks stuck"
            );
            self.events
                .on_connection_event(format!(
                    "[{}] task {} ({}) has not sent a heartbeat for {} min (running {} min)",
                    task.agent,
                    short_id(task.task_id),
                    task.prompt_preview,
                    task.since_heartbeat.as_secs() / 60,
                    task.running_for.as_secs() / 60,
                ))
                .await;
        }
        fresh
    }
}

/// Spawn the periodic scan.
pub fn spawn_watchdog(watchdog: Arc<Watchdog>, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // Skip immediate first tick
        ticker.tick().await;

        loop {
            ticker.tick().await;
            watchdog.check().await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::events::{ChannelEvents, HubEvent};
    use crate::hub::registry::AgentConnection;
    use crate::hub::task::TrackedTask;
    use tokio::sync::mpsc;

    async fn setup(
        stale_after: Duration,
    ) -> (
        Watchdog,
        Arc<AgentConnection>,
        mpsc::Receiver<crate::protocol::Outbound>,
        mpsc::UnboundedReceiver<HubEvent>,
    ) {
        let (events, rx) = ChannelEvents::new();
        let events: Arc<dyn HubEvents> = Arc::new(events);
        let registry = ConnectionRegistry::new(None, Duration::from_secs(10), Arc::clone(&events));
        let (tx, out) = mpsc::channel(4);
        let conn = Arc::new(AgentConnection::new(
            registry.next_conn_id(),
            "mac",
            "/",
            vec![],
            tx,
        ));
        registry.register(Arc::clone(&conn), "").await.unwrap();
        (Watchdog::new(registry, events, stale_after), conn, out, rx)
    }

    #[tokio::test]
    async fn alerts_once_per_episode() {
        let (watchdog, conn, _out, mut events) = setup(Duration::from_millis(20)).await;
        let task_id = Uuid::new_v4();
        conn.track(TrackedTask::new(task_id, "mac", "slow build", ""))
            .await;

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(watchdog.check().await.len(), 1);
        assert!(watchdog.check().await.is_empty());

        match events.recv().await.unwrap() {
            HubEvent::Connection(text) => assert!(text.contains("slow build")),
            other => panic!("unexpected event {other:?}"),
        }
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn heartbeat_starts_a_new_episode() {
        let (watchdog, conn, _out, _events) = setup(Duration::from_millis(20)).await;
        let task_id = Uuid::new_v4();
        conn.track(TrackedTask::new(task_id, "mac", "x", "")).await;

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(watchdog.check().await.len(), 1);

        conn.update_task(task_id, |t| t.last_heartbeat = std::time::Instant::now())
            .await;
        assert!(watchdog.check().await.is_empty());

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(watchdog.check().await.len(), 1);
    }

    #[tokio::test]
    async fn finished_task_stops_alerting() {
        let (watchdog, conn, _out, _events) = setup(Duration::from_millis(20)).await;
        let task_id = Uuid::new_v4();
        conn.track(TrackedTask::new(task_id, "mac", "x", "")).await;

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(watchdog.check().await.len(), 1);

        conn.take_task(task_id).await;
        assert!(watchdog.check().await.is_empty());
        assert!(watchdog.alerted.lock().await.is_empty());
    }

    #[tokio::test]
    async fn fresh_tasks_are_not_flagged() {
        let (watchdog, conn, _out, _events) = setup(Duration::from_secs(600)).await;
        conn.track(TrackedTask::new(Uuid::new_v4(), "mac", "x", ""))
            .await;
        assert!(watchdog.check().await.is_empty());
    }
}

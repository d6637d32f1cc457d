//! The worker's handle on its current hub connection.
//!
//! Task supervisors outlive individual sockets, so they send through this
//! instead of holding a writer queue directly.

use tokio::sync::{RwLock, mpsc, oneshot};

use crate::error::WorkerError;
use crate::protocol::{AgentMessage, Outbound};

#[derive(Default)]
pub struct HubLink {
    current: RwLock<Option<(u64, mpsc::Sender<Outbound>)>>,
}

impl HubLink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the writer queue of a fresh connection.
    pub async fn attach(&self, generation: u64, tx: mpsc::Sender<Outbound>) {
        *self.current.write().await = Some((generation, tx));
    }

    /// Drop the writer queue, unless a newer connection already replaced it.
    pub async fn detach(&self, generation: u64) {
        let mut current = self.current.write().await;
        if matches!(*current, Some((g, _)) if g == generation) {
            *current = None;
        }
    }

    pub async fn is_connected(&self) -> bool {
        self.current.read().await.is_some()
    }

    pub async fn send(&self, msg: AgentMessage) -> Result<(), WorkerError> {
        self.enqueue(Outbound::Message(msg)).await
    }

    /// Send and wait until the writer has put the frame on the socket.
    /// Fails if the connection drops first, even after the frame was queued.
    pub async fn send_confirmed(&self, msg: AgentMessage) -> Result<(), WorkerError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.enqueue(Outbound::Confirmed(msg, ack_tx)).await?;
        ack_rx
            .await
            .map_err(|_| WorkerError::Transport("connection closed before write".to_string()))
    }

    pub async fn enqueue(&self, item: Outbound) -> Result<(), WorkerError> {
        let tx = self
            .current
            .read()
            .await
            .as_ref()
            .map(|(_, tx)| tx.clone())
            .ok_or_else(|| WorkerError::Transport("not connected to hub".to_string()))?;
        tx.send(item)
            .await
            .map_err(|_| WorkerError::Transport("connection writer closed".to_string()))
    }
}

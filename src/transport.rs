//! Single-writer loop shared by both ends of an agent link.
//!
//! The hub (axum) and the worker (tungstenite) use different message types,
//! so each side implements [`WireFrame`] for its own and runs the same loop.

use std::fmt::Display;
use std::time::Duration;

use futures::{Sink, SinkExt};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::protocol::{AgentMessage, Outbound};

/// Builds the transport frames the writer needs.
pub trait WireFrame: Sized {
    fn text(json: String) -> Self;
    fn ping() -> Self;
    fn pong(data: Vec<u8>) -> Self;
    fn close(reason: String) -> Self;
}

/// Drain `rx` into `sink` until the queue closes, a write fails or a close
/// frame goes out. Sends a transport ping every `ping_interval`.
pub async fn write_loop<S, M>(
    mut sink: S,
    mut rx: mpsc::Receiver<Outbound>,
    peer: String,
    ping_interval: Duration,
    write_timeout: Duration,
) where
    S: Sink<M> + Unpin,
    S::Error: Display,
    M: WireFrame,
{
    let mut ticker = tokio::time::interval(ping_interval);
    // Skip immediate first tick
    ticker.tick().await;

    loop {
        let item = tokio::select! {
            item = rx.recv() => match item {
                Some(item) => item,
                None => break,
            },
            _ = ticker.tick() => Outbound::Ping,
        };

        let (frame, confirm, closing) = match item {
            Outbound::Message(msg) => match encode(&msg, &peer) {
                Some(frame) => (frame, None, false),
                None => continue,
            },
            Outbound::Confirmed(msg, ack) => match encode(&msg, &peer) {
                Some(frame) => (frame, Some(ack), false),
                None => continue,
            },
            Outbound::Ping => (M::ping(), None, false),
            Outbound::Pong(data) => (M::pong(data), None, false),
            Outbound::Close(reason) => (M::close(reason), None, true),
        };

        match timeout(write_timeout, sink.send(frame)).await {
            Ok(Ok(())) => {
                if let Some(ack) = confirm {
                    let _ = ack.send(());
                }
            }
            Ok(Err(e)) => {
                debug!(peer = %peer, error = %e, "Socket write failed");
                break;
            }
            Err(_) => {
                warn!(peer = %peer, "Socket write timed out");
                break;
            }
        }
        if closing {
            break;
        }
    }
}

fn encode<M: WireFrame>(msg: &AgentMessage, peer: &str) -> Option<M> {
    match msg.to_json() {
        Ok(json) => Some(M::text(json)),
        Err(e) => {
            warn!(peer = %peer, kind = msg.kind(), error = %e, "Failed to encode message");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use futures::channel::mpsc as fmpsc;
    use tokio::sync::oneshot;

    #[derive(Debug, PartialEq)]
    enum Frame {
        Text(String),
        Ping,
        Pong(Vec<u8>),
        Close(String),
    }

    impl WireFrame for Frame {
        fn text(json: String) -> Self {
            Frame::Text(json)
        }
        fn ping() -> Self {
            Frame::Ping
        }
        fn pong(data: Vec<u8>) -> Self {
            Frame::Pong(data)
        }
        fn close(reason: String) -> Self {
            Frame::Close(reason)
        }
    }

    #[tokio::test]
    async fn confirmed_fires_after_write() {
        let (sink, mut frames) = fmpsc::channel::<Frame>(8);
        let (tx, rx) = mpsc::channel(8);
        let writer = tokio::spawn(write_loop(
            sink,
            rx,
            "test".to_string(),
            Duration::from_secs(60),
            Duration::from_secs(1),
        ));

        let (ack_tx, ack_rx) = oneshot::channel();
        tx.send(Outbound::Confirmed(AgentMessage::Pong, ack_tx))
            .await
            .unwrap();
        ack_rx.await.unwrap();
        assert_eq!(
            frames.next().await,
            Some(Frame::Text(r#"{"type":"pong"}"#.to_string()))
        );

        tx.send(Outbound::Close("bye".to_string())).await.unwrap();
        assert_eq!(frames.next().await, Some(Frame::Close("bye".to_string())));
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn confirmed_is_dropped_when_write_fails() {
        let (sink, frames) = fmpsc::channel::<Frame>(8);
        drop(frames);
        let (tx, rx) = mpsc::channel(8);
        let writer = tokio::spawn(write_loop(
            sink,
            rx,
            "test".to_string(),
            Duration::from_secs(60),
            Duration::from_secs(1),
        ));

        let (ack_tx, ack_rx) = oneshot::channel();
        tx.send(Outbound::Confirmed(AgentMessage::Pong, ack_tx))
            .await
            .unwrap();
        assert!(ack_rx.await.is_err());
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn pings_on_interval_and_echoes_pongs() {
        let (sink, mut frames) = fmpsc::channel::<Frame>(8);
        let (tx, rx) = mpsc::channel(8);
        tokio::spawn(write_loop(
            sink,
            rx,
            "test".to_string(),
            Duration::from_millis(50),
            Duration::from_secs(1),
        ));

        tx.send(Outbound::Pong(vec![7])).await.unwrap();
        assert_eq!(frames.next().await, Some(Frame::Pong(vec![7])));
        assert_eq!(frames.next().await, Some(Frame::Ping));
    }
}

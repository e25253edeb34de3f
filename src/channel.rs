//! Live observer channels
//!
//! Observers are passive consumers of a cluster's stream (a UI socket, a
//! `watch` command). Each one receives every persisted message as a
//! serialized [`ObserverEvent`].

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::message::Message;

/// Event delivered to live observers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ObserverEvent {
    Message(Message),
}

/// Sink side of a live observer
pub trait LiveObserver: Send + Sync {
    /// Deliver one serialized event; an error detaches the observer
    fn send(&self, payload: &str) -> Result<(), ChannelError>;
}

/// Observer backed by an unbounded channel
#[derive(Clone)]
pub struct ObserverSink {
    tx: mpsc::UnboundedSender<String>,
}

impl LiveObserver for ObserverSink {
    fn send(&self, payload: &str) -> Result<(), ChannelError> {
        self.tx
            .send(payload.to_string())
            .map_err(|_| ChannelError::Closed)
    }
}

/// Receiving side handed to the consumer of an [`ObserverSink`]
pub struct ObserverChannel {
    rx: mpsc::UnboundedReceiver<String>,
}

impl ObserverChannel {
    /// Create a connected channel/sink pair
    pub fn new() -> (Self, ObserverSink) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { rx }, ObserverSink { tx })
    }

    /// Try to receive a raw payload (non-blocking)
    pub fn try_recv(&mut self) -> Option<String> {
        self.rx.try_recv().ok()
    }

    /// Receive the next raw payload
    pub async fn recv(&mut self) -> Option<String> {
        self.rx.recv().await
    }

    /// Receive and decode the next event
    pub async fn recv_event(&mut self) -> Option<ObserverEvent> {
        let raw = self.rx.recv().await?;
        serde_json::from_str(&raw).ok()
    }
}

/// Channel errors
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Channel is closed")]
    Closed,

    #[error("Observer write failed: {0}")]
    Io(#[from] std::io::Error),
}

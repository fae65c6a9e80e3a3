//! Connection Identity
//!
//! Identifiers and outbound handles for live client connections.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::protocol::SignalingMessage;

/// Opaque identifier for one physical client connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Generate a fresh random identifier
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Sending side of one connection, owned by the gateway
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    message_tx: mpsc::UnboundedSender<SignalingMessage>,
    connected_at: DateTime<Utc>,
}

impl ConnectionHandle {
    pub fn new(message_tx: mpsc::UnboundedSender<SignalingMessage>) -> Self {
        Self {
            message_tx,
            connected_at: Utc::now(),
        }
    }

    /// Queue a message for the connection's writer task.
    ///
    /// Returns false if the writer has already gone away.
    pub fn send(&self, message: SignalingMessage) -> bool {
        self.message_tx.send(message).is_ok()
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }
}

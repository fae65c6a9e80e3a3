//! Connection Gateway
//!
//! Registers live connections, feeds their lifecycle into the pairing
//! coordinator, and routes coordinator events back to the right socket.

use chrono::Utc;
use log::{debug, info, warn};
use parking_lot::RwLock;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::connection::{ConnectionHandle, ConnectionId};
use crate::coordinator::{EventSink, PairingCoordinator, PartnerLeftPolicy, PeerEvent};
use crate::error::GatewayError;
use crate::protocol::SignalingMessage;

impl From<PeerEvent> for SignalingMessage {
    fn from(event: PeerEvent) -> Self {
        match event {
            PeerEvent::Paired { partner } => SignalingMessage::Paired {
                partner_id: partner,
            },
            PeerEvent::PartnerLeft => SignalingMessage::PartnerLeft,
            PeerEvent::Message { payload } => SignalingMessage::Message { payload },
        }
    }
}

/// Live connection handles, keyed by id
#[derive(Default)]
pub struct ConnectionRegistry {
    handles: RwLock<HashMap<ConnectionId, ConnectionHandle>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&self, id: ConnectionId, handle: ConnectionHandle) -> Result<(), GatewayError> {
        match self.handles.write().entry(id) {
            Entry::Occupied(_) => Err(GatewayError::IdCollision(id)),
            Entry::Vacant(slot) => {
                slot.insert(handle);
                Ok(())
            }
        }
    }

    fn remove(&self, id: &ConnectionId) -> Option<ConnectionHandle> {
        self.handles.write().remove(id)
    }

    /// Queue a message for one connection. Unknown ids are ignored.
    pub fn send(&self, id: ConnectionId, message: SignalingMessage) {
        match self.handles.read().get(&id) {
            Some(handle) => {
                if !handle.send(message) {
                    debug!("Writer for {} already closed", id);
                }
            }
            None => debug!("Dropping {:?} for unknown connection {}", message, id),
        }
    }

    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.handles.read().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.handles.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.read().is_empty()
    }
}

impl EventSink for ConnectionRegistry {
    fn deliver(&self, to: ConnectionId, event: PeerEvent) {
        self.send(to, event.into());
    }
}

/// Transport-agnostic front door for client connections
pub struct ConnectionGateway {
    registry: Arc<ConnectionRegistry>,
    coordinator: PairingCoordinator<Arc<ConnectionRegistry>>,
}

impl ConnectionGateway {
    pub fn new(policy: PartnerLeftPolicy) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        Self {
            coordinator: PairingCoordinator::new(registry.clone(), policy),
            registry,
        }
    }

    pub fn coordinator(&self) -> &PairingCoordinator<Arc<ConnectionRegistry>> {
        &self.coordinator
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Register a new connection and put it in the waiting pool.
    ///
    /// The connection is told its own id before any pairing event.
    pub fn on_connect(
        &self,
        message_tx: mpsc::UnboundedSender<SignalingMessage>,
    ) -> Result<ConnectionId, GatewayError> {
        let id = ConnectionId::new();
        self.on_connect_with_id(id, message_tx)?;
        Ok(id)
    }

    /// Register a connection under a caller-chosen id.
    ///
    /// Fails without touching pairing state if the id is already live.
    pub fn on_connect_with_id(
        &self,
        id: ConnectionId,
        message_tx: mpsc::UnboundedSender<SignalingMessage>,
    ) -> Result<(), GatewayError> {
        let handle = ConnectionHandle::new(message_tx);
        self.registry.insert(id, handle)?;
        self.registry.send(
            id,
            SignalingMessage::Welcome {
                connection_id: id,
                requeue_on_partner_left: self.coordinator.policy() == PartnerLeftPolicy::Requeue,
            },
        );
        info!("Connection {} registered ({} online)", id, self.registry.len());

        self.coordinator.admit(id);
        Ok(())
    }

    /// Tear down a connection. Pairing state is released before the handle
    /// is dropped, so the partner's notification is already queued.
    pub fn on_disconnect(&self, id: ConnectionId) {
        self.coordinator.release(id);
        match self.registry.remove(&id) {
            Some(handle) => {
                let secs = (Utc::now() - handle.connected_at()).num_seconds();
                info!("Connection {} closed after {}s", id, secs);
            }
            None => debug!("Disconnect for unknown connection {}", id),
        }
    }

    /// Relay a payload to the sender's partner, if it has one
    pub fn on_message(&self, id: ConnectionId, payload: serde_json::Value) {
        self.coordinator.relay(id, payload);
    }

    /// Skip the current partner or ask for one when idle
    pub fn on_next(&self, id: ConnectionId) {
        self.coordinator.next(id);
    }

    /// Leave the pool or the current pairing but stay connected
    pub fn on_stop(&self, id: ConnectionId) {
        self.coordinator.release(id);
    }

    /// Push an event to one connection; unknown ids are ignored
    pub fn deliver(&self, id: ConnectionId, event: PeerEvent) {
        self.registry.deliver(id, event);
    }

    pub fn stats(&self) -> SignalingMessage {
        let pool = self.coordinator.stats();
        SignalingMessage::StatsReport {
            online: self.registry.len(),
            waiting: pool.waiting,
            pairs: pool.pairs,
        }
    }

    /// Dispatch one decoded client request
    pub fn handle_request(&self, id: ConnectionId, message: SignalingMessage) {
        if !message.is_client_request() {
            warn!("Connection {} sent server-only message {:?}", id, message);
            self.registry.send(
                id,
                SignalingMessage::Error {
                    message: "Unsupported message type".to_string(),
                },
            );
            return;
        }
        match message {
            SignalingMessage::Send { payload } => self.on_message(id, payload),
            SignalingMessage::Next => self.on_next(id),
            SignalingMessage::Stop => self.on_stop(id),
            SignalingMessage::Stats => self.registry.send(id, self.stats()),
            // keep_alive
            _ => {}
        }
    }
}

//! Chat Roulette - anonymous pairing core
//!
//! This library pairs concurrently connected clients two at a time and
//! relays signaling payloads between the members of each pair.

pub mod config;
pub mod connection;
pub mod coordinator;
pub mod error;
pub mod gateway;
pub mod listener;
pub mod protocol;
pub mod tls;

pub use config::{ClientConfig, ServerConfig};
pub use connection::{ConnectionHandle, ConnectionId};
pub use coordinator::{EventSink, PairingCoordinator, PartnerLeftPolicy, PeerEvent, PoolStats};
pub use gateway::ConnectionGateway;
pub use listener::SignalingServer;
pub use protocol::SignalingMessage;

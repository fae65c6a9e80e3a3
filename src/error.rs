//! Error types

use thiserror::Error;

use crate::connection::ConnectionId;

/// Gateway errors
#[derive(Error, Debug)]
pub enum GatewayError {
    /// A freshly generated identifier is already registered; the
    /// connection must be refused rather than share an id
    #[error("Connection id {0} already in use")]
    IdCollision(ConnectionId),
}

/// Wire protocol errors
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Frame of {len} bytes exceeds limit of {max} bytes")]
    FrameTooLarge { len: usize, max: usize },
}

/// Server startup and listener errors
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid listen address: {0}")]
    InvalidAddress(#[from] std::net::AddrParseError),
    #[error("TLS error: {0}")]
    Tls(String),
}

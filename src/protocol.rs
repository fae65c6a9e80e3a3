//! Signaling Protocol
//!
//! Defines the message format for client-server signaling and the
//! length-prefixed framing used on the wire.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::connection::ConnectionId;
use crate::error::ProtocolError;

/// Default upper bound for one signaling frame (64KB is plenty for JSON)
pub const DEFAULT_MAX_FRAME_BYTES: usize = 64 * 1024;

/// Signaling messages exchanged between client and server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalingMessage {
    // Client -> Server
    /// Relay an opaque payload to the current partner
    Send {
        payload: serde_json::Value,
    },
    /// Drop the current partner (if any) and look for another
    Next,
    /// Leave the pool or the current pairing without disconnecting
    Stop,
    Stats,
    KeepAlive,

    // Server -> Client
    Welcome {
        connection_id: ConnectionId,
        /// Whether the server puts this connection back in the pool by
        /// itself when its partner leaves
        requeue_on_partner_left: bool,
    },
    Paired {
        partner_id: ConnectionId,
    },
    PartnerLeft,
    Message {
        payload: serde_json::Value,
    },
    StatsReport {
        online: usize,
        waiting: usize,
        pairs: usize,
    },
    Error {
        message: String,
    },
}

impl SignalingMessage {
    /// Serialize the message to JSON bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Deserialize a message from JSON bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Create a framed message with length prefix (4 bytes, big-endian)
    pub fn to_framed(&self) -> Result<Vec<u8>, serde_json::Error> {
        let data = self.to_bytes()?;
        let len = (data.len() as u32).to_be_bytes();
        let mut framed = Vec::with_capacity(4 + data.len());
        framed.extend_from_slice(&len);
        framed.extend_from_slice(&data);
        Ok(framed)
    }

    /// Whether a client is allowed to send this message
    pub fn is_client_request(&self) -> bool {
        matches!(
            self,
            SignalingMessage::Send { .. }
                | SignalingMessage::Next
                | SignalingMessage::Stop
                | SignalingMessage::Stats
                | SignalingMessage::KeepAlive
        )
    }
}

/// Read one length-prefixed frame.
///
/// Returns `Ok(None)` on a clean end of stream before a new frame starts.
pub async fn read_frame<R>(reader: &mut R, max_len: usize) -> Result<Option<Vec<u8>>, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    // Only a close before the first header byte is a clean end of stream
    if reader.read(&mut len_buf[..1]).await? == 0 {
        return Ok(None);
    }
    reader.read_exact(&mut len_buf[1..]).await?;

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_len {
        return Err(ProtocolError::FrameTooLarge { len, max: max_len });
    }

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(Some(buf))
}

/// Serialize and write one framed message
pub async fn write_message<W>(writer: &mut W, message: &SignalingMessage) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    let data = message.to_framed()?;
    writer.write_all(&data).await?;
    writer.flush().await?;
    Ok(())
}

/// Read and parse one framed message
pub async fn read_message<R>(
    reader: &mut R,
    max_len: usize,
) -> Result<Option<SignalingMessage>, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    match read_frame(reader, max_len).await? {
        Some(buf) => Ok(Some(SignalingMessage::from_bytes(&buf)?)),
        None => Ok(None),
    }
}

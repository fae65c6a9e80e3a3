//! Signaling Listener
//!
//! TCP (optionally TLS) accept loop. Each connection gets a reader loop that
//! feeds the gateway and a writer task that drains the connection's queue.

use log::{debug, error, info, warn};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;

use crate::config::ServerConfig;
use crate::connection::ConnectionId;
use crate::error::{ProtocolError, ServerError};
use crate::gateway::ConnectionGateway;
use crate::protocol::{read_frame, write_message, SignalingMessage};
use crate::tls;

/// Accepts client connections and wires them to a gateway
pub struct SignalingServer {
    gateway: Arc<ConnectionGateway>,
    acceptor: Option<TlsAcceptor>,
    max_frame_bytes: usize,
}

impl SignalingServer {
    pub fn new(config: &ServerConfig) -> Result<Self, ServerError> {
        let acceptor = match config.tls_paths() {
            Some((cert, key)) => Some(tls::acceptor(cert, key)?),
            None => None,
        };
        Ok(Self {
            gateway: Arc::new(ConnectionGateway::new(config.partner_left_policy)),
            acceptor,
            max_frame_bytes: config.max_frame_bytes,
        })
    }

    pub fn gateway(&self) -> &Arc<ConnectionGateway> {
        &self.gateway
    }

    pub fn is_tls(&self) -> bool {
        self.acceptor.is_some()
    }

    pub async fn bind(config: &ServerConfig) -> Result<TcpListener, ServerError> {
        let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
        Ok(TcpListener::bind(addr).await?)
    }

    /// Accept connections until the listener fails
    pub async fn serve(self, listener: TcpListener) -> Result<(), ServerError> {
        self.serve_until(listener, std::future::pending()).await
    }

    /// Accept connections until `shutdown` resolves
    pub async fn serve_until(
        self,
        listener: TcpListener,
        shutdown: impl Future<Output = ()>,
    ) -> Result<(), ServerError> {
        info!(
            "Signaling server listening on {} ({})",
            listener.local_addr()?,
            if self.is_tls() { "tls" } else { "plain tcp" }
        );
        tokio::pin!(shutdown);

        loop {
            let (stream, peer_addr) = tokio::select! {
                accepted = listener.accept() => accepted?,
                _ = &mut shutdown => {
                    info!("Shutting down listener");
                    return Ok(());
                }
            };
            let gateway = self.gateway.clone();
            let acceptor = self.acceptor.clone();
            let max_frame_bytes = self.max_frame_bytes;

            tokio::spawn(async move {
                match acceptor {
                    Some(acceptor) => match acceptor.accept(stream).await {
                        Ok(tls_stream) => {
                            handle_client(tls_stream, peer_addr, gateway, max_frame_bytes).await
                        }
                        Err(e) => error!("TLS handshake failed for {}: {}", peer_addr, e),
                    },
                    None => handle_client(stream, peer_addr, gateway, max_frame_bytes).await,
                }
            });
        }
    }
}

/// Drive one client connection from registration to teardown
pub async fn handle_client<S>(
    stream: S,
    peer_addr: SocketAddr,
    gateway: Arc<ConnectionGateway>,
    max_frame_bytes: usize,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (message_tx, mut message_rx) = mpsc::unbounded_channel::<SignalingMessage>();
    let (mut read_half, mut write_half) = tokio::io::split(stream);

    let id = match gateway.on_connect(message_tx) {
        Ok(id) => id,
        Err(e) => {
            error!("Refusing connection from {}: {}", peer_addr, e);
            return;
        }
    };
    info!("Client {} connected as {}", peer_addr, id);

    // Ends once the gateway drops this connection's handle
    tokio::spawn(async move {
        while let Some(message) = message_rx.recv().await {
            if let Err(e) = write_message(&mut write_half, &message).await {
                debug!("Write to {} failed: {}", id, e);
                break;
            }
        }
    });

    if let Err(e) = read_loop(&mut read_half, id, &gateway, max_frame_bytes).await {
        warn!("Connection {} from {} failed: {}", id, peer_addr, e);
    }

    gateway.on_disconnect(id);
    info!("Client {} disconnected", peer_addr);
}

async fn read_loop<R>(
    reader: &mut R,
    id: ConnectionId,
    gateway: &ConnectionGateway,
    max_frame_bytes: usize,
) -> Result<(), ProtocolError>
where
    R: AsyncRead + Unpin,
{
    while let Some(frame) = read_frame(reader, max_frame_bytes).await? {
        match SignalingMessage::from_bytes(&frame) {
            Ok(message) => gateway.handle_request(id, message),
            Err(e) => {
                warn!("Invalid message from {}: {}", id, e);
                gateway.registry().send(
                    id,
                    SignalingMessage::Error {
                        message: "Invalid message format".to_string(),
                    },
                );
            }
        }
    }
    Ok(())
}

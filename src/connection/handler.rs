// src/connection/handler.rs

//! Defines the `ProxyConnectionHandler` which manages the full lifecycle of a
//! downstream tool connection.

use super::guard::ConnectionGuard;
use super::session::SessionState;
use crate::core::RelayError;
use crate::core::client::{ChannelProxyClient, ProxyClient};
use crate::core::manager::ManagerKey;
use crate::core::protocol::{AdbRequestCodec, AdbStatus};
use crate::core::registry::ManagerRegistry;
use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{OwnedSemaphorePermit, broadcast, mpsc};
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

/// What the preamble produced: a client attached to a manager, with the
/// receiving ends of its queue and its shutdown signal.
struct Attached {
    key: ManagerKey,
    client: Arc<ChannelProxyClient>,
    queue_rx: mpsc::Receiver<Bytes>,
    client_shutdown_rx: broadcast::Receiver<()>,
    leftover: BytesMut,
    socket: TcpStream,
}

/// Manages one downstream connection from accept to close.
pub struct ProxyConnectionHandler {
    addr: SocketAddr,
    registry: Arc<ManagerRegistry>,
    client_queue_depth: usize,
    read_buffer_size: usize,
    global_shutdown_rx: broadcast::Receiver<()>,
    session: SessionState,
}

impl ProxyConnectionHandler {
    pub fn new(
        addr: SocketAddr,
        registry: Arc<ManagerRegistry>,
        client_queue_depth: usize,
        read_buffer_size: usize,
        global_shutdown_rx: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            addr,
            registry,
            client_queue_depth,
            read_buffer_size,
            global_shutdown_rx,
            session: SessionState::new(),
        }
    }

    /// Runs the preamble, then relays until either side goes away.
    pub async fn run(
        &mut self,
        socket: TcpStream,
        permit: Option<OwnedSemaphorePermit>,
    ) -> Result<(), RelayError> {
        let (client, queue_rx, client_shutdown_rx) =
            ChannelProxyClient::new(self.client_queue_depth);
        let mut guard =
            ConnectionGuard::new(Arc::clone(&self.registry), client.id(), self.addr, permit);

        let Some(attached) = self
            .negotiate(socket, client, queue_rx, client_shutdown_rx)
            .await?
        else {
            return Ok(());
        };
        guard.set_attached(attached.key.clone());
        self.relay(attached).await
    }

    /// Reads `host:transport:` and `jdwp:` requests, answering each with
    /// `OKAY` or `FAIL`. Returns `None` if the connection ended first.
    async fn negotiate(
        &mut self,
        socket: TcpStream,
        client: Arc<ChannelProxyClient>,
        queue_rx: mpsc::Receiver<Bytes>,
        client_shutdown_rx: broadcast::Receiver<()>,
    ) -> Result<Option<Attached>, RelayError> {
        let mut framed = Framed::new(socket, AdbRequestCodec);

        loop {
            let request = tokio::select! {
                biased;
                _ = self.global_shutdown_rx.recv() => {
                    let _ = framed.send(AdbStatus::Fail("relay is shutting down".into())).await;
                    return Ok(None);
                }
                next = framed.next() => match next {
                    Some(Ok(request)) => request,
                    Some(Err(e)) => {
                        warn!("Bad request from {}: {}", self.addr, e);
                        let _ = framed.send(AdbStatus::Fail(e.to_string())).await;
                        return Err(e);
                    }
                    None => {
                        debug!("Connection from {} closed during the preamble.", self.addr);
                        return Ok(None);
                    }
                }
            };
            debug!("{}: received {:?}", self.addr, request);

            let next = match self.session.advance(request) {
                Ok(next) => next,
                Err(e) => {
                    framed.send(AdbStatus::Fail(e.to_string())).await?;
                    return Ok(None);
                }
            };

            if let SessionState::Relaying(key) = &next {
                let key = key.clone();
                let proxy: Arc<dyn ProxyClient> = client.clone();
                if let Err(e) = self.registry.attach(&key, proxy).await {
                    warn!("Failed to attach {} to {}: {}", self.addr, key, e);
                    framed.send(AdbStatus::Fail(e.to_string())).await?;
                    return Ok(None);
                }
                self.session = next;
                // The guard is not armed yet, so a failed OKAY must detach here.
                if let Err(e) = framed.send(AdbStatus::Okay).await {
                    self.registry.detach(&key, client.id());
                    return Err(e);
                }
                info!("{} attached to {} as {}", self.addr, key, client.id());

                let parts = framed.into_parts();
                return Ok(Some(Attached {
                    key,
                    client,
                    queue_rx,
                    client_shutdown_rx,
                    leftover: parts.read_buf,
                    socket: parts.io,
                }));
            }

            self.session = next;
            framed.send(AdbStatus::Okay).await?;
        }
    }

    async fn relay(&mut self, attached: Attached) -> Result<(), RelayError> {
        let Attached {
            key,
            client,
            mut queue_rx,
            mut client_shutdown_rx,
            leftover,
            socket,
        } = attached;
        let id = client.id();

        // Bytes that arrived in the same read as the final request.
        if !leftover.is_empty() {
            self.registry.write(&key, id, &leftover).await;
        }

        let (mut reader, mut writer) = socket.into_split();
        let mut buf = BytesMut::with_capacity(self.read_buffer_size.max(1));

        loop {
            tokio::select! {
                // Prioritize shutdown signals over other events.
                biased;
                _ = self.global_shutdown_rx.recv() => {
                    info!("Connection handler for {} received GLOBAL shutdown signal.", self.addr);
                    break;
                }
                _ = client_shutdown_rx.recv() => {
                    info!("Relay for {} closed; disconnecting {}.", key, self.addr);
                    flush_pending(&mut queue_rx, &mut writer).await;
                    break;
                }
                Some(bytes) = queue_rx.recv() => {
                    if let Err(e) = writer.write_all(&bytes).await {
                        debug!("Write to {} failed: {}", self.addr, e);
                        break;
                    }
                }
                result = reader.read_buf(&mut buf) => match result {
                    Ok(0) => {
                        debug!("Connection from {} closed by peer.", self.addr);
                        break;
                    }
                    Ok(_) => {
                        self.registry.write(&key, id, &buf).await;
                        buf.clear();
                    }
                    Err(e) => {
                        let e = RelayError::from(e);
                        if e.is_disconnect() {
                            debug!("Connection from {} closed by peer: {}", self.addr, e);
                        } else {
                            warn!("Connection error for {}: {}", self.addr, e);
                        }
                        break;
                    }
                }
            }
        }

        let _ = writer.shutdown().await;
        Ok(())
    }
}

/// Writes out whatever the relay queued before it shut the client down.
async fn flush_pending(queue_rx: &mut mpsc::Receiver<Bytes>, writer: &mut OwnedWriteHalf) {
    while let Ok(bytes) = queue_rx.try_recv() {
        if writer.write_all(&bytes).await.is_err() {
            return;
        }
    }
}

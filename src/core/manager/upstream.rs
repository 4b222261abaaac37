// src/core/manager/upstream.rs

//! The write side of the device connection as the manager sees it, and the
//! tokio tasks that move bytes between the socket and the manager.

use super::{ClientManager, ManagerKey, ShutdownReason};
use crate::config::RelayConfig;
use crate::core::RelayError;
use crate::core::interceptor::InterceptorChain;
use crate::core::transport::BoxedTransport;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{Notify, broadcast, mpsc};
use tracing::{debug, info, warn};

/// Where the manager puts bytes destined for the device.
///
/// `send` is called from inside a relay step and must not block. Callers that
/// can wait use `ready` first so the backlog stays bounded.
#[async_trait]
pub trait UpstreamSink: Send + Sync {
    fn send(&self, bytes: Bytes) -> Result<(), RelayError>;

    /// Resolves once the sink can take another write. Sinks without a
    /// backlog are always ready.
    async fn ready(&self) -> Result<(), RelayError> {
        Ok(())
    }

    /// Closes the connection. Must tolerate repeated calls.
    fn close(&self);
}

/// Writes queued for the device but not yet written, shared with the writer
/// task.
#[derive(Debug, Default)]
pub struct Backlog {
    queued: AtomicUsize,
    drained: Notify,
}

impl Backlog {
    pub fn len(&self) -> usize {
        self.queued.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn push(&self) {
        self.queued.fetch_add(1, Ordering::AcqRel);
    }

    fn pop(&self) {
        self.queued.fetch_sub(1, Ordering::AcqRel);
        self.drained.notify_waiters();
    }
}

/// An `UpstreamSink` backed by a queue that a writer task drains. `send`
/// never fails for lack of room; `ready` holds writers back while
/// `depth` writes are already queued.
pub struct ChannelUpstream {
    tx: mpsc::UnboundedSender<Bytes>,
    close_tx: broadcast::Sender<()>,
    closed: AtomicBool,
    backlog: Arc<Backlog>,
    depth: usize,
    write_timeout: Duration,
}

impl ChannelUpstream {
    pub fn new(
        tx: mpsc::UnboundedSender<Bytes>,
        close_tx: broadcast::Sender<()>,
        backlog: Arc<Backlog>,
        depth: usize,
        write_timeout: Duration,
    ) -> Self {
        Self {
            tx,
            close_tx,
            closed: AtomicBool::new(false),
            backlog,
            depth: depth.max(1),
            write_timeout,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn backlog(&self) -> usize {
        self.backlog.len()
    }
}

fn not_connected() -> RelayError {
    RelayError::Io(Arc::new(std::io::Error::from(
        std::io::ErrorKind::NotConnected,
    )))
}

#[async_trait]
impl UpstreamSink for ChannelUpstream {
    fn send(&self, bytes: Bytes) -> Result<(), RelayError> {
        if self.is_closed() {
            return Err(not_connected());
        }
        self.backlog.push();
        self.tx.send(bytes).map_err(|_| {
            self.backlog.pop();
            RelayError::Io(Arc::new(std::io::Error::from(std::io::ErrorKind::BrokenPipe)))
        })
    }

    /// Waits for the writer task to drain the queue below `depth`. A device
    /// that takes no bytes for `write_timeout` fails the wait.
    async fn ready(&self) -> Result<(), RelayError> {
        let wait = async {
            loop {
                // Registered before the check so a drain in between is not missed.
                let drained = self.backlog.drained.notified();
                if self.is_closed() {
                    return Err(not_connected());
                }
                if self.backlog.len() < self.depth {
                    return Ok(());
                }
                drained.await;
            }
        };
        tokio::time::timeout(self.write_timeout, wait)
            .await
            .map_err(|_| RelayError::UpstreamBackpressure)?
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            // Both tasks may already have exited.
            let _ = self.close_tx.send(());
            self.backlog.drained.notify_waiters();
        }
    }
}

/// Builds a manager over an open device connection and starts the tasks that
/// serve it. The handshake is queued before this returns.
pub fn spawn_upstream(
    key: ManagerKey,
    transport: BoxedTransport,
    chain: InterceptorChain,
    config: &RelayConfig,
) -> Result<Arc<ClientManager>, RelayError> {
    let (reader, writer) = tokio::io::split(transport);
    let (tx, rx) = mpsc::unbounded_channel();
    let (close_tx, _) = broadcast::channel(1);
    let backlog = Arc::new(Backlog::default());
    // Subscribe before the manager exists so no close signal can be missed.
    let reader_close = close_tx.subscribe();
    let writer_close = close_tx.subscribe();

    let upstream = Arc::new(ChannelUpstream::new(
        tx,
        close_tx,
        Arc::clone(&backlog),
        config.upstream_queue_depth,
        config.write_timeout,
    ));
    let manager = Arc::new(ClientManager::new(key, upstream, chain, config)?);

    tokio::spawn(run_writer(
        writer,
        rx,
        backlog,
        writer_close,
        config.write_timeout,
        Arc::downgrade(&manager),
    ));
    tokio::spawn(run_reader(
        reader,
        Arc::clone(&manager),
        reader_close,
        config.read_buffer_size,
    ));
    Ok(manager)
}

/// Feeds device reads into the manager until EOF, an error, or close.
pub async fn run_reader<R>(
    mut reader: R,
    manager: Arc<ClientManager>,
    mut close_rx: broadcast::Receiver<()>,
    read_buffer_size: usize,
) where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(read_buffer_size.max(1));
    loop {
        buf.clear();
        tokio::select! {
            _ = close_rx.recv() => {
                debug!("Upstream reader for {} stopping", manager.key());
                break;
            }
            result = reader.read_buf(&mut buf) => match result {
                Ok(0) => {
                    info!("Device closed the connection for {}", manager.key());
                    manager.shutdown(ShutdownReason::UpstreamClosed);
                    break;
                }
                Ok(_) => manager.on_device_data(&buf),
                Err(e) => {
                    warn!("Read from device for {} failed: {}", manager.key(), e);
                    manager.shutdown(ShutdownReason::UpstreamError(e.to_string()));
                    break;
                }
            }
        }
    }
}

/// Drains the upstream queue to the socket. Each write is bounded by
/// `write_timeout` so a stalled device cannot hold the queue forever.
pub async fn run_writer<W>(
    mut writer: W,
    mut rx: mpsc::UnboundedReceiver<Bytes>,
    backlog: Arc<Backlog>,
    mut close_rx: broadcast::Receiver<()>,
    write_timeout: Duration,
    manager: Weak<ClientManager>,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            biased;
            _ = close_rx.recv() => break,
            next = rx.recv() => {
                let Some(bytes) = next else { break };
                let failure = match tokio::time::timeout(write_timeout, writer.write_all(&bytes)).await {
                    Ok(Ok(())) => None,
                    Ok(Err(e)) => Some(e.to_string()),
                    Err(_) => Some(format!("write stalled for {write_timeout:?}")),
                };
                backlog.pop();
                if let Some(reason) = failure {
                    if let Some(manager) = manager.upgrade() {
                        warn!("Write to device for {} failed: {}", manager.key(), reason);
                        manager.shutdown(ShutdownReason::UpstreamError(reason));
                    }
                    break;
                }
            }
        }
    }
    let _ = writer.shutdown().await;
}

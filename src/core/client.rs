// src/core/client.rs

//! Downstream clients: the `ProxyClient` seam, the registry slot that wraps an
//! attached client, and the queue-backed client used by the TCP front-end.

use crate::core::RelayError;
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::{broadcast, mpsc};
use tracing::debug;

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

/// A stable identity for one downstream client, used as the key for all
/// per-client interceptor state.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(u64);

impl ClientId {
    /// Allocates a process-unique id.
    pub fn next() -> Self {
        ClientId(NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl From<u64> for ClientId {
    fn from(id: u64) -> Self {
        ClientId(id)
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

impl fmt::Debug for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// One downstream consumer of relayed traffic.
///
/// `write` is called from inside a relay step and must not block. A failed
/// write is treated as a detach request for this client only.
pub trait ProxyClient: Send + Sync {
    fn id(&self) -> ClientId;

    fn write(&self, bytes: &[u8]) -> Result<(), RelayError>;

    /// Tells the client the relay is done with it. Must be idempotent.
    fn shutdown(&self);
}

/// A client as seen by the manager and interceptors while it is attached.
pub struct AttachedClient {
    client: Arc<dyn ProxyClient>,
    id: ClientId,
    attached: AtomicBool,
    broken: AtomicBool,
}

impl AttachedClient {
    pub(crate) fn new(client: Arc<dyn ProxyClient>) -> Self {
        let id = client.id();
        Self {
            client,
            id,
            attached: AtomicBool::new(true),
            broken: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    /// False once the client has been detached or its pipe has broken.
    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::Acquire) && !self.broken.load(Ordering::Acquire)
    }

    /// Delivers bytes to the client. Returns false if the client is gone; a
    /// write failure marks the client broken so the manager detaches it.
    pub fn send(&self, bytes: &[u8]) -> bool {
        if !self.is_attached() {
            return false;
        }
        match self.client.write(bytes) {
            Ok(()) => true,
            Err(e) => {
                debug!("Write to {} failed: {}. Marking it for detach.", self.id, e);
                self.broken.store(true, Ordering::Release);
                false
            }
        }
    }

    pub(crate) fn is_broken(&self) -> bool {
        self.broken.load(Ordering::Acquire)
    }

    /// Marks the slot detached. Returns true only for the first call.
    pub(crate) fn mark_detached(&self) -> bool {
        self.attached.swap(false, Ordering::AcqRel)
    }

    pub(crate) fn shutdown_client(&self) {
        self.client.shutdown();
    }
}

impl fmt::Debug for AttachedClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttachedClient")
            .field("id", &self.id)
            .field("attached", &self.is_attached())
            .finish()
    }
}

/// A `ProxyClient` that hands bytes to a bounded queue drained by the client's
/// own I/O task. A full queue counts as a broken pipe.
#[derive(Debug)]
pub struct ChannelProxyClient {
    id: ClientId,
    tx: mpsc::Sender<Bytes>,
    shutdown_tx: broadcast::Sender<()>,
    is_shut_down: AtomicBool,
}

impl ChannelProxyClient {
    /// Creates the client together with the receiving end of its queue and a
    /// receiver that fires when the relay shuts the client down.
    pub fn new(queue_depth: usize) -> (Arc<Self>, mpsc::Receiver<Bytes>, broadcast::Receiver<()>) {
        let (tx, rx) = mpsc::channel(queue_depth.max(1));
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let client = Arc::new(Self {
            id: ClientId::next(),
            tx,
            shutdown_tx,
            is_shut_down: AtomicBool::new(false),
        });
        (client, rx, shutdown_rx)
    }

    pub fn is_shut_down(&self) -> bool {
        self.is_shut_down.load(Ordering::Acquire)
    }
}

impl ProxyClient for ChannelProxyClient {
    fn id(&self) -> ClientId {
        self.id
    }

    fn write(&self, bytes: &[u8]) -> Result<(), RelayError> {
        match self.tx.try_send(Bytes::copy_from_slice(bytes)) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(RelayError::ClientBackpressure(self.id)),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(RelayError::ClientClosed(self.id)),
        }
    }

    fn shutdown(&self) {
        if !self.is_shut_down.swap(true, Ordering::AcqRel) {
            // No receiver just means the connection task is already gone.
            let _ = self.shutdown_tx.send(());
        }
    }
}

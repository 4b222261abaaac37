// src/connection/guard.rs

//! Defines `ConnectionGuard`, an RAII guard for connection resource management.

use crate::core::client::ClientId;
use crate::core::manager::ManagerKey;
use crate::core::registry::ManagerRegistry;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::OwnedSemaphorePermit;
use tracing::debug;

/// Detaches the connection's client from its manager and releases its
/// connection slot however the handler exits.
pub struct ConnectionGuard {
    registry: Arc<ManagerRegistry>,
    client: ClientId,
    addr: SocketAddr,
    attached_to: Option<ManagerKey>,
    _permit: Option<OwnedSemaphorePermit>,
}

impl ConnectionGuard {
    pub(crate) fn new(
        registry: Arc<ManagerRegistry>,
        client: ClientId,
        addr: SocketAddr,
        permit: Option<OwnedSemaphorePermit>,
    ) -> Self {
        Self {
            registry,
            client,
            addr,
            attached_to: None,
            _permit: permit,
        }
    }

    /// Records that the client is now attached to `key`.
    pub(crate) fn set_attached(&mut self, key: ManagerKey) {
        self.attached_to = Some(key);
    }

    pub fn is_attached(&self) -> bool {
        self.attached_to.is_some()
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        debug!(
            "ConnectionGuard dropping, cleaning up resources for connection {}",
            self.addr
        );
        if let Some(key) = self.attached_to.take() {
            self.registry.detach(&key, self.client);
        }
    }
}

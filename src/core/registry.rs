// src/core/registry.rs

//! The process-wide table of live managers, one per `ManagerKey`.
//!
//! A manager is created on the first attach for its key and removes itself
//! from the table when it shuts down. Manager methods are never called while a
//! map reference is held, since a shutdown listener removes the entry.

use crate::config::{InterceptorConfig, RelayConfig};
use crate::core::RelayError;
use crate::core::client::{ClientId, ProxyClient};
use crate::core::interceptor::InterceptorChain;
use crate::core::manager::{ClientManager, ManagerKey, ShutdownListener, ShutdownReason, spawn_upstream};
use crate::core::transport::TransportFactory;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Builds the interceptor chain for a newly opened manager.
pub type ChainFactory = Box<dyn Fn() -> InterceptorChain + Send + Sync>;

const ATTACH_ATTEMPTS: usize = 2;

pub struct ManagerRegistry {
    managers: Arc<DashMap<ManagerKey, Arc<ClientManager>>>,
    /// One lock per key so a key is never opened twice, while opens for
    /// different keys proceed independently.
    open_locks: DashMap<ManagerKey, Arc<Mutex<()>>>,
    factory: Arc<dyn TransportFactory>,
    relay: RelayConfig,
    chain_factory: ChainFactory,
}

impl ManagerRegistry {
    pub fn new(
        factory: Arc<dyn TransportFactory>,
        relay: RelayConfig,
        interceptors: InterceptorConfig,
    ) -> Self {
        Self::with_chain_factory(
            factory,
            relay,
            Box::new(move || InterceptorChain::with_defaults(&interceptors)),
        )
    }

    pub fn with_chain_factory(
        factory: Arc<dyn TransportFactory>,
        relay: RelayConfig,
        chain_factory: ChainFactory,
    ) -> Self {
        Self {
            managers: Arc::new(DashMap::new()),
            open_locks: DashMap::new(),
            factory,
            relay,
            chain_factory,
        }
    }

    /// Returns the live manager for `key`, if any.
    pub fn get(&self, key: &ManagerKey) -> Option<Arc<ClientManager>> {
        self.managers.get(key).map(|entry| Arc::clone(entry.value()))
    }

    pub fn len(&self) -> usize {
        self.managers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.managers.is_empty()
    }

    pub fn keys(&self) -> Vec<ManagerKey> {
        self.managers.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Attaches `client` to the manager for `key`, opening the device
    /// connection first if this is the key's first client.
    pub async fn attach(
        &self,
        key: &ManagerKey,
        client: Arc<dyn ProxyClient>,
    ) -> Result<Arc<ClientManager>, RelayError> {
        let mut last_err = RelayError::ManagerClosed(key.to_string());
        for _ in 0..ATTACH_ATTEMPTS {
            let manager = self.get_or_open(key).await?;
            match manager.add_client(Arc::clone(&client)) {
                Ok(()) => return Ok(manager),
                // The manager shut down between lookup and attach; its
                // listener has already dropped it from the table.
                Err(e @ RelayError::ManagerClosed(_)) => {
                    debug!("Manager for {} closed during attach; retrying", key);
                    last_err = e;
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err)
    }

    /// Detaches a client. A no-op for unknown keys or clients.
    pub fn detach(&self, key: &ManagerKey, client: ClientId) {
        if let Some(manager) = self.get(key) {
            manager.remove_client(client);
        }
    }

    /// Relays client bytes towards the device, waiting while the device's
    /// write backlog is full. A no-op once the key is gone.
    pub async fn write(&self, key: &ManagerKey, client: ClientId, bytes: &[u8]) {
        let Some(manager) = self.get(key) else {
            debug!("Dropping {} bytes from {}: no manager for {}", bytes.len(), client, key);
            return;
        };
        if manager.upstream_ready().await.is_ok() {
            manager.write(client, bytes);
        }
    }

    pub fn on_shutdown(&self, key: &ManagerKey, listener: ShutdownListener) -> Result<(), RelayError> {
        self.get(key)
            .ok_or_else(|| RelayError::ManagerClosed(key.to_string()))?
            .add_shutdown_listener(listener)
    }

    /// Shuts down the manager for `key`, if one is live.
    pub fn shutdown(&self, key: &ManagerKey) {
        if let Some(manager) = self.get(key) {
            manager.shutdown(ShutdownReason::Requested);
        }
    }

    /// Shuts down every live manager.
    pub fn shutdown_all(&self) {
        let managers: Vec<_> = self
            .managers
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        if !managers.is_empty() {
            info!("Shutting down {} relay manager(s)", managers.len());
        }
        for manager in managers {
            manager.shutdown(ShutdownReason::Requested);
        }
    }

    async fn get_or_open(&self, key: &ManagerKey) -> Result<Arc<ClientManager>, RelayError> {
        if let Some(manager) = self.get(key).filter(|m| m.is_active()) {
            return Ok(manager);
        }

        let open_lock = Arc::clone(self.open_locks.entry(key.clone()).or_default().value());
        let _guard = open_lock.lock().await;
        if let Some(manager) = self.get(key).filter(|m| m.is_active()) {
            return Ok(manager);
        }

        let transport = self.factory.open(key).await.inspect_err(|e| {
            warn!("Failed to open device transport for {}: {}", key, e);
        })?;
        let manager = spawn_upstream(key.clone(), transport, (self.chain_factory)(), &self.relay)?;
        self.managers.insert(key.clone(), Arc::clone(&manager));

        let managers = Arc::clone(&self.managers);
        let registered = Arc::downgrade(&manager);
        let listener: ShutdownListener = Box::new(move |key, reason| {
            let removed = managers
                .remove_if(key, |_, current| std::ptr::eq(Arc::as_ptr(current), registered.as_ptr()))
                .is_some();
            if removed {
                debug!("Removed manager for {} from the registry ({})", key, reason);
            }
        });
        if let Err(e) = manager.add_shutdown_listener(listener) {
            self.managers
                .remove_if(key, |_, current| Arc::ptr_eq(current, &manager));
            return Err(e);
        }
        Ok(manager)
    }
}

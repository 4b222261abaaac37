// src/core/manager/mod.rs

//! The `ClientManager` owns one upstream device connection and relays units
//! between it and every attached client.
//!
//! A relay step (one device read or one client write) runs to completion under
//! `core`, which is the single serialization point for the interceptor chain and
//! the framing buffers. The client registry is a separate lock: each step works
//! on a snapshot taken when it starts, and checks `is_attached` before every
//! delivery so a detach lands at the next unit boundary. Detaches requested while
//! a step is running are queued and applied once the step releases `core`.

mod assembler;
pub mod upstream;

pub use assembler::{Assembled, FallbackCause, StreamAssembler};
pub use upstream::{Backlog, ChannelUpstream, UpstreamSink, spawn_upstream};

use crate::config::RelayConfig;
use crate::core::RelayError;
use crate::core::client::{AttachedClient, ClientId, ProxyClient};
use crate::core::interceptor::{Direction, InterceptContext, InterceptorChain};
use crate::core::metrics;
use crate::core::protocol::{HANDSHAKE, JdwpCodec, Unit};
use bytes::{Bytes, BytesMut};
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use strum_macros::Display;
use tracing::{Level, debug, enabled, info, warn};

/// How many leading bytes of relayed traffic are hex-dumped at debug level.
const HEX_PREVIEW_LEN: usize = 32;

/// Identifies one upstream connection: a process on a device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ManagerKey {
    pub device: String,
    pub pid: u32,
}

impl ManagerKey {
    pub fn new(device: impl Into<String>, pid: u32) -> Self {
        Self {
            device: device.into(),
            pid,
        }
    }
}

impl fmt::Display for ManagerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.device, self.pid)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ManagerState {
    Connecting,
    Active,
    ShuttingDown,
    Closed,
}

impl ManagerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ManagerState::Connecting,
            1 => ManagerState::Active,
            2 => ManagerState::ShuttingDown,
            _ => ManagerState::Closed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// The device closed its end of the connection.
    UpstreamClosed,
    /// Reading from or writing to the device failed.
    UpstreamError(String),
    /// Someone outside the relay asked for it.
    Requested,
    /// The last client detached under `IdlePolicy::CloseWhenEmpty`.
    Idle,
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownReason::UpstreamClosed => write!(f, "upstream closed"),
            ShutdownReason::UpstreamError(e) => write!(f, "upstream error: {e}"),
            ShutdownReason::Requested => write!(f, "requested"),
            ShutdownReason::Idle => write!(f, "no clients left"),
        }
    }
}

/// What a manager does once its last client detaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IdlePolicy {
    /// Keep the device connection open for the next attach.
    #[default]
    KeepAlive,
    /// Shut the manager down.
    CloseWhenEmpty,
}

/// Invoked once when the manager shuts down.
pub type ShutdownListener = Box<dyn FnOnce(&ManagerKey, &ShutdownReason) + Send>;

/// State that only a running relay step may touch.
struct RelayCore {
    chain: InterceptorChain,
    device: StreamAssembler,
    /// Framing buffers for client-to-device traffic, created on first write.
    writers: HashMap<ClientId, StreamAssembler>,
}

pub struct ClientManager {
    key: ManagerKey,
    state: AtomicU8,
    upstream: Arc<dyn UpstreamSink>,
    core: Mutex<RelayCore>,
    clients: RwLock<IndexMap<ClientId, Arc<AttachedClient>>>,
    pending_detach: Mutex<Vec<ClientId>>,
    listeners: Mutex<Vec<ShutdownListener>>,
    codec: JdwpCodec,
    read_buffer_size: usize,
    partial_read_limit: usize,
    idle_policy: IdlePolicy,
}

impl ClientManager {
    /// Creates a manager for an already-open upstream and sends the handshake
    /// before any client traffic can reach the device.
    pub fn new(
        key: ManagerKey,
        upstream: Arc<dyn UpstreamSink>,
        chain: InterceptorChain,
        config: &RelayConfig,
    ) -> Result<Self, RelayError> {
        let codec = JdwpCodec::new(config.max_packet_len);
        let manager = Self {
            key,
            state: AtomicU8::new(ManagerState::Connecting as u8),
            upstream,
            core: Mutex::new(RelayCore {
                chain,
                device: StreamAssembler::new(
                    codec,
                    config.read_buffer_size,
                    config.partial_read_limit,
                ),
                writers: HashMap::new(),
            }),
            clients: RwLock::new(IndexMap::new()),
            pending_detach: Mutex::new(Vec::new()),
            listeners: Mutex::new(Vec::new()),
            codec,
            read_buffer_size: config.read_buffer_size,
            partial_read_limit: config.partial_read_limit,
            idle_policy: config.idle_policy,
        };

        manager.send_upstream(Bytes::from_static(HANDSHAKE))?;
        manager
            .state
            .store(ManagerState::Active as u8, Ordering::Release);
        metrics::ACTIVE_MANAGERS.inc();
        info!("Manager for {} is active", manager.key);
        Ok(manager)
    }

    pub fn key(&self) -> &ManagerKey {
        &self.key
    }

    pub fn state(&self) -> ManagerState {
        ManagerState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_active(&self) -> bool {
        self.state() == ManagerState::Active
    }

    pub fn idle_policy(&self) -> IdlePolicy {
        self.idle_policy
    }

    pub fn client_count(&self) -> usize {
        self.clients.read().len()
    }

    pub fn has_client(&self, id: ClientId) -> bool {
        self.clients
            .read()
            .get(&id)
            .is_some_and(|slot| slot.is_attached())
    }

    /// Registers a client. It receives device traffic from the next relay step on.
    pub fn add_client(&self, client: Arc<dyn ProxyClient>) -> Result<(), RelayError> {
        let mut clients = self.clients.write();
        if !self.is_active() {
            return Err(RelayError::ManagerClosed(self.key.to_string()));
        }
        let id = client.id();
        if clients.contains_key(&id) {
            debug!("{} is already attached to {}", id, self.key);
            return Ok(());
        }
        clients.insert(id, Arc::new(AttachedClient::new(client)));
        metrics::ATTACHED_CLIENTS.inc();
        info!("{} attached to {} ({} clients)", id, self.key, clients.len());
        Ok(())
    }

    /// Detaches a client. Safe to call at any time, including from inside a
    /// client's `write` during a relay step, and for clients already gone.
    pub fn remove_client(&self, id: ClientId) {
        if let Some(slot) = self.clients.read().get(&id) {
            slot.mark_detached();
        } else {
            return;
        }
        self.pending_detach.lock().push(id);
        self.settle();
    }

    /// Registers a callback for shutdown. Fails once shutdown has begun.
    pub fn add_shutdown_listener(&self, listener: ShutdownListener) -> Result<(), RelayError> {
        let mut listeners = self.listeners.lock();
        if self.state() >= ManagerState::ShuttingDown {
            return Err(RelayError::ManagerClosed(self.key.to_string()));
        }
        listeners.push(listener);
        Ok(())
    }

    /// Relays one read's worth of device bytes to the attached clients.
    pub fn on_device_data(&self, data: &[u8]) {
        if !self.is_active() {
            debug!("Ignoring {} device bytes for closed {}", data.len(), self.key);
            return;
        }
        metrics::DEVICE_BYTES_TOTAL.inc_by(data.len() as u64);
        self.log_hex("DEVICE READ", data);

        {
            let mut guard = self.core.lock();
            if !self.is_active() {
                return;
            }
            let core = &mut *guard;
            let assembled = core.device.feed(data);
            self.note_fallback(&assembled, Direction::ToClient);

            let peers = self.snapshot();
            for unit in &assembled.units {
                Self::dispatch_to_clients(&mut core.chain, &peers, unit);
            }
        }
        self.settle();
    }

    /// Relays bytes written by one client towards the device. Calls for
    /// unknown or detached clients, or after shutdown, are ignored.
    pub fn write(&self, from: ClientId, data: &[u8]) {
        if !self.is_active() {
            debug!("Ignoring write from {} to closed {}", from, self.key);
            return;
        }
        let Some(slot) = self.clients.read().get(&from).cloned() else {
            debug!("Ignoring write from {}: not attached to {}", from, self.key);
            return;
        };
        if !slot.is_attached() {
            return;
        }
        metrics::CLIENT_BYTES_TOTAL.inc_by(data.len() as u64);
        self.log_hex("CLIENT WRITE", data);

        let mut failure = None;
        {
            let mut guard = self.core.lock();
            if !self.is_active() {
                return;
            }
            let core = &mut *guard;
            let (codec, capacity, limit) =
                (self.codec, self.read_buffer_size, self.partial_read_limit);
            let assembled = core
                .writers
                .entry(from)
                .or_insert_with(|| StreamAssembler::new(codec, capacity, limit))
                .feed(data);
            self.note_fallback(&assembled, Direction::ToDevice);

            let peers = self.snapshot();
            let mut outbound = Vec::new();
            for unit in assembled.units {
                if !slot.is_attached() {
                    break;
                }
                let ctx = InterceptContext::new(&slot, &peers);
                let forward = match &unit {
                    Unit::Handshake => {
                        core.chain.client_handshake(&ctx);
                        false
                    }
                    Unit::Packet(packet) => !core.chain.to_device(&ctx, packet),
                    Unit::Raw(bytes) => !core.chain.raw_to_device(&ctx, bytes),
                };
                if forward {
                    outbound.push(unit.into_bytes());
                }
            }
            // One queued write per step, whatever the number of units.
            if let Some(bytes) = coalesce(outbound) {
                failure = self.send_upstream(bytes).err();
            }
        }
        self.settle();

        if let Some(e) = failure {
            warn!("Upstream write for {} failed: {}", self.key, e);
            self.shutdown(ShutdownReason::UpstreamError(e.to_string()));
        }
    }

    /// Waits until the device side can take another write. Callers that may
    /// suspend call this before `write` so the upstream backlog stays bounded.
    /// A device that stops draining shuts the manager down.
    pub async fn upstream_ready(&self) -> Result<(), RelayError> {
        if !self.is_active() {
            return Err(RelayError::ManagerClosed(self.key.to_string()));
        }
        self.upstream.ready().await.inspect_err(|e| {
            warn!("Device for {} is not draining writes: {}", self.key, e);
            self.shutdown(ShutdownReason::UpstreamError(e.to_string()));
        })
    }

    /// Shuts the manager down. Only the first call has any effect: listeners
    /// run once in registration order, then every client is detached and shut
    /// down, then the upstream is closed once.
    pub fn shutdown(&self, reason: ShutdownReason) {
        let began = self.state.fetch_update(Ordering::AcqRel, Ordering::Acquire, |s| {
            (s < ManagerState::ShuttingDown as u8).then_some(ManagerState::ShuttingDown as u8)
        });
        if began.is_err() {
            return;
        }
        info!("Shutting down manager for {}: {}", self.key, reason);

        let listeners = std::mem::take(&mut *self.listeners.lock());
        for listener in listeners {
            listener(&self.key, &reason);
        }

        let clients: Vec<_> = self.clients.write().drain(..).map(|(_, c)| c).collect();
        for client in clients {
            client.mark_detached();
            metrics::ATTACHED_CLIENTS.dec();
            client.shutdown_client();
        }

        self.upstream.close();
        self.state
            .store(ManagerState::Closed as u8, Ordering::Release);
        metrics::ACTIVE_MANAGERS.dec();
        info!("Manager for {} closed", self.key);
    }

    fn dispatch_to_clients(
        chain: &mut InterceptorChain,
        peers: &[Arc<AttachedClient>],
        unit: &Unit,
    ) {
        match unit {
            Unit::Handshake => debug!("Device handshake reply consumed"),
            Unit::Packet(packet) => {
                chain.observe_from_device(packet);
                for peer in peers {
                    if !peer.is_attached() {
                        continue;
                    }
                    let ctx = InterceptContext::new(peer, peers);
                    if !chain.to_client(&ctx, packet) {
                        peer.send(packet.as_bytes());
                    }
                }
            }
            Unit::Raw(bytes) => {
                for peer in peers {
                    if !peer.is_attached() {
                        continue;
                    }
                    let ctx = InterceptContext::new(peer, peers);
                    if !chain.raw_to_client(&ctx, bytes) {
                        peer.send(bytes);
                    }
                }
            }
        }
    }

    fn send_upstream(&self, bytes: Bytes) -> Result<(), RelayError> {
        self.log_hex("DEVICE WRITE", &bytes);
        self.upstream.send(bytes)
    }

    fn snapshot(&self) -> Vec<Arc<AttachedClient>> {
        self.clients.read().values().cloned().collect()
    }

    /// Applies queued and broken-pipe detaches if no relay step is running.
    /// Whichever step holds `core` applies them when it calls this on exit.
    fn settle(&self) {
        loop {
            let became_empty = {
                let Some(mut core) = self.core.try_lock() else {
                    return;
                };
                self.apply_detaches(&mut core)
            };
            if became_empty && self.idle_policy == IdlePolicy::CloseWhenEmpty {
                self.shutdown(ShutdownReason::Idle);
                return;
            }
            if self.pending_detach.lock().is_empty() {
                return;
            }
        }
    }

    /// Returns true if this call removed the last client.
    fn apply_detaches(&self, core: &mut RelayCore) -> bool {
        let mut pending = std::mem::take(&mut *self.pending_detach.lock());
        pending.extend(
            self.clients
                .read()
                .values()
                .filter(|slot| slot.is_broken())
                .map(|slot| slot.id()),
        );
        if pending.is_empty() {
            return false;
        }

        let mut removed_any = false;
        for id in pending {
            let Some(slot) = self.clients.write().shift_remove(&id) else {
                continue;
            };
            removed_any = true;
            slot.mark_detached();
            metrics::ATTACHED_CLIENTS.dec();
            core.writers.remove(&id);
            let remaining = self.snapshot();
            core.chain.client_detached(id, &remaining);
            info!("{} detached from {} ({} clients)", id, self.key, remaining.len());
            slot.shutdown_client();
        }
        removed_any && self.clients.read().is_empty()
    }

    fn note_fallback(&self, assembled: &Assembled, direction: Direction) {
        let Some(cause) = assembled.fallback else {
            return;
        };
        metrics::RAW_FALLBACKS_TOTAL
            .with_label_values(&[direction.as_ref()])
            .inc();
        if cause == FallbackCause::BadFraming {
            warn!("Bad framing {} on {}; forwarding raw bytes", direction, self.key);
        }
    }

    fn log_hex(&self, label: &str, data: &[u8]) {
        if enabled!(Level::DEBUG) {
            let preview = &data[..data.len().min(HEX_PREVIEW_LEN)];
            debug!(
                "{} {} [{} bytes] {}{}",
                label,
                self.key,
                data.len(),
                hex::encode(preview),
                if data.len() > HEX_PREVIEW_LEN { "..." } else { "" }
            );
        }
    }
}

fn coalesce(mut parts: Vec<Bytes>) -> Option<Bytes> {
    match parts.len() {
        0 => None,
        1 => parts.pop(),
        _ => {
            let mut joined = BytesMut::with_capacity(parts.iter().map(Bytes::len).sum());
            for part in &parts {
                joined.extend_from_slice(part);
            }
            Some(joined.freeze())
        }
    }
}

impl fmt::Debug for ClientManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientManager")
            .field("key", &self.key)
            .field("state", &self.state())
            .field("clients", &self.client_count())
            .finish()
    }
}

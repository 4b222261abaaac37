// src/core/interceptor/client_init.rs

//! Gates every client behind its own JDWP handshake and gives late-attaching
//! clients the same view of the VM the first client got.
//!
//! The relay handshakes the device exactly once, so a client's handshake is
//! answered here instead of being forwarded. Until that happens all traffic to
//! and from the client is dropped. DDM requests whose answers never change for
//! the lifetime of the VM (`HELO`, `FEAT`) are forwarded once and then served
//! from a cache, and unsolicited announcements (`APNM`, `WAIT`) are kept and
//! replayed to each client as soon as it has handshaken.

use super::{InterceptContext, Interceptor};
use crate::core::client::{AttachedClient, ClientId};
use crate::core::protocol::handshake::starts_with_handshake;
use crate::core::protocol::{ChunkType, HANDSHAKE, JdwpPacket};
use indexmap::IndexMap;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Default)]
struct ClientInitState {
    handshake_done: bool,
    /// Ids of cacheable requests this client is waiting on.
    pending: HashMap<u32, ChunkType>,
}

pub struct ClientInitializationInterceptor {
    cacheable: HashSet<ChunkType>,
    replayed: HashSet<ChunkType>,
    clients: HashMap<ClientId, ClientInitState>,
    reply_cache: HashMap<ChunkType, JdwpPacket>,
    announcements: IndexMap<ChunkType, JdwpPacket>,
}

impl ClientInitializationInterceptor {
    pub fn new(
        cacheable: impl IntoIterator<Item = ChunkType>,
        replayed: impl IntoIterator<Item = ChunkType>,
    ) -> Self {
        Self {
            cacheable: cacheable.into_iter().collect(),
            replayed: replayed.into_iter().collect(),
            clients: HashMap::new(),
            reply_cache: HashMap::new(),
            announcements: IndexMap::new(),
        }
    }

    pub fn is_initialized(&self, client: ClientId) -> bool {
        self.clients
            .get(&client)
            .is_some_and(|state| state.handshake_done)
    }

    pub fn tracked_clients(&self) -> usize {
        self.clients.len()
    }

    pub fn cached_reply(&self, chunk_type: ChunkType) -> Option<&JdwpPacket> {
        self.reply_cache.get(&chunk_type)
    }
}

impl Interceptor for ClientInitializationInterceptor {
    fn name(&self) -> &'static str {
        "client_init"
    }

    fn on_client_handshake(&mut self, ctx: &InterceptContext<'_>) {
        let state = self.clients.entry(ctx.client_id()).or_default();
        if state.handshake_done {
            debug!("{} repeated its handshake", ctx.client_id());
        }
        state.handshake_done = true;

        let client = ctx.client();
        if !client.send(HANDSHAKE) {
            return;
        }
        for (chunk_type, announcement) in &self.announcements {
            debug!("Replaying {} to {}", chunk_type, ctx.client_id());
            if !client.send(announcement.as_bytes()) {
                break;
            }
        }
    }

    fn filter_to_device(&mut self, ctx: &InterceptContext<'_>, packet: &JdwpPacket) -> bool {
        let state = self.clients.entry(ctx.client_id()).or_default();
        if !state.handshake_done {
            warn!(
                "{} sent a packet before its handshake; dropping it",
                ctx.client_id()
            );
            return true;
        }
        if !packet.is_ddm_command() {
            return false;
        }
        let Some(chunk) = packet.ddm_chunk() else {
            return false;
        };
        if !self.cacheable.contains(&chunk.chunk_type) {
            return false;
        }
        if let Some(cached) = self.reply_cache.get(&chunk.chunk_type) {
            debug!(
                "Answering {} from {} with the cached reply",
                chunk.chunk_type,
                ctx.client_id()
            );
            ctx.client().send(cached.with_id(packet.id()).as_bytes());
            return true;
        }
        state.pending.insert(packet.id(), chunk.chunk_type);
        false
    }

    fn filter_raw_to_device(&mut self, ctx: &InterceptContext<'_>, bytes: &[u8]) -> bool {
        let initialized = self.is_initialized(ctx.client_id());
        if !initialized && !starts_with_handshake(bytes) {
            warn!(
                "{} sent {} bytes before its handshake; dropping them",
                ctx.client_id(),
                bytes.len()
            );
            return true;
        }
        false
    }

    fn observe_from_device(&mut self, packet: &JdwpPacket) {
        if packet.is_ddm_command()
            && let Some(chunk) = packet.ddm_chunk()
            && self.replayed.contains(&chunk.chunk_type)
        {
            debug!("Keeping the latest {} announcement", chunk.chunk_type);
            self.announcements.insert(chunk.chunk_type, packet.clone());
        }
    }

    fn filter_to_client(&mut self, ctx: &InterceptContext<'_>, packet: &JdwpPacket) -> bool {
        let state = self.clients.entry(ctx.client_id()).or_default();
        if !state.handshake_done {
            return true;
        }
        if packet.is_reply()
            && let Some(chunk_type) = state.pending.remove(&packet.id())
            && packet.error_code() == Some(0)
        {
            debug!("Caching the {} reply", chunk_type);
            self.reply_cache.insert(chunk_type, packet.clone());
        }
        false
    }

    fn filter_raw_to_client(&mut self, ctx: &InterceptContext<'_>, _bytes: &[u8]) -> bool {
        !self.is_initialized(ctx.client_id())
    }

    fn on_client_detached(&mut self, client: ClientId, _remaining: &[Arc<AttachedClient>]) {
        self.clients.remove(&client);
    }
}

// src/core/interceptor/debugger.rs

//! Arbitrates which client owns the debugging session and routes replies back
//! to the clients that asked for them.
//!
//! The first client to send a non-DDM JDWP command becomes the owner. While a
//! session is owned, non-DDM traffic from other clients is dropped and non-DDM
//! device traffic is delivered to the owner only. Every other client is told
//! about ownership changes with a relay-synthesized `DBGS` packet.

use super::{InterceptContext, Interceptor};
use crate::core::client::{AttachedClient, ClientId};
use crate::core::protocol::{ChunkType, JdwpPacket};
use indexmap::{IndexMap, IndexSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Bit set on ids of packets the relay itself originates, keeping them clear
/// of the ids devices and clients allocate from 1 upwards.
const SYNTHESIZED_ID_FLAG: u32 = 0x4000_0000;
const MAX_OUTSTANDING: usize = 4096;
const MAX_SYNTHESIZED: usize = 256;

pub struct DebuggerInterceptor {
    owner: Option<ClientId>,
    /// Clients that completed their handshake and may receive status packets.
    ready: IndexSet<ClientId>,
    /// Request id -> clients still waiting for the reply with that id.
    outstanding: IndexMap<u32, Vec<ClientId>>,
    /// Recipients of the reply currently being dispatched. Reset for every
    /// device packet.
    routing: Option<(u32, Vec<ClientId>)>,
    synthesized: IndexSet<u32>,
    next_id: u32,
}

impl DebuggerInterceptor {
    pub fn new() -> Self {
        Self {
            owner: None,
            ready: IndexSet::new(),
            outstanding: IndexMap::new(),
            routing: None,
            synthesized: IndexSet::new(),
            next_id: 0,
        }
    }

    /// The client that currently owns the session, if any.
    pub fn owner(&self) -> Option<ClientId> {
        self.owner
    }

    fn status_packet(&mut self, attached: bool) -> JdwpPacket {
        self.next_id = (self.next_id + 1) & !SYNTHESIZED_ID_FLAG;
        let id = self.next_id | SYNTHESIZED_ID_FLAG;
        self.synthesized.insert(id);
        if self.synthesized.len() > MAX_SYNTHESIZED {
            self.synthesized.shift_remove_index(0);
        }
        JdwpPacket::ddm_command(id, ChunkType::DBGS, &[u8::from(attached)])
    }

    /// Sends a status packet to every ready client in `targets`.
    fn reflect<'a>(&mut self, attached: bool, targets: impl Iterator<Item = &'a Arc<AttachedClient>>) {
        let packet = self.status_packet(attached);
        for peer in targets.filter(|peer| self.ready.contains(&peer.id())) {
            debug!("Reflecting DBGS({}) to {}", u8::from(attached), peer.id());
            peer.send(packet.as_bytes());
        }
    }

    fn track_request(&mut self, client: ClientId, id: u32) {
        let waiting = self.outstanding.entry(id).or_default();
        if !waiting.contains(&client) {
            waiting.push(client);
        }
        if self.outstanding.len() > MAX_OUTSTANDING {
            self.outstanding.shift_remove_index(0);
        }
    }
}

impl Default for DebuggerInterceptor {
    fn default() -> Self {
        Self::new()
    }
}

impl Interceptor for DebuggerInterceptor {
    fn name(&self) -> &'static str {
        "debugger"
    }

    fn on_client_handshake(&mut self, ctx: &InterceptContext<'_>) {
        let id = ctx.client_id();
        self.ready.insert(id);
        if self.owner.is_some_and(|owner| owner != id) {
            let packet = self.status_packet(true);
            ctx.client().send(packet.as_bytes());
        }
    }

    fn filter_to_device(&mut self, ctx: &InterceptContext<'_>, packet: &JdwpPacket) -> bool {
        let id = ctx.client_id();

        if packet.is_reply() {
            if self.synthesized.contains(&packet.id()) {
                return true;
            }
            return self.owner.is_some_and(|owner| owner != id);
        }

        if packet.is_ddm_command() {
            self.track_request(id, packet.id());
            return false;
        }

        match self.owner {
            None => {
                info!("{} is now the owning debugger", id);
                self.owner = Some(id);
                self.reflect(true, ctx.others());
            }
            Some(owner) if owner != id => {
                warn!(
                    "Dropping JDWP command from {}: the session is owned by {}",
                    id, owner
                );
                return true;
            }
            Some(_) => {}
        }
        self.track_request(id, packet.id());
        false
    }

    fn observe_from_device(&mut self, packet: &JdwpPacket) {
        self.routing = None;
        if packet.is_reply()
            && let Some(waiting) = self.outstanding.shift_remove(&packet.id())
        {
            self.routing = Some((packet.id(), waiting));
        }
    }

    fn filter_to_client(&mut self, ctx: &InterceptContext<'_>, packet: &JdwpPacket) -> bool {
        let id = ctx.client_id();

        if packet.is_reply() {
            return match &self.routing {
                Some((routed, waiting)) if *routed == packet.id() => !waiting.contains(&id),
                _ => false,
            };
        }

        if packet.is_ddm_command() {
            return false;
        }
        self.owner.is_some_and(|owner| owner != id)
    }

    fn on_client_detached(&mut self, client: ClientId, remaining: &[Arc<AttachedClient>]) {
        self.ready.shift_remove(&client);
        self.outstanding.retain(|_, waiting| {
            waiting.retain(|c| *c != client);
            !waiting.is_empty()
        });
        if let Some((_, waiting)) = &mut self.routing {
            waiting.retain(|c| *c != client);
        }
        if self.owner == Some(client) {
            info!("Owning debugger {} detached; releasing the session", client);
            self.owner = None;
            self.reflect(false, remaining.iter().filter(|peer| peer.is_attached()));
        }
    }
}

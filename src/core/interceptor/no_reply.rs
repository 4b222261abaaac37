// src/core/interceptor/no_reply.rs

use super::{InterceptContext, Interceptor};
use crate::core::client::{AttachedClient, ClientId};
use crate::core::protocol::{ChunkType, JdwpPacket};
use indexmap::IndexSet;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

/// Oldest ids are forgotten past this many outstanding no-reply requests per client.
const MAX_PENDING_PER_CLIENT: usize = 256;

/// Suppresses device replies to DDM commands a client sent as fire-and-forget,
/// so the client never sees an answer it is not waiting for.
pub struct NoReplyInterceptor {
    no_reply_chunks: HashSet<ChunkType>,
    pending: HashMap<ClientId, IndexSet<u32>>,
}

impl NoReplyInterceptor {
    pub fn new(no_reply_chunks: impl IntoIterator<Item = ChunkType>) -> Self {
        Self {
            no_reply_chunks: no_reply_chunks.into_iter().collect(),
            pending: HashMap::new(),
        }
    }

    /// Number of outstanding no-reply ids tracked for `client`.
    pub fn pending_for(&self, client: ClientId) -> usize {
        self.pending.get(&client).map_or(0, |ids| ids.len())
    }
}

impl Interceptor for NoReplyInterceptor {
    fn name(&self) -> &'static str {
        "no_reply"
    }

    fn filter_to_device(&mut self, ctx: &InterceptContext<'_>, packet: &JdwpPacket) -> bool {
        if !packet.is_ddm_command() {
            return false;
        }
        let Some(chunk) = packet.ddm_chunk() else {
            return false;
        };
        if self.no_reply_chunks.contains(&chunk.chunk_type) {
            let ids = self.pending.entry(ctx.client_id()).or_default();
            ids.insert(packet.id());
            if ids.len() > MAX_PENDING_PER_CLIENT {
                ids.shift_remove_index(0);
            }
        }
        false
    }

    fn filter_to_client(&mut self, ctx: &InterceptContext<'_>, packet: &JdwpPacket) -> bool {
        if !packet.is_reply() {
            return false;
        }
        let Some(ids) = self.pending.get_mut(&ctx.client_id()) else {
            return false;
        };
        if ids.shift_remove(&packet.id()) {
            debug!(
                "Dropping reply {} for {}: the request expects no reply",
                packet.id(),
                ctx.client_id()
            );
            return true;
        }
        false
    }

    fn on_client_detached(&mut self, client: ClientId, _remaining: &[Arc<AttachedClient>]) {
        self.pending.remove(&client);
    }
}

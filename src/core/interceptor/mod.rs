// src/core/interceptor/mod.rs

//! Interceptors decide, per client and per unit, whether relayed traffic is
//! forwarded. They are evaluated in order and the first one to suppress a unit
//! wins; later interceptors never observe a unit an earlier one suppressed.

mod client_init;
mod debugger;
mod no_reply;

pub use client_init::ClientInitializationInterceptor;
pub use debugger::DebuggerInterceptor;
pub use no_reply::NoReplyInterceptor;

use crate::config::InterceptorConfig;
use crate::core::client::{AttachedClient, ClientId};
use crate::core::metrics;
use crate::core::protocol::JdwpPacket;
use std::sync::Arc;
use strum_macros::{AsRefStr, Display};
use tracing::debug;

/// Which way a unit is travelling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsRefStr, Display)]
#[strum(serialize_all = "snake_case")]
pub enum Direction {
    ToDevice,
    ToClient,
}

/// The client a decision is being made for, plus every client attached at the
/// start of the relay step.
#[derive(Clone, Copy)]
pub struct InterceptContext<'a> {
    client: &'a AttachedClient,
    peers: &'a [Arc<AttachedClient>],
}

impl<'a> InterceptContext<'a> {
    pub fn new(client: &'a AttachedClient, peers: &'a [Arc<AttachedClient>]) -> Self {
        Self { client, peers }
    }

    pub fn client(&self) -> &'a AttachedClient {
        self.client
    }

    pub fn client_id(&self) -> ClientId {
        self.client.id()
    }

    /// All attached clients except the one this decision is for.
    pub fn others(&self) -> impl Iterator<Item = &'a Arc<AttachedClient>> + 'a {
        let id = self.client.id();
        self.peers
            .iter()
            .filter(move |peer| peer.id() != id && peer.is_attached())
    }
}

/// A stateful filter over relayed traffic. Returning `true` from a filter hook
/// suppresses the unit for that client in that direction.
///
/// Per-client state must be created lazily and dropped in `on_client_detached`.
pub trait Interceptor: Send {
    fn name(&self) -> &'static str;

    fn filter_to_device(&mut self, _ctx: &InterceptContext<'_>, _packet: &JdwpPacket) -> bool {
        false
    }

    fn filter_raw_to_device(&mut self, _ctx: &InterceptContext<'_>, _bytes: &[u8]) -> bool {
        false
    }

    /// Sees every packet read from the device exactly once, before any
    /// per-client filtering and even when no client is attached.
    fn observe_from_device(&mut self, _packet: &JdwpPacket) {}

    fn filter_to_client(&mut self, _ctx: &InterceptContext<'_>, _packet: &JdwpPacket) -> bool {
        false
    }

    fn filter_raw_to_client(&mut self, _ctx: &InterceptContext<'_>, _bytes: &[u8]) -> bool {
        false
    }

    /// Called when a client sends the handshake token. The token itself is
    /// never forwarded upstream.
    fn on_client_handshake(&mut self, _ctx: &InterceptContext<'_>) {}

    fn on_client_detached(&mut self, _client: ClientId, _remaining: &[Arc<AttachedClient>]) {}
}

/// The ordered interceptor list owned by one manager. Immutable after construction.
pub struct InterceptorChain {
    interceptors: Vec<Box<dyn Interceptor>>,
}

impl InterceptorChain {
    pub fn new(interceptors: Vec<Box<dyn Interceptor>>) -> Self {
        Self { interceptors }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    /// The built-in chain: no-reply suppression, client initialization gating,
    /// then debugger arbitration.
    pub fn with_defaults(config: &InterceptorConfig) -> Self {
        Self::new(vec![
            Box::new(NoReplyInterceptor::new(config.no_reply_chunks.iter().copied())),
            Box::new(ClientInitializationInterceptor::new(
                config.cached_chunks.iter().copied(),
                config.replayed_chunks.iter().copied(),
            )),
            Box::new(DebuggerInterceptor::new()),
        ])
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.interceptors.iter().map(|i| i.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }

    pub fn to_device(&mut self, ctx: &InterceptContext<'_>, packet: &JdwpPacket) -> bool {
        self.first_veto(ctx, Direction::ToDevice, |i| i.filter_to_device(ctx, packet))
    }

    pub fn raw_to_device(&mut self, ctx: &InterceptContext<'_>, bytes: &[u8]) -> bool {
        self.first_veto(ctx, Direction::ToDevice, |i| i.filter_raw_to_device(ctx, bytes))
    }

    pub fn observe_from_device(&mut self, packet: &JdwpPacket) {
        for interceptor in &mut self.interceptors {
            interceptor.observe_from_device(packet);
        }
    }

    pub fn to_client(&mut self, ctx: &InterceptContext<'_>, packet: &JdwpPacket) -> bool {
        self.first_veto(ctx, Direction::ToClient, |i| i.filter_to_client(ctx, packet))
    }

    pub fn raw_to_client(&mut self, ctx: &InterceptContext<'_>, bytes: &[u8]) -> bool {
        self.first_veto(ctx, Direction::ToClient, |i| i.filter_raw_to_client(ctx, bytes))
    }

    pub fn client_handshake(&mut self, ctx: &InterceptContext<'_>) {
        for interceptor in &mut self.interceptors {
            interceptor.on_client_handshake(ctx);
        }
    }

    pub fn client_detached(&mut self, client: ClientId, remaining: &[Arc<AttachedClient>]) {
        for interceptor in &mut self.interceptors {
            interceptor.on_client_detached(client, remaining);
        }
    }

    fn first_veto(
        &mut self,
        ctx: &InterceptContext<'_>,
        direction: Direction,
        mut filter: impl FnMut(&mut dyn Interceptor) -> bool,
    ) -> bool {
        for interceptor in &mut self.interceptors {
            if filter(interceptor.as_mut()) {
                debug!(
                    "{} suppressed a unit {} for {}",
                    interceptor.name(),
                    direction,
                    ctx.client_id()
                );
                metrics::SUPPRESSED_UNITS_TOTAL
                    .with_label_values(&[interceptor.name(), direction.as_ref()])
                    .inc();
                return true;
            }
        }
        false
    }
}

impl Default for InterceptorChain {
    fn default() -> Self {
        Self::with_defaults(&InterceptorConfig::default())
    }
}

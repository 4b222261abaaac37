// src/core/mod.rs

//! The relay itself: wire framing, interceptors, clients, managers and the
//! registry that ties managers to device processes.

pub mod client;
pub mod errors;
pub mod interceptor;
pub mod manager;
pub mod metrics;
pub mod protocol;
pub mod registry;
pub mod transport;

pub use client::{ClientId, ProxyClient};
pub use errors::RelayError;
pub use manager::{ClientManager, IdlePolicy, ManagerKey, ShutdownReason};
pub use registry::ManagerRegistry;

// src/connection/mod.rs

//! Manages the lifecycle of a single downstream tool connection: the adb-style
//! request preamble, attaching to a relay manager, and pumping bytes both ways.

mod guard;
mod handler;
mod session;

pub use guard::ConnectionGuard;
pub use handler::ProxyConnectionHandler;
pub use session::SessionState;

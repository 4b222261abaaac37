// src/server/context.rs

use crate::config::Config;
use crate::core::registry::ManagerRegistry;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{Semaphore, broadcast};
use tokio::task::JoinSet;
use tracing_subscriber::{filter::EnvFilter, reload};

pub type LogReloadHandle = Arc<reload::Handle<EnvFilter, tracing_subscriber::Registry>>;

/// Holds all the initialized state required to run the server's main loop.
pub struct ServerContext {
    pub config: Arc<Config>,
    /// The file the configuration was loaded from, re-read on SIGHUP.
    pub config_path: Option<String>,
    pub registry: Arc<ManagerRegistry>,
    pub listener: TcpListener,
    pub shutdown_tx: broadcast::Sender<()>,
    pub background_tasks: JoinSet<Result<(), anyhow::Error>>,
    pub connection_permits: Arc<Semaphore>,
    pub log_reload_handle: LogReloadHandle,
}

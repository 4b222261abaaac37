// src/server/initialization.rs

//! Builds everything the accept loop needs: the transport factory, the manager
//! registry and the listening socket.

use super::context::{LogReloadHandle, ServerContext};
use crate::config::Config;
use crate::core::registry::ManagerRegistry;
use crate::core::transport::AdbTransportFactory;
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{Semaphore, broadcast};
use tokio::task::JoinSet;
use tracing::info;

/// Initializes all server components before starting the main loop.
pub async fn setup(
    config: Config,
    config_path: Option<String>,
    log_reload_handle: LogReloadHandle,
) -> Result<ServerContext> {
    log_startup_info(&config);
    let (shutdown_tx, _) = broadcast::channel(1);

    let factory = AdbTransportFactory::new(&config.adb);
    info!("Device transports will be opened through adb at {}", factory.addr());
    let registry = Arc::new(ManagerRegistry::new(
        Arc::new(factory),
        config.relay.clone(),
        config.interceptors.clone(),
    ));

    let listener = TcpListener::bind((config.host.as_str(), config.port))
        .await
        .with_context(|| format!("Failed to bind {}:{}", config.host, config.port))?;
    info!("jdwpmux listening on {}:{}", config.host, config.port);
    let connection_permits = Arc::new(Semaphore::new(config.max_clients));

    Ok(ServerContext {
        config: Arc::new(config),
        config_path,
        registry,
        listener,
        shutdown_tx,
        background_tasks: JoinSet::new(),
        connection_permits,
        log_reload_handle,
    })
}

fn log_startup_info(config: &Config) {
    info!("Starting jdwpmux v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "Relay: max packet {} bytes, read buffer {} bytes, partial-read limit {}, idle policy {:?}",
        config.relay.max_packet_len,
        config.relay.read_buffer_size,
        config.relay.partial_read_limit,
        config.relay.idle_policy
    );
    info!(
        "Interceptors: no-reply {:?}, cached {:?}, replayed {:?}",
        config.interceptors.no_reply_chunks,
        config.interceptors.cached_chunks,
        config.interceptors.replayed_chunks
    );
}

// src/server/connection_loop.rs

//! Contains the main server loop for accepting connections and handling graceful shutdown.

use super::context::ServerContext;
use crate::config::Config;
use crate::connection::ProxyConnectionHandler;
use crate::core::metrics;
use crate::core::protocol::adb::encode_fail;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::signal::unix::{SignalKind, signal};
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use tracing_subscriber::filter::EnvFilter;

/// The main server loop that accepts connections and handles graceful shutdown.
pub async fn run(mut ctx: ServerContext) {
    let mut client_tasks = JoinSet::new();

    let (mut sigint, mut sigterm, mut sighup) = match (
        signal(SignalKind::interrupt()),
        signal(SignalKind::terminate()),
        signal(SignalKind::hangup()),
    ) {
        (Ok(int), Ok(term), Ok(hup)) => (int, term, hup),
        _ => {
            error!("Failed to register signal handlers; refusing to run without graceful shutdown.");
            return;
        }
    };

    loop {
        tokio::select! {
            biased;

            _ = sigint.recv() => {
                info!("SIGINT received, initiating graceful shutdown.");
                break;
            }
            _ = sigterm.recv() => {
                info!("SIGTERM received, initiating graceful shutdown.");
                break;
            }
            _ = sighup.recv() => {
                reload_log_level(&ctx);
            }

            Some(res) = ctx.background_tasks.join_next() => {
                match res {
                    Ok(Ok(())) => warn!("A background task finished unexpectedly without an error."),
                    Ok(Err(e)) => { error!("CRITICAL: Background task failed: {}. Shutting down.", e); break; }
                    Err(e) => { error!("CRITICAL: Background task panicked: {e:?}. Shutting down."); break; }
                }
            },

            res = ctx.listener.accept() => {
                let (mut socket, addr) = match res {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                        continue;
                    }
                };
                metrics::CONNECTIONS_RECEIVED_TOTAL.inc();

                let Ok(permit) = Arc::clone(&ctx.connection_permits).try_acquire_owned() else {
                    warn!("Rejecting connection from {}: max_clients reached.", addr);
                    client_tasks.spawn(async move {
                        let _ = socket.write_all(&encode_fail("too many connections")).await;
                    });
                    continue;
                };
                info!("Accepted new connection from: {}", addr);
                if let Err(e) = socket.set_nodelay(true) {
                    warn!("Failed to set TCP_NODELAY for {}: {}", addr, e);
                }

                let mut handler = ProxyConnectionHandler::new(
                    addr,
                    Arc::clone(&ctx.registry),
                    ctx.config.relay.client_queue_depth,
                    ctx.config.relay.read_buffer_size,
                    ctx.shutdown_tx.subscribe(),
                );
                client_tasks.spawn(async move {
                    if let Err(e) = handler.run(socket, Some(permit)).await {
                        warn!("Connection from {} terminated unexpectedly: {}", addr, e);
                    }
                });
            },

            Some(res) = client_tasks.join_next() => {
                if let Err(e) = res
                    && e.is_panic()
                {
                    error!("A client handler panicked: {e:?}");
                }
            },
        }
    }

    info!("Shutting down. Sending signal to all tasks.");
    if ctx.shutdown_tx.send(()).is_err() {
        warn!("No task was listening for the shutdown signal.");
    }

    ctx.registry.shutdown_all();

    if tokio::time::timeout(Duration::from_secs(5), async {
        while client_tasks.join_next().await.is_some() {}
    })
    .await
    .is_err()
    {
        warn!("Timed out waiting for client connections to close; aborting them.");
        client_tasks.shutdown().await;
    }
    info!("All client connections closed.");

    info!("Waiting for background tasks to finish...");
    if tokio::time::timeout(Duration::from_secs(10), async {
        while ctx.background_tasks.join_next().await.is_some() {}
    })
    .await
    .is_err()
    {
        warn!("Timed out waiting for background tasks to finish cleanly.");
    };
    info!("Server shutdown complete.");
}

/// Re-reads `log_level` from the configuration file and applies it.
fn reload_log_level(ctx: &ServerContext) {
    let Some(path) = ctx.config_path.as_deref() else {
        info!("SIGHUP received, but no configuration file was loaded; ignoring.");
        return;
    };
    let level = match Config::from_file(path) {
        Ok(config) => config.log_level,
        Err(e) => {
            warn!("SIGHUP: keeping the current log level: {:#}", e);
            return;
        }
    };
    match ctx
        .log_reload_handle
        .modify(|filter| *filter = EnvFilter::new(&level))
    {
        Ok(()) => info!("SIGHUP: log level set to '{}'", level),
        Err(e) => warn!("SIGHUP: failed to apply log level '{}': {}", level, e),
    }
}

// src/core/transport.rs

//! Acquisition of the upstream device connection.

use crate::config::AdbConfig;
use crate::core::RelayError;
use crate::core::manager::ManagerKey;
use crate::core::protocol::AdbRequest;
use crate::core::protocol::adb::send_request;
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info};

/// A duplex byte stream to a device's debugging endpoint.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

pub type BoxedTransport = Box<dyn Transport>;

/// Opens the upstream connection for a key. Implementations own all timeouts.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn open(&self, key: &ManagerKey) -> Result<BoxedTransport, RelayError>;
}

/// Connects through a local adb server: `host:transport:<serial>` selects the
/// device, then `jdwp:<pid>` turns the socket into the process's JDWP stream.
#[derive(Debug, Clone)]
pub struct AdbTransportFactory {
    addr: String,
    connect_timeout: Duration,
}

impl AdbTransportFactory {
    pub fn new(config: &AdbConfig) -> Self {
        Self {
            addr: format!("{}:{}", config.host, config.port),
            connect_timeout: config.connect_timeout,
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }
}

#[async_trait]
impl TransportFactory for AdbTransportFactory {
    async fn open(&self, key: &ManagerKey) -> Result<BoxedTransport, RelayError> {
        debug!("Connecting to adb at {} for {}", self.addr, key);
        let setup = async {
            let mut stream = TcpStream::connect(&self.addr).await?;
            stream.set_nodelay(true)?;
            send_request(&mut stream, &AdbRequest::Transport(key.device.clone())).await?;
            send_request(&mut stream, &AdbRequest::Jdwp(key.pid)).await?;
            Ok::<_, RelayError>(stream)
        };
        let stream = timeout(self.connect_timeout, setup).await??;
        info!("Opened JDWP transport for {} via {}", key, self.addr);
        Ok(Box::new(stream))
    }
}

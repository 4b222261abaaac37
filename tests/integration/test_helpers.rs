// tests/integration/test_helpers.rs

//! Test helpers and utilities for integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use jdwpmux::config::RelayConfig;
use jdwpmux::core::client::{ClientId, ProxyClient};
use jdwpmux::core::interceptor::InterceptorChain;
use jdwpmux::core::manager::{ClientManager, ManagerKey, UpstreamSink};
use jdwpmux::core::protocol::{JdwpCodec, Unit};
use jdwpmux::core::transport::{BoxedTransport, TransportFactory};
use jdwpmux::core::RelayError;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::DuplexStream;
use tokio_util::codec::Decoder;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Installs a test subscriber once per test binary.
pub fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::new("warn"))
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .try_init();
}

type WriteHook = Box<dyn Fn(&[u8]) + Send + Sync>;

/// A `ProxyClient` that records everything written to it.
pub struct RecordingClient {
    id: ClientId,
    writes: Mutex<Vec<Vec<u8>>>,
    shutdowns: AtomicUsize,
    failing: AtomicBool,
    on_write: Mutex<Option<WriteHook>>,
}

impl RecordingClient {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            id: ClientId::next(),
            writes: Mutex::new(Vec::new()),
            shutdowns: AtomicUsize::new(0),
            failing: AtomicBool::new(false),
            on_write: Mutex::new(None),
        })
    }

    pub fn client_id(&self) -> ClientId {
        self.id
    }

    /// Every write, in order.
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.writes.lock().unwrap().clone()
    }

    /// All written bytes concatenated.
    pub fn received(&self) -> Vec<u8> {
        self.writes().concat()
    }

    /// The received bytes split back into units.
    pub fn units(&self) -> Vec<Unit> {
        decode_units(&self.received())
    }

    pub fn shutdown_count(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Runs `hook` after every successful write, on the relay's thread.
    pub fn set_on_write(&self, hook: impl Fn(&[u8]) + Send + Sync + 'static) {
        *self.on_write.lock().unwrap() = Some(Box::new(hook));
    }

    pub fn clear(&self) {
        self.writes.lock().unwrap().clear();
    }
}

impl ProxyClient for RecordingClient {
    fn id(&self) -> ClientId {
        self.id
    }

    fn write(&self, bytes: &[u8]) -> Result<(), RelayError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(RelayError::ClientClosed(self.id));
        }
        self.writes.lock().unwrap().push(bytes.to_vec());
        if let Some(hook) = self.on_write.lock().unwrap().as_ref() {
            hook(bytes);
        }
        Ok(())
    }

    fn shutdown(&self) {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
    }
}

/// An `UpstreamSink` that records what the manager sends to the device.
#[derive(Default)]
pub struct RecordingUpstream {
    sent: Mutex<Vec<Bytes>>,
    closes: AtomicUsize,
}

impl RecordingUpstream {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn sent(&self) -> Vec<Bytes> {
        self.sent.lock().unwrap().clone()
    }

    /// Everything sent after the manager's own handshake.
    pub fn sent_after_handshake(&self) -> Vec<u8> {
        self.sent().iter().skip(1).flat_map(|b| b.to_vec()).collect()
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

impl UpstreamSink for RecordingUpstream {
    fn send(&self, bytes: Bytes) -> Result<(), RelayError> {
        self.sent.lock().unwrap().push(bytes);
        Ok(())
    }

    fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn test_key() -> ManagerKey {
    ManagerKey::new("emulator-5554", 4242)
}

/// Builds a manager over a recording upstream.
pub fn manager_with(chain: InterceptorChain) -> (Arc<ClientManager>, Arc<RecordingUpstream>) {
    manager_with_config(chain, &RelayConfig::default())
}

pub fn manager_with_config(
    chain: InterceptorChain,
    config: &RelayConfig,
) -> (Arc<ClientManager>, Arc<RecordingUpstream>) {
    init_tracing();
    let upstream = RecordingUpstream::new();
    let manager = ClientManager::new(test_key(), upstream.clone(), chain, config)
        .expect("manager should start");
    (Arc::new(manager), upstream)
}

/// Attaches `n` fresh recording clients.
pub fn attach_clients(manager: &ClientManager, n: usize) -> Vec<Arc<RecordingClient>> {
    (0..n)
        .map(|_| {
            let client = RecordingClient::new();
            manager.add_client(client.clone()).expect("attach should succeed");
            client
        })
        .collect()
}

/// Splits a byte stream into units the way the relay would.
pub fn decode_units(bytes: &[u8]) -> Vec<Unit> {
    let mut codec = JdwpCodec::default();
    let mut buf = BytesMut::from(bytes);
    let mut units = Vec::new();
    while let Ok(Some(unit)) = codec.decode(&mut buf) {
        units.push(unit);
    }
    if !buf.is_empty() {
        units.push(Unit::Raw(buf.freeze()));
    }
    units
}

/// Polls `condition` until it holds or the timeout expires.
pub async fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

/// A `TransportFactory` backed by in-memory duplex pipes. The device end of
/// every opened pipe is kept for the test to drive.
#[derive(Default)]
pub struct DuplexTransportFactory {
    opens: AtomicUsize,
    devices: Mutex<HashMap<ManagerKey, Vec<DuplexStream>>>,
    fail_with: Mutex<Option<RelayError>>,
}

impl DuplexTransportFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing(error: RelayError) -> Arc<Self> {
        let factory = Self::default();
        *factory.fail_with.lock().unwrap() = Some(error);
        Arc::new(factory)
    }

    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Takes the device end of the most recent connection for `key`.
    pub fn take_device(&self, key: &ManagerKey) -> Option<DuplexStream> {
        self.devices.lock().unwrap().get_mut(key)?.pop()
    }
}

#[async_trait]
impl TransportFactory for DuplexTransportFactory {
    async fn open(&self, key: &ManagerKey) -> Result<BoxedTransport, RelayError> {
        if let Some(e) = self.fail_with.lock().unwrap().clone() {
            return Err(e);
        }
        self.opens.fetch_add(1, Ordering::SeqCst);
        let (relay_end, device_end) = tokio::io::duplex(64 * 1024);
        self.devices
            .lock()
            .unwrap()
            .entry(key.clone())
            .or_default()
            .push(device_end);
        Ok(Box::new(relay_end))
    }
}

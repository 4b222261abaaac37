// src/config.rs

//! Manages relay configuration: loading, resolving chunk names, and validation.

use crate::core::IdlePolicy;
use crate::core::protocol::codec::DEFAULT_MAX_PACKET_LEN;
use crate::core::protocol::{ChunkType, HEADER_LEN};
use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use std::fs;
use std::time::Duration;

/// Where the adb server that provides device transports listens.
#[derive(Deserialize, Debug, Clone)]
pub struct AdbConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_adb_port")]
    pub port: u16,
    /// Bound on connecting to adb and completing the transport requests.
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,
}

impl Default for AdbConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_adb_port(),
            connect_timeout: default_connect_timeout(),
        }
    }
}

fn default_adb_port() -> u16 {
    5037
}
fn default_connect_timeout() -> Duration {
    Duration::from_secs(5)
}

/// Tuning for the relay managers.
#[derive(Deserialize, Debug, Clone)]
pub struct RelayConfig {
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,
    /// Declared packet lengths above this are treated as bad framing.
    #[serde(default = "default_max_packet_len")]
    pub max_packet_len: usize,
    /// How many consecutive reads a header fragment or handshake prefix may
    /// stay unrecognized before it is forwarded raw. `0` forwards such a
    /// leftover immediately. A valid header waiting for its body is exempt.
    #[serde(default = "default_partial_read_limit")]
    pub partial_read_limit: usize,
    #[serde(default = "default_write_timeout", with = "humantime_serde")]
    pub write_timeout: Duration,
    /// Queued device writes past which client writes wait for the device.
    #[serde(default = "default_upstream_queue_depth")]
    pub upstream_queue_depth: usize,
    #[serde(default = "default_client_queue_depth")]
    pub client_queue_depth: usize,
    #[serde(default)]
    pub idle_policy: IdlePolicy,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            read_buffer_size: default_read_buffer_size(),
            max_packet_len: default_max_packet_len(),
            partial_read_limit: default_partial_read_limit(),
            write_timeout: default_write_timeout(),
            upstream_queue_depth: default_upstream_queue_depth(),
            client_queue_depth: default_client_queue_depth(),
            idle_policy: IdlePolicy::default(),
        }
    }
}

fn default_read_buffer_size() -> usize {
    64 * 1024
}
fn default_max_packet_len() -> usize {
    DEFAULT_MAX_PACKET_LEN
}
fn default_partial_read_limit() -> usize {
    64
}
fn default_write_timeout() -> Duration {
    Duration::from_secs(5)
}
fn default_upstream_queue_depth() -> usize {
    256
}
fn default_client_queue_depth() -> usize {
    1024
}

/// Chunk types the built-in interceptors act on, as written in the file.
#[derive(Deserialize, Debug, Clone)]
struct RawInterceptorConfig {
    #[serde(default = "default_no_reply_chunks")]
    no_reply_chunks: Vec<String>,
    #[serde(default = "default_cached_chunks")]
    cached_chunks: Vec<String>,
    #[serde(default = "default_replayed_chunks")]
    replayed_chunks: Vec<String>,
}

impl Default for RawInterceptorConfig {
    fn default() -> Self {
        Self {
            no_reply_chunks: default_no_reply_chunks(),
            cached_chunks: default_cached_chunks(),
            replayed_chunks: default_replayed_chunks(),
        }
    }
}

fn default_no_reply_chunks() -> Vec<String> {
    vec!["EXIT".to_string()]
}
fn default_cached_chunks() -> Vec<String> {
    vec!["HELO".to_string(), "FEAT".to_string()]
}
fn default_replayed_chunks() -> Vec<String> {
    vec!["APNM".to_string(), "WAIT".to_string()]
}

/// Chunk types the built-in interceptors act on.
#[derive(Debug, Clone, PartialEq)]
pub struct InterceptorConfig {
    /// DDM commands whose device replies are never shown to the sender.
    pub no_reply_chunks: Vec<ChunkType>,
    /// DDM requests answered from a cache after the first reply.
    pub cached_chunks: Vec<ChunkType>,
    /// Device announcements replayed to each client after its handshake.
    pub replayed_chunks: Vec<ChunkType>,
}

impl Default for InterceptorConfig {
    fn default() -> Self {
        Self {
            no_reply_chunks: vec![ChunkType::EXIT],
            cached_chunks: vec![ChunkType::HELO, ChunkType::FEAT],
            replayed_chunks: vec![ChunkType::APNM, ChunkType::WAIT],
        }
    }
}

impl TryFrom<RawInterceptorConfig> for InterceptorConfig {
    type Error = anyhow::Error;

    fn try_from(raw: RawInterceptorConfig) -> Result<Self> {
        let parse = |field: &str, names: Vec<String>| -> Result<Vec<ChunkType>> {
            names
                .iter()
                .map(|name| {
                    name.parse::<ChunkType>()
                        .map_err(|e| anyhow!("interceptors.{field}: {e}"))
                })
                .collect()
        };
        Ok(Self {
            no_reply_chunks: parse("no_reply_chunks", raw.no_reply_chunks)?,
            cached_chunks: parse("cached_chunks", raw.cached_chunks)?,
            replayed_chunks: parse("replayed_chunks", raw.replayed_chunks)?,
        })
    }
}

/// Configuration for the Prometheus metrics exporter.
#[derive(Deserialize, Debug, Clone, Default)]
pub struct MetricsConfig {
    /// If true, an HTTP server will be started to expose Prometheus metrics.
    #[serde(default)]
    pub enabled: bool,
    /// The port for the Prometheus metrics server.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

fn default_metrics_port() -> u16 {
    8878
}

#[derive(Deserialize)]
struct RawConfig {
    #[serde(default = "default_host")]
    host: String,
    #[serde(default = "default_port")]
    port: u16,
    #[serde(default = "default_log_level")]
    log_level: String,
    #[serde(default = "default_max_clients")]
    max_clients: usize,
    #[serde(default)]
    adb: AdbConfig,
    #[serde(default)]
    relay: RelayConfig,
    #[serde(default)]
    interceptors: RawInterceptorConfig,
    #[serde(default)]
    metrics: MetricsConfig,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    8599
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_max_clients() -> usize {
    256
}

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    /// Downstream connections accepted at once.
    pub max_clients: usize,
    pub adb: AdbConfig,
    pub relay: RelayConfig,
    pub interceptors: InterceptorConfig,
    pub metrics: MetricsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            log_level: default_log_level(),
            max_clients: default_max_clients(),
            adb: AdbConfig::default(),
            relay: RelayConfig::default(),
            interceptors: InterceptorConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file at '{path}'"))?;
        Self::from_toml(&contents).with_context(|| format!("Invalid config in '{path}'"))
    }

    /// Parses, resolves and validates a configuration document.
    pub fn from_toml(contents: &str) -> Result<Self> {
        let raw_config: RawConfig =
            toml::from_str(contents).context("Failed to parse TOML configuration")?;

        let config = Config {
            host: raw_config.host,
            port: raw_config.port,
            log_level: raw_config.log_level,
            max_clients: raw_config.max_clients,
            adb: raw_config.adb,
            relay: raw_config.relay,
            interceptors: raw_config.interceptors.try_into()?,
            metrics: raw_config.metrics,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(anyhow!("port cannot be 0"));
        }
        if self.host.trim().is_empty() {
            return Err(anyhow!("host cannot be empty"));
        }
        if self.max_clients == 0 {
            return Err(anyhow!("max_clients must be greater than 0"));
        }
        if self.adb.port == 0 {
            return Err(anyhow!("adb.port cannot be 0"));
        }
        if self.adb.host.trim().is_empty() {
            return Err(anyhow!("adb.host cannot be empty"));
        }
        if self.relay.max_packet_len < HEADER_LEN {
            return Err(anyhow!(
                "relay.max_packet_len must be at least {HEADER_LEN} bytes"
            ));
        }
        if self.relay.read_buffer_size == 0 {
            return Err(anyhow!("relay.read_buffer_size must be greater than 0"));
        }
        if self.relay.upstream_queue_depth == 0 || self.relay.client_queue_depth == 0 {
            return Err(anyhow!("relay queue depths must be greater than 0"));
        }
        if self.relay.write_timeout.is_zero() {
            return Err(anyhow!("relay.write_timeout cannot be 0"));
        }
        if self.metrics.enabled && self.metrics.port == self.port {
            return Err(anyhow!(
                "metrics.port cannot be the same as the relay port ({})",
                self.port
            ));
        }
        Ok(())
    }
}

// src/core/metrics.rs

//! Defines and registers Prometheus metrics for relay monitoring.
//!
//! This module uses `lazy_static` to ensure that metrics are registered only once
//! globally for the entire application lifecycle.

use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, Gauge, IntCounter, TextEncoder, register_counter, register_counter_vec,
    register_gauge, register_int_counter,
};

lazy_static! {
    // --- Gauges ---
    /// The number of managers holding an open device connection.
    pub static ref ACTIVE_MANAGERS: Gauge =
        register_gauge!("jdwpmux_active_managers", "Number of live relay managers.").unwrap();
    /// The number of clients attached across all managers.
    pub static ref ATTACHED_CLIENTS: Gauge =
        register_gauge!("jdwpmux_attached_clients", "Number of clients attached to a manager.").unwrap();


    // --- Traffic Counters ---
    pub static ref DEVICE_BYTES_TOTAL: IntCounter =
        register_int_counter!("jdwpmux_device_bytes_total", "Total bytes read from devices.").unwrap();
    pub static ref CLIENT_BYTES_TOTAL: IntCounter =
        register_int_counter!("jdwpmux_client_bytes_total", "Total bytes written by clients.").unwrap();
    /// Bytes forwarded without framing, labeled by direction.
    pub static ref RAW_FALLBACKS_TOTAL: CounterVec =
        register_counter_vec!("jdwpmux_raw_fallbacks_total", "Total number of raw fallbacks, labeled by direction.", &["direction"]).unwrap();
    /// Units an interceptor kept from a client or the device.
    pub static ref SUPPRESSED_UNITS_TOTAL: CounterVec =
        register_counter_vec!("jdwpmux_suppressed_units_total", "Total number of suppressed units, labeled by interceptor and direction.", &["interceptor", "direction"]).unwrap();


    // --- Server Counters ---
    /// The total number of downstream connections accepted since startup.
    pub static ref CONNECTIONS_RECEIVED_TOTAL: Counter =
        register_counter!("jdwpmux_connections_received_total", "Total number of connections received.").unwrap();
}

/// Gathers all registered metrics and encodes them in the Prometheus text format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder
        .encode_to_string(&metric_families)
        .unwrap_or_default()
}

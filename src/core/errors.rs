// src/core/errors.rs

//! Defines the primary error type for the entire relay.

use crate::core::client::ClientId;
use std::sync::Arc;
use thiserror::Error;

/// The main error enum, representing all possible failures within the relay.
/// Using `thiserror` allows for clean error definitions and automatic `From` trait implementations.
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("IO Error: {0}")]
    Io(Arc<std::io::Error>),

    /// The byte stream does not describe a plausible packet boundary.
    #[error("Bad framing: {0}")]
    BadFraming(String),

    #[error("Timed out while connecting to the device transport")]
    ConnectTimeout,

    #[error("Command rejected by adb: {0}")]
    CommandRejected(String),

    #[error("Client {0} is closed")]
    ClientClosed(ClientId),

    #[error("Client {0} is not draining its queue")]
    ClientBackpressure(ClientId),

    #[error("Device stopped draining the upstream write queue")]
    UpstreamBackpressure,

    #[error("Manager for {0} is closed")]
    ManagerClosed(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Internal Error: {0}")]
    Internal(String),
}

// Manual implementation of Clone because `std::io::Error` is not cloneable.
impl Clone for RelayError {
    fn clone(&self) -> Self {
        match self {
            RelayError::Io(e) => RelayError::Io(Arc::clone(e)),
            RelayError::BadFraming(s) => RelayError::BadFraming(s.clone()),
            RelayError::ConnectTimeout => RelayError::ConnectTimeout,
            RelayError::CommandRejected(s) => RelayError::CommandRejected(s.clone()),
            RelayError::ClientClosed(id) => RelayError::ClientClosed(*id),
            RelayError::ClientBackpressure(id) => RelayError::ClientBackpressure(*id),
            RelayError::UpstreamBackpressure => RelayError::UpstreamBackpressure,
            RelayError::ManagerClosed(s) => RelayError::ManagerClosed(s.clone()),
            RelayError::InvalidRequest(s) => RelayError::InvalidRequest(s.clone()),
            RelayError::Internal(s) => RelayError::Internal(s.clone()),
        }
    }
}

impl PartialEq for RelayError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (RelayError::Io(e1), RelayError::Io(e2)) => e1.kind() == e2.kind(),
            (RelayError::BadFraming(s1), RelayError::BadFraming(s2)) => s1 == s2,
            (RelayError::CommandRejected(s1), RelayError::CommandRejected(s2)) => s1 == s2,
            (RelayError::ClientClosed(a), RelayError::ClientClosed(b)) => a == b,
            (RelayError::ClientBackpressure(a), RelayError::ClientBackpressure(b)) => a == b,
            (RelayError::ManagerClosed(s1), RelayError::ManagerClosed(s2)) => s1 == s2,
            (RelayError::InvalidRequest(s1), RelayError::InvalidRequest(s2)) => s1 == s2,
            (RelayError::Internal(s1), RelayError::Internal(s2)) => s1 == s2,
            _ => core::mem::discriminant(self) == core::mem::discriminant(other),
        }
    }
}

impl RelayError {
    /// True for errors that mean the peer went away rather than misbehaved.
    pub fn is_disconnect(&self) -> bool {
        match self {
            RelayError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::ConnectionAborted
            ),
            RelayError::ClientClosed(_) => true,
            _ => false,
        }
    }
}

// --- From trait implementations for easy error conversion ---

impl From<std::io::Error> for RelayError {
    fn from(e: std::io::Error) -> Self {
        RelayError::Io(Arc::new(e))
    }
}

impl From<tokio::time::error::Elapsed> for RelayError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        RelayError::ConnectTimeout
    }
}

impl From<std::str::Utf8Error> for RelayError {
    fn from(e: std::str::Utf8Error) -> Self {
        RelayError::InvalidRequest(format!("request is not valid UTF-8: {e}"))
    }
}

impl From<std::num::ParseIntError> for RelayError {
    fn from(e: std::num::ParseIntError) -> Self {
        RelayError::InvalidRequest(format!("invalid number: {e}"))
    }
}

// src/connection/session.rs

//! Defines the preamble state of a single downstream connection.

use crate::core::RelayError;
use crate::core::manager::ManagerKey;
use crate::core::protocol::AdbRequest;

/// Where a connection is in the `host:transport:` / `jdwp:` preamble.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SessionState {
    /// Waiting for the device to be selected.
    #[default]
    AwaitingTransport,
    /// A device is selected; waiting for the process.
    AwaitingProcess { device: String },
    /// The socket now carries raw JDWP for this key.
    Relaying(ManagerKey),
}

impl SessionState {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Applies one request and returns the next state.
    pub fn advance(&self, request: AdbRequest) -> Result<SessionState, RelayError> {
        match (self, request) {
            (SessionState::AwaitingTransport, AdbRequest::Transport(device)) => {
                Ok(SessionState::AwaitingProcess { device })
            }
            (SessionState::AwaitingTransport, AdbRequest::Jdwp(_)) => Err(
                RelayError::InvalidRequest("no device selected".into()),
            ),
            (SessionState::AwaitingProcess { .. }, AdbRequest::Transport(_)) => Err(
                RelayError::InvalidRequest("device already selected".into()),
            ),
            (SessionState::AwaitingProcess { device }, AdbRequest::Jdwp(pid)) => {
                Ok(SessionState::Relaying(ManagerKey::new(device.clone(), pid)))
            }
            (SessionState::Relaying(_), _) => Err(RelayError::InvalidRequest(
                "connection is already relaying".into(),
            )),
        }
    }

    pub fn key(&self) -> Option<&ManagerKey> {
        match self {
            SessionState::Relaying(key) => Some(key),
            _ => None,
        }
    }
}

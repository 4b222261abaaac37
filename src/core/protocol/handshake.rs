// src/core/protocol/handshake.rs

//! The JDWP handshake token. It is exchanged once at connection start and is the
//! only unit on the wire that does not follow the packet format.

/// The raw handshake bytes, sent verbatim in both directions.
pub const HANDSHAKE: &[u8; 14] = b"JDWP-Handshake";
pub const HANDSHAKE_LEN: usize = HANDSHAKE.len();

/// Outcome of looking for the handshake at the start of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeMatch {
    /// The full token is present at offset 0.
    Good,
    /// The buffer is a strict prefix of the token; more bytes may complete it.
    NotYet,
    /// The buffer does not start with the token.
    Bad,
}

/// Checks whether `buf` starts with the handshake token.
pub fn find_handshake(buf: &[u8]) -> HandshakeMatch {
    if buf.len() >= HANDSHAKE_LEN {
        if &buf[..HANDSHAKE_LEN] == HANDSHAKE {
            HandshakeMatch::Good
        } else {
            HandshakeMatch::Bad
        }
    } else if HANDSHAKE.starts_with(buf) {
        HandshakeMatch::NotYet
    } else {
        HandshakeMatch::Bad
    }
}

/// True if `buf` starts with at least a prefix of the handshake token.
pub fn starts_with_handshake(buf: &[u8]) -> bool {
    !buf.is_empty() && find_handshake(buf) != HandshakeMatch::Bad
}

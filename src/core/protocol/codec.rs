// src/core/protocol/codec.rs

//! Implements the packet framer as a `tokio_util::codec::Decoder` that splits a
//! growing byte buffer into handshake tokens and complete JDWP packets.

use super::handshake::{HANDSHAKE, HANDSHAKE_LEN, HandshakeMatch, find_handshake};
use super::packet::{HEADER_LEN, JdwpPacket};
use crate::core::RelayError;
use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Default upper bound on a declared packet length.
pub const DEFAULT_MAX_PACKET_LEN: usize = 1024 * 1024;

/// One unit of relayed traffic.
#[derive(Debug, Clone, PartialEq)]
pub enum Unit {
    /// The fixed handshake token.
    Handshake,
    /// A complete, well-framed packet.
    Packet(JdwpPacket),
    /// Bytes that could not be framed and are forwarded verbatim.
    Raw(Bytes),
}

impl Unit {
    /// The bytes that go on the wire for this unit.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Unit::Handshake => HANDSHAKE,
            Unit::Packet(packet) => packet.as_bytes(),
            Unit::Raw(bytes) => bytes,
        }
    }

    /// Converts the unit into owned bytes ready to be queued for a socket.
    pub fn into_bytes(self) -> Bytes {
        match self {
            Unit::Handshake => Bytes::from_static(HANDSHAKE),
            Unit::Packet(packet) => packet.to_bytes(),
            Unit::Raw(bytes) => bytes,
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Unit::Handshake => "handshake",
            Unit::Packet(_) => "packet",
            Unit::Raw(_) => "raw",
        }
    }
}

/// Splits a byte stream into `Unit`s. The codec itself is stateless apart from
/// its length limit; all buffering lives in the caller's `BytesMut`.
#[derive(Debug, Clone, Copy)]
pub struct JdwpCodec {
    max_packet_len: usize,
}

impl Default for JdwpCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PACKET_LEN)
    }
}

impl JdwpCodec {
    pub fn new(max_packet_len: usize) -> Self {
        Self {
            max_packet_len: max_packet_len.max(HEADER_LEN),
        }
    }

    pub fn max_packet_len(&self) -> usize {
        self.max_packet_len
    }

    /// Looks for the handshake token at the start of `buf`.
    pub fn try_handshake(&self, buf: &[u8]) -> HandshakeMatch {
        find_handshake(buf)
    }

    /// Returns the length of the complete packet at the start of `buf`, `None`
    /// if more bytes are needed, or `BadFraming` if the header cannot describe
    /// a real packet.
    pub fn try_packet(&self, buf: &[u8]) -> Result<Option<usize>, RelayError> {
        if buf.len() < HEADER_LEN {
            return Ok(None);
        }
        let declared = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        if declared < HEADER_LEN {
            return Err(RelayError::BadFraming(format!(
                "declared packet length {declared} is shorter than the header"
            )));
        }
        if declared > self.max_packet_len {
            return Err(RelayError::BadFraming(format!(
                "declared packet length {declared} exceeds the limit of {}",
                self.max_packet_len
            )));
        }
        if buf.len() < declared {
            return Ok(None);
        }
        Ok(Some(declared))
    }

    /// True when `buf` starts with a header whose declared length is within
    /// bounds and only the body is still missing. Such a packet always
    /// completes once enough bytes arrive.
    pub fn awaiting_body(&self, buf: &[u8]) -> bool {
        buf.len() >= HEADER_LEN
            && self.try_handshake(buf) == HandshakeMatch::Bad
            && matches!(self.try_packet(buf), Ok(None))
    }

    /// Removes `len` bytes from the front of `src`, leaving the remainder in
    /// place for the next attempt.
    pub fn consume(&self, src: &mut BytesMut, len: usize) -> Bytes {
        src.split_to(len).freeze()
    }
}

impl Decoder for JdwpCodec {
    type Item = Unit;
    type Error = RelayError;

    /// Decodes the next unit. The handshake is checked first so an exact token
    /// match always wins over a packet-header reading of the same bytes.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }

        match self.try_handshake(src) {
            HandshakeMatch::Good => {
                src.advance(HANDSHAKE_LEN);
                return Ok(Some(Unit::Handshake));
            }
            HandshakeMatch::NotYet => return Ok(None),
            HandshakeMatch::Bad => {}
        }

        match self.try_packet(src)? {
            Some(len) => {
                let frame = self.consume(src, len);
                Ok(Some(Unit::Packet(JdwpPacket::from_frame(frame))))
            }
            None => Ok(None),
        }
    }
}

impl Encoder<Unit> for JdwpCodec {
    type Error = RelayError;

    fn encode(&mut self, item: Unit, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.extend_from_slice(item.as_bytes());
        Ok(())
    }
}

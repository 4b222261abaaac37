// src/core/protocol/packet.rs

//! A view over one complete JDWP packet, plus the small amount of DDM chunk
//! decoding the built-in interceptors need.

use crate::core::RelayError;
use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;
use std::str::FromStr;

/// Length of the fixed JDWP packet header.
pub const HEADER_LEN: usize = 11;
/// Flag bit marking a packet as a reply.
pub const REPLY_FLAG: u8 = 0x80;
/// The command set and command used by every DDM packet.
pub const DDM_COMMAND_SET: u8 = 0xC7;
pub const DDM_COMMAND: u8 = 0x01;
/// Length of the chunk header (type + length) at the start of a DDM payload.
pub const CHUNK_HEADER_LEN: usize = 8;

/// A four-character DDM chunk type, such as `HELO`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkType(pub [u8; 4]);

impl ChunkType {
    pub const HELO: ChunkType = ChunkType(*b"HELO");
    pub const FEAT: ChunkType = ChunkType(*b"FEAT");
    pub const APNM: ChunkType = ChunkType(*b"APNM");
    pub const WAIT: ChunkType = ChunkType(*b"WAIT");
    pub const EXIT: ChunkType = ChunkType(*b"EXIT");
    /// Synthesized by the relay to tell clients whether a debugger owns the session.
    pub const DBGS: ChunkType = ChunkType(*b"DBGS");

    pub fn as_u32(&self) -> u32 {
        u32::from_be_bytes(self.0)
    }
}

impl fmt::Display for ChunkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

impl fmt::Debug for ChunkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChunkType({self})")
    }
}

impl FromStr for ChunkType {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = s.as_bytes();
        if bytes.len() != 4 || !bytes.iter().all(|b| b.is_ascii_graphic()) {
            return Err(RelayError::InvalidRequest(format!(
                "chunk type '{s}' must be exactly 4 printable ASCII characters"
            )));
        }
        Ok(ChunkType([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }
}

/// A decoded DDM chunk header with the chunk's data.
#[derive(Debug, Clone, PartialEq)]
pub struct DdmChunk {
    pub chunk_type: ChunkType,
    pub data: Bytes,
}

/// One complete JDWP packet. The underlying bytes always hold exactly
/// `length()` bytes, header included.
#[derive(Clone, PartialEq)]
pub struct JdwpPacket {
    bytes: Bytes,
}

impl JdwpPacket {
    /// Wraps bytes that are already known to hold one complete packet.
    /// The codec is the only producer of packets from the wire.
    pub(crate) fn from_frame(bytes: Bytes) -> Self {
        debug_assert!(bytes.len() >= HEADER_LEN);
        Self { bytes }
    }

    /// Builds a command packet.
    pub fn command(id: u32, cmd_set: u8, cmd: u8, payload: &[u8]) -> Self {
        let mut buf = Self::header(id, 0, payload.len());
        buf.put_u8(cmd_set);
        buf.put_u8(cmd);
        buf.put_slice(payload);
        Self {
            bytes: buf.freeze(),
        }
    }

    /// Builds a reply packet.
    pub fn reply(id: u32, error_code: u16, payload: &[u8]) -> Self {
        let mut buf = Self::header(id, REPLY_FLAG, payload.len());
        buf.put_u16(error_code);
        buf.put_slice(payload);
        Self {
            bytes: buf.freeze(),
        }
    }

    /// Builds a DDM command packet carrying a single chunk.
    pub fn ddm_command(id: u32, chunk_type: ChunkType, data: &[u8]) -> Self {
        Self::command(id, DDM_COMMAND_SET, DDM_COMMAND, &chunk_payload(chunk_type, data))
    }

    /// Builds a DDM reply packet carrying a single chunk.
    pub fn ddm_reply(id: u32, chunk_type: ChunkType, data: &[u8]) -> Self {
        Self::reply(id, 0, &chunk_payload(chunk_type, data))
    }

    fn header(id: u32, flags: u8, payload_len: usize) -> BytesMut {
        let total = HEADER_LEN + payload_len;
        let mut buf = BytesMut::with_capacity(total);
        buf.put_u32(total as u32);
        buf.put_u32(id);
        buf.put_u8(flags);
        buf
    }

    pub fn length(&self) -> usize {
        self.bytes.len()
    }

    pub fn id(&self) -> u32 {
        u32::from_be_bytes([self.bytes[4], self.bytes[5], self.bytes[6], self.bytes[7]])
    }

    pub fn flags(&self) -> u8 {
        self.bytes[8]
    }

    pub fn is_reply(&self) -> bool {
        self.flags() & REPLY_FLAG != 0
    }

    pub fn is_command(&self) -> bool {
        !self.is_reply()
    }

    /// Command set, or `None` for replies.
    pub fn cmd_set(&self) -> Option<u8> {
        self.is_command().then(|| self.bytes[9])
    }

    /// Command, or `None` for replies.
    pub fn cmd(&self) -> Option<u8> {
        self.is_command().then(|| self.bytes[10])
    }

    /// Error code, or `None` for commands.
    pub fn error_code(&self) -> Option<u16> {
        self.is_reply()
            .then(|| u16::from_be_bytes([self.bytes[9], self.bytes[10]]))
    }

    pub fn payload(&self) -> &[u8] {
        &self.bytes[HEADER_LEN..]
    }

    /// True for a command in the DDM command set.
    pub fn is_ddm_command(&self) -> bool {
        self.cmd_set() == Some(DDM_COMMAND_SET) && self.cmd() == Some(DDM_COMMAND)
    }

    /// Decodes the leading DDM chunk of the payload.
    ///
    /// Replies carry no command set, so for replies this only checks that the
    /// payload is shaped like a chunk; callers that care correlate reply ids
    /// with the DDM command they answer.
    pub fn ddm_chunk(&self) -> Option<DdmChunk> {
        if self.is_command() && !self.is_ddm_command() {
            return None;
        }
        let payload = self.payload();
        if payload.len() < CHUNK_HEADER_LEN {
            return None;
        }
        let chunk_type = ChunkType([payload[0], payload[1], payload[2], payload[3]]);
        let declared =
            u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]) as usize;
        let available = payload.len() - CHUNK_HEADER_LEN;
        let start = HEADER_LEN + CHUNK_HEADER_LEN;
        Some(DdmChunk {
            chunk_type,
            data: self.bytes.slice(start..start + declared.min(available)),
        })
    }

    /// Returns a copy of this packet with a different id.
    pub fn with_id(&self, id: u32) -> Self {
        let mut buf = BytesMut::from(&self.bytes[..]);
        buf[4..8].copy_from_slice(&id.to_be_bytes());
        Self {
            bytes: buf.freeze(),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn to_bytes(&self) -> Bytes {
        self.bytes.clone()
    }
}

impl fmt::Debug for JdwpPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("JdwpPacket");
        s.field("length", &self.length()).field("id", &self.id());
        if self.is_reply() {
            s.field("error_code", &self.error_code());
        } else {
            s.field("cmd_set", &self.cmd_set()).field("cmd", &self.cmd());
        }
        if self.is_ddm_command()
            && let Some(chunk) = self.ddm_chunk()
        {
            s.field("chunk", &chunk.chunk_type);
        }
        s.finish()
    }
}

fn chunk_payload(chunk_type: ChunkType, data: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(CHUNK_HEADER_LEN + data.len());
    payload.extend_from_slice(&chunk_type.0);
    payload.extend_from_slice(&(data.len() as u32).to_be_bytes());
    payload.extend_from_slice(data);
    payload
}

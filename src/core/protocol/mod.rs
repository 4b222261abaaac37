// src/core/protocol/mod.rs

pub mod adb;
pub mod codec;
pub mod handshake;
pub mod packet;

pub use adb::{AdbRequest, AdbRequestCodec, AdbStatus};
pub use codec::{JdwpCodec, Unit};
pub use handshake::{HANDSHAKE, HANDSHAKE_LEN, HandshakeMatch};
pub use packet::{ChunkType, DdmChunk, HEADER_LEN, JdwpPacket};

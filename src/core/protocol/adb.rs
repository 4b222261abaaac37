// src/core/protocol/adb.rs

//! The adb smart-socket request format: a 4-digit hex length followed by an
//! ASCII payload, answered by `OKAY` or `FAIL` plus a length-prefixed message.
//! Both the pass-through transport and the downstream front-end speak it.

use crate::core::RelayError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{Decoder, Encoder};

const LENGTH_PREFIX_LEN: usize = 4;
const STATUS_LEN: usize = 4;
const MAX_REQUEST_LEN: usize = 0xFFFF;

pub const OKAY: &[u8; 4] = b"OKAY";
pub const FAIL: &[u8; 4] = b"FAIL";

const TRANSPORT_PREFIX: &str = "host:transport:";
const JDWP_PREFIX: &str = "jdwp:";

/// A request the relay understands on its downstream port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdbRequest {
    /// `host:transport:<serial>` selects the device.
    Transport(String),
    /// `jdwp:<pid>` selects the process on the selected device.
    Jdwp(u32),
}

impl AdbRequest {
    pub fn parse(payload: &str) -> Result<Self, RelayError> {
        if let Some(serial) = payload.strip_prefix(TRANSPORT_PREFIX) {
            if serial.is_empty() {
                return Err(RelayError::InvalidRequest("empty device serial".into()));
            }
            return Ok(AdbRequest::Transport(serial.to_string()));
        }
        if let Some(pid) = payload.strip_prefix(JDWP_PREFIX) {
            return Ok(AdbRequest::Jdwp(pid.trim().parse()?));
        }
        Err(RelayError::InvalidRequest(format!(
            "unsupported request '{payload}'"
        )))
    }

    pub fn to_payload(&self) -> String {
        match self {
            AdbRequest::Transport(serial) => format!("{TRANSPORT_PREFIX}{serial}"),
            AdbRequest::Jdwp(pid) => format!("{JDWP_PREFIX}{pid}"),
        }
    }
}

/// Encodes a request payload with its hex length prefix.
pub fn encode_request(payload: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_LEN + payload.len());
    buf.put_slice(format!("{:04x}", payload.len()).as_bytes());
    buf.put_slice(payload.as_bytes());
    buf.freeze()
}

/// Encodes a `FAIL` status with its message.
pub fn encode_fail(message: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(STATUS_LEN + LENGTH_PREFIX_LEN + message.len());
    buf.put_slice(FAIL);
    buf.put_slice(format!("{:04x}", message.len()).as_bytes());
    buf.put_slice(message.as_bytes());
    buf.freeze()
}

/// Sends a request and waits for its status.
pub async fn send_request<S>(stream: &mut S, request: &AdbRequest) -> Result<(), RelayError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream
        .write_all(&encode_request(&request.to_payload()))
        .await?;
    read_status(stream).await
}

/// Reads an `OKAY`/`FAIL` status. `FAIL` becomes `CommandRejected`.
pub async fn read_status<S>(stream: &mut S) -> Result<(), RelayError>
where
    S: AsyncRead + Unpin,
{
    let mut status = [0u8; STATUS_LEN];
    stream.read_exact(&mut status).await?;
    if &status == OKAY {
        return Ok(());
    }
    if &status == FAIL {
        let mut len_buf = [0u8; LENGTH_PREFIX_LEN];
        stream.read_exact(&mut len_buf).await?;
        let len = parse_hex_len(&len_buf)?;
        let mut message = vec![0u8; len];
        stream.read_exact(&mut message).await?;
        return Err(RelayError::CommandRejected(
            String::from_utf8_lossy(&message).to_string(),
        ));
    }
    Err(RelayError::InvalidRequest(format!(
        "unexpected adb status '{}'",
        String::from_utf8_lossy(&status)
    )))
}

fn parse_hex_len(prefix: &[u8]) -> Result<usize, RelayError> {
    let text = std::str::from_utf8(prefix)?;
    usize::from_str_radix(text, 16)
        .map_err(|_| RelayError::InvalidRequest(format!("invalid length prefix '{text}'")))
}

/// A `tokio_util::codec` implementation for length-prefixed adb requests.
#[derive(Debug, Default, Clone, Copy)]
pub struct AdbRequestCodec;

impl Decoder for AdbRequestCodec {
    type Item = AdbRequest;
    type Error = RelayError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < LENGTH_PREFIX_LEN {
            return Ok(None);
        }
        let len = parse_hex_len(&src[..LENGTH_PREFIX_LEN])?;
        if len > MAX_REQUEST_LEN {
            return Err(RelayError::InvalidRequest("request too long".into()));
        }
        if src.len() < LENGTH_PREFIX_LEN + len {
            return Ok(None);
        }
        src.advance(LENGTH_PREFIX_LEN);
        let payload = src.split_to(len);
        let text = std::str::from_utf8(&payload)?;
        AdbRequest::parse(text).map(Some)
    }
}

/// Replies sent back on the downstream port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdbStatus {
    Okay,
    Fail(String),
}

impl Encoder<AdbStatus> for AdbRequestCodec {
    type Error = RelayError;

    fn encode(&mut self, item: AdbStatus, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match item {
            AdbStatus::Okay => dst.put_slice(OKAY),
            AdbStatus::Fail(message) => dst.put_slice(&encode_fail(&message)),
        }
        Ok(())
    }
}

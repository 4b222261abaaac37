// src/core/manager/assembler.rs

//! Per-stream framing buffer. Turns arbitrary read boundaries into a sequence
//! of `Unit`s and decides when pending bytes have waited long enough to be
//! forwarded raw.

use crate::core::RelayError;
use crate::core::protocol::{JdwpCodec, Unit};
use bytes::BytesMut;
use tokio_util::codec::Decoder;
use tracing::{debug, warn};

/// Why an assembler gave up on framing part of its buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackCause {
    /// The header at the buffer start cannot describe a real packet.
    BadFraming,
    /// A header fragment or handshake prefix stayed unrecognized for too many
    /// reads.
    Stalled,
}

/// The units produced from one `feed`, plus whether the tail was flushed raw.
#[derive(Debug, Default)]
pub struct Assembled {
    pub units: Vec<Unit>,
    pub fallback: Option<FallbackCause>,
}

#[derive(Debug)]
pub struct StreamAssembler {
    codec: JdwpCodec,
    buffer: BytesMut,
    stalled_reads: usize,
    partial_read_limit: usize,
}

impl StreamAssembler {
    pub fn new(codec: JdwpCodec, capacity: usize, partial_read_limit: usize) -> Self {
        Self {
            codec,
            buffer: BytesMut::with_capacity(capacity),
            stalled_reads: 0,
            partial_read_limit,
        }
    }

    /// Bytes received but not yet emitted as a unit.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Appends one read's worth of bytes and drains every complete unit.
    ///
    /// No byte is ever dropped: anything that cannot be framed ends up in a
    /// trailing `Unit::Raw`.
    pub fn feed(&mut self, data: &[u8]) -> Assembled {
        self.buffer.extend_from_slice(data);
        let mut out = Assembled::default();

        loop {
            match self.codec.decode(&mut self.buffer) {
                Ok(Some(unit)) => out.units.push(unit),
                Ok(None) => break,
                Err(RelayError::BadFraming(reason)) => {
                    debug!("Framing lost ({}); forwarding {} bytes raw", reason, self.buffer.len());
                    out.fallback = Some(FallbackCause::BadFraming);
                    out.units.push(Unit::Raw(self.buffer.split().freeze()));
                    break;
                }
                Err(e) => {
                    warn!("Unexpected decoder error: {}", e);
                    out.fallback = Some(FallbackCause::BadFraming);
                    out.units.push(Unit::Raw(self.buffer.split().freeze()));
                    break;
                }
            }
        }

        // Only remnants that cannot be recognized yet count toward the limit. A
        // valid header waiting for its body is bounded by the packet limit.
        if self.buffer.is_empty() || self.codec.awaiting_body(&self.buffer) {
            self.stalled_reads = 0;
        } else {
            if !out.units.is_empty() {
                self.stalled_reads = 0;
            }
            self.stalled_reads += 1;
            if self.stalled_reads > self.partial_read_limit {
                debug!(
                    "Partial unit pending for {} reads; forwarding {} bytes raw",
                    self.stalled_reads,
                    self.buffer.len()
                );
                out.fallback = Some(FallbackCause::Stalled);
                out.units.push(Unit::Raw(self.buffer.split().freeze()));
                self.stalled_reads = 0;
            }
        }
        out
    }

    /// Empties the buffer, returning whatever was pending as a raw unit.
    pub fn flush(&mut self) -> Option<Unit> {
        self.stalled_reads = 0;
        (!self.buffer.is_empty()).then(|| Unit::Raw(self.buffer.split().freeze()))
    }
}

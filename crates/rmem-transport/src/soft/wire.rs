//! Frames exchanged between soft queue pairs.
//!
//! On a TCP link each frame is a 4-byte big-endian length followed by the
//! `bincode` body. In-memory links pass frames by value.

use crate::transport::{TransportError, TransportResult};
use crate::verbs::{ImmData, Qpn, RKey, WcStatus};
use serde::{Deserialize, Serialize};
use std::io::{self, Read, Write};

/// Largest encoded frame accepted from a peer
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// One message between two queue pairs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frame {
    /// Connection request carrying the initiator's queue pair number
    Connect {
        /// Initiator queue pair
        qpn: Qpn,
    },
    /// Connection accepted
    Accept {
        /// Acceptor queue pair
        qpn: Qpn,
    },
    /// Connection refused
    Reject,
    /// Two-sided send
    Send {
        /// Immediate data
        imm: Option<ImmData>,
        /// Payload (empty for bare signals)
        data: Vec<u8>,
    },
    /// One-sided write into the target's registered memory
    Write {
        /// Initiator's correlation tag
        tag: u64,
        /// Target address
        addr: u64,
        /// Target remote key
        rkey: RKey,
        /// Bytes to place
        data: Vec<u8>,
    },
    /// Outcome of a write
    WriteAck {
        /// Correlation tag of the write
        tag: u64,
        /// Completion status for the initiator
        status: WcStatus,
    },
    /// One-sided read from the target's registered memory
    ReadRequest {
        /// Initiator's correlation tag
        tag: u64,
        /// Source address
        addr: u64,
        /// Source remote key
        rkey: RKey,
        /// Bytes requested
        length: u32,
    },
    /// Data (or failure) for a read
    ReadResponse {
        /// Correlation tag of the read
        tag: u64,
        /// Completion status for the initiator
        status: WcStatus,
        /// Bytes read (empty on failure)
        data: Vec<u8>,
    },
    /// Orderly teardown
    Disconnect,
}

impl Frame {
    /// Short name for logs
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Connect { .. } => "connect",
            Self::Accept { .. } => "accept",
            Self::Reject => "reject",
            Self::Send { .. } => "send",
            Self::Write { .. } => "write",
            Self::WriteAck { .. } => "write-ack",
            Self::ReadRequest { .. } => "read-request",
            Self::ReadResponse { .. } => "read-response",
            Self::Disconnect => "disconnect",
        }
    }
}

/// Serialize a frame body
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode(frame: &Frame) -> TransportResult<Vec<u8>> {
    bincode::serialize(frame)
        .map_err(|e| TransportError::PostSend(format!("frame encoding failed: {e}")))
}

/// Deserialize a frame body
///
/// # Errors
///
/// Returns an error if the body is not a valid frame.
pub fn decode(body: &[u8]) -> TransportResult<Frame> {
    bincode::deserialize(body)
        .map_err(|e| TransportError::PollCompletion(format!("malformed frame: {e}")))
}

/// Write one length-prefixed frame
///
/// # Errors
///
/// Returns an error on I/O failure or if the frame is too large.
pub fn write_frame<W: Write>(writer: &mut W, frame: &Frame) -> TransportResult<()> {
    let body = encode(frame)?;
    if body.len() > MAX_FRAME_LEN {
        return Err(TransportError::PostSend(format!(
            "frame of {} bytes exceeds limit",
            body.len()
        )));
    }
    let len = u32::try_from(body.len())
        .map_err(|_| TransportError::PostSend("frame length overflow".to_string()))?;
    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(&body)?;
    writer.flush()?;
    Ok(())
}

/// Read one length-prefixed frame; `Ok(None)` on a clean end of stream
///
/// # Errors
///
/// Returns an error on I/O failure, an oversized length, or a malformed body.
pub fn read_frame<R: Read>(reader: &mut R) -> TransportResult<Option<Frame>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(TransportError::PollCompletion(format!(
            "frame length {len} exceeds limit"
        )));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body)?;
    decode(&body).map(Some)
}

//! Control-opcode channel multiplexed over a session.
//!
//! Signals travel as sends whose immediate data carries the opcode. Bare
//! signals have no payload; region signals carry one inline directory entry.
//! A background listener owns the receive side for the session's lifetime
//! and hands each message to a [`ControlHandler`].

use crate::config::DIRECTORY_ENTRY_LEN;
use crate::directory::PeerEntry;
use crate::error::{Result, SessionError, WireError};
use crate::session::Session;
use rmem_transport::{Sge, WcStatus};
use std::fmt;
use tracing::{debug, trace, warn};

/// Control and data opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    /// Peer-initiated teardown, or its acknowledgement
    Disconnect = 1,
    /// Inline write (data opcode)
    WriteInline = 2,
    /// Write (data opcode)
    Write = 3,
    /// Read (data opcode)
    Read = 4,
    /// Mark the sender's region open
    OpenMr = 5,
    /// Mark the sender's region closed (server) or drop an entry (client)
    CloseMr = 6,
    /// Reserved
    RequestPage = 7,
    /// Register with the directory / relay an entry
    RequestMr = 8,
    /// Wake the caller waiting on a region request
    SemaPost = 9,
}

impl Opcode {
    /// Value carried in the immediate data
    #[must_use]
    pub fn as_imm(self) -> u32 {
        self as u32
    }

    /// Whether this opcode names a data operation rather than a signal
    #[must_use]
    pub fn is_data(self) -> bool {
        matches!(self, Opcode::WriteInline | Opcode::Write | Opcode::Read)
    }
}

impl TryFrom<u32> for Opcode {
    type Error = WireError;

    fn try_from(value: u32) -> std::result::Result<Self, Self::Error> {
        Ok(match value {
            1 => Opcode::Disconnect,
            2 => Opcode::WriteInline,
            3 => Opcode::Write,
            4 => Opcode::Read,
            5 => Opcode::OpenMr,
            6 => Opcode::CloseMr,
            7 => Opcode::RequestPage,
            8 => Opcode::RequestMr,
            9 => Opcode::SemaPost,
            other => return Err(WireError::UnknownOpcode(other)),
        })
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Opcode::Disconnect => "DISCONNECT",
            Opcode::WriteInline => "WRITE_INLINE",
            Opcode::Write => "WRITE",
            Opcode::Read => "READ",
            Opcode::OpenMr => "OPEN_MR",
            Opcode::CloseMr => "CLOSE_MR",
            Opcode::RequestPage => "REQUEST_PAGE",
            Opcode::RequestMr => "REQUEST_MR",
            Opcode::SemaPost => "SEMA_POST",
        };
        f.write_str(name)
    }
}

/// Send a bare signal and wait for its send completion
///
/// # Errors
///
/// Returns [`SessionError::Closed`] after teardown, or the post/completion
/// failure.
pub fn send_signal(session: &Session, opcode: Opcode) -> Result<()> {
    session.post_and_wait(|id, wr_id| id.post_send(wr_id, None, Some(opcode.as_imm())))?;
    debug!("sent {}", opcode);
    Ok(())
}

/// Send a signal carrying `entry` inline
///
/// # Errors
///
/// As for [`send_signal`].
pub fn send_entry(session: &Session, opcode: Opcode, entry: &PeerEntry) -> Result<()> {
    let payload = entry.encode();
    session.post_and_wait(|id, wr_id| {
        id.post_send(wr_id, Some(Sge::Inline(&payload)), Some(opcode.as_imm()))
    })?;
    debug!("sent {} for peer {}", opcode, entry.id);
    Ok(())
}

/// One inbound control message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Received {
    /// Opcode 0 or a flushed receive; the listener should exit
    Exit,
    /// A known opcode, with its entry when one was carried
    Message {
        /// Opcode from the immediate data
        opcode: Opcode,
        /// Directory entry payload
        entry: Option<PeerEntry>,
    },
    /// Immediate data that names no opcode
    Unknown(u32),
}

/// Post one receive into the control region and wait for it
///
/// # Errors
///
/// Returns [`SessionError::Wire`] on a malformed payload and
/// [`SessionError::CompletionFailed`] on any failed completion other than a
/// flush.
pub fn receive(session: &Session) -> Result<Received> {
    let region = session.control_region();
    let wc = match session.receive_into(region, 0, DIRECTORY_ENTRY_LEN) {
        Ok(wc) => wc,
        Err(SessionError::Closed) => return Ok(Received::Exit),
        Err(e) => return Err(e),
    };

    if wc.status == WcStatus::WrFlushError {
        trace!("control receive flushed");
        return Ok(Received::Exit);
    }
    if !wc.is_success() {
        return Err(SessionError::CompletionFailed {
            opcode: wc.opcode,
            status: wc.status,
        });
    }

    let imm = wc.imm_data.unwrap_or(0);
    if imm == 0 {
        return Ok(Received::Exit);
    }
    let Ok(opcode) = Opcode::try_from(imm) else {
        return Ok(Received::Unknown(imm));
    };

    let entry = match wc.byte_len as usize {
        0 => None,
        len => {
            let bytes = region
                .read(0, len)
                .ok_or(SessionError::invalid_state("payload outside control region"))?;
            Some(PeerEntry::decode(&bytes)?)
        }
    };
    Ok(Received::Message { opcode, entry })
}

/// What a handler wants the listener to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Post another receive
    Continue,
    /// Stop listening
    Stop,
}

/// How a listener loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerExit {
    /// The handler stopped the loop (a disconnect was handled)
    Stopped,
    /// Receives were flushed or opcode 0 arrived
    Flushed,
}

/// Role-specific reaction to control messages.
pub trait ControlHandler {
    /// Handle one message
    ///
    /// # Errors
    ///
    /// An error ends the listener.
    fn on_message(
        &mut self,
        session: &Session,
        opcode: Opcode,
        entry: Option<PeerEntry>,
    ) -> Result<Flow>;
}

/// Receive and dispatch control messages until the handler stops or the
/// session's receives are flushed
///
/// # Errors
///
/// Returns the first receive or handler error.
pub fn run_listener<H: ControlHandler>(session: &Session, handler: &mut H) -> Result<ListenerExit> {
    loop {
        match receive(session)? {
            Received::Exit => {
                debug!("control listener exiting");
                return Ok(ListenerExit::Flushed);
            }
            Received::Unknown(value) => {
                warn!("ignoring unknown control opcode {}", value);
            }
            Received::Message { opcode, entry } => {
                trace!("received {}", opcode);
                if handler.on_message(session, opcode, entry)? == Flow::Stop {
                    return Ok(ListenerExit::Stopped);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_values() {
        assert_eq!(Opcode::Disconnect.as_imm(), 1);
        assert_eq!(Opcode::RequestMr.as_imm(), 8);
        assert_eq!(Opcode::SemaPost.as_imm(), 9);
        for value in 1..=9u32 {
            assert_eq!(Opcode::try_from(value).unwrap().as_imm(), value);
        }
    }

    #[test]
    fn test_unknown_opcodes() {
        assert_eq!(Opcode::try_from(0), Err(WireError::UnknownOpcode(0)));
        assert_eq!(Opcode::try_from(10), Err(WireError::UnknownOpcode(10)));
    }

    #[test]
    fn test_data_opcodes() {
        assert!(Opcode::Write.is_data());
        assert!(!Opcode::OpenMr.is_data());
        assert_eq!(Opcode::CloseMr.to_string(), "CLOSE_MR");
    }
}

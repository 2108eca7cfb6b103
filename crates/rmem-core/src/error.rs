//! Error types for the session core.
//!
//! Errors are classified by what the caller can still do afterwards:
//!
//! - **Fatal**: the session (or the thread owning it) cannot continue. Setup
//!   failures, protocol violations, bounded waits that elapsed, malformed
//!   wire data and a closed session fall here.
//! - **Recoverable**: the request was refused or failed but the session is
//!   still usable. Bounds rejections post nothing; a failed completion is
//!   reported and the next operation may proceed.
//!
//! There is no automatic retry anywhere in the core.

use crate::directory::PeerId;
use rmem_transport::{CmEventKind, TransportError, WcOpcode, WcStatus};
use std::borrow::Cow;
use thiserror::Error;

/// Errors raised by sessions, the directory and the server.
#[derive(Debug, Error)]
pub enum SessionError {
    // ============ Setup ============
    /// A transport primitive failed while establishing the session
    #[error("{operation} failed: {source}")]
    Setup {
        /// Primitive that failed
        operation: &'static str,
        /// Underlying transport error
        #[source]
        source: TransportError,
    },

    /// A connection-management event other than the expected one arrived
    #[error("protocol violation: expected {expected}, received {received}")]
    ProtocolViolation {
        /// Event the state machine was waiting for
        expected: CmEventKind,
        /// Event that arrived instead
        received: CmEventKind,
    },

    /// A bounded wait for an event elapsed
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    // ============ Operations ============
    /// Operation refused locally; nothing was posted
    #[error("operation rejected: {0}")]
    Bounds(#[from] BoundsError),

    /// A posted operation completed with a non-success status
    #[error("{opcode} completion failed with status {status}")]
    CompletionFailed {
        /// Kind of operation
        opcode: WcOpcode,
        /// Completion status
        status: WcStatus,
    },

    /// A transport primitive failed after setup
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    // ============ Directory & wire ============
    /// Directory lookup or mutation failed
    #[error("directory error: {0}")]
    Directory(#[from] DirectoryError),

    /// Malformed credential or directory entry payload
    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    // ============ Lifecycle & configuration ============
    /// The session is closed or its listener has exited
    #[error("session closed")]
    Closed,

    /// Operation not allowed in the current state
    #[error("invalid state: {0}")]
    InvalidState(Cow<'static, str>),

    /// Configuration rejected by validation
    #[error("invalid configuration: {0}")]
    InvalidConfig(Cow<'static, str>),
}

impl SessionError {
    /// Returns true if the session cannot continue after this error
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SessionError::Setup { .. }
                | SessionError::ProtocolViolation { .. }
                | SessionError::Timeout(_)
                | SessionError::Transport(_)
                | SessionError::Wire(_)
                | SessionError::Closed
                | SessionError::InvalidConfig(_)
        )
    }

    /// Returns true if the session stays usable after this error
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        !self.is_fatal()
    }

    /// Wrap a setup-phase transport failure
    #[must_use]
    pub fn setup(operation: &'static str, source: TransportError) -> Self {
        SessionError::Setup { operation, source }
    }

    /// Create an invalid state error with static context
    #[must_use]
    pub const fn invalid_state(context: &'static str) -> Self {
        SessionError::InvalidState(Cow::Borrowed(context))
    }

    /// Create an invalid configuration error with static context
    #[must_use]
    pub const fn invalid_config(context: &'static str) -> Self {
        SessionError::InvalidConfig(Cow::Borrowed(context))
    }
}

/// Local bounds rejections of the remote operation executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BoundsError {
    /// Inline payload larger than the inline ceiling
    #[error("inline payload of {len} bytes exceeds the {ceiling}-byte ceiling")]
    InlineTooLarge {
        /// Payload length
        len: usize,
        /// Inline ceiling
        ceiling: usize,
    },

    /// `offset + span` reaches past the remote region
    #[error("invalid offset: {offset} + {span} exceeds remote length {remote_length}")]
    InvalidOffset {
        /// Requested offset
        offset: u64,
        /// Bytes the operation touches
        span: u64,
        /// Length of the remote region
        remote_length: u64,
    },

    /// Offset at or beyond the end of the remote region
    #[error("offset {offset} is outside remote region of {remote_length} bytes")]
    OffsetPastEnd {
        /// Requested offset
        offset: u64,
        /// Length of the remote region
        remote_length: u64,
    },

    /// Payload or read length larger than the local data region
    #[error("{len} bytes exceed local capacity of {capacity}")]
    ExceedsLocalCapacity {
        /// Requested length
        len: usize,
        /// Local data region length
        capacity: usize,
    },
}

/// Peer directory errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DirectoryError {
    /// No entry with this peer id
    #[error("peer {0} not found")]
    NotFound(PeerId),
}

/// Wire format errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum WireError {
    /// Message shorter than its fixed layout
    #[error("message too short: expected at least {expected}, got {actual}")]
    TooShort {
        /// Expected minimum size
        expected: usize,
        /// Actual size received
        actual: usize,
    },

    /// Immediate data does not name a known opcode
    #[error("unknown opcode: {0}")]
    UnknownOpcode(u32),
}

/// Result type for session operations
pub type Result<T> = std::result::Result<T, SessionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_errors() {
        assert!(SessionError::setup("rdma_connect", TransportError::Closed).is_fatal());
        assert!(
            SessionError::ProtocolViolation {
                expected: CmEventKind::Established,
                received: CmEventKind::Rejected,
            }
            .is_fatal()
        );
        assert!(SessionError::Timeout("RDMA_CM_EVENT_ADDR_RESOLVED").is_fatal());
        assert!(SessionError::Wire(WireError::UnknownOpcode(42)).is_fatal());
        assert!(SessionError::Closed.is_fatal());
        assert!(SessionError::invalid_config("region length is zero").is_fatal());
    }

    #[test]
    fn test_recoverable_errors() {
        let bounds = BoundsError::ExceedsLocalCapacity {
            len: 10,
            capacity: 5,
        };
        assert!(SessionError::from(bounds).is_recoverable());
        assert!(
            SessionError::CompletionFailed {
                opcode: WcOpcode::RdmaWrite,
                status: WcStatus::RemoteAccessError,
            }
            .is_recoverable()
        );
        assert!(SessionError::from(DirectoryError::NotFound(7)).is_recoverable());
        assert!(SessionError::invalid_state("credential already set").is_recoverable());
    }

    #[test]
    fn test_protocol_violation_names_both_events() {
        let err = SessionError::ProtocolViolation {
            expected: CmEventKind::AddrResolved,
            received: CmEventKind::AddrError,
        };
        let msg = err.to_string();
        assert!(msg.contains("RDMA_CM_EVENT_ADDR_RESOLVED"));
        assert!(msg.contains("RDMA_CM_EVENT_ADDR_ERROR"));
    }

    #[test]
    fn test_bounds_display() {
        let err = BoundsError::InvalidOffset {
            offset: 1048570,
            span: 64,
            remote_length: 1048576,
        };
        assert!(err.to_string().starts_with("invalid offset"));
    }
}

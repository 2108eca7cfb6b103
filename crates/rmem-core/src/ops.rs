//! Remote operation executor: inline write, write and read against a remote
//! target.
//!
//! Every operation checks its bounds locally first. A rejected request posts
//! nothing. An accepted one posts a single work request and blocks for its
//! completion.

use crate::error::{BoundsError, Result, SessionError};
use crate::session::Session;
use rmem_transport::{RKey, Sge};
use tracing::debug;

/// A region on the other side of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteTarget {
    /// Base address
    pub addr: u64,
    /// Remote key
    pub rkey: RKey,
    /// Length in bytes
    pub length: u64,
}

impl RemoteTarget {
    /// Absolute address of `offset`, for an operation touching `span` bytes
    ///
    /// # Errors
    ///
    /// Returns [`BoundsError::InvalidOffset`] if the address overflows.
    pub fn address_at(&self, offset: u64, span: u64) -> std::result::Result<u64, BoundsError> {
        self.addr
            .checked_add(offset)
            .ok_or(BoundsError::InvalidOffset {
                offset,
                span,
                remote_length: self.length,
            })
    }
}

/// Inline writes always write the full ceiling, so `offset + ceiling` must fit.
///
/// # Errors
///
/// Returns [`BoundsError::InlineTooLarge`] or [`BoundsError::InvalidOffset`].
pub fn check_inline(
    target: &RemoteTarget,
    offset: u64,
    payload_len: usize,
    ceiling: usize,
) -> std::result::Result<(), BoundsError> {
    if payload_len > ceiling {
        return Err(BoundsError::InlineTooLarge {
            len: payload_len,
            ceiling,
        });
    }
    let span = ceiling as u64;
    match offset.checked_add(span) {
        Some(end) if end <= target.length => Ok(()),
        _ => Err(BoundsError::InvalidOffset {
            offset,
            span,
            remote_length: target.length,
        }),
    }
}

/// Writes need a starting offset inside the region and a payload the local
/// region can stage. The end is checked by the target.
///
/// # Errors
///
/// Returns [`BoundsError::OffsetPastEnd`] or
/// [`BoundsError::ExceedsLocalCapacity`].
pub fn check_write(
    target: &RemoteTarget,
    offset: u64,
    payload_len: usize,
    capacity: usize,
) -> std::result::Result<(), BoundsError> {
    if offset >= target.length {
        return Err(BoundsError::OffsetPastEnd {
            offset,
            remote_length: target.length,
        });
    }
    if payload_len > capacity {
        return Err(BoundsError::ExceedsLocalCapacity {
            len: payload_len,
            capacity,
        });
    }
    Ok(())
}

/// Reads must end inside the remote region and fit the local one.
///
/// # Errors
///
/// Returns [`BoundsError::InvalidOffset`] or
/// [`BoundsError::ExceedsLocalCapacity`].
pub fn check_read(
    target: &RemoteTarget,
    offset: u64,
    len: usize,
    capacity: usize,
) -> std::result::Result<(), BoundsError> {
    let span = len as u64;
    match offset.checked_add(span) {
        Some(end) if end <= target.length => {}
        _ => {
            return Err(BoundsError::InvalidOffset {
                offset,
                span,
                remote_length: target.length,
            });
        }
    }
    if len > capacity {
        return Err(BoundsError::ExceedsLocalCapacity { len, capacity });
    }
    Ok(())
}

impl Session {
    /// Write `payload` inline at `target.addr + offset`, zero-padded to the
    /// inline ceiling
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Bounds`] (nothing posted) or
    /// [`SessionError::CompletionFailed`].
    pub fn write_inline(&self, target: &RemoteTarget, offset: u64, payload: &[u8]) -> Result<()> {
        let ceiling = self.inline_ceiling();
        check_inline(target, offset, payload.len(), ceiling)?;
        let remote_addr = target.address_at(offset, ceiling as u64)?;

        let mut buffer = vec![0u8; ceiling];
        buffer[..payload.len()].copy_from_slice(payload);

        self.post_and_wait(|id, wr_id| {
            id.post_remote_write(wr_id, Sge::Inline(&buffer[..]), remote_addr, target.rkey)
        })?;
        debug!("inline write of {} bytes at offset {}", payload.len(), offset);
        Ok(())
    }

    /// Stage `payload` in the local data region and write it to
    /// `target.addr + offset`
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Bounds`] (nothing posted) or
    /// [`SessionError::CompletionFailed`].
    pub fn write(&self, target: &RemoteTarget, offset: u64, payload: &[u8]) -> Result<()> {
        check_write(target, offset, payload.len(), self.local_capacity())?;
        let remote_addr = target.address_at(offset, payload.len() as u64)?;

        let mr = self.data_region();
        if !mr.write_at(0, payload) {
            return Err(SessionError::invalid_state("payload does not fit data region"));
        }

        self.post_and_wait(|id, wr_id| {
            id.post_remote_write(
                wr_id,
                Sge::Local {
                    mr,
                    offset: 0,
                    length: payload.len(),
                },
                remote_addr,
                target.rkey,
            )
        })?;
        debug!("write of {} bytes at offset {}", payload.len(), offset);
        Ok(())
    }

    /// Read `len` bytes from `target.addr + offset` into the local data
    /// region and return a copy
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Bounds`] (nothing posted) or
    /// [`SessionError::CompletionFailed`].
    pub fn read(&self, target: &RemoteTarget, offset: u64, len: usize) -> Result<Vec<u8>> {
        check_read(target, offset, len, self.local_capacity())?;
        let remote_addr = target.address_at(offset, len as u64)?;

        let mr = self.data_region();
        self.post_and_wait(|id, wr_id| {
            id.post_remote_read(wr_id, mr, 0, len, remote_addr, target.rkey)
        })?;

        debug!("read {} bytes at offset {}", len, offset);
        mr.read(0, len)
            .ok_or(SessionError::invalid_state("read landed outside data region"))
    }
}

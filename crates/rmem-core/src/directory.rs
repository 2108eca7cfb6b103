//! Peer directory: regions other parties have advertised.
//!
//! Entries are keyed by peer id in one map behind one lock. Inserts are
//! idempotent: a second registration for a known id is ignored and the
//! original attributes stay.

use crate::config::DIRECTORY_ENTRY_LEN;
use crate::error::{DirectoryError, WireError};
use crate::ops::RemoteTarget;
use rmem_transport::RKey;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{PoisonError, RwLock};
use tracing::debug;

/// Identifier a client picks for itself when it connects
pub type PeerId = u64;

/// Whether an advertised region may be targeted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegionStatus {
    /// Peers may read and write the region
    Open,
    /// The owner has withdrawn the region
    Closed,
}

impl fmt::Display for RegionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegionStatus::Open => f.write_str("open"),
            RegionStatus::Closed => f.write_str("closed"),
        }
    }
}

/// One advertised region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerEntry {
    /// Owner of the region
    pub id: PeerId,
    /// Remote key authorizing access
    pub rkey: RKey,
    /// Base address of the region
    pub addr: u64,
    /// Length in bytes
    pub length: u64,
    /// Open/closed flag
    pub status: RegionStatus,
}

impl PeerEntry {
    /// Create a closed entry
    #[must_use]
    pub fn new(id: PeerId, rkey: RKey, addr: u64, length: u64) -> Self {
        Self {
            id,
            rkey,
            addr,
            length,
            status: RegionStatus::Closed,
        }
    }

    /// Same entry with another status
    #[must_use]
    pub fn with_status(mut self, status: RegionStatus) -> Self {
        self.status = status;
        self
    }

    /// Whether the region is open
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.status == RegionStatus::Open
    }

    /// Target for the remote operation executor
    #[must_use]
    pub fn target(&self) -> RemoteTarget {
        RemoteTarget {
            addr: self.addr,
            rkey: self.rkey,
            length: self.length,
        }
    }

    /// Encode as `{id u64, rkey u32, addr u64, length u64}`, little-endian.
    /// The status is not carried; the control opcode conveys it.
    #[must_use]
    pub fn encode(&self) -> [u8; DIRECTORY_ENTRY_LEN] {
        let mut buf = [0u8; DIRECTORY_ENTRY_LEN];
        buf[0..8].copy_from_slice(&self.id.to_le_bytes());
        buf[8..12].copy_from_slice(&self.rkey.to_le_bytes());
        buf[12..20].copy_from_slice(&self.addr.to_le_bytes());
        buf[20..28].copy_from_slice(&self.length.to_le_bytes());
        buf
    }

    /// Decode an entry; the result is closed
    ///
    /// # Errors
    ///
    /// Returns [`WireError::TooShort`] if fewer than 28 bytes are given.
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() < DIRECTORY_ENTRY_LEN {
            return Err(WireError::TooShort {
                expected: DIRECTORY_ENTRY_LEN,
                actual: bytes.len(),
            });
        }
        let u64_at = |at: usize| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&bytes[at..at + 8]);
            u64::from_le_bytes(raw)
        };
        let mut rkey = [0u8; 4];
        rkey.copy_from_slice(&bytes[8..12]);

        Ok(Self::new(
            u64_at(0),
            u32::from_le_bytes(rkey),
            u64_at(12),
            u64_at(20),
        ))
    }
}

/// Concurrently accessed directory of peer regions.
#[derive(Debug, Default)]
pub struct PeerDirectory {
    entries: RwLock<BTreeMap<PeerId, PeerEntry>>,
}

impl PeerDirectory {
    /// Create an empty directory
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `entry` unless its id is already present; returns whether it was added
    pub fn insert(&self, entry: PeerEntry) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if entries.contains_key(&entry.id) {
            debug!("peer {} already registered, keeping existing entry", entry.id);
            return false;
        }
        entries.insert(entry.id, entry);
        true
    }

    /// Remove and return the entry for `id`
    ///
    /// # Errors
    ///
    /// Returns [`DirectoryError::NotFound`] and leaves the directory
    /// unchanged if `id` is absent.
    pub fn remove(&self, id: PeerId) -> Result<PeerEntry, DirectoryError> {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
            .ok_or(DirectoryError::NotFound(id))
    }

    /// Whether `id` has an entry
    #[must_use]
    pub fn contains(&self, id: PeerId) -> bool {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&id)
    }

    /// Copy of the entry for `id`
    #[must_use]
    pub fn get(&self, id: PeerId) -> Option<PeerEntry> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .copied()
    }

    /// Number of entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether the directory is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Change the status of an existing entry
    ///
    /// # Errors
    ///
    /// Returns [`DirectoryError::NotFound`] if `id` is absent.
    pub fn set_status(&self, id: PeerId, status: RegionStatus) -> Result<(), DirectoryError> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let entry = entries.get_mut(&id).ok_or(DirectoryError::NotFound(id))?;
        entry.status = status;
        Ok(())
    }

    /// All entries, ordered by id
    #[must_use]
    pub fn snapshot(&self) -> Vec<PeerEntry> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .copied()
            .collect()
    }

    /// Look up an id chosen by an operator
    ///
    /// # Errors
    ///
    /// Returns [`DirectoryError::NotFound`] if `id` is absent.
    pub fn find_interactive(&self, id: PeerId) -> Result<PeerEntry, DirectoryError> {
        self.get(id).ok_or(DirectoryError::NotFound(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: PeerId, length: u64) -> PeerEntry {
        PeerEntry::new(id, 0x1000 + id as u32, 0x7f00_0000_0000 + id * 0x10_0000, length)
    }

    #[test]
    fn test_entry_layout() {
        let e = PeerEntry::new(0x0102_0304_0506_0708, 0xaabb_ccdd, 0x1122, 65536);
        let bytes = e.encode();
        assert_eq!(bytes.len(), 28);
        assert_eq!(&bytes[0..8], &0x0102_0304_0506_0708u64.to_le_bytes());
        assert_eq!(&bytes[8..12], &0xaabb_ccddu32.to_le_bytes());
        assert_eq!(&bytes[12..20], &0x1122u64.to_le_bytes());
        assert_eq!(&bytes[20..28], &65536u64.to_le_bytes());
        assert_eq!(PeerEntry::decode(&bytes).unwrap(), e);
    }

    #[test]
    fn test_decode_short() {
        assert_eq!(
            PeerEntry::decode(&[0u8; 27]),
            Err(WireError::TooShort {
                expected: 28,
                actual: 27
            })
        );
    }

    #[test]
    fn test_insert_is_idempotent() {
        let dir = PeerDirectory::new();
        assert!(dir.insert(entry(1, 100)));
        assert!(!dir.insert(entry(1, 999)));
        assert_eq!(dir.len(), 1);
        assert_eq!(dir.get(1).unwrap().length, 100);
    }

    #[test]
    fn test_remove() {
        let dir = PeerDirectory::new();
        dir.insert(entry(5, 10));
        assert_eq!(dir.remove(5).unwrap().id, 5);
        assert!(dir.is_empty());
        assert_eq!(dir.remove(5), Err(DirectoryError::NotFound(5)));
    }

    #[test]
    fn test_remove_missing_leaves_directory_unchanged() {
        let dir = PeerDirectory::new();
        dir.insert(entry(1, 10));
        assert!(dir.remove(2).is_err());
        assert_eq!(dir.snapshot(), vec![entry(1, 10)]);
    }

    #[test]
    fn test_set_status() {
        let dir = PeerDirectory::new();
        dir.insert(entry(3, 10));
        dir.set_status(3, RegionStatus::Open).unwrap();
        assert!(dir.get(3).unwrap().is_open());
        assert_eq!(
            dir.set_status(4, RegionStatus::Open),
            Err(DirectoryError::NotFound(4))
        );
    }

    #[test]
    fn test_snapshot_ordered_by_id() {
        let dir = PeerDirectory::new();
        for id in [9, 2, 5] {
            dir.insert(entry(id, 1));
        }
        let ids: Vec<_> = dir.snapshot().iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![2, 5, 9]);
    }

    #[test]
    fn test_find_interactive() {
        let dir = PeerDirectory::new();
        dir.insert(entry(7, 64));
        assert_eq!(dir.find_interactive(7).unwrap().target().length, 64);
        assert_eq!(dir.find_interactive(8), Err(DirectoryError::NotFound(8)));
    }

    #[test]
    fn test_concurrent_inserts() {
        use std::sync::Arc;
        use std::thread;

        let dir = Arc::new(PeerDirectory::new());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let dir = Arc::clone(&dir);
                thread::spawn(move || {
                    for i in 0..50u64 {
                        dir.insert(entry(i % 20, t));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(dir.len(), 20);
    }
}

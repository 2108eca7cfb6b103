//! Registered memory regions.
//!
//! A [`MemoryRegion`] is the local view of a registration: the buffer plus the
//! keys that name it. The fabric-wide [`RegionTable`] maps remote keys to
//! buffers so remote reads and writes can be served by the target side.

use crate::verbs::{AccessFlags, LKey, RKey, WcStatus};
use dashmap::DashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

const PAGE_SIZE: u64 = 4096;

/// First synthetic address handed out; looks like a user-space heap mapping
const BASE_ADDRESS: u64 = 0x7f3a_0000_0000;

/// Backing storage of one registration.
pub struct RegionBuffer {
    base: u64,
    data: RwLock<Box<[u8]>>,
}

impl RegionBuffer {
    fn new(base: u64, length: usize) -> Self {
        Self {
            base,
            data: RwLock::new(vec![0u8; length].into_boxed_slice()),
        }
    }

    fn len(&self) -> usize {
        self.data.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn read(&self, offset: usize, length: usize) -> Option<Vec<u8>> {
        let data = self.data.read().unwrap_or_else(PoisonError::into_inner);
        let end = offset.checked_add(length)?;
        data.get(offset..end).map(<[u8]>::to_vec)
    }

    fn write(&self, offset: usize, bytes: &[u8]) -> bool {
        let mut data = self.data.write().unwrap_or_else(PoisonError::into_inner);
        let Some(end) = offset.checked_add(bytes.len()) else {
            return false;
        };
        match data.get_mut(offset..end) {
            Some(dst) => {
                dst.copy_from_slice(bytes);
                true
            }
            None => false,
        }
    }

    fn fill(&self, value: u8) {
        self.data
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .fill(value);
    }

    /// Translate a remote address range into an offset inside this buffer
    fn offset_of(&self, addr: u64, length: usize) -> Option<usize> {
        let offset = addr.checked_sub(self.base)?;
        let end = offset.checked_add(length as u64)?;
        if end > self.len() as u64 {
            return None;
        }
        usize::try_from(offset).ok()
    }
}

/// A registered buffer together with its keys.
///
/// Clones refer to the same registration.
#[derive(Clone)]
pub struct MemoryRegion {
    buffer: Arc<RegionBuffer>,
    lkey: LKey,
    rkey: RKey,
    access: AccessFlags,
}

impl MemoryRegion {
    /// Base address peers use to target this region
    #[must_use]
    pub fn addr(&self) -> u64 {
        self.buffer.base
    }

    /// Length in bytes
    #[must_use]
    pub fn length(&self) -> usize {
        self.buffer.len()
    }

    /// Local key
    #[must_use]
    pub fn lkey(&self) -> LKey {
        self.lkey
    }

    /// Remote key handed to peers
    #[must_use]
    pub fn rkey(&self) -> RKey {
        self.rkey
    }

    /// Granted access
    #[must_use]
    pub fn access(&self) -> AccessFlags {
        self.access
    }

    /// Copy `length` bytes starting at `offset`; `None` if out of range
    #[must_use]
    pub fn read(&self, offset: usize, length: usize) -> Option<Vec<u8>> {
        self.buffer.read(offset, length)
    }

    /// Copy `bytes` in at `offset`; returns false if out of range
    pub fn write_at(&self, offset: usize, bytes: &[u8]) -> bool {
        self.buffer.write(offset, bytes)
    }

    /// Zero the whole region
    pub fn zero(&self) {
        self.buffer.fill(0);
    }
}

impl fmt::Debug for MemoryRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryRegion")
            .field("addr", &format_args!("{:#x}", self.addr()))
            .field("length", &self.length())
            .field("lkey", &self.lkey)
            .field("rkey", &self.rkey)
            .finish()
    }
}

struct TableEntry {
    buffer: Arc<RegionBuffer>,
    access: AccessFlags,
}

/// Registrations of one protection domain, keyed by remote key.
pub(crate) struct RegionTable {
    entries: DashMap<RKey, TableEntry>,
    next_key: AtomicU32,
    next_addr: AtomicU64,
}

impl RegionTable {
    pub(crate) fn new() -> Self {
        Self {
            entries: DashMap::new(),
            next_key: AtomicU32::new(0x1000),
            next_addr: AtomicU64::new(BASE_ADDRESS),
        }
    }

    pub(crate) fn register(&self, length: usize, access: AccessFlags) -> MemoryRegion {
        // One guard page between regions keeps stray ranges from aliasing
        let span = (length as u64).div_ceil(PAGE_SIZE).max(1) * PAGE_SIZE + PAGE_SIZE;
        let base = self.next_addr.fetch_add(span, Ordering::Relaxed);
        let key = self.next_key.fetch_add(1, Ordering::Relaxed);

        let buffer = Arc::new(RegionBuffer::new(base, length));
        self.entries.insert(
            key,
            TableEntry {
                buffer: Arc::clone(&buffer),
                access,
            },
        );

        MemoryRegion {
            buffer,
            lkey: key | 0x8000_0000,
            rkey: key,
            access,
        }
    }

    pub(crate) fn deregister(&self, rkey: RKey) -> bool {
        self.entries.remove(&rkey).is_some()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Apply a remote write; the status is what the initiator observes
    pub(crate) fn write_remote(&self, addr: u64, rkey: RKey, bytes: &[u8]) -> WcStatus {
        let Some(entry) = self.entries.get(&rkey) else {
            return WcStatus::RemoteAccessError;
        };
        if !entry.access.allows(AccessFlags::REMOTE_WRITE) {
            return WcStatus::RemoteAccessError;
        }
        match entry.buffer.offset_of(addr, bytes.len()) {
            Some(offset) if entry.buffer.write(offset, bytes) => WcStatus::Success,
            _ => WcStatus::RemoteAccessError,
        }
    }

    /// Serve a remote read
    pub(crate) fn read_remote(
        &self,
        addr: u64,
        rkey: RKey,
        length: usize,
    ) -> Result<Vec<u8>, WcStatus> {
        let entry = self
            .entries
            .get(&rkey)
            .ok_or(WcStatus::RemoteAccessError)?;
        if !entry.access.allows(AccessFlags::REMOTE_READ) {
            return Err(WcStatus::RemoteAccessError);
        }
        entry
            .buffer
            .offset_of(addr, length)
            .and_then(|offset| entry.buffer.read(offset, length))
            .ok_or(WcStatus::RemoteAccessError)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_assigns_distinct_page_aligned_ranges() {
        let table = RegionTable::new();
        let a = table.register(100, AccessFlags::remote_rw());
        let b = table.register(100, AccessFlags::remote_rw());

        assert_eq!(a.addr() % PAGE_SIZE, 0);
        assert_eq!(b.addr() % PAGE_SIZE, 0);
        assert!(b.addr() >= a.addr() + 2 * PAGE_SIZE);
        assert_ne!(a.rkey(), b.rkey());
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_local_read_write() {
        let table = RegionTable::new();
        let mr = table.register(16, AccessFlags::remote_rw());

        assert!(mr.write_at(4, b"abcd"));
        assert_eq!(mr.read(4, 4).unwrap(), b"abcd".to_vec());
        assert!(!mr.write_at(14, b"abcd"));
        assert!(mr.read(10, 10).is_none());

        mr.zero();
        assert_eq!(mr.read(0, 16).unwrap(), vec![0u8; 16]);
    }

    #[test]
    fn test_remote_access_checks() {
        let table = RegionTable::new();
        let mr = table.register(32, AccessFlags::remote_rw());

        assert_eq!(
            table.write_remote(mr.addr() + 8, mr.rkey(), b"xy"),
            WcStatus::Success
        );
        assert_eq!(
            table.read_remote(mr.addr() + 8, mr.rkey(), 2).unwrap(),
            b"xy".to_vec()
        );

        // Past the end
        assert_eq!(
            table.write_remote(mr.addr() + 31, mr.rkey(), b"xy"),
            WcStatus::RemoteAccessError
        );
        // Below the base
        assert_eq!(
            table.read_remote(mr.addr() - 1, mr.rkey(), 1),
            Err(WcStatus::RemoteAccessError)
        );
        // Unknown key
        assert_eq!(
            table.write_remote(mr.addr(), mr.rkey() + 99, b"x"),
            WcStatus::RemoteAccessError
        );
    }

    #[test]
    fn test_local_only_region_refuses_remote_access() {
        let table = RegionTable::new();
        let mr = table.register(8, AccessFlags::local_only());
        assert_eq!(
            table.write_remote(mr.addr(), mr.rkey(), b"x"),
            WcStatus::RemoteAccessError
        );
    }

    proptest::proptest! {
        #[test]
        fn prop_remote_write_bounds(offset in 0u64..256, len in 1usize..128) {
            let table = RegionTable::new();
            let mr = table.register(200, AccessFlags::remote_rw());
            let status = table.write_remote(mr.addr() + offset, mr.rkey(), &vec![7u8; len]);
            let fits = offset as usize + len <= 200;
            proptest::prop_assert_eq!(status == WcStatus::Success, fits);
        }
    }

    #[test]
    fn test_deregister_revokes_remote_access() {
        let table = RegionTable::new();
        let mr = table.register(8, AccessFlags::remote_rw());

        assert!(table.deregister(mr.rkey()));
        assert!(!table.deregister(mr.rkey()));
        assert_eq!(table.len(), 0);
        assert_eq!(
            table.read_remote(mr.addr(), mr.rkey(), 1),
            Err(WcStatus::RemoteAccessError)
        );
    }
}

//! Soft fabric: a software provider of reliable-connected remote memory
//! access.
//!
//! Remote reads and writes are applied by the *target's* fabric service
//! thread against its registered regions; application code on the target
//! never sees them. Two link modes are available:
//!
//! - [`SoftFabric::in_memory`]: every endpoint lives in this process and
//!   shares one protection domain. Ports are a process-local namespace.
//! - [`SoftFabric::tcp`]: frames travel over TCP, one stream per connection.

mod cm;
mod link;
mod qp;
pub mod wire;

pub use cm::SoftCmId;

use crate::event::EventChannel;
use crate::region::RegionTable;
use crate::transport::TransportResult;
use crate::verbs::{CmId, Fabric, Qpn};
use cm::PortSlot;
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, AtomicU32, AtomicU64, Ordering};

/// First port handed out when binding to port 0 in memory mode
const EPHEMERAL_PORT_START: u16 = 49152;

/// How frames travel between endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkMode {
    /// In-process channels
    InMemory,
    /// TCP streams
    Tcp,
}

pub(crate) struct FabricShared {
    mode: LinkMode,
    regions: Arc<RegionTable>,
    ports: DashMap<u16, PortSlot>,
    next_qpn: AtomicU32,
    next_serial: AtomicU64,
    next_ephemeral: AtomicU16,
}

impl FabricShared {
    fn new(mode: LinkMode) -> Self {
        Self {
            mode,
            regions: Arc::new(RegionTable::new()),
            ports: DashMap::new(),
            next_qpn: AtomicU32::new(0x100),
            next_serial: AtomicU64::new(1),
            next_ephemeral: AtomicU16::new(EPHEMERAL_PORT_START),
        }
    }

    fn allocate_qpn(&self) -> Qpn {
        self.next_qpn.fetch_add(1, Ordering::Relaxed)
    }

    fn allocate_serial(&self) -> u64 {
        self.next_serial.fetch_add(1, Ordering::Relaxed)
    }
}

/// Software provider of the capability traits.
///
/// Clones share the same protection domain and port namespace.
#[derive(Clone)]
pub struct SoftFabric {
    shared: Arc<FabricShared>,
}

impl SoftFabric {
    /// Fabric whose endpoints all live in this process
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            shared: Arc::new(FabricShared::new(LinkMode::InMemory)),
        }
    }

    /// Fabric that connects endpoints over TCP
    #[must_use]
    pub fn tcp() -> Self {
        Self {
            shared: Arc::new(FabricShared::new(LinkMode::Tcp)),
        }
    }

    /// Link mode of this fabric
    #[must_use]
    pub fn mode(&self) -> LinkMode {
        self.shared.mode
    }

    /// Number of live memory registrations
    #[must_use]
    pub fn registered_regions(&self) -> usize {
        self.shared.regions.len()
    }
}

impl std::fmt::Debug for SoftFabric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoftFabric")
            .field("mode", &self.shared.mode)
            .field("regions", &self.shared.regions.len())
            .field("ports", &self.shared.ports.len())
            .finish()
    }
}

impl Fabric for SoftFabric {
    fn create_event_channel(&self) -> TransportResult<EventChannel> {
        Ok(EventChannel::new())
    }

    fn create_id(&self, channel: &EventChannel) -> TransportResult<Arc<dyn CmId>> {
        Ok(Arc::new(SoftCmId::new(
            Arc::clone(&self.shared),
            channel.clone(),
        )))
    }
}

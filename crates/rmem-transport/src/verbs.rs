//! Verbs-level value types and the capability traits the session core consumes.
//!
//! The traits mirror the connection-manager and queue-pair primitives of a
//! reliable-connected RDMA stack. A provider implements [`Fabric`] and
//! [`CmId`]; the core never touches provider internals.

use crate::event::EventChannel;
use crate::region::MemoryRegion;
use crate::transport::{TransportError, TransportResult, TransportStats};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// Remote key (rkey) that authorizes a peer to target a memory region.
pub type RKey = u32;

/// Local key (lkey) of a memory region.
pub type LKey = u32;

/// Queue pair number.
pub type Qpn = u32;

/// Caller-chosen work request identifier, echoed in the completion.
pub type WrId = u64;

/// Immediate data carried by a send and surfaced in the receive completion.
pub type ImmData = u32;

/// Queue pair capacity parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QpCaps {
    /// Maximum outstanding send work requests
    pub max_send_wr: u32,
    /// Maximum outstanding receive work requests
    pub max_recv_wr: u32,
    /// Scatter/gather elements per send work request
    pub max_send_sge: u32,
    /// Scatter/gather elements per receive work request
    pub max_recv_sge: u32,
    /// Largest payload that may be posted inline
    pub max_inline_data: u32,
}

impl Default for QpCaps {
    fn default() -> Self {
        Self {
            max_send_wr: 16,
            max_recv_wr: 16,
            max_send_sge: 1,
            max_recv_sge: 1,
            max_inline_data: 64,
        }
    }
}

/// Parameters of the connect/accept handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnParams {
    /// Transport retries before a send is failed
    pub retry_count: u8,
    /// Receiver-not-ready retries
    pub rnr_retry_count: u8,
    /// Outstanding remote reads this side will serve
    pub responder_resources: u8,
    /// Outstanding remote reads this side may issue
    pub initiator_depth: u8,
}

impl Default for ConnParams {
    fn default() -> Self {
        Self {
            retry_count: 8,
            rnr_retry_count: 8,
            responder_resources: 10,
            initiator_depth: 10,
        }
    }
}

/// Memory region access permissions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AccessFlags(u32);

impl AccessFlags {
    /// Local writes (receives and read responses land here)
    pub const LOCAL_WRITE: u32 = 0b001;
    /// Peers may write into the region
    pub const REMOTE_WRITE: u32 = 0b010;
    /// Peers may read from the region
    pub const REMOTE_READ: u32 = 0b100;

    /// Flags used for session regions: local write, remote read and write
    #[must_use]
    pub fn remote_rw() -> Self {
        Self(Self::LOCAL_WRITE | Self::REMOTE_WRITE | Self::REMOTE_READ)
    }

    /// Local write only
    #[must_use]
    pub fn local_only() -> Self {
        Self(Self::LOCAL_WRITE)
    }

    /// Check whether every bit in `bits` is granted
    #[must_use]
    pub fn allows(&self, bits: u32) -> bool {
        self.0 & bits == bits
    }

    /// Raw flag bits
    #[must_use]
    pub fn bits(&self) -> u32 {
        self.0
    }
}

/// Connection-management event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CmEventKind {
    /// Destination address resolved
    AddrResolved,
    /// Address resolution failed
    AddrError,
    /// Route to the destination resolved
    RouteResolved,
    /// Route resolution failed
    RouteError,
    /// A peer asks to connect (acceptor side)
    ConnectRequest,
    /// Connection could not be completed
    ConnectError,
    /// Destination is unreachable
    Unreachable,
    /// Peer rejected the connection request
    Rejected,
    /// Connection established
    Established,
    /// Connection torn down
    Disconnected,
}

impl CmEventKind {
    /// Event name in verbs CM notation
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AddrResolved => "RDMA_CM_EVENT_ADDR_RESOLVED",
            Self::AddrError => "RDMA_CM_EVENT_ADDR_ERROR",
            Self::RouteResolved => "RDMA_CM_EVENT_ROUTE_RESOLVED",
            Self::RouteError => "RDMA_CM_EVENT_ROUTE_ERROR",
            Self::ConnectRequest => "RDMA_CM_EVENT_CONNECT_REQUEST",
            Self::ConnectError => "RDMA_CM_EVENT_CONNECT_ERROR",
            Self::Unreachable => "RDMA_CM_EVENT_UNREACHABLE",
            Self::Rejected => "RDMA_CM_EVENT_REJECTED",
            Self::Established => "RDMA_CM_EVENT_ESTABLISHED",
            Self::Disconnected => "RDMA_CM_EVENT_DISCONNECTED",
        }
    }
}

impl fmt::Display for CmEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A connection-management event.
#[derive(Clone)]
pub struct CmEvent {
    /// What happened
    pub kind: CmEventKind,
    /// New connection handle (set for connect requests)
    pub id: Option<Arc<dyn CmId>>,
    /// Queue pair number of the remote side, when known
    pub remote_qpn: Option<Qpn>,
}

impl CmEvent {
    /// Event without a handle or remote queue pair
    #[must_use]
    pub fn new(kind: CmEventKind) -> Self {
        Self {
            kind,
            id: None,
            remote_qpn: None,
        }
    }

    /// Attach the remote queue pair number
    #[must_use]
    pub fn with_remote_qpn(mut self, qpn: Qpn) -> Self {
        self.remote_qpn = Some(qpn);
        self
    }

    /// Attach a connection handle
    #[must_use]
    pub fn with_id(mut self, id: Arc<dyn CmId>) -> Self {
        self.id = Some(id);
        self
    }
}

impl fmt::Debug for CmEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CmEvent")
            .field("kind", &self.kind)
            .field("has_id", &self.id.is_some())
            .field("remote_qpn", &self.remote_qpn)
            .finish()
    }
}

/// Work completion opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WcOpcode {
    /// Send finished
    Send,
    /// Receive consumed an inbound send
    Recv,
    /// Remote write finished
    RdmaWrite,
    /// Remote read finished
    RdmaRead,
}

impl fmt::Display for WcOpcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Send => "Send",
            Self::Recv => "Receive",
            Self::RdmaWrite => "Write",
            Self::RdmaRead => "Read",
        };
        f.write_str(name)
    }
}

/// Work completion status, numbered like `ibv_wc_status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WcStatus {
    /// Operation completed successfully
    Success,
    /// Inbound message longer than the posted receive
    LocalLengthError,
    /// Local buffer outside the registered region
    LocalProtectionError,
    /// Work request flushed because the queue pair entered the error state
    WrFlushError,
    /// Remote request was malformed
    RemoteInvalidRequest,
    /// Remote key or address range rejected by the target
    RemoteAccessError,
    /// Transport retries exhausted
    RetryExceeded,
}

impl WcStatus {
    /// Numeric status value
    #[must_use]
    pub fn code(&self) -> i32 {
        match self {
            Self::Success => 0,
            Self::LocalLengthError => 1,
            Self::LocalProtectionError => 4,
            Self::WrFlushError => 5,
            Self::RemoteInvalidRequest => 9,
            Self::RemoteAccessError => 10,
            Self::RetryExceeded => 12,
        }
    }
}

impl fmt::Display for WcStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} ({})", self, self.code())
    }
}

/// A completed work request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkCompletion {
    /// Identifier supplied when the request was posted
    pub wr_id: WrId,
    /// Completion status
    pub status: WcStatus,
    /// Kind of operation that completed
    pub opcode: WcOpcode,
    /// Bytes transferred
    pub byte_len: u32,
    /// Immediate data, present on receives of a send-with-immediate
    pub imm_data: Option<ImmData>,
}

impl WorkCompletion {
    /// Whether the operation succeeded
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == WcStatus::Success
    }
}

/// Data source of an outbound work request.
#[derive(Debug, Clone, Copy)]
pub enum Sge<'a> {
    /// Bytes taken from a registered local region
    Local {
        /// Source region
        mr: &'a MemoryRegion,
        /// Offset into the region
        offset: usize,
        /// Number of bytes
        length: usize,
    },
    /// Bytes copied into the work request itself
    Inline(&'a [u8]),
}

impl Sge<'_> {
    /// Number of bytes carried
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Local { length, .. } => *length,
            Self::Inline(data) => data.len(),
        }
    }

    /// Whether the element carries no bytes
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Gather the carried bytes
    ///
    /// # Errors
    ///
    /// Returns an error if a local element lies outside its region.
    pub fn gather(&self) -> TransportResult<Vec<u8>> {
        match self {
            Self::Local { mr, offset, length } => mr.read(*offset, *length).ok_or_else(|| {
                TransportError::PostSend(format!(
                    "local range {}+{} outside region of {} bytes",
                    offset,
                    length,
                    mr.length()
                ))
            }),
            Self::Inline(data) => Ok(data.to_vec()),
        }
    }
}

/// A connection-management handle together with the queue pair it owns.
///
/// Methods that post work never block; the `poll_*` methods block until the
/// matching completion queue yields an entry.
pub trait CmId: Send + Sync {
    /// Start resolving `dst`; completion is reported as an event
    fn resolve_address(&self, dst: SocketAddr, timeout: Duration) -> TransportResult<()>;

    /// Start resolving the route to the resolved address
    fn resolve_route(&self, timeout: Duration) -> TransportResult<()>;

    /// Create the queue pair for this handle
    fn create_queue_pair(&self, caps: &QpCaps) -> TransportResult<()>;

    /// Destroy the queue pair, if any
    fn destroy_queue_pair(&self);

    /// Send a connection request to the resolved destination
    fn connect(&self, params: &ConnParams) -> TransportResult<()>;

    /// Accept the connection request that produced this handle
    fn accept(&self, params: &ConnParams) -> TransportResult<()>;

    /// Bind to a local port (0 picks an ephemeral port)
    fn bind_to_port(&self, port: u16) -> TransportResult<()>;

    /// Start delivering up to `backlog` connection requests
    fn listen(&self, backlog: u32) -> TransportResult<()>;

    /// Port this handle is bound to
    fn local_port(&self) -> Option<u16>;

    /// Tear down the network connection
    fn disconnect(&self) -> TransportResult<()>;

    /// Release the handle and everything it still owns
    fn destroy(&self) -> TransportResult<()>;

    /// Register a zeroed buffer of `length` bytes
    fn register_memory_region(
        &self,
        length: usize,
        access: AccessFlags,
    ) -> TransportResult<MemoryRegion>;

    /// Revoke a registration
    fn deregister_memory_region(&self, mr: &MemoryRegion) -> TransportResult<()>;

    /// Post a send, optionally with immediate data
    fn post_send(&self, wr_id: WrId, sge: Option<Sge<'_>>, imm: Option<ImmData>)
    -> TransportResult<()>;

    /// Post a receive into `mr[offset..offset + length]`
    fn post_receive(
        &self,
        wr_id: WrId,
        mr: &MemoryRegion,
        offset: usize,
        length: usize,
    ) -> TransportResult<()>;

    /// Post a remote read into `mr[offset..offset + length]`
    fn post_remote_read(
        &self,
        wr_id: WrId,
        mr: &MemoryRegion,
        offset: usize,
        length: usize,
        remote_addr: u64,
        rkey: RKey,
    ) -> TransportResult<()>;

    /// Post a remote write of `sge` to `remote_addr`
    fn post_remote_write(
        &self,
        wr_id: WrId,
        sge: Sge<'_>,
        remote_addr: u64,
        rkey: RKey,
    ) -> TransportResult<()>;

    /// Block until the send queue yields a completion
    fn poll_send_completion(&self) -> TransportResult<WorkCompletion>;

    /// Block until the receive queue yields a completion
    fn poll_receive_completion(&self) -> TransportResult<WorkCompletion>;

    /// Number of the queue pair, once created
    fn qp_num(&self) -> Option<Qpn>;

    /// Operations posted on this handle so far
    fn stats(&self) -> TransportStats;

    /// Event channel this handle reports on
    fn event_channel(&self) -> EventChannel;
}

/// Entry point of a provider.
pub trait Fabric: Send + Sync {
    /// Create a fresh event channel
    fn create_event_channel(&self) -> TransportResult<EventChannel>;

    /// Create a handle reporting on `channel`
    fn create_id(&self, channel: &EventChannel) -> TransportResult<Arc<dyn CmId>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_caps_and_params() {
        let caps = QpCaps::default();
        assert_eq!(caps.max_inline_data, 64);
        assert_eq!(caps.max_send_sge, 1);

        let params = ConnParams::default();
        assert_eq!(params.retry_count, 8);
        assert_eq!(params.rnr_retry_count, 8);
        assert_eq!(params.responder_resources, 10);
        assert_eq!(params.initiator_depth, 10);
    }

    #[test]
    fn test_access_flags() {
        let rw = AccessFlags::remote_rw();
        assert!(rw.allows(AccessFlags::REMOTE_READ));
        assert!(rw.allows(AccessFlags::REMOTE_WRITE | AccessFlags::LOCAL_WRITE));

        let local = AccessFlags::local_only();
        assert!(!local.allows(AccessFlags::REMOTE_READ));
    }

    #[test]
    fn test_event_names() {
        assert_eq!(
            CmEventKind::Established.to_string(),
            "RDMA_CM_EVENT_ESTABLISHED"
        );
        assert_eq!(
            CmEventKind::ConnectRequest.as_str(),
            "RDMA_CM_EVENT_CONNECT_REQUEST"
        );
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(WcStatus::Success.code(), 0);
        assert_eq!(WcStatus::WrFlushError.code(), 5);
        assert_eq!(WcStatus::RemoteAccessError.code(), 10);
        assert!(WcStatus::RemoteAccessError.to_string().contains("10"));
    }

    #[test]
    fn test_inline_sge() {
        let sge = Sge::Inline(b"hello");
        assert_eq!(sge.len(), 5);
        assert_eq!(sge.gather().unwrap(), b"hello".to_vec());
        assert!(Sge::Inline(&[]).is_empty());
    }
}

//! Transport error taxonomy and per-connection statistics.
//!
//! Every capability primitive reports its own error variant so the session
//! layer can tell a setup failure (fatal) from an operation-phase condition.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};

/// Transport layer errors, one variant per failing primitive.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// I/O error from an underlying socket
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Address resolution failed
    #[error("address resolution failed: {0}")]
    AddressResolution(String),

    /// Route resolution failed
    #[error("route resolution failed: {0}")]
    RouteResolution(String),

    /// Queue pair could not be created
    #[error("queue pair creation failed: {0}")]
    QueuePairCreation(String),

    /// Outbound connection request failed
    #[error("connect failed: {0}")]
    Connect(String),

    /// Accepting a connection request failed
    #[error("accept failed: {0}")]
    Accept(String),

    /// Binding to a local port failed
    #[error("failed to bind port: {0}")]
    Bind(String),

    /// Listening for connection requests failed
    #[error("listen failed: {0}")]
    Listen(String),

    /// Memory registration failed
    #[error("memory registration failed: {0}")]
    Registration(String),

    /// Memory deregistration failed
    #[error("memory deregistration failed: {0}")]
    Deregistration(String),

    /// Posting a send work request failed
    #[error("post send failed: {0}")]
    PostSend(String),

    /// Posting a receive work request failed
    #[error("post receive failed: {0}")]
    PostReceive(String),

    /// Posting a remote read failed
    #[error("post remote read failed: {0}")]
    PostRead(String),

    /// Posting a remote write failed
    #[error("post remote write failed: {0}")]
    PostWrite(String),

    /// Polling a completion queue failed
    #[error("completion poll failed: {0}")]
    PollCompletion(String),

    /// Network-level disconnect failed
    #[error("disconnect failed: {0}")]
    Disconnect(String),

    /// Releasing a connection handle failed
    #[error("destroy failed: {0}")]
    Destroy(String),

    /// Event channel failure
    #[error("event channel error: {0}")]
    EventChannel(String),

    /// A bounded wait elapsed
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    /// The connection or queue has been closed
    #[error("transport is closed")]
    Closed,
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Snapshot of the operations a connection has posted and completed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportStats {
    /// Send work requests posted
    pub sends_posted: u64,
    /// Receive work requests posted
    pub recvs_posted: u64,
    /// Remote writes posted
    pub writes_posted: u64,
    /// Remote reads posted
    pub reads_posted: u64,
    /// Bytes carried by sends and writes
    pub bytes_out: u64,
    /// Bytes landed by receives and reads
    pub bytes_in: u64,
    /// Completions that finished with a non-success status
    pub completion_errors: u64,
    /// Memory regions deregistered through this handle
    pub regions_deregistered: u64,
}

impl TransportStats {
    /// Total work requests posted on the send side (sends, writes, reads)
    #[must_use]
    pub fn send_side_posted(&self) -> u64 {
        self.sends_posted + self.writes_posted + self.reads_posted
    }

    /// Total work requests posted on both queues
    #[must_use]
    pub fn posted_operations(&self) -> u64 {
        self.send_side_posted() + self.recvs_posted
    }
}

/// Live counters behind [`TransportStats`].
#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    sends_posted: AtomicU64,
    recvs_posted: AtomicU64,
    writes_posted: AtomicU64,
    reads_posted: AtomicU64,
    bytes_out: AtomicU64,
    bytes_in: AtomicU64,
    completion_errors: AtomicU64,
    regions_deregistered: AtomicU64,
}

impl StatsCounters {
    pub(crate) fn record_send(&self, bytes: usize) {
        self.sends_posted.fetch_add(1, Ordering::Relaxed);
        self.bytes_out.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_recv_posted(&self) {
        self.recvs_posted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_write(&self, bytes: usize) {
        self.writes_posted.fetch_add(1, Ordering::Relaxed);
        self.bytes_out.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_read(&self) {
        self.reads_posted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_bytes_in(&self, bytes: usize) {
        self.bytes_in.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_completion_error(&self) {
        self.completion_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_deregistration(&self) {
        self.regions_deregistered.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> TransportStats {
        TransportStats {
            sends_posted: self.sends_posted.load(Ordering::Relaxed),
            recvs_posted: self.recvs_posted.load(Ordering::Relaxed),
            writes_posted: self.writes_posted.load(Ordering::Relaxed),
            reads_posted: self.reads_posted.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            completion_errors: self.completion_errors.load(Ordering::Relaxed),
            regions_deregistered: self.regions_deregistered.load(Ordering::Relaxed),
        }
    }
}

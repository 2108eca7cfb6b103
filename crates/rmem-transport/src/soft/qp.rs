//! Soft queue pair: send and receive queues, completion queues and the
//! service thread that plays the target side of one-sided operations.

use super::link::Link;
use super::wire::Frame;
use crate::event::EventChannel;
use crate::region::{MemoryRegion, RegionTable};
use crate::transport::{StatsCounters, TransportError, TransportResult};
use crate::verbs::{
    CmEvent, CmEventKind, ImmData, QpCaps, Qpn, RKey, Sge, WcOpcode, WcStatus, WorkCompletion,
    WrId,
};
use crossbeam_channel::{Receiver, Sender, unbounded};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::thread::{self, JoinHandle};
use tracing::{debug, trace, warn};

struct PostedRecv {
    wr_id: WrId,
    mr: MemoryRegion,
    offset: usize,
    length: usize,
}

struct InboundSend {
    imm: Option<ImmData>,
    data: Vec<u8>,
}

#[derive(Default)]
struct RecvQueue {
    posted: VecDeque<PostedRecv>,
    // Sends that arrived before a receive was posted
    unmatched: VecDeque<InboundSend>,
}

enum PendingKind {
    Write {
        length: usize,
    },
    Read {
        mr: MemoryRegion,
        offset: usize,
        length: usize,
    },
}

struct PendingOp {
    wr_id: WrId,
    kind: PendingKind,
}

pub(crate) struct QueuePair {
    qpn: Qpn,
    caps: QpCaps,
    regions: Arc<RegionTable>,
    events: EventChannel,
    stats: Arc<StatsCounters>,
    link: OnceLock<Arc<dyn Link>>,
    send_cq: (Sender<WorkCompletion>, Receiver<WorkCompletion>),
    recv_cq: (Sender<WorkCompletion>, Receiver<WorkCompletion>),
    recv_queue: Mutex<RecvQueue>,
    pending: Mutex<HashMap<u64, PendingOp>>,
    next_tag: AtomicU64,
    established: AtomicBool,
    errored: AtomicBool,
    service: Mutex<Option<JoinHandle<()>>>,
}

impl QueuePair {
    pub(crate) fn new(
        qpn: Qpn,
        caps: QpCaps,
        regions: Arc<RegionTable>,
        events: EventChannel,
        stats: Arc<StatsCounters>,
    ) -> Self {
        Self {
            qpn,
            caps,
            regions,
            events,
            stats,
            link: OnceLock::new(),
            send_cq: unbounded(),
            recv_cq: unbounded(),
            recv_queue: Mutex::new(RecvQueue::default()),
            pending: Mutex::new(HashMap::new()),
            next_tag: AtomicU64::new(1),
            established: AtomicBool::new(false),
            errored: AtomicBool::new(false),
            service: Mutex::new(None),
        }
    }

    pub(crate) fn qpn(&self) -> Qpn {
        self.qpn
    }

    /// Bind the queue pair to a link and start serving inbound frames
    pub(crate) fn attach(self: &Arc<Self>, link: Arc<dyn Link>) -> TransportResult<()> {
        if self.link.set(Arc::clone(&link)).is_err() {
            return Err(TransportError::Connect(format!(
                "queue pair {} is already connected",
                self.qpn
            )));
        }

        let qp = Arc::clone(self);
        let handle = thread::Builder::new()
            .name(format!("rmem-qp-{}", self.qpn))
            .spawn(move || qp.service_loop(link))?;
        *self.service.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        Ok(())
    }

    /// Report the connection as established (acceptor side)
    pub(crate) fn mark_established(&self, remote_qpn: Qpn) {
        self.established.store(true, Ordering::Release);
        self.events
            .notify(CmEvent::new(CmEventKind::Established).with_remote_qpn(remote_qpn));
    }

    fn link(&self) -> TransportResult<&Arc<dyn Link>> {
        if self.errored.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        self.link.get().ok_or(TransportError::Closed)
    }

    fn check_inline(&self, sge: &Sge<'_>) -> Result<(), String> {
        if let Sge::Inline(data) = sge {
            if data.len() > self.caps.max_inline_data as usize {
                return Err(format!(
                    "inline payload of {} bytes exceeds ceiling of {}",
                    data.len(),
                    self.caps.max_inline_data
                ));
            }
        }
        Ok(())
    }

    fn complete_send(&self, completion: WorkCompletion) {
        if !completion.is_success() {
            self.stats.record_completion_error();
        }
        let _ = self.send_cq.0.send(completion);
    }

    fn complete_recv(&self, completion: WorkCompletion) {
        if !completion.is_success() {
            self.stats.record_completion_error();
        }
        let _ = self.recv_cq.0.send(completion);
    }

    pub(crate) fn post_send(
        &self,
        wr_id: WrId,
        sge: Option<Sge<'_>>,
        imm: Option<ImmData>,
    ) -> TransportResult<()> {
        let link = self.link()?;
        let data = match sge {
            Some(sge) => {
                self.check_inline(&sge).map_err(TransportError::PostSend)?;
                sge.gather()?
            }
            None => Vec::new(),
        };
        let byte_len = data.len();

        link.send(Frame::Send { imm, data })
            .map_err(|e| TransportError::PostSend(e.to_string()))?;
        self.stats.record_send(byte_len);
        trace!(qpn = self.qpn, wr_id, byte_len, ?imm, "send posted");

        self.complete_send(WorkCompletion {
            wr_id,
            status: WcStatus::Success,
            opcode: WcOpcode::Send,
            byte_len: byte_len as u32,
            imm_data: None,
        });
        Ok(())
    }

    pub(crate) fn post_receive(
        &self,
        wr_id: WrId,
        mr: &MemoryRegion,
        offset: usize,
        length: usize,
    ) -> TransportResult<()> {
        if offset.checked_add(length).is_none_or(|end| end > mr.length()) {
            return Err(TransportError::PostReceive(format!(
                "range {}+{} outside region of {} bytes",
                offset,
                length,
                mr.length()
            )));
        }

        let posted = PostedRecv {
            wr_id,
            mr: mr.clone(),
            offset,
            length,
        };

        let mut queue = self.recv_queue.lock().unwrap_or_else(PoisonError::into_inner);
        if self.errored.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        self.stats.record_recv_posted();
        match queue.unmatched.pop_front() {
            Some(inbound) => {
                drop(queue);
                self.deliver(posted, inbound);
            }
            None => queue.posted.push_back(posted),
        }
        Ok(())
    }

    pub(crate) fn post_remote_write(
        &self,
        wr_id: WrId,
        sge: Sge<'_>,
        remote_addr: u64,
        rkey: RKey,
    ) -> TransportResult<()> {
        let link = self.link()?;
        self.check_inline(&sge).map_err(TransportError::PostWrite)?;
        let data = sge
            .gather()
            .map_err(|e| TransportError::PostWrite(e.to_string()))?;
        let length = data.len();

        let tag = self.register_pending(wr_id, PendingKind::Write { length })?;
        if let Err(e) = link.send(Frame::Write {
            tag,
            addr: remote_addr,
            rkey,
            data,
        }) {
            self.take_pending(tag);
            return Err(TransportError::PostWrite(e.to_string()));
        }
        self.stats.record_write(length);
        trace!(qpn = self.qpn, wr_id, length, "remote write posted");
        Ok(())
    }

    pub(crate) fn post_remote_read(
        &self,
        wr_id: WrId,
        mr: &MemoryRegion,
        offset: usize,
        length: usize,
        remote_addr: u64,
        rkey: RKey,
    ) -> TransportResult<()> {
        let link = self.link()?;
        if offset.checked_add(length).is_none_or(|end| end > mr.length()) {
            return Err(TransportError::PostRead(format!(
                "local range {}+{} outside region of {} bytes",
                offset,
                length,
                mr.length()
            )));
        }
        let wire_len = u32::try_from(length)
            .map_err(|_| TransportError::PostRead(format!("length {length} too large")))?;

        let tag = self.register_pending(
            wr_id,
            PendingKind::Read {
                mr: mr.clone(),
                offset,
                length,
            },
        )?;
        if let Err(e) = link.send(Frame::ReadRequest {
            tag,
            addr: remote_addr,
            rkey,
            length: wire_len,
        }) {
            self.take_pending(tag);
            return Err(TransportError::PostRead(e.to_string()));
        }
        self.stats.record_read();
        trace!(qpn = self.qpn, wr_id, length, "remote read posted");
        Ok(())
    }

    fn register_pending(&self, wr_id: WrId, kind: PendingKind) -> TransportResult<u64> {
        let tag = self.next_tag.fetch_add(1, Ordering::Relaxed);
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        if self.errored.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        pending.insert(tag, PendingOp { wr_id, kind });
        Ok(tag)
    }

    fn take_pending(&self, tag: u64) -> Option<PendingOp> {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&tag)
    }

    pub(crate) fn poll_send(&self) -> TransportResult<WorkCompletion> {
        self.send_cq.1.recv().map_err(|_| TransportError::Closed)
    }

    pub(crate) fn poll_recv(&self) -> TransportResult<WorkCompletion> {
        self.recv_cq.1.recv().map_err(|_| TransportError::Closed)
    }

    /// Send a disconnect to the peer (if still connected) and flush
    pub(crate) fn disconnect(&self) {
        if let Some(link) = self.link.get() {
            if !self.errored.load(Ordering::Acquire) {
                let _ = link.send(Frame::Disconnect);
            }
            link.close();
        }
        self.enter_error();
    }

    /// Close the link and wait for the service thread
    pub(crate) fn destroy(&self) {
        if let Some(link) = self.link.get() {
            link.close();
        }
        self.enter_error();

        let handle = self
            .service
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                warn!(qpn = self.qpn, "queue pair service thread panicked");
            }
        }
    }

    /// Move to the error state: flush both queues, report one disconnect
    fn enter_error(&self) {
        if self.errored.swap(true, Ordering::AcqRel) {
            return;
        }

        let flushed_recvs: Vec<PostedRecv> = {
            let mut queue = self.recv_queue.lock().unwrap_or_else(PoisonError::into_inner);
            queue.unmatched.clear();
            queue.posted.drain(..).collect()
        };
        for recv in &flushed_recvs {
            self.complete_recv(WorkCompletion {
                wr_id: recv.wr_id,
                status: WcStatus::WrFlushError,
                opcode: WcOpcode::Recv,
                byte_len: 0,
                imm_data: None,
            });
        }

        let flushed_ops: Vec<PendingOp> = {
            let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            pending.drain().map(|(_, op)| op).collect()
        };
        for op in &flushed_ops {
            let opcode = match op.kind {
                PendingKind::Write { .. } => WcOpcode::RdmaWrite,
                PendingKind::Read { .. } => WcOpcode::RdmaRead,
            };
            self.complete_send(WorkCompletion {
                wr_id: op.wr_id,
                status: WcStatus::WrFlushError,
                opcode,
                byte_len: 0,
                imm_data: None,
            });
        }

        debug!(
            qpn = self.qpn,
            receives = flushed_recvs.len(),
            operations = flushed_ops.len(),
            "queue pair entered error state"
        );

        if self.established.load(Ordering::Acquire) {
            self.events.notify(CmEvent::new(CmEventKind::Disconnected));
        }
    }

    fn deliver(&self, recv: PostedRecv, inbound: InboundSend) {
        let completion = if inbound.data.len() > recv.length {
            warn!(
                qpn = self.qpn,
                received = inbound.data.len(),
                posted = recv.length,
                "inbound send longer than posted receive"
            );
            WorkCompletion {
                wr_id: recv.wr_id,
                status: WcStatus::LocalLengthError,
                opcode: WcOpcode::Recv,
                byte_len: 0,
                imm_data: inbound.imm,
            }
        } else if !recv.mr.write_at(recv.offset, &inbound.data) {
            WorkCompletion {
                wr_id: recv.wr_id,
                status: WcStatus::LocalProtectionError,
                opcode: WcOpcode::Recv,
                byte_len: 0,
                imm_data: inbound.imm,
            }
        } else {
            self.stats.record_bytes_in(inbound.data.len());
            WorkCompletion {
                wr_id: recv.wr_id,
                status: WcStatus::Success,
                opcode: WcOpcode::Recv,
                byte_len: inbound.data.len() as u32,
                imm_data: inbound.imm,
            }
        };
        self.complete_recv(completion);
    }

    fn on_inbound_send(&self, inbound: InboundSend) {
        let mut queue = self.recv_queue.lock().unwrap_or_else(PoisonError::into_inner);
        match queue.posted.pop_front() {
            Some(recv) => {
                drop(queue);
                self.deliver(recv, inbound);
            }
            None => queue.unmatched.push_back(inbound),
        }
    }

    fn on_ack(&self, tag: u64, status: WcStatus, data: Option<Vec<u8>>) {
        let Some(op) = self.take_pending(tag) else {
            warn!(qpn = self.qpn, tag, "completion for unknown operation");
            return;
        };

        let completion = match op.kind {
            PendingKind::Write { length } => WorkCompletion {
                wr_id: op.wr_id,
                status,
                opcode: WcOpcode::RdmaWrite,
                byte_len: if status == WcStatus::Success {
                    length as u32
                } else {
                    0
                },
                imm_data: None,
            },
            PendingKind::Read { mr, offset, length } => {
                let bytes = data.unwrap_or_default();
                let status = if status != WcStatus::Success {
                    status
                } else if bytes.len() != length || !mr.write_at(offset, &bytes) {
                    WcStatus::LocalProtectionError
                } else {
                    self.stats.record_bytes_in(length);
                    WcStatus::Success
                };
                WorkCompletion {
                    wr_id: op.wr_id,
                    status,
                    opcode: WcOpcode::RdmaRead,
                    byte_len: if status == WcStatus::Success {
                        length as u32
                    } else {
                        0
                    },
                    imm_data: None,
                }
            }
        };
        self.complete_send(completion);
    }

    fn service_loop(&self, link: Arc<dyn Link>) {
        debug!(qpn = self.qpn, "queue pair service started");
        loop {
            let frame = match link.recv() {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) => {
                    debug!(qpn = self.qpn, "link failed: {}", e);
                    break;
                }
            };

            match frame {
                Frame::Accept { qpn } => {
                    self.established.store(true, Ordering::Release);
                    self.events
                        .notify(CmEvent::new(CmEventKind::Established).with_remote_qpn(qpn));
                }
                Frame::Reject => {
                    self.events.notify(CmEvent::new(CmEventKind::Rejected));
                    break;
                }
                Frame::Send { imm, data } => self.on_inbound_send(InboundSend { imm, data }),
                Frame::Write {
                    tag,
                    addr,
                    rkey,
                    data,
                } => {
                    let status = self.regions.write_remote(addr, rkey, &data);
                    if status != WcStatus::Success {
                        debug!(qpn = self.qpn, addr, rkey, "refused remote write");
                    }
                    let _ = link.send(Frame::WriteAck { tag, status });
                }
                Frame::ReadRequest {
                    tag,
                    addr,
                    rkey,
                    length,
                } => {
                    let reply = match self.regions.read_remote(addr, rkey, length as usize) {
                        Ok(data) => Frame::ReadResponse {
                            tag,
                            status: WcStatus::Success,
                            data,
                        },
                        Err(status) => {
                            debug!(qpn = self.qpn, addr, rkey, "refused remote read");
                            Frame::ReadResponse {
                                tag,
                                status,
                                data: Vec::new(),
                            }
                        }
                    };
                    let _ = link.send(reply);
                }
                Frame::WriteAck { tag, status } => self.on_ack(tag, status, None),
                Frame::ReadResponse { tag, status, data } => self.on_ack(tag, status, Some(data)),
                Frame::Disconnect => break,
                other @ Frame::Connect { .. } => {
                    warn!(qpn = self.qpn, "unexpected {} frame ignored", other.name());
                }
            }
        }
        self.enter_error();
        debug!(qpn = self.qpn, "queue pair service stopped");
    }
}

//! Connection-management handles of the soft fabric.

use super::link::{Link, MemoryLink, TcpLink};
use super::qp::QueuePair;
use super::wire::{self, Frame};
use super::{FabricShared, LinkMode};
use crate::event::EventChannel;
use crate::region::MemoryRegion;
use crate::transport::{StatsCounters, TransportError, TransportResult, TransportStats};
use crate::verbs::{
    AccessFlags, CmEvent, CmEventKind, CmId, ConnParams, ImmData, QpCaps, Qpn, RKey, Sge,
    WorkCompletion, WrId,
};
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::VecDeque;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

const TCP_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const TCP_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(20);
const KERNEL_BACKLOG: i32 = 128;

/// A connection request waiting to be accepted.
pub(crate) struct ConnectOffer {
    link: Arc<dyn Link>,
    initiator_qpn: Qpn,
}

struct ListenerSlot {
    owner: u64,
    channel: EventChannel,
    remaining: u32,
}

/// State of one port in the fabric's namespace.
///
/// Slots outlive the handles bound to them so requests arriving between two
/// listeners are kept, and a TCP socket can be reused across rebinds.
#[derive(Default)]
pub(crate) struct PortSlot {
    bound_by: Option<u64>,
    listener: Option<ListenerSlot>,
    pending: VecDeque<ConnectOffer>,
    tcp: Option<Arc<TcpListener>>,
}

struct TcpAcceptor {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct IdState {
    destination: Option<SocketAddr>,
    route_resolved: bool,
    qp: Option<Arc<QueuePair>>,
    bound_port: Option<u16>,
    acceptor: Option<TcpAcceptor>,
    request: Option<ConnectOffer>,
    remote_qpn: Option<Qpn>,
    destroyed: bool,
}

/// Soft fabric implementation of [`CmId`].
pub struct SoftCmId {
    serial: u64,
    shared: Arc<FabricShared>,
    channel: EventChannel,
    stats: Arc<StatsCounters>,
    state: Mutex<IdState>,
}

impl SoftCmId {
    pub(crate) fn new(shared: Arc<FabricShared>, channel: EventChannel) -> Self {
        Self {
            serial: shared.allocate_serial(),
            shared,
            channel,
            stats: Arc::new(StatsCounters::default()),
            state: Mutex::new(IdState::default()),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, IdState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn qp(&self) -> Option<Arc<QueuePair>> {
        self.state().qp.clone()
    }

    /// Queue pair number of the connected peer
    #[must_use]
    pub fn remote_qpn(&self) -> Option<Qpn> {
        self.state().remote_qpn
    }

    fn bind_memory(&self, port: u16) -> TransportResult<u16> {
        if port != 0 {
            let mut slot = self.shared.ports.entry(port).or_default();
            if slot.bound_by.is_some() {
                return Err(TransportError::Bind(format!("port {port} is in use")));
            }
            slot.bound_by = Some(self.serial);
            return Ok(port);
        }

        for _ in 0..=u16::MAX {
            let candidate = self.shared.next_ephemeral.fetch_add(1, Ordering::Relaxed);
            if candidate < super::EPHEMERAL_PORT_START {
                continue;
            }
            let mut slot = self.shared.ports.entry(candidate).or_default();
            if slot.bound_by.is_none() && slot.listener.is_none() {
                slot.bound_by = Some(self.serial);
                return Ok(candidate);
            }
        }
        Err(TransportError::Bind("no ephemeral port available".to_string()))
    }

    fn bind_tcp(&self, port: u16) -> TransportResult<u16> {
        if port != 0 {
            if let Some(mut slot) = self.shared.ports.get_mut(&port) {
                if slot.bound_by.is_some() {
                    return Err(TransportError::Bind(format!("port {port} is in use")));
                }
                if slot.tcp.is_some() {
                    slot.bound_by = Some(self.serial);
                    return Ok(port);
                }
            }
        }

        let listener = open_tcp_listener(port)?;
        let actual = listener.local_addr()?.port();
        let mut slot = self.shared.ports.entry(actual).or_default();
        if slot.bound_by.is_some() {
            return Err(TransportError::Bind(format!("port {actual} is in use")));
        }
        slot.tcp = Some(Arc::new(listener));
        slot.bound_by = Some(self.serial);
        Ok(actual)
    }

    fn connect_memory(
        &self,
        qp: &Arc<QueuePair>,
        destination: SocketAddr,
    ) -> TransportResult<()> {
        let port = destination.port();
        let Some(mut slot) = self.shared.ports.get_mut(&port) else {
            debug!("no endpoint at port {}, rejecting", port);
            self.channel.notify(CmEvent::new(CmEventKind::Rejected));
            return Ok(());
        };

        let (local, remote) = MemoryLink::pair();
        qp.attach(Arc::new(local))?;
        let offer = ConnectOffer {
            link: Arc::new(remote),
            initiator_qpn: qp.qpn(),
        };

        match slot.listener.as_mut() {
            Some(listener) if listener.remaining > 0 => {
                listener.remaining -= 1;
                deliver_offer(&self.shared, &listener.channel, offer);
            }
            _ => {
                debug!("port {} has no free listener, request queued", port);
                slot.pending.push_back(offer);
            }
        }
        Ok(())
    }

    fn connect_tcp(&self, qp: &Arc<QueuePair>, destination: SocketAddr) -> TransportResult<()> {
        let stream = match TcpStream::connect_timeout(&destination, TCP_CONNECT_TIMEOUT) {
            Ok(stream) => stream,
            Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
                debug!("connection to {} refused", destination);
                self.channel.notify(CmEvent::new(CmEventKind::Rejected));
                return Ok(());
            }
            Err(e) => {
                warn!("{} unreachable: {}", destination, e);
                self.channel.notify(CmEvent::new(CmEventKind::Unreachable));
                return Ok(());
            }
        };

        let mut writer = &stream;
        wire::write_frame(&mut writer, &Frame::Connect { qpn: qp.qpn() })
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        qp.attach(Arc::new(TcpLink::new(stream)?))
    }

    fn release(&self) -> TransportResult<()> {
        let (qp, acceptor, port, request) = {
            let mut state = self.state();
            if state.destroyed {
                return Err(TransportError::Destroy("handle already destroyed".to_string()));
            }
            state.destroyed = true;
            (
                state.qp.take(),
                state.acceptor.take(),
                state.bound_port.take(),
                state.request.take(),
            )
        };

        if let Some(acceptor) = acceptor {
            acceptor.stop.store(true, Ordering::Release);
            if acceptor.handle.join().is_err() {
                warn!("tcp accept thread panicked");
            }
        }

        if let Some(port) = port {
            if let Some(mut slot) = self.shared.ports.get_mut(&port) {
                if slot.bound_by == Some(self.serial) {
                    slot.bound_by = None;
                }
                if slot.listener.as_ref().is_some_and(|l| l.owner == self.serial) {
                    slot.listener = None;
                }
            }
        }

        // An unaccepted request is refused when its handle goes away
        if let Some(request) = request {
            let _ = request.link.send(Frame::Reject);
            request.link.close();
        }

        if let Some(qp) = qp {
            qp.destroy();
        }
        Ok(())
    }
}

impl Drop for SoftCmId {
    fn drop(&mut self) {
        // Nothing to report if destroy already ran
        let _ = self.release();
    }
}

fn open_tcp_listener(port: u16) -> TransportResult<TcpListener> {
    let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port));
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))
        .map_err(|e| TransportError::Bind(e.to_string()))?;
    socket
        .set_reuse_address(true)
        .map_err(|e| TransportError::Bind(e.to_string()))?;
    socket
        .bind(&addr.into())
        .map_err(|e| TransportError::Bind(format!("{addr}: {e}")))?;
    socket
        .listen(KERNEL_BACKLOG)
        .map_err(|e| TransportError::Listen(e.to_string()))?;
    Ok(socket.into())
}

/// Hand a connection request to a listener as a new child handle
fn deliver_offer(shared: &Arc<FabricShared>, channel: &EventChannel, offer: ConnectOffer) {
    let initiator_qpn = offer.initiator_qpn;
    let child = SoftCmId::new(Arc::clone(shared), channel.clone());
    child.state().request = Some(offer);

    channel.notify(
        CmEvent::new(CmEventKind::ConnectRequest)
            .with_id(Arc::new(child))
            .with_remote_qpn(initiator_qpn),
    );
}

fn read_connect_frame(stream: TcpStream) -> TransportResult<ConnectOffer> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(TCP_HANDSHAKE_TIMEOUT))?;
    let mut reader = &stream;
    let qpn = match wire::read_frame(&mut reader)? {
        Some(Frame::Connect { qpn }) => qpn,
        Some(other) => {
            return Err(TransportError::Accept(format!(
                "expected connect frame, got {}",
                other.name()
            )));
        }
        None => return Err(TransportError::Closed),
    };
    stream.set_read_timeout(None)?;

    Ok(ConnectOffer {
        link: Arc::new(TcpLink::new(stream)?),
        initiator_qpn: qpn,
    })
}

fn run_tcp_acceptor(
    listener: Arc<TcpListener>,
    shared: Arc<FabricShared>,
    channel: EventChannel,
    stop: Arc<AtomicBool>,
    backlog: u32,
) {
    if let Err(e) = listener.set_nonblocking(true) {
        warn!("cannot poll listening socket: {}", e);
        return;
    }

    let mut remaining = backlog;
    while remaining > 0 && !stop.load(Ordering::Acquire) {
        match listener.accept() {
            Ok((stream, peer)) => match read_connect_frame(stream) {
                Ok(offer) => {
                    debug!("connection request from {}", peer);
                    deliver_offer(&shared, &channel, offer);
                    remaining -= 1;
                }
                Err(e) => warn!("dropping connection from {}: {}", peer, e),
            },
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL_INTERVAL),
            Err(e) => {
                warn!("accept failed: {}", e);
                thread::sleep(ACCEPT_POLL_INTERVAL);
            }
        }
    }
}

impl CmId for SoftCmId {
    fn resolve_address(&self, dst: SocketAddr, timeout: Duration) -> TransportResult<()> {
        debug!("resolving {} (timeout {:?})", dst, timeout);
        self.state().destination = Some(dst);
        self.channel.notify(CmEvent::new(CmEventKind::AddrResolved));
        Ok(())
    }

    fn resolve_route(&self, timeout: Duration) -> TransportResult<()> {
        let mut state = self.state();
        let Some(dst) = state.destination else {
            return Err(TransportError::RouteResolution(
                "address not resolved".to_string(),
            ));
        };
        debug!("resolving route to {} (timeout {:?})", dst, timeout);
        state.route_resolved = true;
        self.channel.notify(CmEvent::new(CmEventKind::RouteResolved));
        Ok(())
    }

    fn create_queue_pair(&self, caps: &QpCaps) -> TransportResult<()> {
        let mut state = self.state();
        if state.destroyed {
            return Err(TransportError::QueuePairCreation(
                "handle destroyed".to_string(),
            ));
        }
        if state.qp.is_some() {
            return Err(TransportError::QueuePairCreation(
                "queue pair already exists for this connection".to_string(),
            ));
        }

        let qp = QueuePair::new(
            self.shared.allocate_qpn(),
            *caps,
            Arc::clone(&self.shared.regions),
            self.channel.clone(),
            Arc::clone(&self.stats),
        );
        debug!("created queue pair {} ({:?})", qp.qpn(), caps);
        state.qp = Some(Arc::new(qp));
        Ok(())
    }

    fn destroy_queue_pair(&self) {
        let qp = self.state().qp.take();
        if let Some(qp) = qp {
            qp.destroy();
        }
    }

    fn connect(&self, params: &ConnParams) -> TransportResult<()> {
        let (qp, destination) = {
            let state = self.state();
            let qp = state
                .qp
                .clone()
                .ok_or_else(|| TransportError::Connect("no queue pair".to_string()))?;
            let destination = state
                .destination
                .filter(|_| state.route_resolved)
                .ok_or_else(|| TransportError::Connect("route not resolved".to_string()))?;
            (qp, destination)
        };

        debug!("connecting to {} with {:?}", destination, params);
        match self.shared.mode {
            LinkMode::InMemory => self.connect_memory(&qp, destination),
            LinkMode::Tcp => self.connect_tcp(&qp, destination),
        }
    }

    fn accept(&self, params: &ConnParams) -> TransportResult<()> {
        let (qp, request) = {
            let mut state = self.state();
            let qp = state
                .qp
                .clone()
                .ok_or_else(|| TransportError::Accept("no queue pair".to_string()))?;
            let request = state.request.take().ok_or_else(|| {
                TransportError::Accept("no pending connection request".to_string())
            })?;
            state.remote_qpn = Some(request.initiator_qpn);
            (qp, request)
        };

        debug!(
            "accepting request from queue pair {} with {:?}",
            request.initiator_qpn, params
        );
        qp.attach(Arc::clone(&request.link))?;
        request
            .link
            .send(Frame::Accept { qpn: qp.qpn() })
            .map_err(|e| TransportError::Accept(e.to_string()))?;
        qp.mark_established(request.initiator_qpn);
        Ok(())
    }

    fn bind_to_port(&self, port: u16) -> TransportResult<()> {
        if self.state().bound_port.is_some() {
            return Err(TransportError::Bind("handle already bound".to_string()));
        }
        let actual = match self.shared.mode {
            LinkMode::InMemory => self.bind_memory(port)?,
            LinkMode::Tcp => self.bind_tcp(port)?,
        };
        self.state().bound_port = Some(actual);
        info!("bound to port {}", actual);
        Ok(())
    }

    fn listen(&self, backlog: u32) -> TransportResult<()> {
        let Some(port) = self.state().bound_port else {
            return Err(TransportError::Listen("handle is not bound".to_string()));
        };

        match self.shared.mode {
            LinkMode::InMemory => {
                let mut slot = self
                    .shared
                    .ports
                    .get_mut(&port)
                    .ok_or_else(|| TransportError::Listen(format!("port {port} not bound")))?;
                let mut remaining = backlog;
                while remaining > 0 {
                    let Some(offer) = slot.pending.pop_front() else {
                        break;
                    };
                    deliver_offer(&self.shared, &self.channel, offer);
                    remaining -= 1;
                }
                slot.listener = Some(ListenerSlot {
                    owner: self.serial,
                    channel: self.channel.clone(),
                    remaining,
                });
            }
            LinkMode::Tcp => {
                let listener = self
                    .shared
                    .ports
                    .get(&port)
                    .and_then(|slot| slot.tcp.clone())
                    .ok_or_else(|| TransportError::Listen(format!("port {port} not bound")))?;
                let stop = Arc::new(AtomicBool::new(false));
                let shared = Arc::clone(&self.shared);
                let channel = self.channel.clone();
                let thread_stop = Arc::clone(&stop);
                let handle = thread::Builder::new()
                    .name(format!("rmem-accept-{port}"))
                    .spawn(move || run_tcp_acceptor(listener, shared, channel, thread_stop, backlog))
                    .map_err(|e| TransportError::Listen(e.to_string()))?;
                self.state().acceptor = Some(TcpAcceptor { stop, handle });
            }
        }

        debug!("listening on port {} (backlog {})", port, backlog);
        Ok(())
    }

    fn local_port(&self) -> Option<u16> {
        self.state().bound_port
    }

    fn disconnect(&self) -> TransportResult<()> {
        let qp = self
            .qp()
            .ok_or_else(|| TransportError::Disconnect("no queue pair".to_string()))?;
        qp.disconnect();
        Ok(())
    }

    fn destroy(&self) -> TransportResult<()> {
        self.release()
    }

    fn register_memory_region(
        &self,
        length: usize,
        access: AccessFlags,
    ) -> TransportResult<MemoryRegion> {
        if length == 0 {
            return Err(TransportError::Registration(
                "zero-length region".to_string(),
            ));
        }
        let mr = self.shared.regions.register(length, access);
        debug!(
            "registered {} bytes at {:#x} (rkey {:#x})",
            length,
            mr.addr(),
            mr.rkey()
        );
        Ok(mr)
    }

    fn deregister_memory_region(&self, mr: &MemoryRegion) -> TransportResult<()> {
        if !self.shared.regions.deregister(mr.rkey()) {
            return Err(TransportError::Deregistration(format!(
                "rkey {:#x} is not registered",
                mr.rkey()
            )));
        }
        self.stats.record_deregistration();
        debug!("deregistered region at {:#x}", mr.addr());
        Ok(())
    }

    fn post_send(
        &self,
        wr_id: WrId,
        sge: Option<Sge<'_>>,
        imm: Option<ImmData>,
    ) -> TransportResult<()> {
        self.qp()
            .ok_or_else(|| TransportError::PostSend("no queue pair".to_string()))?
            .post_send(wr_id, sge, imm)
    }

    fn post_receive(
        &self,
        wr_id: WrId,
        mr: &MemoryRegion,
        offset: usize,
        length: usize,
    ) -> TransportResult<()> {
        self.qp()
            .ok_or_else(|| TransportError::PostReceive("no queue pair".to_string()))?
            .post_receive(wr_id, mr, offset, length)
    }

    fn post_remote_read(
        &self,
        wr_id: WrId,
        mr: &MemoryRegion,
        offset: usize,
        length: usize,
        remote_addr: u64,
        rkey: RKey,
    ) -> TransportResult<()> {
        self.qp()
            .ok_or_else(|| TransportError::PostRead("no queue pair".to_string()))?
            .post_remote_read(wr_id, mr, offset, length, remote_addr, rkey)
    }

    fn post_remote_write(
        &self,
        wr_id: WrId,
        sge: Sge<'_>,
        remote_addr: u64,
        rkey: RKey,
    ) -> TransportResult<()> {
        self.qp()
            .ok_or_else(|| TransportError::PostWrite("no queue pair".to_string()))?
            .post_remote_write(wr_id, sge, remote_addr, rkey)
    }

    fn poll_send_completion(&self) -> TransportResult<WorkCompletion> {
        self.qp()
            .ok_or_else(|| TransportError::PollCompletion("no queue pair".to_string()))?
            .poll_send()
    }

    fn poll_receive_completion(&self) -> TransportResult<WorkCompletion> {
        self.qp()
            .ok_or_else(|| TransportError::PollCompletion("no queue pair".to_string()))?
            .poll_recv()
    }

    fn qp_num(&self) -> Option<Qpn> {
        self.state().qp.as_ref().map(|qp| qp.qpn())
    }

    fn stats(&self) -> TransportStats {
        self.stats.snapshot()
    }

    fn event_channel(&self) -> EventChannel {
        self.channel.clone()
    }
}

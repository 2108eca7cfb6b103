//! Session state machine and connection lifecycle.
//!
//! A [`Session`] is one established connection with its registered regions.
//! Initiators build one with [`Session::connect`]; acceptors wait on an
//! [`Endpoint`] and build one per request with [`Session::accept`].
//!
//! ```text
//! initiator: Init -> AddrResolved -> RouteResolved -> Connecting -> Established
//! acceptor:  Listening -> ConnectRequested -> QpReady -> Established
//! both:      Established -> Disconnecting -> Closed
//! ```

use crate::config::{DIRECTORY_ENTRY_LEN, SessionConfig};
use crate::error::{Result, SessionError};
use crate::exchange::RemoteCredential;
use crossbeam_channel::{Receiver, select};
use rmem_transport::{
    AccessFlags, CmEvent, CmEventKind, CmId, EventChannel, Fabric, MemoryRegion, Qpn,
    TransportError, TransportStats, WcOpcode, WorkCompletion, WrId,
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Which side of the connection a session plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Resolves and connects (client)
    Initiator,
    /// Listens and accepts (server agent)
    Acceptor,
}

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Initiator before address resolution
    Init,
    /// Destination address resolved
    AddrResolved,
    /// Route resolved
    RouteResolved,
    /// Connection request sent
    Connecting,
    /// Acceptor waiting for a request
    Listening,
    /// Acceptor received a request
    ConnectRequested,
    /// Acceptor built the queue pair for the request
    QpReady,
    /// Connection established
    Established,
    /// Teardown in progress
    Disconnecting,
    /// Torn down
    Closed,
}

/// Validated state transitions for one role.
#[derive(Debug, Clone)]
pub struct StateMachine {
    role: Role,
    state: SessionState,
}

impl StateMachine {
    /// Start in `Init` (initiator) or `Listening` (acceptor)
    #[must_use]
    pub fn new(role: Role) -> Self {
        let state = match role {
            Role::Initiator => SessionState::Init,
            Role::Acceptor => SessionState::Listening,
        };
        Self { role, state }
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Role this machine belongs to
    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    /// Check if a state transition is valid
    #[must_use]
    pub fn can_transition(&self, to: SessionState) -> bool {
        use SessionState::*;

        match (self.role, self.state, to) {
            // Initiator setup
            (Role::Initiator, Init, AddrResolved)
            | (Role::Initiator, AddrResolved, RouteResolved)
            | (Role::Initiator, RouteResolved, Connecting)
            | (Role::Initiator, Connecting, Established) => true,

            // Acceptor setup
            (Role::Acceptor, Listening, ConnectRequested)
            | (Role::Acceptor, ConnectRequested, QpReady)
            | (Role::Acceptor, QpReady, Established) => true,

            // Shared teardown
            (_, Established, Disconnecting) | (_, Disconnecting, Closed) => true,

            // Abandoned setup
            (
                _,
                Init | AddrResolved | RouteResolved | Connecting | Listening | ConnectRequested
                | QpReady,
                Closed,
            ) => true,

            _ => false,
        }
    }

    /// Transition to a new state
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::InvalidState`] if the transition is not
    /// allowed from the current state.
    pub fn transition_to(&mut self, new_state: SessionState) -> Result<()> {
        if !self.can_transition(new_state) {
            return Err(SessionError::InvalidState(
                format!(
                    "{:?} cannot move from {:?} to {:?}",
                    self.role, self.state, new_state
                )
                .into(),
            ));
        }

        let old_state = self.state;
        self.state = new_state;

        tracing::debug!(
            "Session state transition: {:?} -> {:?}",
            old_state,
            new_state
        );

        Ok(())
    }
}

/// How a session tears down its connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownMode {
    /// Disconnect, then wait for `DISCONNECTED`
    Active,
    /// Wait for `DISCONNECTED` (the peer disconnected), then disconnect
    Passive,
}

/// Wait for exactly one event of `expected` kind.
///
/// # Errors
///
/// Returns [`SessionError::Timeout`] when `timeout` elapses and
/// [`SessionError::ProtocolViolation`] if another kind arrives.
pub fn expect_event(
    channel: &EventChannel,
    expected: CmEventKind,
    timeout: Option<Duration>,
) -> Result<CmEvent> {
    let event = match timeout {
        Some(timeout) => channel.get_event_timeout(timeout, expected.as_str()),
        None => channel.get_event(),
    }
    .map_err(|e| match e {
        TransportError::Timeout(what) => SessionError::Timeout(what),
        other => SessionError::setup("rdma_get_cm_event", other),
    })?;

    if event.kind != expected {
        return Err(SessionError::ProtocolViolation {
            expected,
            received: event.kind,
        });
    }
    debug!("received {}", event.kind);
    Ok(event)
}

/// One established connection.
///
/// Shared (`Arc`) between the interactive path and the background control
/// listener after setup. Sends are serialized; receives belong to the
/// listener.
pub struct Session {
    role: Role,
    id: Arc<dyn CmId>,
    channel: EventChannel,
    machine: Mutex<StateMachine>,
    config: SessionConfig,
    data_region: MemoryRegion,
    control_region: MemoryRegion,
    remote: OnceLock<RemoteCredential>,
    remote_qpn: Option<Qpn>,
    send_lock: Mutex<()>,
    next_wr_id: AtomicU64,
    torn_down: AtomicBool,
}

impl Session {
    /// Resolve, connect and register the data region (initiator role)
    ///
    /// # Errors
    ///
    /// Any failure here is fatal: a transport primitive failing
    /// ([`SessionError::Setup`]), an unexpected event
    /// ([`SessionError::ProtocolViolation`]) or an elapsed wait
    /// ([`SessionError::Timeout`]).
    pub fn connect(
        fabric: &dyn Fabric,
        destination: SocketAddr,
        config: &SessionConfig,
        region_length: usize,
    ) -> Result<Self> {
        config.validate()?;
        let mut machine = StateMachine::new(Role::Initiator);

        let channel = fabric
            .create_event_channel()
            .map_err(|e| SessionError::setup("rdma_create_event_channel", e))?;
        let id = fabric
            .create_id(&channel)
            .map_err(|e| SessionError::setup("rdma_create_id", e))?;

        id.resolve_address(destination, config.resolve_timeout())
            .map_err(|e| SessionError::setup("rdma_resolve_addr", e))?;
        expect_event(
            &channel,
            CmEventKind::AddrResolved,
            Some(config.resolve_timeout()),
        )?;
        machine.transition_to(SessionState::AddrResolved)?;

        id.create_queue_pair(&config.qp_caps)
            .map_err(|e| SessionError::setup("rdma_create_qp", e))?;

        id.resolve_route(config.resolve_timeout())
            .map_err(|e| SessionError::setup("rdma_resolve_route", e))?;
        expect_event(
            &channel,
            CmEventKind::RouteResolved,
            Some(config.resolve_timeout()),
        )?;
        machine.transition_to(SessionState::RouteResolved)?;

        id.connect(&config.conn_params)
            .map_err(|e| SessionError::setup("rdma_connect", e))?;
        machine.transition_to(SessionState::Connecting)?;
        let established = expect_event(
            &channel,
            CmEventKind::Established,
            Some(config.connect_timeout()),
        )?;
        machine.transition_to(SessionState::Established)?;

        info!("connected to {}", destination);
        Self::establish(
            Role::Initiator,
            id,
            channel,
            machine,
            config,
            region_length,
            established.remote_qpn,
        )
    }

    /// Build the queue pair for a connection request, accept it and register
    /// the data region (acceptor role)
    ///
    /// `channel` is the listening endpoint's channel; the new session keeps
    /// reporting on it.
    ///
    /// # Errors
    ///
    /// Fatal setup errors as for [`Session::connect`].
    pub fn accept(
        request: CmEvent,
        channel: &EventChannel,
        config: &SessionConfig,
        region_length: usize,
    ) -> Result<Self> {
        config.validate()?;
        let mut machine = StateMachine::new(Role::Acceptor);

        if request.kind != CmEventKind::ConnectRequest {
            return Err(SessionError::ProtocolViolation {
                expected: CmEventKind::ConnectRequest,
                received: request.kind,
            });
        }
        let id = request
            .id
            .ok_or(SessionError::invalid_state("connect request carries no handle"))?;
        machine.transition_to(SessionState::ConnectRequested)?;

        id.create_queue_pair(&config.qp_caps)
            .map_err(|e| SessionError::setup("rdma_create_qp", e))?;
        machine.transition_to(SessionState::QpReady)?;

        id.accept(&config.conn_params)
            .map_err(|e| SessionError::setup("rdma_accept", e))?;
        expect_event(
            channel,
            CmEventKind::Established,
            Some(config.connect_timeout()),
        )?;
        machine.transition_to(SessionState::Established)?;

        info!(
            "accepted connection from queue pair {:?}",
            request.remote_qpn
        );
        Self::establish(
            Role::Acceptor,
            id,
            channel.clone(),
            machine,
            config,
            region_length,
            request.remote_qpn,
        )
    }

    fn establish(
        role: Role,
        id: Arc<dyn CmId>,
        channel: EventChannel,
        machine: StateMachine,
        config: &SessionConfig,
        region_length: usize,
        remote_qpn: Option<Qpn>,
    ) -> Result<Self> {
        let data_region = id
            .register_memory_region(region_length, AccessFlags::remote_rw())
            .map_err(|e| SessionError::setup("ibv_reg_mr", e))?;
        let control_region = id
            .register_memory_region(DIRECTORY_ENTRY_LEN, AccessFlags::local_only())
            .map_err(|e| SessionError::setup("ibv_reg_mr", e))?;

        Ok(Self {
            role,
            id,
            channel,
            machine: Mutex::new(machine),
            config: config.clone(),
            data_region,
            control_region,
            remote: OnceLock::new(),
            remote_qpn,
            send_lock: Mutex::new(()),
            next_wr_id: AtomicU64::new(1),
            torn_down: AtomicBool::new(false),
        })
    }

    fn machine(&self) -> MutexGuard<'_, StateMachine> {
        self.machine.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Role of this session
    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    /// Current lifecycle state
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.machine().state()
    }

    /// Session parameters
    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Local data region exposed to the peer
    #[must_use]
    pub fn data_region(&self) -> &MemoryRegion {
        &self.data_region
    }

    /// Receive buffer of the control listener
    #[must_use]
    pub fn control_region(&self) -> &MemoryRegion {
        &self.control_region
    }

    /// Bytes the local data region holds
    #[must_use]
    pub fn local_capacity(&self) -> usize {
        self.data_region.length()
    }

    /// Largest payload of an inline send or write
    #[must_use]
    pub fn inline_ceiling(&self) -> usize {
        self.config.inline_ceiling()
    }

    /// Credential received from the peer, once the exchange ran
    #[must_use]
    pub fn remote(&self) -> Option<&RemoteCredential> {
        self.remote.get()
    }

    /// Store the peer's credential
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::InvalidState`] if a credential is already set.
    pub fn set_remote(&self, credential: RemoteCredential) -> Result<()> {
        self.remote
            .set(credential)
            .map_err(|_| SessionError::invalid_state("remote credential already set"))
    }

    /// Queue pair number of the peer
    #[must_use]
    pub fn remote_qpn(&self) -> Option<Qpn> {
        self.remote_qpn
    }

    /// Operations posted on this connection
    #[must_use]
    pub fn stats(&self) -> TransportStats {
        self.id.stats()
    }

    /// Whether teardown has started
    #[must_use]
    pub fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::Acquire)
    }

    pub(crate) fn cm_id(&self) -> &Arc<dyn CmId> {
        &self.id
    }

    pub(crate) fn next_wr_id(&self) -> WrId {
        self.next_wr_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Post one send-queue work request and wait for its completion, with no
    /// other send interleaving
    pub(crate) fn post_and_wait<F>(&self, post: F) -> Result<WorkCompletion>
    where
        F: FnOnce(&dyn CmId, WrId) -> std::result::Result<(), TransportError>,
    {
        if self.is_torn_down() {
            return Err(SessionError::Closed);
        }

        let _guard = self.send_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let wr_id = self.next_wr_id();
        post(self.id.as_ref(), wr_id).map_err(|e| match e {
            TransportError::Closed => SessionError::Closed,
            other => SessionError::Transport(other),
        })?;

        let wc = self.id.poll_send_completion()?;
        if !wc.is_success() {
            warn!("{} completion failed: {}", wc.opcode, wc.status);
            return Err(SessionError::CompletionFailed {
                opcode: wc.opcode,
                status: wc.status,
            });
        }
        Ok(wc)
    }

    /// Post a receive into `region[offset..offset + length]` and wait for it
    pub(crate) fn receive_into(
        &self,
        region: &MemoryRegion,
        offset: usize,
        length: usize,
    ) -> Result<WorkCompletion> {
        let wr_id = self.next_wr_id();
        self.id
            .post_receive(wr_id, region, offset, length)
            .map_err(|e| match e {
                TransportError::Closed => SessionError::Closed,
                other => SessionError::Transport(other),
            })?;
        let wc = self.id.poll_receive_completion()?;
        debug_assert_eq!(wc.opcode, WcOpcode::Recv);
        Ok(wc)
    }

    /// Tear the session down; runs once even if called from two threads.
    /// Returns `false` if another caller already started teardown.
    ///
    /// Order: deregister regions, disconnect and wait for `DISCONNECTED` (in
    /// the order `mode` names), destroy the queue pair, release the handle.
    ///
    /// # Errors
    ///
    /// Returns the first failing step; later steps still run.
    pub fn teardown(&self, mode: TeardownMode) -> Result<bool> {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return Ok(false);
        }

        if let Err(e) = self.machine().transition_to(SessionState::Disconnecting) {
            warn!("teardown from unexpected state: {}", e);
        }

        let mut first_error: Option<SessionError> = None;
        let mut note = |result: Result<()>| {
            if let Err(e) = result {
                warn!("teardown step failed: {}", e);
                first_error.get_or_insert(e);
            }
        };

        note(
            self.id
                .deregister_memory_region(&self.data_region)
                .map_err(|e| SessionError::setup("ibv_dereg_mr", e)),
        );
        note(
            self.id
                .deregister_memory_region(&self.control_region)
                .map_err(|e| SessionError::setup("ibv_dereg_mr", e)),
        );

        let timeout = Some(self.config.teardown_timeout());
        match mode {
            TeardownMode::Active => {
                note(
                    self.id
                        .disconnect()
                        .map_err(|e| SessionError::setup("rdma_disconnect", e)),
                );
                note(expect_event(&self.channel, CmEventKind::Disconnected, timeout).map(|_| ()));
            }
            TeardownMode::Passive => {
                note(expect_event(&self.channel, CmEventKind::Disconnected, timeout).map(|_| ()));
                note(
                    self.id
                        .disconnect()
                        .map_err(|e| SessionError::setup("rdma_disconnect", e)),
                );
            }
        }

        self.id.destroy_queue_pair();
        note(
            self.id
                .destroy()
                .map_err(|e| SessionError::setup("rdma_destroy_id", e)),
        );

        if let Err(e) = self.machine().transition_to(SessionState::Closed) {
            warn!("teardown finished in unexpected state: {}", e);
        }
        info!("{:?} session closed ({:?} teardown)", self.role, mode);

        match first_error {
            Some(e) => Err(e),
            None => Ok(true),
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("role", &self.role)
            .field("state", &self.state())
            .field("data_region", &self.data_region)
            .field("remote", &self.remote.get())
            .finish()
    }
}

/// Listening side of the acceptor: one handle bound to a port, delivering
/// a bounded number of connection requests before it is rebuilt.
pub struct Endpoint {
    fabric: Arc<dyn Fabric>,
    id: Arc<dyn CmId>,
    channel: EventChannel,
    port: u16,
    backlog: u32,
}

impl Endpoint {
    /// Bind to `port` (0 picks one) and start listening
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Setup`] if any primitive fails.
    pub fn bind(fabric: Arc<dyn Fabric>, port: u16, backlog: u32) -> Result<Self> {
        let (id, channel, port) = Self::open(fabric.as_ref(), port, backlog)?;
        Ok(Self {
            fabric,
            id,
            channel,
            port,
            backlog,
        })
    }

    fn open(
        fabric: &dyn Fabric,
        port: u16,
        backlog: u32,
    ) -> Result<(Arc<dyn CmId>, EventChannel, u16)> {
        let channel = fabric
            .create_event_channel()
            .map_err(|e| SessionError::setup("rdma_create_event_channel", e))?;
        let id = fabric
            .create_id(&channel)
            .map_err(|e| SessionError::setup("rdma_create_id", e))?;
        id.bind_to_port(port)
            .map_err(|e| SessionError::setup("rdma_bind_addr", e))?;
        let port = id
            .local_port()
            .ok_or(SessionError::invalid_state("bound handle reports no port"))?;
        id.listen(backlog)
            .map_err(|e| SessionError::setup("rdma_listen", e))?;
        Ok((id, channel, port))
    }

    /// Port the endpoint is bound to
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Channel connection requests (and the accepted sessions) report on
    #[must_use]
    pub fn channel(&self) -> &EventChannel {
        &self.channel
    }

    /// Wait for the next connection request, or `None` once `shutdown`
    /// fires or its sender is dropped
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::ProtocolViolation`] if another event kind
    /// arrives first.
    pub fn next_request(&self, shutdown: &Receiver<()>) -> Result<Option<CmEvent>> {
        select! {
            recv(self.channel.receiver()) -> event => {
                let event = event.map_err(|_| SessionError::Closed)?;
                if event.kind != CmEventKind::ConnectRequest {
                    return Err(SessionError::ProtocolViolation {
                        expected: CmEventKind::ConnectRequest,
                        received: event.kind,
                    });
                }
                debug!("received {}", event.kind);
                Ok(Some(event))
            }
            recv(shutdown) -> _ => Ok(None),
        }
    }

    /// Release the listening handle and bind a fresh one to the same port
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Setup`] if the new handle cannot be bound.
    pub fn rebuild(&mut self) -> Result<()> {
        self.id
            .destroy()
            .map_err(|e| SessionError::setup("rdma_destroy_id", e))?;
        let (id, channel, _) = Self::open(self.fabric.as_ref(), self.port, self.backlog)?;
        self.id = id;
        self.channel = channel;
        debug!("listening endpoint rebuilt on port {}", self.port);
        Ok(())
    }

    /// Stop listening
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Setup`] if the handle cannot be released.
    pub fn close(self) -> Result<()> {
        self.id
            .destroy()
            .map_err(|e| SessionError::setup("rdma_destroy_id", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rmem_transport::SoftFabric;

    #[test]
    fn test_initiator_path() {
        let mut machine = StateMachine::new(Role::Initiator);
        assert_eq!(machine.state(), SessionState::Init);
        for next in [
            SessionState::AddrResolved,
            SessionState::RouteResolved,
            SessionState::Connecting,
            SessionState::Established,
            SessionState::Disconnecting,
            SessionState::Closed,
        ] {
            machine.transition_to(next).unwrap();
        }
        assert_eq!(machine.state(), SessionState::Closed);
    }

    #[test]
    fn test_acceptor_path() {
        let mut machine = StateMachine::new(Role::Acceptor);
        assert_eq!(machine.state(), SessionState::Listening);
        machine.transition_to(SessionState::ConnectRequested).unwrap();
        machine.transition_to(SessionState::QpReady).unwrap();
        machine.transition_to(SessionState::Established).unwrap();
    }

    #[test]
    fn test_invalid_transitions() {
        let mut machine = StateMachine::new(Role::Initiator);
        assert!(!machine.can_transition(SessionState::Established));
        assert!(!machine.can_transition(SessionState::QpReady));
        assert!(machine.transition_to(SessionState::Connecting).is_err());

        let machine = StateMachine::new(Role::Acceptor);
        assert!(!machine.can_transition(SessionState::AddrResolved));
        assert!(!machine.can_transition(SessionState::Disconnecting));
        assert!(machine.can_transition(SessionState::Closed));
    }

    #[test]
    fn test_closed_is_terminal() {
        let mut machine = StateMachine::new(Role::Initiator);
        machine.transition_to(SessionState::Closed).unwrap();
        assert!(!machine.can_transition(SessionState::Init));
        assert!(!machine.can_transition(SessionState::Closed));
    }

    #[test]
    fn test_expect_event_violation() {
        let fabric = SoftFabric::in_memory();
        let channel = fabric.create_event_channel().unwrap();
        let id = fabric.create_id(&channel).unwrap();
        id.resolve_address("127.0.0.1:1".parse().unwrap(), Duration::from_secs(1))
            .unwrap();

        let err = expect_event(
            &channel,
            CmEventKind::RouteResolved,
            Some(Duration::from_secs(1)),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            SessionError::ProtocolViolation {
                expected: CmEventKind::RouteResolved,
                received: CmEventKind::AddrResolved,
            }
        ));
    }

    #[test]
    fn test_expect_event_timeout() {
        let channel = EventChannel::new();
        let err = expect_event(
            &channel,
            CmEventKind::Established,
            Some(Duration::from_millis(10)),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            SessionError::Timeout("RDMA_CM_EVENT_ESTABLISHED")
        ));
    }

    #[test]
    fn test_connect_rejected_without_listener() {
        let fabric = SoftFabric::in_memory();
        let err = Session::connect(
            &fabric,
            "127.0.0.1:42999".parse().unwrap(),
            &SessionConfig::default(),
            4096,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            SessionError::ProtocolViolation {
                expected: CmEventKind::Established,
                received: CmEventKind::Rejected,
            }
        ));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_endpoint_shutdown_releases_wait() {
        let fabric: Arc<dyn Fabric> = Arc::new(SoftFabric::in_memory());
        let endpoint = Endpoint::bind(fabric, 0, 1).unwrap();
        assert!(endpoint.port() >= 49152);

        let (tx, rx) = crossbeam_channel::bounded(1);
        tx.send(()).unwrap();
        assert!(endpoint.next_request(&rx).unwrap().is_none());
        endpoint.close().unwrap();
    }
}

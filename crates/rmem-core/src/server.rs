//! Connection acceptor and agent pool.
//!
//! The acceptor thread waits for one connection request at a time, accepts
//! it, hands the session to a fresh agent thread and rebinds the listening
//! endpoint to the same port. Each agent runs the credential exchange under
//! the server contract and then serves the directory protocol until its
//! client disconnects.

use crate::config::{LISTEN_BACKLOG, ServerConfig};
use crate::control::{self, ControlHandler, Flow, ListenerExit, Opcode};
use crate::directory::{PeerDirectory, PeerEntry, PeerId, RegionStatus};
use crate::error::{Result, SessionError};
use crate::exchange::{self, Contract};
use crate::session::{Endpoint, Session, TeardownMode};
use crossbeam_channel::{Receiver, Sender};
use rmem_transport::{Fabric, Qpn};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

/// Server-local identifier of an accepted connection
pub type ConnectionId = u64;

/// What the server knows about one connected client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionRecord {
    /// Connection identifier
    pub id: ConnectionId,
    /// Queue pair number of the client
    pub remote_qpn: Option<Qpn>,
    /// Length of the region registered for this client
    pub region_length: usize,
    /// Peer id, once the client has announced one
    pub peer: Option<PeerId>,
    /// Whether the client's own region is open
    pub status: RegionStatus,
}

/// Why a task exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskPurpose {
    /// The thread accepting connections
    Acceptor,
    /// The thread serving one connection
    Agent(ConnectionId),
}

/// Totals over the connections the server has closed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerStats {
    /// Connections whose agent has finished
    pub connections_closed: u64,
    /// Teardowns that reported an error
    pub teardown_failures: u64,
    /// Regions deregistered by agent teardowns
    pub regions_deregistered: u64,
}

#[derive(Debug, Default)]
struct StatsCounters {
    connections_closed: AtomicU64,
    teardown_failures: AtomicU64,
    regions_deregistered: AtomicU64,
}

impl StatsCounters {
    fn snapshot(&self) -> ServerStats {
        ServerStats {
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            teardown_failures: self.teardown_failures.load(Ordering::Relaxed),
            regions_deregistered: self.regions_deregistered.load(Ordering::Relaxed),
        }
    }
}

struct TaskRecord {
    handle: JoinHandle<()>,
    purpose: TaskPurpose,
}

struct Connection {
    record: ConnectionRecord,
    session: Arc<Session>,
}

struct Shared {
    config: ServerConfig,
    directory: PeerDirectory,
    connections: Mutex<BTreeMap<ConnectionId, Connection>>,
    tasks: Mutex<Vec<TaskRecord>>,
    next_connection: AtomicU64,
    stats: StatsCounters,
}

impl Shared {
    fn connections(&self) -> MutexGuard<'_, BTreeMap<ConnectionId, Connection>> {
        self.connections.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn tasks(&self) -> MutexGuard<'_, Vec<TaskRecord>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Join agents that have already returned and drop their records
    fn reap_finished(&self) {
        let finished: Vec<TaskRecord> = {
            let mut tasks = self.tasks();
            let (finished, running): (Vec<_>, Vec<_>) = std::mem::take(&mut *tasks)
                .into_iter()
                .partition(|task| {
                    matches!(task.purpose, TaskPurpose::Agent(_)) && task.handle.is_finished()
                });
            *tasks = running;
            finished
        };
        if !finished.is_empty() {
            debug!("reaping {} finished agents", finished.len());
        }
        join_all(finished);
    }

    fn update_record(&self, id: ConnectionId, update: impl FnOnce(&mut ConnectionRecord)) {
        if let Some(connection) = self.connections().get_mut(&id) {
            update(&mut connection.record);
        }
    }
}

/// A running directory server.
pub struct Server {
    port: u16,
    shared: Arc<Shared>,
    shutdown_tx: Mutex<Option<Sender<()>>>,
}

impl Server {
    /// Bind `port` (0 picks an ephemeral one) and start accepting
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::InvalidConfig`] for a bad configuration and
    /// [`SessionError::Setup`] if the endpoint cannot be bound.
    pub fn bind(fabric: Arc<dyn Fabric>, config: ServerConfig, port: u16) -> Result<Self> {
        config.validate()?;
        let endpoint = Endpoint::bind(fabric, port, LISTEN_BACKLOG)?;
        let port = endpoint.port();

        let shared = Arc::new(Shared {
            config,
            directory: PeerDirectory::new(),
            connections: Mutex::new(BTreeMap::new()),
            tasks: Mutex::new(Vec::new()),
            next_connection: AtomicU64::new(1),
            stats: StatsCounters::default(),
        });
        let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded(1);

        let acceptor = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("rmem-acceptor".to_string())
                .spawn(move || run_acceptor(&shared, endpoint, &shutdown_rx))
                .map_err(|e| SessionError::Transport(e.into()))?
        };
        shared.tasks().push(TaskRecord {
            handle: acceptor,
            purpose: TaskPurpose::Acceptor,
        });

        info!("server listening on port {}", port);
        Ok(Self {
            port,
            shared,
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
        })
    }

    /// Port the server listens on
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Regions clients have announced
    #[must_use]
    pub fn directory(&self) -> &PeerDirectory {
        &self.shared.directory
    }

    /// Connected clients, ordered by connection id
    #[must_use]
    pub fn connections(&self) -> Vec<ConnectionRecord> {
        self.shared
            .connections()
            .values()
            .map(|connection| connection.record.clone())
            .collect()
    }

    /// Purposes of the registered tasks; finished agents are reaped first
    #[must_use]
    pub fn tasks(&self) -> Vec<TaskPurpose> {
        self.shared.reap_finished();
        self.shared.tasks().iter().map(|task| task.purpose).collect()
    }

    /// Totals over closed connections
    #[must_use]
    pub fn stats(&self) -> ServerStats {
        self.shared.stats.snapshot()
    }

    /// Stop accepting, ask every client to disconnect and wait for all
    /// tasks to finish. Later calls do nothing.
    pub fn shutdown(&self) {
        let Some(shutdown_tx) = self
            .shutdown_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return;
        };
        drop(shutdown_tx);
        info!("server shutting down");

        let tasks = std::mem::take(&mut *self.shared.tasks());
        let (acceptors, mut agents): (Vec<_>, Vec<_>) = tasks
            .into_iter()
            .partition(|task| task.purpose == TaskPurpose::Acceptor);
        join_all(acceptors);
        // Agents spawned while the acceptor was winding down
        agents.append(&mut self.shared.tasks());

        let sessions: Vec<Arc<Session>> = self
            .shared
            .connections()
            .values()
            .map(|connection| Arc::clone(&connection.session))
            .collect();
        for session in sessions {
            match control::send_signal(&session, Opcode::Disconnect) {
                Ok(()) | Err(SessionError::Closed) => {}
                Err(e) => warn!("could not signal disconnect: {}", e),
            }
        }

        join_all(agents);
        info!("server stopped");
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("port", &self.port)
            .field("connections", &self.shared.connections().len())
            .field("directory_len", &self.shared.directory.len())
            .finish()
    }
}

fn join_all(tasks: Vec<TaskRecord>) {
    for task in tasks {
        if task.handle.join().is_err() {
            error!("{:?} task panicked", task.purpose);
        }
    }
}

fn run_acceptor(shared: &Arc<Shared>, mut endpoint: Endpoint, shutdown: &Receiver<()>) {
    loop {
        let request = match endpoint.next_request(shutdown) {
            Ok(Some(request)) => request,
            Ok(None) => break,
            Err(SessionError::Closed) => {
                error!("listening endpoint closed");
                break;
            }
            Err(e) => {
                warn!("ignoring event on listening endpoint: {}", e);
                continue;
            }
        };

        let accepted = Session::accept(
            request,
            endpoint.channel(),
            &shared.config.session,
            shared.config.region_length,
        );
        match accepted {
            Ok(session) => spawn_agent(shared, Arc::new(session)),
            Err(e) => error!("failed to accept connection: {}", e),
        }

        if let Err(e) = endpoint.rebuild() {
            error!("cannot listen again on port {}: {}", endpoint.port(), e);
            return;
        }
    }

    if let Err(e) = endpoint.close() {
        warn!("closing listening endpoint: {}", e);
    }
    debug!("acceptor stopped");
}

fn spawn_agent(shared: &Arc<Shared>, session: Arc<Session>) {
    shared.reap_finished();
    let id = shared.next_connection.fetch_add(1, Ordering::Relaxed);
    let record = ConnectionRecord {
        id,
        remote_qpn: session.remote_qpn(),
        region_length: session.local_capacity(),
        peer: None,
        status: RegionStatus::Closed,
    };
    shared.connections().insert(
        id,
        Connection {
            record,
            session: Arc::clone(&session),
        },
    );

    let spawned = {
        let shared = Arc::clone(shared);
        let session = Arc::clone(&session);
        thread::Builder::new()
            .name(format!("rmem-agent-{id}"))
            .spawn(move || run_agent(&shared, id, &session))
    };
    match spawned {
        Ok(handle) => shared.tasks().push(TaskRecord {
            handle,
            purpose: TaskPurpose::Agent(id),
        }),
        Err(e) => {
            error!("cannot start agent for connection {}: {}", id, e);
            shared.connections().remove(&id);
            let _ = session.teardown(TeardownMode::Active);
        }
    }
}

fn run_agent(shared: &Shared, id: ConnectionId, session: &Session) {
    info!("connection {} established", id);
    let mode = match serve(shared, id, session) {
        Ok(exit) => {
            debug!("connection {} listener ended: {:?}", id, exit);
            TeardownMode::Passive
        }
        Err(e) => {
            error!("connection {} failed: {}", id, e);
            TeardownMode::Active
        }
    };
    if let Err(e) = session.teardown(mode) {
        warn!("connection {} teardown: {}", id, e);
        shared.stats.teardown_failures.fetch_add(1, Ordering::Relaxed);
    }
    shared
        .stats
        .regions_deregistered
        .fetch_add(session.stats().regions_deregistered, Ordering::Relaxed);

    let peer = shared
        .connections()
        .get(&id)
        .and_then(|connection| connection.record.peer);
    if let Some(peer) = peer {
        match shared.directory.remove(peer) {
            Ok(_) => debug!("peer {:#018x} left the directory", peer),
            Err(e) => debug!("{}", e),
        }
    }
    shared.connections().remove(&id);
    shared.stats.connections_closed.fetch_add(1, Ordering::Relaxed);
    info!("connection {} closed", id);
}

fn serve(shared: &Shared, id: ConnectionId, session: &Session) -> Result<ListenerExit> {
    exchange::exchange(session, Contract::Server)?;
    let mut handler = AgentHandler {
        shared,
        connection: id,
    };
    control::run_listener(session, &mut handler)
}

struct AgentHandler<'a> {
    shared: &'a Shared,
    connection: ConnectionId,
}

impl AgentHandler<'_> {
    fn register(&self, session: &Session, requester: PeerEntry) -> Result<()> {
        if self.shared.directory.insert(requester) {
            info!(
                "peer {:#018x} registered {} bytes",
                requester.id, requester.length
            );
        }
        self.shared
            .update_record(self.connection, |record| record.peer = Some(requester.id));

        for entry in self.shared.directory.snapshot() {
            if entry.id == requester.id {
                continue;
            }
            let opcode = match entry.status {
                RegionStatus::Open => Opcode::RequestMr,
                RegionStatus::Closed => Opcode::CloseMr,
            };
            control::send_entry(session, opcode, &entry)?;
        }
        control::send_signal(session, Opcode::SemaPost)
    }

    fn set_status(&self, entry: PeerEntry, status: RegionStatus) -> Result<()> {
        self.shared.directory.insert(entry);
        self.shared.directory.set_status(entry.id, status)?;
        self.shared.update_record(self.connection, |record| {
            record.peer = Some(entry.id);
            record.status = status;
        });
        info!("peer {:#018x} region {}", entry.id, status);
        Ok(())
    }
}

impl ControlHandler for AgentHandler<'_> {
    fn on_message(
        &mut self,
        session: &Session,
        opcode: Opcode,
        entry: Option<PeerEntry>,
    ) -> Result<Flow> {
        match (opcode, entry) {
            (Opcode::Disconnect, _) => {
                info!("connection {} requested disconnect", self.connection);
                return Ok(Flow::Stop);
            }
            (Opcode::RequestMr, Some(entry)) => self.register(session, entry)?,
            (Opcode::OpenMr, Some(entry)) => self.set_status(entry, RegionStatus::Open)?,
            (Opcode::CloseMr, Some(entry)) => self.set_status(entry, RegionStatus::Closed)?,
            (Opcode::RequestPage, _) => {}
            (opcode, None) if !opcode.is_data() => {
                warn!("{} without a directory entry", opcode);
            }
            (opcode, _) => warn!("unexpected {} from connection {}", opcode, self.connection),
        }
        Ok(Flow::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rmem_transport::SoftFabric;

    #[test]
    fn test_bind_ephemeral_and_shutdown() {
        let fabric: Arc<dyn Fabric> = Arc::new(SoftFabric::in_memory());
        let server = Server::bind(fabric, ServerConfig::default(), 0).unwrap();
        assert!(server.port() >= 49152);
        assert_eq!(server.tasks(), vec![TaskPurpose::Acceptor]);
        assert!(server.connections().is_empty());

        server.shutdown();
        assert!(server.tasks().is_empty());
        // Idempotent
        server.shutdown();
    }

    #[test]
    fn test_bind_rejects_bad_config() {
        let fabric: Arc<dyn Fabric> = Arc::new(SoftFabric::in_memory());
        let config = ServerConfig {
            region_length: 16,
            ..ServerConfig::default()
        };
        assert!(matches!(
            Server::bind(fabric, config, 0),
            Err(SessionError::InvalidConfig(_))
        ));
    }
}

//! Client facade: one initiator session to a directory server.
//!
//! Connecting runs the credential exchange under the client contract and
//! starts a background control listener. The interactive side then issues
//! remote operations against the server region or any directory entry, and
//! advertises its own region with `OPEN_MR`/`CLOSE_MR`/`REQUEST_MR`.

use crate::config::ClientConfig;
use crate::control::{self, ControlHandler, Flow, ListenerExit, Opcode};
use crate::directory::{PeerDirectory, PeerEntry, PeerId, RegionStatus};
use crate::error::{Result, SessionError};
use crate::exchange::{self, Contract};
use crate::ops::RemoteTarget;
use crate::session::{Session, TeardownMode};
use crossbeam_channel::{Receiver, Sender};
use rmem_transport::Fabric;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

/// A connected client.
pub struct Client {
    session: Arc<Session>,
    peer_id: PeerId,
    directory: Arc<PeerDirectory>,
    wake_rx: Receiver<()>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl Client {
    /// Connect to a server, exchange credentials and start listening for
    /// control signals
    ///
    /// # Errors
    ///
    /// Returns the fatal setup error if the connection or handshake fails.
    pub fn connect(fabric: &dyn Fabric, server: SocketAddr, config: &ClientConfig) -> Result<Self> {
        config.validate()?;
        let session = Arc::new(Session::connect(
            fabric,
            server,
            &config.session,
            config.region_length,
        )?);

        if let Err(e) = exchange::exchange(&session, Contract::Client) {
            error!("credential exchange failed: {}", e);
            let _ = session.teardown(TeardownMode::Active);
            return Err(e);
        }

        let peer_id: PeerId = rand::random();
        let directory = Arc::new(PeerDirectory::new());
        let (wake_tx, wake_rx) = crossbeam_channel::unbounded();

        let handler = ClientHandler {
            peer_id,
            directory: Arc::clone(&directory),
            wake_tx,
        };
        let listener = {
            let session = Arc::clone(&session);
            thread::Builder::new()
                .name("rmem-listener".to_string())
                .spawn(move || run_client_listener(&session, handler))
        };
        let listener = match listener {
            Ok(handle) => handle,
            Err(e) => {
                let _ = session.teardown(TeardownMode::Active);
                return Err(SessionError::Transport(e.into()));
            }
        };

        info!("client {:#018x} connected to {}", peer_id, server);
        Ok(Self {
            session,
            peer_id,
            directory,
            wake_rx,
            listener: Mutex::new(Some(listener)),
        })
    }

    /// Identifier this client advertises
    #[must_use]
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// Regions other clients have advertised
    #[must_use]
    pub fn directory(&self) -> &PeerDirectory {
        &self.directory
    }

    /// Underlying session
    #[must_use]
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// This client's region as a directory entry
    #[must_use]
    pub fn local_entry(&self) -> PeerEntry {
        let mr = self.session.data_region();
        PeerEntry::new(self.peer_id, mr.rkey(), mr.addr(), mr.length() as u64)
    }

    /// The server region learned in the exchange
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::InvalidState`] before the exchange completed.
    pub fn server_target(&self) -> Result<RemoteTarget> {
        self.session
            .remote()
            .and_then(|credential| credential.target())
            .ok_or(SessionError::invalid_state("server credential not received"))
    }

    /// Inline write into the server region
    ///
    /// # Errors
    ///
    /// See [`Session::write_inline`].
    pub fn write_inline(&self, offset: u64, payload: &[u8]) -> Result<()> {
        self.session.write_inline(&self.server_target()?, offset, payload)
    }

    /// Write into the server region
    ///
    /// # Errors
    ///
    /// See [`Session::write`].
    pub fn write(&self, offset: u64, payload: &[u8]) -> Result<()> {
        self.session.write(&self.server_target()?, offset, payload)
    }

    /// Read from the server region
    ///
    /// # Errors
    ///
    /// See [`Session::read`].
    pub fn read(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        self.session.read(&self.server_target()?, offset, len)
    }

    /// Inline write into the region of directory entry `peer`
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Directory`] if `peer` is unknown, otherwise as
    /// for [`Session::write_inline`].
    pub fn write_inline_to(&self, peer: PeerId, offset: u64, payload: &[u8]) -> Result<()> {
        let target = self.directory.find_interactive(peer)?.target();
        self.session.write_inline(&target, offset, payload)
    }

    /// Write into the region of directory entry `peer`
    ///
    /// # Errors
    ///
    /// As for [`Client::write_inline_to`].
    pub fn write_to(&self, peer: PeerId, offset: u64, payload: &[u8]) -> Result<()> {
        let target = self.directory.find_interactive(peer)?.target();
        self.session.write(&target, offset, payload)
    }

    /// Read from the region of directory entry `peer`
    ///
    /// # Errors
    ///
    /// As for [`Client::write_inline_to`].
    pub fn read_from(&self, peer: PeerId, offset: u64, len: usize) -> Result<Vec<u8>> {
        let target = self.directory.find_interactive(peer)?.target();
        self.session.read(&target, offset, len)
    }

    /// Advertise this client's region as open
    ///
    /// # Errors
    ///
    /// Returns the send failure.
    pub fn open_region(&self) -> Result<()> {
        control::send_entry(&self.session, Opcode::OpenMr, &self.local_entry())?;
        info!("region opened to peers");
        Ok(())
    }

    /// Withdraw this client's region
    ///
    /// # Errors
    ///
    /// Returns the send failure.
    pub fn close_region(&self) -> Result<()> {
        control::send_entry(&self.session, Opcode::CloseMr, &self.local_entry())?;
        info!("region closed to peers");
        Ok(())
    }

    /// Register with the server directory and wait until it has relayed
    /// every other advertised region
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Closed`] if the listener exits before the
    /// server's `SEMA_POST` arrives.
    pub fn request_regions(&self) -> Result<()> {
        // Drop wake-ups nobody waited for
        while self.wake_rx.try_recv().is_ok() {}
        control::send_entry(&self.session, Opcode::RequestMr, &self.local_entry())?;
        self.wake_rx.recv().map_err(|_| SessionError::Closed)?;
        debug!("directory now holds {} entries", self.directory.len());
        Ok(())
    }

    /// Tell the server we are leaving and tear the session down
    ///
    /// Safe to call more than once; later calls do nothing.
    ///
    /// # Errors
    ///
    /// Returns the first teardown step that failed.
    pub fn disconnect(&self) -> Result<()> {
        let result = if self.session.is_torn_down() {
            Ok(())
        } else {
            match control::send_signal(&self.session, Opcode::Disconnect) {
                Ok(()) | Err(SessionError::Closed) => {}
                Err(e) => warn!("could not signal disconnect: {}", e),
            }
            self.session.teardown(TeardownMode::Active).map(|_| ())
        };

        let handle = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("control listener panicked");
            }
        }
        result
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if let Err(e) = self.disconnect() {
            debug!("teardown on drop: {}", e);
        }
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("peer_id", &self.peer_id)
            .field("session", &self.session)
            .field("directory_len", &self.directory.len())
            .finish()
    }
}

fn run_client_listener(session: &Session, mut handler: ClientHandler) {
    match control::run_listener(session, &mut handler) {
        Ok(ListenerExit::Stopped) => debug!("listener stopped after server disconnect"),
        Ok(ListenerExit::Flushed) => {
            // The connection dropped without a DISCONNECT signal
            if let Ok(true) = session.teardown(TeardownMode::Passive) {
                warn!("server went away without signalling");
            }
        }
        Err(e) => {
            error!("control listener failed: {}", e);
            let _ = session.teardown(TeardownMode::Active);
        }
    }
}

struct ClientHandler {
    peer_id: PeerId,
    directory: Arc<PeerDirectory>,
    wake_tx: Sender<()>,
}

impl ClientHandler {
    fn advertise(&self, entry: PeerEntry) {
        if entry.id == self.peer_id {
            debug!("skipping own region relayed by server");
            return;
        }
        if self.directory.insert(entry.with_status(RegionStatus::Open)) {
            info!(
                "peer {:#018x} advertised {} bytes at {:#x}",
                entry.id, entry.length, entry.addr
            );
        }
    }
}

impl ControlHandler for ClientHandler {
    fn on_message(
        &mut self,
        session: &Session,
        opcode: Opcode,
        entry: Option<PeerEntry>,
    ) -> Result<Flow> {
        match (opcode, entry) {
            (Opcode::Disconnect, _) => {
                info!("server requested disconnect");
                match control::send_signal(session, Opcode::Disconnect) {
                    Ok(()) | Err(SessionError::Closed) => {}
                    Err(e) => warn!("could not acknowledge disconnect: {}", e),
                }
                session.teardown(TeardownMode::Active)?;
                return Ok(Flow::Stop);
            }
            (Opcode::RequestMr, Some(entry)) => self.advertise(entry),
            (Opcode::CloseMr, Some(entry)) => match self.directory.remove(entry.id) {
                Ok(_) => info!("peer {:#018x} closed its region", entry.id),
                Err(e) => debug!("close for unknown peer: {}", e),
            },
            (Opcode::SemaPost, _) => {
                let _ = self.wake_tx.send(());
            }
            (Opcode::RequestPage, _) => {}
            (opcode, _) => warn!("unexpected {} from server", opcode),
        }
        Ok(Flow::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handler(peer_id: PeerId) -> ClientHandler {
        let (wake_tx, _wake_rx) = crossbeam_channel::bounded(1);
        ClientHandler {
            peer_id,
            directory: Arc::new(PeerDirectory::new()),
            wake_tx,
        }
    }

    #[test]
    fn test_own_region_not_recorded() {
        let handler = handler(7);
        handler.advertise(PeerEntry::new(7, 1, 0x1000, 4096));
        assert!(handler.directory.is_empty());
    }

    #[test]
    fn test_advertised_region_recorded_open() {
        let handler = handler(7);
        handler.advertise(PeerEntry::new(8, 2, 0x2000, 4096));
        let entry = handler.directory.get(8).unwrap();
        assert!(entry.is_open());
        assert_eq!(entry.addr, 0x2000);

        // Repeats leave the first record in place
        handler.advertise(PeerEntry::new(8, 3, 0x3000, 4096));
        assert_eq!(handler.directory.get(8).unwrap().rkey, 2);
    }
}

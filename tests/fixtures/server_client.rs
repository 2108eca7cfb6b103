//! Server fixture over the in-memory soft fabric
//!
//! Every fixture owns its own fabric, so port numbers never clash between
//! tests running in parallel.
//!
//! # Example
//!
//! ```no_run
//! use rmem_integration_tests::fixtures::ServerFixture;
//!
//! let fixture = ServerFixture::new().unwrap();
//! let client = fixture.connect().unwrap();
//! client.write_inline(0, b"hello").unwrap();
//! client.disconnect().unwrap();
//! fixture.shutdown();
//! ```

use rmem_core::{Client, ClientConfig, Server, ServerConfig, SessionError};
use rmem_transport::{Fabric, SoftFabric};
use std::net::SocketAddr;
use std::sync::Arc;

/// A running server and the fabric its clients connect through.
pub struct ServerFixture {
    /// Fabric shared by the server and every client of this fixture
    pub fabric: SoftFabric,
    /// The server under test
    pub server: Server,
}

impl ServerFixture {
    /// Server with default configuration on an ephemeral port
    ///
    /// # Errors
    ///
    /// Returns the bind failure.
    pub fn new() -> Result<Self, SessionError> {
        Self::with_config(0, ServerConfig::default())
    }

    /// Server on `port` with `config`
    ///
    /// # Errors
    ///
    /// Returns the bind failure.
    pub fn with_config(port: u16, config: ServerConfig) -> Result<Self, SessionError> {
        let fabric = SoftFabric::in_memory();
        let shared: Arc<dyn Fabric> = Arc::new(fabric.clone());
        let server = Server::bind(shared, config, port)?;
        Ok(Self { fabric, server })
    }

    /// Loopback address of the server
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], self.server.port()))
    }

    /// Connect a client with default configuration
    ///
    /// # Errors
    ///
    /// Returns the connection or handshake failure.
    pub fn connect(&self) -> Result<Client, SessionError> {
        self.connect_with(&ClientConfig::default())
    }

    /// Connect a client with `config`
    ///
    /// # Errors
    ///
    /// Returns the connection or handshake failure.
    pub fn connect_with(&self, config: &ClientConfig) -> Result<Client, SessionError> {
        Client::connect(&self.fabric, self.addr(), config)
    }

    /// Stop the server and wait for its threads
    pub fn shutdown(self) {
        self.server.shutdown();
    }
}

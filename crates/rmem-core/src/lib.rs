//! # RMEM Core
//!
//! Session and directory protocol for remote memory access.
//!
//! This crate provides:
//! - Session state machine for initiator and acceptor roles
//! - Credential exchange (address, remote key, region length)
//! - Control-opcode channel carried in immediate data
//! - Remote operation executor (inline write, write, read)
//! - Peer directory of advertised regions
//! - Client facade and the acceptor/agent server
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │      Client  /  Server (acceptor + agents)    │
//! ├───────────────────────────────────────────────┤
//! │  Control channel  │  Executor  │  Directory   │
//! ├───────────────────────────────────────────────┤
//! │   Session (state machine, credential swap)    │
//! ├───────────────────────────────────────────────┤
//! │        rmem-transport (Fabric, CmId)          │
//! └───────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client;
pub mod config;
pub mod control;
pub mod directory;
pub mod error;
pub mod exchange;
pub mod ops;
pub mod server;
pub mod session;

pub use client::Client;
pub use config::{ClientConfig, ServerConfig, SessionConfig};
pub use control::{ControlHandler, Flow, ListenerExit, Opcode, Received};
pub use directory::{PeerDirectory, PeerEntry, PeerId, RegionStatus};
pub use error::{BoundsError, DirectoryError, Result, SessionError, WireError};
pub use exchange::{Contract, RemoteCredential, decode_credential, encode_credential};
pub use ops::RemoteTarget;
pub use server::{ConnectionId, ConnectionRecord, Server, ServerStats, TaskPurpose};
pub use session::{Endpoint, Role, Session, SessionState, StateMachine, TeardownMode};

//! # RMEM Transport
//!
//! Capability interface for reliable-connected remote memory access, and one
//! provider of it.
//!
//! This crate provides:
//! - Verbs value types (queue pair caps, work completions, CM events)
//! - The [`Fabric`] and [`CmId`] traits consumed by the session core
//! - Registered memory regions with remote keys
//! - The soft fabric provider (in-memory and TCP link modes)
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │        Fabric (event channels, handles)       │
//! ├───────────────────────────────────────────────┤
//! │  CmId: resolution, connect/accept, bind/listen│
//! │        queue pair, memory registration        │
//! ├───────────────────────────────────────────────┤
//! │  Link: in-process channels or TCP frames      │
//! └───────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod event;
pub mod region;
pub mod soft;
pub mod transport;
pub mod verbs;

pub use event::EventChannel;
pub use region::MemoryRegion;
pub use soft::{LinkMode, SoftCmId, SoftFabric};
pub use transport::{TransportError, TransportResult, TransportStats};
pub use verbs::{
    AccessFlags, CmEvent, CmEventKind, CmId, ConnParams, Fabric, ImmData, LKey, QpCaps, Qpn,
    RKey, Sge, WcOpcode, WcStatus, WorkCompletion, WrId,
};

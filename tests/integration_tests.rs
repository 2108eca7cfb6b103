//! Integration tests for the session and directory protocol.
//!
//! Servers and clients run in one process over the in-memory soft fabric;
//! the last test repeats the basic exchange over TCP links.

use rmem_core::{
    BoundsError, ClientConfig, DirectoryError, PeerEntry, RegionStatus, ServerConfig,
    SessionError, TaskPurpose, TeardownMode,
};
use rmem_integration_tests::fixtures::ServerFixture;
use rmem_integration_tests::wait_until;
use rmem_transport::{Fabric, SoftFabric, WcOpcode, WcStatus};
use std::sync::Arc;
use std::time::Duration;

const MIB: u64 = 1024 * 1024;
const SETTLE: Duration = Duration::from_secs(5);

fn agent_count(fixture: &ServerFixture) -> usize {
    fixture
        .server
        .tasks()
        .iter()
        .filter(|t| matches!(t, TaskPurpose::Agent(_)))
        .count()
}

fn hex_bytes(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(" ")
}

// ============================================================================
// Handshake and Data Path
// ============================================================================

/// Port 50000, 1 MiB server region: the client learns the length, writes
/// "hello" inline and reads it back.
#[test]
fn test_handshake_inline_write_and_read_back() {
    let fixture = ServerFixture::with_config(50000, ServerConfig::default()).unwrap();
    assert_eq!(fixture.server.port(), 50000);

    let client = fixture.connect().unwrap();
    let target = client.server_target().unwrap();
    assert_eq!(target.length, 1_048_576);

    client.write_inline(0, b"hello").unwrap();
    let bytes = client.read(0, 5).unwrap();
    assert_eq!(hex_bytes(&bytes), "68 65 6c 6c 6f");

    client.disconnect().unwrap();
    fixture.shutdown();
}

#[test]
fn test_write_right_after_connect_survives() {
    let fixture = ServerFixture::new().unwrap();

    for i in 0..100u32 {
        let client = fixture.connect().unwrap();
        let payload = i.to_le_bytes();
        client.write_inline(0, &payload).unwrap();
        assert_eq!(client.read(0, 4).unwrap(), payload, "iteration {i}");

        client.write(8, b"staged").unwrap();
        assert_eq!(client.read(8, 6).unwrap(), b"staged", "iteration {i}");

        client.disconnect().unwrap();
    }

    fixture.shutdown();
}

#[test]
fn test_inline_write_pads_to_ceiling() {
    let fixture = ServerFixture::new().unwrap();
    let client = fixture.connect().unwrap();

    client.write(0, &[0xff; 128]).unwrap();
    client.write_inline(0, b"abc").unwrap();

    let bytes = client.read(0, 128).unwrap();
    assert_eq!(&bytes[..3], b"abc");
    // The full 64-byte ceiling was written, zero padded
    assert!(bytes[3..64].iter().all(|&b| b == 0));
    assert!(bytes[64..].iter().all(|&b| b == 0xff));

    client.disconnect().unwrap();
    fixture.shutdown();
}

#[test]
fn test_write_and_read_at_region_end() {
    let fixture = ServerFixture::new().unwrap();
    let client = fixture.connect().unwrap();

    let payload: Vec<u8> = (0..=255u8).collect();
    let offset = MIB - payload.len() as u64;
    client.write(offset, &payload).unwrap();
    assert_eq!(client.read(offset, payload.len()).unwrap(), payload);

    client.disconnect().unwrap();
    fixture.shutdown();
}

#[test]
fn test_credential_exchange_zeroes_client_region() {
    let fixture = ServerFixture::new().unwrap();
    let client = fixture.connect().unwrap();

    let mr = client.session().data_region();
    assert!(mr.read(0, 60).unwrap().iter().all(|&b| b == 0));
    assert!(client.session().remote().is_some());

    client.disconnect().unwrap();
    fixture.shutdown();
}

// ============================================================================
// Local Bounds Rejection
// ============================================================================

/// A read longer than the local region is rejected before anything is
/// posted.
#[test]
fn test_read_longer_than_local_capacity_posts_nothing() {
    let fixture = ServerFixture::new().unwrap();
    let config = ClientConfig {
        region_length: 4096,
        ..ClientConfig::default()
    };
    let client = fixture.connect_with(&config).unwrap();

    let before = client.session().stats().send_side_posted();
    let err = client.read(0, 8192).unwrap_err();
    assert!(matches!(
        err,
        SessionError::Bounds(BoundsError::ExceedsLocalCapacity {
            len: 8192,
            capacity: 4096
        })
    ));
    assert!(err.is_recoverable());
    assert_eq!(client.session().stats().send_side_posted(), before);

    // Session still usable
    client.write_inline(0, b"ok").unwrap();

    client.disconnect().unwrap();
    fixture.shutdown();
}

#[test]
fn test_inline_write_past_end_posts_nothing() {
    let fixture = ServerFixture::new().unwrap();
    let client = fixture.connect().unwrap();

    let before = client.session().stats();
    let err = client.write_inline(MIB - 63, b"x").unwrap_err();
    assert!(matches!(
        err,
        SessionError::Bounds(BoundsError::InvalidOffset { span: 64, .. })
    ));
    assert!(matches!(
        client.write(MIB, b"x").unwrap_err(),
        SessionError::Bounds(BoundsError::OffsetPastEnd { .. })
    ));
    assert_eq!(
        client.session().stats().send_side_posted(),
        before.send_side_posted()
    );

    client.disconnect().unwrap();
    fixture.shutdown();
}

#[test]
fn test_failed_completion_leaves_session_usable() {
    let fixture = ServerFixture::new().unwrap();
    let client = fixture.connect().unwrap();

    // An entry nobody registered
    client
        .directory()
        .insert(PeerEntry::new(99, 0x0dea_d000, 0x1000, 4096).with_status(RegionStatus::Open));
    let err = client.write_inline_to(99, 0, b"x").unwrap_err();
    assert!(matches!(
        err,
        SessionError::CompletionFailed {
            opcode: WcOpcode::RdmaWrite,
            status: WcStatus::RemoteAccessError,
        }
    ));
    assert!(err.is_recoverable());

    client.write_inline(0, b"still here").unwrap();
    assert_eq!(client.read(0, 10).unwrap(), b"still here");

    client.disconnect().unwrap();
    fixture.shutdown();
}

#[test]
fn test_entry_near_address_limit_posts_nothing() {
    let fixture = ServerFixture::new().unwrap();
    let client = fixture.connect().unwrap();

    client
        .directory()
        .insert(PeerEntry::new(77, 0x1000, u64::MAX - 8, 4096).with_status(RegionStatus::Open));
    let before = client.session().stats().send_side_posted();
    for err in [
        client.read_from(77, 16, 4).unwrap_err(),
        client.write_inline_to(77, 16, b"x").unwrap_err(),
    ] {
        assert!(matches!(
            err,
            SessionError::Bounds(BoundsError::InvalidOffset { offset: 16, .. })
        ));
    }
    assert_eq!(client.session().stats().send_side_posted(), before);

    client.disconnect().unwrap();
    fixture.shutdown();
}

#[test]
fn test_unknown_directory_entry() {
    let fixture = ServerFixture::new().unwrap();
    let client = fixture.connect().unwrap();

    assert!(matches!(
        client.read_from(42, 0, 5),
        Err(SessionError::Directory(DirectoryError::NotFound(42)))
    ));

    client.disconnect().unwrap();
    fixture.shutdown();
}

// ============================================================================
// Directory Protocol
// ============================================================================

/// REQUEST_MR registers the client once, with its region length.
#[test]
fn test_request_registers_client_once() {
    let fixture = ServerFixture::new().unwrap();
    let client = fixture.connect().unwrap();

    client.request_regions().unwrap();
    let entries = fixture.server.directory().snapshot();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].id, client.peer_id());
    assert_eq!(entries[0].length, 64 * 1024);

    client.request_regions().unwrap();
    assert_eq!(fixture.server.directory().len(), 1);
    assert!(client.directory().is_empty());

    let records = fixture.server.connections();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].peer, Some(client.peer_id()));
    assert_eq!(records[0].region_length, 1024 * 1024);

    client.disconnect().unwrap();
    fixture.shutdown();
}

#[test]
fn test_open_region_is_relayed_and_writable() {
    let fixture = ServerFixture::new().unwrap();
    let owner = fixture.connect().unwrap();
    let peer = fixture.connect().unwrap();

    owner.open_region().unwrap();
    assert!(wait_until(SETTLE, || {
        fixture
            .server
            .directory()
            .get(owner.peer_id())
            .is_some_and(|e| e.is_open())
    }));

    peer.request_regions().unwrap();
    let entry = peer.directory().find_interactive(owner.peer_id()).unwrap();
    assert!(entry.is_open());
    assert_eq!(entry.length, 64 * 1024);

    peer.write_to(owner.peer_id(), 16, b"from a peer").unwrap();
    assert_eq!(
        owner.session().data_region().read(16, 11).unwrap(),
        b"from a peer"
    );
    assert_eq!(peer.read_from(owner.peer_id(), 16, 11).unwrap(), b"from a peer");

    peer.disconnect().unwrap();
    owner.disconnect().unwrap();
    fixture.shutdown();
}

#[test]
fn test_closed_region_is_withdrawn() {
    let fixture = ServerFixture::new().unwrap();
    let owner = fixture.connect().unwrap();
    let peer = fixture.connect().unwrap();

    owner.open_region().unwrap();
    assert!(wait_until(SETTLE, || fixture.server.directory().len() == 1));
    peer.request_regions().unwrap();
    assert!(peer.directory().contains(owner.peer_id()));

    owner.close_region().unwrap();
    assert!(wait_until(SETTLE, || {
        fixture
            .server
            .directory()
            .get(owner.peer_id())
            .is_some_and(|e| !e.is_open())
    }));

    peer.request_regions().unwrap();
    assert!(!peer.directory().contains(owner.peer_id()));

    peer.disconnect().unwrap();
    owner.disconnect().unwrap();
    fixture.shutdown();
}

// ============================================================================
// Teardown
// ============================================================================

/// DISCONNECT tears both sides down and deregisters every region once.
#[test]
fn test_disconnect_tears_down_both_sides() {
    let fixture = ServerFixture::new().unwrap();
    let client = fixture.connect().unwrap();
    client.request_regions().unwrap();
    assert_eq!(fixture.server.connections().len(), 1);
    assert_eq!(fixture.fabric.registered_regions(), 4);

    client.disconnect().unwrap();
    assert!(client.session().is_torn_down());
    assert_eq!(client.session().stats().regions_deregistered, 2);

    assert!(wait_until(SETTLE, || {
        fixture.server.stats().connections_closed == 1 && fixture.fabric.registered_regions() == 0
    }));
    assert!(fixture.server.connections().is_empty());
    assert!(fixture.server.directory().is_empty());
    let stats = fixture.server.stats();
    assert_eq!(stats.teardown_failures, 0);
    assert_eq!(stats.regions_deregistered, 2);

    // Second disconnect is a no-op and operations report Closed
    client.disconnect().unwrap();
    assert!(!client.session().teardown(TeardownMode::Active).unwrap());
    assert_eq!(client.session().stats().regions_deregistered, 2);
    assert!(matches!(
        client.write_inline(0, b"late"),
        Err(SessionError::Closed)
    ));
    fixture.shutdown();
}

#[test]
fn test_finished_agents_are_reaped() {
    let fixture = ServerFixture::new().unwrap();
    let client = fixture.connect().unwrap();
    assert_eq!(agent_count(&fixture), 1);

    client.disconnect().unwrap();
    assert!(wait_until(SETTLE, || agent_count(&fixture) == 0));
    assert_eq!(fixture.server.tasks(), vec![TaskPurpose::Acceptor]);

    let next = fixture.connect().unwrap();
    assert_eq!(agent_count(&fixture), 1);
    assert_eq!(fixture.server.stats().connections_closed, 1);

    next.disconnect().unwrap();
    fixture.shutdown();
}

#[test]
fn test_server_shutdown_disconnects_clients() {
    let fixture = ServerFixture::new().unwrap();
    let first = fixture.connect().unwrap();
    let second = fixture.connect().unwrap();
    assert_eq!(fixture.server.connections().len(), 2);
    assert_eq!(agent_count(&fixture), 2);
    assert_eq!(fixture.server.stats().connections_closed, 0);

    fixture.server.shutdown();
    assert!(first.session().is_torn_down());
    assert!(second.session().is_torn_down());
    assert!(fixture.server.connections().is_empty());
    let stats = fixture.server.stats();
    assert_eq!(stats.connections_closed, 2);
    assert_eq!(stats.teardown_failures, 0);
    assert_eq!(stats.regions_deregistered, 4);

    first.disconnect().unwrap();
    second.disconnect().unwrap();
    assert_eq!(fixture.fabric.registered_regions(), 0);
}

#[test]
fn test_request_after_server_leaves_reports_closed() {
    let fixture = ServerFixture::new().unwrap();
    let client = fixture.connect().unwrap();

    fixture.server.shutdown();
    assert!(matches!(
        client.request_regions(),
        Err(SessionError::Closed)
    ));
    client.disconnect().unwrap();
}

#[test]
fn test_clients_connect_one_after_another() {
    let fixture = ServerFixture::new().unwrap();
    for round in 0..3u8 {
        let client = fixture.connect().unwrap();
        client.write_inline(0, &[round; 4]).unwrap();
        assert_eq!(client.read(0, 4).unwrap(), vec![round; 4]);
        client.disconnect().unwrap();
    }
    assert!(wait_until(SETTLE, || fixture.server.connections().is_empty()));
    fixture.shutdown();
}

#[test]
fn test_connect_to_unbound_port_is_rejected() {
    let fabric = SoftFabric::in_memory();
    let err = rmem_core::Client::connect(
        &fabric,
        "127.0.0.1:50001".parse().unwrap(),
        &ClientConfig::default(),
    )
    .unwrap_err();
    assert!(err.is_fatal());
}

// ============================================================================
// TCP Links
// ============================================================================

#[test]
fn test_tcp_fabric_handshake_and_read_back() {
    let server_fabric: Arc<dyn Fabric> = Arc::new(SoftFabric::tcp());
    let server = rmem_core::Server::bind(server_fabric, ServerConfig::default(), 0).unwrap();
    let addr = format!("127.0.0.1:{}", server.port()).parse().unwrap();

    let client_fabric = SoftFabric::tcp();
    let client = rmem_core::Client::connect(&client_fabric, addr, &ClientConfig::default()).unwrap();
    assert_eq!(client.server_target().unwrap().length, MIB);

    client.write_inline(8, b"over tcp").unwrap();
    assert_eq!(client.read(8, 8).unwrap(), b"over tcp");

    client.request_regions().unwrap();
    assert_eq!(server.directory().len(), 1);

    client.disconnect().unwrap();
    assert!(wait_until(SETTLE, || server.connections().is_empty()));
    server.shutdown();
}

//! Credential exchange, run once per session right after establishment.
//!
//! Each side sends a 30-byte message: address (8), remote key (4) and region
//! length (8), little-endian, followed by 10 zero bytes, carried inline. The
//! receive lands in `data[0..30]` and the whole data region is zeroed once it
//! has been decoded.
//!
//! The server only sends after its region is clean, so a client that has its
//! credential can write into the server region without racing the zeroing.

use crate::config::{CREDENTIAL_MESSAGE_LEN, CREDENTIAL_PAYLOAD_LEN, MIN_REGION_LEN};
use crate::error::{Result, SessionError, WireError};
use crate::ops::RemoteTarget;
use crate::session::Session;
use rmem_transport::{RKey, Sge};
use tracing::{info, trace};

/// Which fields a role reads from the peer's message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Contract {
    /// Address, key and length (the client learns the server region size)
    Client,
    /// Address and key only
    Server,
}

/// What a peer handed over about its data region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteCredential {
    /// Base address
    pub addr: u64,
    /// Remote key
    pub rkey: RKey,
    /// Region length; absent under the server contract
    pub length: Option<u64>,
}

impl RemoteCredential {
    /// Target for the executor, when the length is known
    #[must_use]
    pub fn target(&self) -> Option<RemoteTarget> {
        self.length.map(|length| RemoteTarget {
            addr: self.addr,
            rkey: self.rkey,
            length,
        })
    }
}

/// Build the 30-byte credential message
#[must_use]
pub fn encode_credential(addr: u64, rkey: RKey, length: u64) -> [u8; CREDENTIAL_MESSAGE_LEN] {
    let mut msg = [0u8; CREDENTIAL_MESSAGE_LEN];
    msg[0..8].copy_from_slice(&addr.to_le_bytes());
    msg[8..12].copy_from_slice(&rkey.to_le_bytes());
    msg[12..20].copy_from_slice(&length.to_le_bytes());
    msg
}

/// Parse a credential message under `contract`
///
/// # Errors
///
/// Returns [`WireError::TooShort`] if the bytes the contract reads are
/// missing. The server contract needs only the first 12 bytes.
pub fn decode_credential(
    bytes: &[u8],
    contract: Contract,
) -> std::result::Result<RemoteCredential, WireError> {
    let needed = match contract {
        Contract::Client => CREDENTIAL_PAYLOAD_LEN,
        Contract::Server => 12,
    };
    if bytes.len() < needed {
        return Err(WireError::TooShort {
            expected: needed,
            actual: bytes.len(),
        });
    }

    let mut addr = [0u8; 8];
    addr.copy_from_slice(&bytes[0..8]);
    let mut rkey = [0u8; 4];
    rkey.copy_from_slice(&bytes[8..12]);
    let length = match contract {
        Contract::Client => {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&bytes[12..20]);
            Some(u64::from_le_bytes(raw))
        }
        Contract::Server => None,
    };

    Ok(RemoteCredential {
        addr: u64::from_le_bytes(addr),
        rkey: u32::from_le_bytes(rkey),
        length,
    })
}

/// Swap credentials with the peer and store the one received
///
/// # Errors
///
/// Fails if a post or completion fails, the message is malformed, or the
/// session already holds a credential.
pub fn exchange(session: &Session, contract: Contract) -> Result<RemoteCredential> {
    let mr = session.data_region();
    if mr.length() < MIN_REGION_LEN {
        return Err(SessionError::InvalidConfig(
            format!("data region of {} bytes cannot stage the exchange", mr.length()).into(),
        ));
    }

    let outgoing = encode_credential(mr.addr(), mr.rkey(), mr.length() as u64);
    info!(
        "sending credential: addr {:#x}, rkey {:#x}, length {}",
        mr.addr(),
        mr.rkey(),
        mr.length()
    );
    trace!("credential bytes: {}", hex::encode(outgoing));

    let recv_wr = session.next_wr_id();
    session
        .cm_id()
        .post_receive(recv_wr, mr, 0, CREDENTIAL_MESSAGE_LEN)
        .map_err(|e| SessionError::setup("ibv_post_recv", e))?;

    let credential = match contract {
        Contract::Client => {
            send_credential(session, &outgoing)?;
            receive_credential(session, contract)?
        }
        Contract::Server => {
            let credential = receive_credential(session, contract)?;
            send_credential(session, &outgoing)?;
            credential
        }
    };

    info!(
        "received credential: addr {:#x}, rkey {:#x}, length {:?}",
        credential.addr, credential.rkey, credential.length
    );
    session.set_remote(credential)?;
    Ok(credential)
}

fn send_credential(session: &Session, outgoing: &[u8]) -> Result<()> {
    session.post_and_wait(|id, wr_id| id.post_send(wr_id, Some(Sge::Inline(outgoing)), None))?;
    Ok(())
}

/// Wait for the peer's message, decode it and clear the data region
fn receive_credential(session: &Session, contract: Contract) -> Result<RemoteCredential> {
    let mr = session.data_region();
    let wc = session.cm_id().poll_receive_completion()?;
    if !wc.is_success() {
        return Err(SessionError::CompletionFailed {
            opcode: wc.opcode,
            status: wc.status,
        });
    }

    let incoming = mr
        .read(0, wc.byte_len as usize)
        .ok_or(SessionError::invalid_state("credential outside data region"))?;
    trace!("received credential bytes: {}", hex::encode(&incoming));
    let credential = decode_credential(&incoming, contract)?;
    mr.zero();
    Ok(credential)
}

//! Fuzz target for the credential and directory-entry decoders
//!
//! Both decoders must reject short input with an error and never panic.

#![no_main]

use libfuzzer_sys::fuzz_target;
use rmem_core::{Contract, PeerEntry, decode_credential};

fuzz_target!(|data: &[u8]| {
    if let Ok(credential) = decode_credential(data, Contract::Client) {
        assert!(data.len() >= 20);
        assert!(credential.length.is_some());
    }
    if let Ok(credential) = decode_credential(data, Contract::Server) {
        assert!(data.len() >= 12);
        assert!(credential.length.is_none());
    }

    if let Ok(entry) = PeerEntry::decode(data) {
        assert_eq!(&entry.encode()[..], &data[..28]);
    }
});

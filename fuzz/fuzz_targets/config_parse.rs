//! Fuzz target for configuration parsing
//!
//! Arbitrary TOML must either fail to parse or produce a configuration whose
//! validation returns without panicking.

#![no_main]

use libfuzzer_sys::fuzz_target;
use rmem_core::{ClientConfig, ServerConfig};

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    if let Ok(config) = toml::from_str::<ClientConfig>(text) {
        let _ = config.validate();
    }
    if let Ok(config) = toml::from_str::<ServerConfig>(text) {
        let _ = config.validate();
    }
});

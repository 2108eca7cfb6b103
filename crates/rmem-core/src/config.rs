//! Session, client and server configuration.

use crate::error::{Result, SessionError};
use rmem_transport::{ConnParams, QpCaps};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Size of the credential message exchanged in each direction
pub const CREDENTIAL_MESSAGE_LEN: usize = 30;

/// Bytes of the credential message that carry data (address, rkey, length)
pub const CREDENTIAL_PAYLOAD_LEN: usize = 20;

/// Encoded size of a directory entry carried by control messages
pub const DIRECTORY_ENTRY_LEN: usize = 28;

/// Data region registered by each server agent (1 MiB)
pub const DEFAULT_SERVER_REGION_LEN: usize = 1024 * 1024;

/// Data region registered by a client (64 KiB)
pub const DEFAULT_CLIENT_REGION_LEN: usize = 64 * 1024;

/// Bounded wait for address/route resolution and connection establishment
pub const DEFAULT_RESOLVE_TIMEOUT_MS: u64 = 10_000;

/// Connection requests a listening endpoint delivers before it is rebuilt
pub const LISTEN_BACKLOG: u32 = 1;

/// Smallest data region accepted: room for two credential messages.
pub const MIN_REGION_LEN: usize = 2 * CREDENTIAL_MESSAGE_LEN;

fn default_resolve_timeout_ms() -> u64 {
    DEFAULT_RESOLVE_TIMEOUT_MS
}

fn default_connect_timeout_ms() -> u64 {
    DEFAULT_RESOLVE_TIMEOUT_MS
}

fn default_teardown_timeout_ms() -> u64 {
    DEFAULT_RESOLVE_TIMEOUT_MS
}

fn default_client_region_len() -> usize {
    DEFAULT_CLIENT_REGION_LEN
}

fn default_server_region_len() -> usize {
    DEFAULT_SERVER_REGION_LEN
}

/// Parameters shared by both roles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Wait for `ADDR_RESOLVED` and `ROUTE_RESOLVED`, in milliseconds
    #[serde(default = "default_resolve_timeout_ms")]
    pub resolve_timeout_ms: u64,

    /// Wait for `ESTABLISHED`, in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Wait for `DISCONNECTED` during teardown, in milliseconds
    #[serde(default = "default_teardown_timeout_ms")]
    pub teardown_timeout_ms: u64,

    /// Queue pair capacities
    #[serde(default)]
    pub qp_caps: QpCaps,

    /// Connect/accept parameters
    #[serde(default)]
    pub conn_params: ConnParams,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            resolve_timeout_ms: DEFAULT_RESOLVE_TIMEOUT_MS,
            connect_timeout_ms: DEFAULT_RESOLVE_TIMEOUT_MS,
            teardown_timeout_ms: DEFAULT_RESOLVE_TIMEOUT_MS,
            qp_caps: QpCaps::default(),
            conn_params: ConnParams::default(),
        }
    }
}

impl SessionConfig {
    /// Resolution timeout as a [`Duration`]
    #[must_use]
    pub fn resolve_timeout(&self) -> Duration {
        Duration::from_millis(self.resolve_timeout_ms)
    }

    /// Establishment timeout as a [`Duration`]
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Teardown timeout as a [`Duration`]
    #[must_use]
    pub fn teardown_timeout(&self) -> Duration {
        Duration::from_millis(self.teardown_timeout_ms)
    }

    /// Inline ceiling in bytes
    #[must_use]
    pub fn inline_ceiling(&self) -> usize {
        self.qp_caps.max_inline_data as usize
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::InvalidConfig`] if a timeout is zero, a queue
    /// is empty, or the inline ceiling cannot carry a credential message.
    pub fn validate(&self) -> Result<()> {
        if self.resolve_timeout_ms == 0
            || self.connect_timeout_ms == 0
            || self.teardown_timeout_ms == 0
        {
            return Err(SessionError::invalid_config("timeouts must be non-zero"));
        }
        if self.qp_caps.max_send_wr == 0 || self.qp_caps.max_recv_wr == 0 {
            return Err(SessionError::invalid_config(
                "queue pair needs at least one send and one receive work request",
            ));
        }
        let needed = CREDENTIAL_MESSAGE_LEN.max(DIRECTORY_ENTRY_LEN);
        if self.inline_ceiling() < needed {
            return Err(SessionError::InvalidConfig(
                format!(
                    "inline ceiling of {} bytes cannot carry a {}-byte message",
                    self.inline_ceiling(),
                    needed
                )
                .into(),
            ));
        }
        Ok(())
    }
}

/// Client configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Session parameters
    #[serde(default)]
    pub session: SessionConfig,

    /// Length of the local data region
    #[serde(default = "default_client_region_len")]
    pub region_length: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            region_length: DEFAULT_CLIENT_REGION_LEN,
        }
    }
}

impl ClientConfig {
    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::InvalidConfig`] on an invalid session section
    /// or a region too small for the credential exchange.
    pub fn validate(&self) -> Result<()> {
        self.session.validate()?;
        validate_region(self.region_length)
    }
}

/// Server configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Session parameters for every accepted connection
    #[serde(default)]
    pub session: SessionConfig,

    /// Length of the region each agent registers
    #[serde(default = "default_server_region_len")]
    pub region_length: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            region_length: DEFAULT_SERVER_REGION_LEN,
        }
    }
}

impl ServerConfig {
    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::InvalidConfig`] on an invalid session section
    /// or a region too small for the credential exchange.
    pub fn validate(&self) -> Result<()> {
        self.session.validate()?;
        validate_region(self.region_length)
    }
}

fn validate_region(length: usize) -> Result<()> {
    if length < MIN_REGION_LEN {
        return Err(SessionError::InvalidConfig(
            format!("region of {length} bytes is smaller than {MIN_REGION_LEN}").into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(SessionConfig::default().validate().is_ok());
        assert!(ClientConfig::default().validate().is_ok());
        assert!(ServerConfig::default().validate().is_ok());
        assert_eq!(ServerConfig::default().region_length, 1_048_576);
        assert_eq!(
            SessionConfig::default().resolve_timeout(),
            Duration::from_secs(10)
        );
    }

    #[test]
    fn test_small_region_rejected() {
        let config = ClientConfig {
            region_length: 59,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(SessionError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_small_inline_ceiling_rejected() {
        let mut config = SessionConfig::default();
        config.qp_caps.max_inline_data = 16;
        assert!(config.validate().is_err());

        // Room for a directory entry but not a credential
        config.qp_caps.max_inline_data = 29;
        assert!(config.validate().is_err());
        config.qp_caps.max_inline_data = 30;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let config = SessionConfig {
            connect_timeout_ms: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}

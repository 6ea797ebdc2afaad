//! Connection system configuration.
use serde::{Deserialize, Serialize};

use crate::common::time::LocalDuration;
use crate::error::ConfigError;

/// Default time between two outgoing frames to the same peer.
pub const DEFAULT_KEEP_ALIVE_INTERVAL: LocalDuration = LocalDuration::from_millis(300);
/// Default silence period after which a peer is considered gone.
pub const DEFAULT_KEEP_ALIVE_TIMEOUT: LocalDuration = LocalDuration::from_millis(1500);

/// Connection system configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Identifies the embedding communication user in log output.
    pub communication_user_id: u32,
    /// Protocol version; messages with any other version are dropped.
    pub protocol_version: u16,
    /// Whether the initiator/responder handshake is spoken. When disabled
    /// only the fallback protocol is used and announced.
    pub enable_initiator_responder: bool,
    /// Time between two outgoing frames to the same peer.
    pub keep_alive_interval: LocalDuration,
    /// Silence period after which a peer is considered gone.
    pub keep_alive_timeout: LocalDuration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            communication_user_id: 1,
            protocol_version: 1,
            enable_initiator_responder: true,
            keep_alive_interval: DEFAULT_KEEP_ALIVE_INTERVAL,
            keep_alive_timeout: DEFAULT_KEEP_ALIVE_TIMEOUT,
        }
    }
}

impl Config {
    /// Check the configuration for consistency.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.communication_user_id == 0 {
            return Err(ConfigError::InvalidUserId);
        }
        if self.protocol_version == 0 {
            return Err(ConfigError::InvalidProtocolVersion);
        }
        if self.keep_alive_disabled() {
            tracing::warn!(
                target: "connsys",
                "keep-alive disabled, for testing only"
            );
        } else if self.keep_alive_timeout <= self.keep_alive_interval
            || self.keep_alive_interval.is_zero()
        {
            return Err(ConfigError::InvalidKeepAlive);
        }
        Ok(())
    }

    /// Whether the keep-alive worker is disabled. Testing only.
    pub fn keep_alive_disabled(&self) -> bool {
        self.keep_alive_interval.is_zero() && self.keep_alive_timeout.is_zero()
    }
}

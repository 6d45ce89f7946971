//! Connector configuration.
//!
//! Keys are camelCase and durations are whole milliseconds, so a host can
//! hand over the same JSON object it already stores for the service:
//!
//! ```json
//! { "callTimeoutDefault": 2000, "heartbeatInterval": 1000, "heartbeatMissedThreshold": 3 }
//! ```

use std::time::Duration;

use hostlink_frame::{CodecLimits, DEFAULT_MAX_MESSAGE_SIZE, DEFAULT_MAX_NESTING_DEPTH, HEADER_SIZE};
use serde::{Deserialize, Serialize};

use crate::error::{ConnectorError, Result};
use crate::handshake::HandshakeConfig;

/// Behaviour of a [`Connector`](crate::Connector).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct ConnectorConfig {
    /// Upper bound for one frame, header excluded.
    pub max_message_size: usize,
    pub max_nesting_depth: usize,
    /// Timeout used by [`Connector::call_default`](crate::Connector::call_default).
    #[serde(with = "millis")]
    pub call_timeout_default: Duration,
    /// Probe period while READY. Zero disables heartbeats.
    #[serde(with = "millis")]
    pub heartbeat_interval: Duration,
    /// Intervals without inbound traffic before the peer is declared dead.
    pub heartbeat_missed_threshold: u32,
    #[serde(with = "millis")]
    pub reconnect_backoff_initial: Duration,
    #[serde(with = "millis")]
    pub reconnect_backoff_max: Duration,
    /// Zero means a degraded connection is given up immediately.
    pub reconnect_backoff_max_attempts: u32,
    #[serde(with = "millis")]
    pub connect_timeout: Duration,
    /// Consecutive undecodable frames tolerated before teardown.
    pub max_consecutive_protocol_errors: u32,
    pub handshake: HandshakeConfig,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            max_nesting_depth: DEFAULT_MAX_NESTING_DEPTH,
            call_timeout_default: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(5),
            heartbeat_missed_threshold: 3,
            reconnect_backoff_initial: Duration::from_millis(100),
            reconnect_backoff_max: Duration::from_secs(10),
            reconnect_backoff_max_attempts: 5,
            connect_timeout: Duration::from_secs(5),
            max_consecutive_protocol_errors: 8,
            handshake: HandshakeConfig::default(),
        }
    }
}

impl ConnectorConfig {
    /// Parse from JSON; missing keys keep their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|err| ConnectorError::InvalidConfig(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check that values are usable together.
    pub fn validate(&self) -> Result<()> {
        if self.max_message_size <= HEADER_SIZE || self.max_message_size > u32::MAX as usize {
            return Err(invalid(format!(
                "maxMessageSize must be between {} and {}, got {}",
                HEADER_SIZE + 1,
                u32::MAX,
                self.max_message_size
            )));
        }
        if self.max_nesting_depth == 0 {
            return Err(invalid("maxNestingDepth must be at least 1".to_string()));
        }
        if self.call_timeout_default.is_zero() {
            return Err(invalid("callTimeoutDefault must be positive".to_string()));
        }
        if self.heartbeats_enabled() && self.heartbeat_missed_threshold == 0 {
            return Err(invalid(
                "heartbeatMissedThreshold must be at least 1 when heartbeats are enabled".to_string(),
            ));
        }
        if self.reconnect_backoff_initial.is_zero() {
            return Err(invalid("reconnectBackoffInitial must be positive".to_string()));
        }
        if self.reconnect_backoff_max < self.reconnect_backoff_initial {
            return Err(invalid(format!(
                "reconnectBackoffMax ({:?}) is below reconnectBackoffInitial ({:?})",
                self.reconnect_backoff_max, self.reconnect_backoff_initial
            )));
        }
        if self.connect_timeout.is_zero() {
            return Err(invalid("connectTimeout must be positive".to_string()));
        }
        if self.max_consecutive_protocol_errors == 0 {
            return Err(invalid(
                "maxConsecutiveProtocolErrors must be at least 1".to_string(),
            ));
        }
        self.handshake.validate()
    }

    pub fn heartbeats_enabled(&self) -> bool {
        !self.heartbeat_interval.is_zero()
    }

    /// Silence tolerated before the connection is declared degraded.
    pub fn heartbeat_deadline(&self) -> Duration {
        self.heartbeat_interval
            .saturating_mul(self.heartbeat_missed_threshold)
    }

    pub fn codec_limits(&self) -> CodecLimits {
        CodecLimits {
            max_message_size: self.max_message_size,
            max_nesting_depth: self.max_nesting_depth,
        }
    }
}

fn invalid(reason: String) -> ConnectorError {
    ConnectorError::InvalidConfig(reason)
}

/// `Duration` as integer milliseconds.
pub(crate) mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        u64::try_from(duration.as_millis())
            .unwrap_or(u64::MAX)
            .serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

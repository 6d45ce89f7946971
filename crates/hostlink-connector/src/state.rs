use std::fmt;

/// Lifecycle state of a [`Connector`](crate::Connector).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Handshaking,
    Ready,
    /// Connection lost; reconnection in progress.
    Degraded,
    Closing,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "DISCONNECTED",
            Self::Connecting => "CONNECTING",
            Self::Handshaking => "HANDSHAKING",
            Self::Ready => "READY",
            Self::Degraded => "DEGRADED",
            Self::Closing => "CLOSING",
        }
    }

    /// States in which `connect` returns without starting a new attempt.
    pub(crate) fn is_active(self) -> bool {
        matches!(
            self,
            Self::Connecting | Self::Handshaking | Self::Ready | Self::Degraded
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

use std::time::Duration;

use crate::state::ConnectionState;

/// Errors that can occur in connector operations.
#[derive(Debug, thiserror::Error)]
pub enum ConnectorError {
    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] hostlink_transport::TransportError),

    /// Frame-level error.
    #[error("frame error: {0}")]
    Frame(#[from] hostlink_frame::FrameError),

    /// The operation needs a READY connection.
    #[error("not connected (state {0})")]
    NotConnected(ConnectionState),

    /// No response arrived before the call deadline.
    #[error("call timed out after {0:?}")]
    CallTimeout(Duration),

    /// The connector was closed while the operation was outstanding, or
    /// has been closed for good.
    #[error("connector closed")]
    ConnectorClosed,

    /// The peer speaks a protocol or version we cannot talk to.
    #[error("incompatible peer: {0}")]
    IncompatiblePeer(String),

    /// The handshake exchange itself went wrong.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// The connection dropped while the operation was outstanding.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// Topic is empty or reserved for the protocol.
    #[error("invalid topic '{0}'")]
    InvalidTopic(String),

    /// A configuration value is out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Peer disconnected.
    #[error("peer disconnected: {0}")]
    Disconnected(String),

    /// A blocking step outside a call timed out.
    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

impl ConnectorError {
    /// True for failures the reconnection policy may recover from.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(err) => !matches!(
                err,
                hostlink_transport::TransportError::InvalidEndpoint(_)
                    | hostlink_transport::TransportError::PathTooLong { .. }
            ),
            Self::Frame(err) => !err.is_protocol(),
            Self::CallTimeout(_)
            | Self::ConnectionLost(_)
            | Self::Disconnected(_)
            | Self::Timeout(_) => true,
            Self::NotConnected(_)
            | Self::ConnectorClosed
            | Self::IncompatiblePeer(_)
            | Self::HandshakeFailed(_)
            | Self::InvalidTopic(_)
            | Self::InvalidConfig(_) => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, ConnectorError>;

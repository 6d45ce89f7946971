use std::path::PathBuf;
use std::time::Duration;

/// Errors that can occur in transport channel operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The endpoint string could not be interpreted.
    #[error("invalid endpoint '{0}'")]
    InvalidEndpoint(String),

    /// Nothing is listening at the endpoint.
    #[error("connection refused by {endpoint}")]
    ConnectionRefused { endpoint: String },

    /// The connect deadline elapsed.
    #[error("connect to {endpoint} timed out after {timeout:?}")]
    Timeout { endpoint: String, timeout: Duration },

    /// Failed to connect for any other reason.
    #[error("failed to connect to {endpoint}: {source}")]
    Connect {
        endpoint: String,
        source: std::io::Error,
    },

    /// The peer closed its end while we were writing.
    #[error("broken pipe (peer closed the channel)")]
    BrokenPipe,

    /// Failed to bind to the specified address.
    #[error("failed to bind to {endpoint}: {source}")]
    Bind {
        endpoint: String,
        source: std::io::Error,
    },

    /// Failed to accept an incoming connection.
    #[error("failed to accept connection: {0}")]
    Accept(std::io::Error),

    /// An I/O error occurred on the transport stream.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The socket path is too long for the platform.
    #[error("socket path too long ({len} bytes, max {max}): {path}")]
    PathTooLong {
        path: PathBuf,
        len: usize,
        max: usize,
    },
}

impl TransportError {
    /// Classify a raw connect failure against `endpoint`.
    pub(crate) fn from_connect(endpoint: &str, timeout: Duration, source: std::io::Error) -> Self {
        match source.kind() {
            std::io::ErrorKind::ConnectionRefused | std::io::ErrorKind::NotFound => {
                Self::ConnectionRefused {
                    endpoint: endpoint.to_string(),
                }
            }
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => Self::Timeout {
                endpoint: endpoint.to_string(),
                timeout,
            },
            _ => Self::Connect {
                endpoint: endpoint.to_string(),
                source,
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;

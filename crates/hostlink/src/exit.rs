use std::fmt;
use std::io;

use hostlink_connector::ConnectorError;
use hostlink_frame::FrameError;
use hostlink_transport::TransportError;

pub const SUCCESS: i32 = 0;
pub const FAILURE: i32 = 1;
pub const TRANSPORT_ERROR: i32 = 3;
/// Handshake refused or garbled: the two sides cannot talk.
pub const PROTOCOL_MISMATCH: i32 = 4;
pub const PERMISSION_DENIED: i32 = 50;
pub const DATA_INVALID: i32 = 60;
pub const USAGE: i32 = 64;
pub const TIMEOUT: i32 = 124;
pub const INTERNAL: i32 = 125;

pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug)]
pub struct CliError {
    pub code: i32,
    pub message: String,
}

impl CliError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CliError {}

pub fn io_error(context: &str, err: io::Error) -> CliError {
    let code = match err.kind() {
        io::ErrorKind::PermissionDenied => PERMISSION_DENIED,
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TIMEOUT,
        io::ErrorKind::ConnectionRefused | io::ErrorKind::NotFound => TRANSPORT_ERROR,
        _ => INTERNAL,
    };
    CliError::new(code, format!("{context}: {err}"))
}

pub fn transport_error(context: &str, err: TransportError) -> CliError {
    match err {
        TransportError::Bind { source, .. }
        | TransportError::Connect { source, .. }
        | TransportError::Accept(source)
        | TransportError::Io(source) => io_error(context, source),
        TransportError::Timeout { .. } => CliError::new(TIMEOUT, format!("{context}: {err}")),
        TransportError::InvalidEndpoint(_) | TransportError::PathTooLong { .. } => {
            CliError::new(USAGE, format!("{context}: {err}"))
        }
        other => CliError::new(TRANSPORT_ERROR, format!("{context}: {other}")),
    }
}

pub fn frame_error(context: &str, err: FrameError) -> CliError {
    match err {
        FrameError::Io(source) => io_error(context, source),
        FrameError::MalformedMessage(_)
        | FrameError::OversizedMessage { .. }
        | FrameError::UnknownKind(_) => CliError::new(DATA_INVALID, format!("{context}: {err}")),
        FrameError::ConnectionClosed => CliError::new(FAILURE, format!("{context}: {err}")),
    }
}

pub fn connector_error(context: &str, err: ConnectorError) -> CliError {
    match err {
        ConnectorError::Transport(err) => transport_error(context, err),
        ConnectorError::Frame(err) => frame_error(context, err),
        ConnectorError::CallTimeout(_) | ConnectorError::Timeout(_) => {
            CliError::new(TIMEOUT, format!("{context}: {err}"))
        }
        ConnectorError::IncompatiblePeer(_) | ConnectorError::HandshakeFailed(_) => {
            CliError::new(PROTOCOL_MISMATCH, format!("{context}: {err}"))
        }
        ConnectorError::InvalidTopic(_) | ConnectorError::InvalidConfig(_) => {
            CliError::new(USAGE, format!("{context}: {err}"))
        }
        ConnectorError::NotConnected(_)
        | ConnectorError::ConnectorClosed
        | ConnectorError::ConnectionLost(_)
        | ConnectorError::Disconnected(_) => CliError::new(FAILURE, format!("{context}: {err}")),
    }
}

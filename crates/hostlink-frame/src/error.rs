/// Errors that can occur during message and frame encoding/decoding.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// A tag/type pair is inconsistent, the data is truncated, or nesting
    /// exceeds the configured limit.
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// The declared or encoded size exceeds the configured maximum.
    #[error("message too large ({size} bytes, max {max})")]
    OversizedMessage { size: usize, max: usize },

    /// The envelope kind byte is not one we understand.
    #[error("unknown envelope kind {0:#04x}")]
    UnknownKind(u8),

    /// An I/O error occurred while reading or writing frames.
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The connection was closed (cleanly, or with an incomplete frame buffered).
    #[error("connection closed")]
    ConnectionClosed,
}

impl FrameError {
    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedMessage(reason.into())
    }

    /// True for errors confined to a single frame; the stream is still in sync.
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            Self::MalformedMessage(_) | Self::OversizedMessage { .. } | Self::UnknownKind(_)
        )
    }

    /// True when a read or write hit a timeout rather than a failure.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::Io(err) if matches!(
                err.kind(),
                std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
            )
        )
    }
}

pub type Result<T> = std::result::Result<T, FrameError>;

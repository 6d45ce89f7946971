//! Duplex byte-stream transport channel.
//!
//! Provides a unified interface over the local transport mechanisms a host
//! uses to reach an out-of-process service:
//! - Unix domain sockets (Linux/macOS)
//! - TCP loopback or LAN addresses
//!
//! This is the lowest layer of hostlink. It performs no framing; everything
//! else builds on top of the [`IpcStream`] type provided here.

pub mod endpoint;
pub mod error;
pub mod listener;
pub mod stream;

pub use endpoint::Endpoint;
pub use error::{Result, TransportError};
pub use listener::IpcListener;
pub use stream::{classify_write_error, connect, IpcStream};

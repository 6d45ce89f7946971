//! Bridge a host application to an out-of-process service.
//!
//! hostlink carries tagged binary messages over a local byte stream,
//! correlates requests with responses, routes topic notifications, and keeps
//! the connection alive with heartbeats and backoff reconnection.
//!
//! # Crate Structure
//!
//! - [`transport`]: endpoints, connected streams and listeners (Unix sockets, TCP)
//! - [`frame`]: the message codec and length-prefixed envelope framing
//! - [`connector`]: connection lifecycle, calls, subscriptions, heartbeats

/// Re-export transport types.
pub mod transport {
    pub use hostlink_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use hostlink_frame::*;
}

/// Re-export connector types.
pub mod connector {
    pub use hostlink_connector::*;
}

pub use hostlink_connector::{
    ConnectionState, Connector, ConnectorConfig, ConnectorError, ConnectorEvent,
};
pub use hostlink_frame::{Message, Value};

//! Connection lifecycle for out-of-process services.
//!
//! This is the "just works" layer. A [`Connector`] connects to a service,
//! handshakes, correlates calls with their responses, routes topic
//! notifications to subscribers, probes the peer with heartbeats and
//! reconnects with backoff when the connection degrades.
//!
//! ```no_run
//! use std::time::Duration;
//! use hostlink_connector::{Connector, ConnectorConfig};
//! use hostlink_frame::Message;
//!
//! let connector = Connector::new(ConnectorConfig::default())?;
//! connector.connect("unix:/run/quotes.sock")?;
//! let reply = connector.call(Message::new().with(1, "ping"), Duration::from_secs(2))?;
//! assert_eq!(reply.get_str(1), Some("pong"));
//! # Ok::<(), hostlink_connector::ConnectorError>(())
//! ```

pub mod backoff;
pub mod config;
pub mod connector;
pub mod control;
pub mod error;
pub mod event;
pub mod handshake;
pub mod heartbeat;
pub mod multiplexer;
pub mod service;
pub mod state;

pub use backoff::Backoff;
pub use config::ConnectorConfig;
pub use connector::{Connector, Handler};
pub use control::{
    is_reserved_topic, topic_of, validate_topic, with_topic, HeartbeatMarker, HEARTBEAT_MARKER_TAG,
    RESERVED_TOPIC_PREFIX, TOPIC_HELLO, TOPIC_REJECT, TOPIC_TAG, TOPIC_WELCOME,
};
pub use error::{ConnectorError, Result};
pub use event::ConnectorEvent;
pub use handshake::{
    handshake_client, handshake_server, is_version_compatible, HandshakeConfig, HandshakeResult,
};
pub use heartbeat::HeartbeatMonitor;
pub use multiplexer::{Completion, Dispatch, Multiplexer, Waiter};
pub use service::{ServiceListener, ServiceSession};
pub use state::ConnectionState;

//! Service side of the protocol.
//!
//! A [`ServiceListener`] accepts connections and runs the server half of the
//! handshake; each accepted connection becomes a [`ServiceSession`] that the
//! service drives by hand. The connector never needs this, but the CLI's
//! `serve` command and the integration tests do.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use hostlink_frame::{CodecLimits, Envelope, EnvelopeKind, FrameConfig, FrameReader, FrameWriter, Message};
use hostlink_transport::{Endpoint, IpcListener, IpcStream};
use tracing::{debug, info, trace};

use crate::control::{validate_topic, with_topic, HeartbeatMarker};
use crate::error::{ConnectorError, Result};
use crate::handshake::{handshake_server, HandshakeConfig, HandshakeResult};

/// Accepts host connections.
pub struct ServiceListener {
    listener: IpcListener,
    handshake_config: HandshakeConfig,
    limits: CodecLimits,
    answer_heartbeats: bool,
    next_peer_id: AtomicU64,
}

impl ServiceListener {
    pub fn bind(endpoint: &Endpoint) -> Result<Self> {
        let listener = IpcListener::bind(endpoint)?;
        info!(endpoint = %listener.endpoint(), "service listening");
        Ok(Self {
            listener,
            handshake_config: HandshakeConfig::default(),
            limits: CodecLimits::default(),
            answer_heartbeats: true,
            next_peer_id: AtomicU64::new(1),
        })
    }

    /// Bind to an endpoint string such as `unix:/run/svc.sock` or `tcp:127.0.0.1:7000`.
    pub fn bind_str(endpoint: &str) -> Result<Self> {
        Self::bind(&Endpoint::parse(endpoint)?)
    }

    pub fn with_handshake_config(mut self, config: HandshakeConfig) -> Self {
        self.handshake_config = config;
        self
    }

    /// Runtime codec limits applied after the handshake.
    pub fn with_limits(mut self, limits: CodecLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Whether sessions answer heartbeat probes inside [`ServiceSession::recv`].
    /// On by default; turning it off simulates a hung service.
    pub fn with_heartbeat_answers(mut self, answer: bool) -> Self {
        self.answer_heartbeats = answer;
        self
    }

    /// Accept the next connection and assign an auto-generated peer id.
    pub fn accept(&self) -> Result<ServiceSession> {
        let id = self.next_peer_id.fetch_add(1, Ordering::Relaxed);
        self.accept_with_id(&format!("peer-{id}"))
    }

    pub fn accept_with_id(&self, peer_id: &str) -> Result<ServiceSession> {
        let stream = self.listener.accept()?;
        let reader_stream = stream.try_clone()?;
        let writer_stream = stream.try_clone()?;

        let frame_config = FrameConfig {
            limits: CodecLimits {
                max_message_size: self.handshake_config.max_handshake_payload,
                max_nesting_depth: self.limits.max_nesting_depth,
            },
            read_timeout: Some(self.handshake_config.timeout),
            write_timeout: Some(self.handshake_config.timeout),
        };
        let mut reader = FrameReader::with_config_ipc(reader_stream, frame_config.clone())?;
        let mut writer = FrameWriter::with_config_ipc(writer_stream, frame_config)?;

        let handshake = match handshake_server(&mut reader, &mut writer, peer_id, &self.handshake_config) {
            Ok(handshake) => handshake,
            Err(err) => {
                let _ = stream.close();
                return Err(err);
            }
        };
        reader.set_limits(self.limits);
        writer.set_limits(self.limits);
        reader.set_read_timeout(None)?;

        debug!(peer_id, "session accepted");
        Ok(ServiceSession {
            stream,
            reader,
            writer,
            handshake,
            answer_heartbeats: self.answer_heartbeats,
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        self.listener.endpoint()
    }
}

/// One accepted host connection.
pub struct ServiceSession {
    stream: IpcStream,
    reader: FrameReader<IpcStream>,
    writer: FrameWriter<IpcStream>,
    handshake: HandshakeResult,
    answer_heartbeats: bool,
}

impl ServiceSession {
    /// Next envelope from the host.
    ///
    /// Heartbeat probes are answered here and not returned, unless heartbeat
    /// answers were turned off on the listener.
    pub fn recv(&mut self) -> Result<Envelope> {
        loop {
            let envelope = self.reader.read_envelope()?;
            if self.answer_heartbeats
                && envelope.kind == EnvelopeKind::Heartbeat
                && HeartbeatMarker::from_message(&envelope.message) == HeartbeatMarker::Probe
            {
                trace!(sequence = envelope.correlation_id, "answering heartbeat probe");
                self.send_heartbeat_ack(envelope.correlation_id)?;
                continue;
            }
            return Ok(envelope);
        }
    }

    /// Bound the wait in [`recv`](Self::recv); `None` blocks indefinitely.
    pub fn set_read_timeout(&mut self, timeout: Option<Duration>) -> Result<()> {
        self.reader.set_read_timeout(timeout)?;
        Ok(())
    }

    /// Answer the request with `correlation_id`.
    pub fn respond(&mut self, correlation_id: u64, message: Message) -> Result<()> {
        self.send(&Envelope::response(correlation_id, message))
    }

    /// Push a notification on `topic`.
    pub fn notify(&mut self, topic: &str, message: Message) -> Result<()> {
        validate_topic(topic)?;
        self.send(&Envelope::notification(with_topic(topic, message)))
    }

    pub fn send_heartbeat_ack(&mut self, sequence: u64) -> Result<()> {
        self.send(&Envelope::heartbeat(sequence, HeartbeatMarker::Ack.to_message()))
    }

    /// Write any envelope as-is.
    pub fn send(&mut self, envelope: &Envelope) -> Result<()> {
        self.writer.write_envelope(envelope).map_err(ConnectorError::from)
    }

    pub fn handshake(&self) -> &HandshakeResult {
        &self.handshake
    }

    pub fn peer_id(&self) -> &str {
        &self.handshake.peer_id
    }

    /// Shut the connection down; the host sees the stream end.
    pub fn close(&self) -> Result<()> {
        self.stream.close()?;
        Ok(())
    }
}

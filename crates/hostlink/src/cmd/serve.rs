use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use hostlink_connector::{ConnectorConfig, ConnectorError, ServiceListener, ServiceSession};
use hostlink_frame::{Envelope, EnvelopeKind, FrameError};
use hostlink_transport::Endpoint;

use crate::cmd::listen::install_ctrlc_handler;
use crate::cmd::ServeArgs;
use crate::exit::{connector_error, transport_error, CliResult, SUCCESS};

pub fn run(args: ServeArgs, config: ConnectorConfig) -> CliResult<i32> {
    let endpoint =
        Endpoint::parse(&args.endpoint).map_err(|err| transport_error("invalid endpoint", err))?;
    let listener = ServiceListener::bind(&endpoint)
        .map_err(|err| connector_error("bind failed", err))?
        .with_handshake_config(config.handshake.clone())
        .with_limits(config.codec_limits());

    let running = Arc::new(AtomicBool::new(true));
    install_ctrlc_handler(running.clone())?;

    while running.load(Ordering::SeqCst) {
        let session = match listener.accept() {
            Ok(session) => session,
            Err(ConnectorError::Transport(err)) => {
                return Err(transport_error("accept failed", err));
            }
            Err(err) => {
                tracing::warn!(error = %err, "handshake failed; waiting for next host");
                continue;
            }
        };

        let name = format!("serve-{}", session.peer_id());
        let spawned = thread::Builder::new()
            .name(name)
            .spawn(move || echo_session(session));
        if let Err(err) = spawned {
            tracing::error!(error = %err, "could not start session thread");
        }
    }

    Ok(SUCCESS)
}

/// Answer every request with its own message and reflect notifications.
fn echo_session(mut session: ServiceSession) {
    let peer_id = session.peer_id().to_string();
    tracing::info!(%peer_id, "host connected");

    loop {
        let envelope = match session.recv() {
            Ok(envelope) => envelope,
            Err(ConnectorError::Frame(FrameError::ConnectionClosed)) => break,
            Err(err) if is_skippable(&err) => {
                tracing::warn!(%peer_id, error = %err, "discarding undecodable frame");
                continue;
            }
            Err(err) => {
                tracing::warn!(%peer_id, error = %err, "session failed");
                break;
            }
        };

        let reply = match envelope.kind {
            EnvelopeKind::Request => Some(Envelope::response(
                envelope.correlation_id,
                envelope.message,
            )),
            EnvelopeKind::Notification => Some(Envelope::notification(envelope.message)),
            EnvelopeKind::Response | EnvelopeKind::Heartbeat => None,
        };
        if let Some(reply) = reply {
            tracing::debug!(
                %peer_id,
                kind = %reply.kind,
                correlation_id = reply.correlation_id,
                "echo"
            );
            if let Err(err) = session.send(&reply) {
                tracing::warn!(%peer_id, error = %err, "send failed");
                break;
            }
        }
    }

    tracing::info!(%peer_id, "host disconnected");
}

fn is_skippable(err: &ConnectorError) -> bool {
    matches!(err, ConnectorError::Frame(frame) if frame.is_protocol())
}

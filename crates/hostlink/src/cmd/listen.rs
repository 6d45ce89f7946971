use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::RecvTimeoutError;
use std::sync::Arc;
use std::time::Duration;

use hostlink_connector::{ConnectorConfig, ConnectorEvent};

use crate::cmd::{connect, ListenArgs};
use crate::exit::{connector_error, CliError, CliResult, FAILURE, INTERNAL, SUCCESS};
use crate::output::{print_message, Origin, OutputFormat};

const POLL: Duration = Duration::from_millis(100);

pub fn run(args: ListenArgs, format: OutputFormat, config: ConnectorConfig) -> CliResult<i32> {
    for topic in &args.topics {
        hostlink_connector::validate_topic(topic)
            .map_err(|err| connector_error("invalid topic", err))?;
    }

    let running = Arc::new(AtomicBool::new(true));
    install_ctrlc_handler(running.clone())?;

    let connector = connect(&args.endpoint, config)?;
    let events = connector.events();
    for topic in &args.topics {
        // Printing happens from the event stream; the handler only marks interest.
        connector
            .subscribe(topic, |_| {})
            .map_err(|err| connector_error("subscribe failed", err))?;
    }
    tracing::info!(topics = ?args.topics, "listening");

    let mut printed = 0usize;
    while running.load(Ordering::SeqCst) {
        let event = match events.recv_timeout(POLL) {
            Ok(event) => event,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };

        match event {
            ConnectorEvent::NotificationReceived { topic, message } => {
                let peer_id = connector.peer_id().unwrap_or_default();
                print_message(&message, Origin::Notification { topic: &topic }, &peer_id, format);
                printed = printed.saturating_add(1);
                if args.count.is_some_and(|count| printed >= count) {
                    break;
                }
            }
            ConnectorEvent::Reconnected { attempts } => {
                tracing::warn!(attempts, "connection restored");
            }
            ConnectorEvent::ConnectionLost { reason } => {
                return Err(CliError::new(FAILURE, format!("connection lost: {reason}")));
            }
        }
    }

    connector.close();
    Ok(SUCCESS)
}

pub(crate) fn install_ctrlc_handler(running: Arc<AtomicBool>) -> CliResult<()> {
    ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
    })
    .map_err(|err| CliError::new(INTERNAL, format!("signal handler setup failed: {err}")))
}

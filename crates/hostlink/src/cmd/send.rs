use hostlink_connector::ConnectorConfig;

use crate::cmd::{build_message, connect, SendArgs};
use crate::exit::{connector_error, CliResult, SUCCESS};

pub fn run(args: SendArgs, config: ConnectorConfig) -> CliResult<i32> {
    let message = build_message(&args.fields);
    if let Some(topic) = &args.topic {
        hostlink_connector::validate_topic(topic)
            .map_err(|err| connector_error("invalid topic", err))?;
    }

    let connector = connect(&args.endpoint, config)?;
    let sent = match &args.topic {
        Some(topic) => connector.notify(topic, message),
        None => connector.send(message),
    };
    sent.map_err(|err| connector_error("send failed", err))?;

    tracing::debug!(topic = args.topic.as_deref(), "notification sent");
    connector.close();
    Ok(SUCCESS)
}

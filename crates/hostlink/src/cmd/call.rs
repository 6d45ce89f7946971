use hostlink_connector::ConnectorConfig;

use crate::cmd::{build_message, connect, CallArgs};
use crate::exit::{connector_error, CliResult, SUCCESS};
use crate::output::{print_message, Origin, OutputFormat};

pub fn run(args: CallArgs, format: OutputFormat, config: ConnectorConfig) -> CliResult<i32> {
    let timeout = args.timeout.unwrap_or(config.call_timeout_default);
    let connector = connect(&args.endpoint, config)?;

    let request = build_message(&args.fields);
    tracing::debug!(fields = request.len(), ?timeout, "calling");
    let response = connector
        .call(request, timeout)
        .map_err(|err| connector_error("call failed", err))?;

    let peer_id = connector.peer_id().unwrap_or_default();
    print_message(&response, Origin::Response, &peer_id, format);
    connector.close();
    Ok(SUCCESS)
}

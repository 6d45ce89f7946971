use std::time::{Duration, Instant};

use hostlink_connector::{Connector, ConnectorConfig, ConnectorError, HandshakeConfig};
use hostlink_transport::TransportError;
use serde::Serialize;

use crate::cmd::InfoArgs;
use crate::exit::{connector_error, CliError, CliResult, SUCCESS, TIMEOUT};
use crate::output::OutputFormat;

#[derive(Serialize)]
struct InfoOutput {
    endpoint: String,
    peer_id: String,
    protocol: String,
    protocol_version: String,
    capabilities: Vec<String>,
    state: String,
    connect_ms: f64,
}

pub fn run(args: InfoArgs, format: OutputFormat, config: ConnectorConfig) -> CliResult<i32> {
    let config = ConnectorConfig {
        heartbeat_interval: Duration::ZERO,
        handshake: HandshakeConfig {
            timeout: args.timeout.min(config.handshake.timeout),
            ..config.handshake.clone()
        },
        ..config
    };

    let start = Instant::now();
    let connector = connect_with_retry(&args.endpoint, config, args.timeout)?;
    let connect_ms = (start.elapsed().as_secs_f64() * 1000.0 * 100.0).round() / 100.0;

    let handshake = connector
        .handshake()
        .ok_or_else(|| CliError::new(crate::exit::INTERNAL, "connected without handshake"))?;
    let out = InfoOutput {
        endpoint: args.endpoint.clone(),
        peer_id: handshake.peer_id,
        protocol: handshake.protocol,
        protocol_version: handshake.protocol_version,
        capabilities: handshake.capabilities,
        state: connector.state().to_string(),
        connect_ms,
    };
    connector.close();

    print_info(&out, format);
    Ok(SUCCESS)
}

/// The service may still be starting; keep trying until `timeout`.
fn connect_with_retry(
    endpoint: &str,
    config: ConnectorConfig,
    timeout: Duration,
) -> CliResult<Connector> {
    let connector =
        Connector::new(config).map_err(|err| connector_error("invalid config", err))?;
    let start = Instant::now();
    loop {
        match connector.connect(endpoint) {
            Ok(_) => return Ok(connector),
            Err(err) if is_retryable_connect_error(&err) => {
                if start.elapsed() >= timeout {
                    return Err(CliError::new(
                        TIMEOUT,
                        format!("connect timed out after {timeout:?}"),
                    ));
                }
                std::thread::sleep(Duration::from_millis(50));
            }
            Err(err) => return Err(connector_error("connect failed", err)),
        }
    }
}

fn is_retryable_connect_error(err: &ConnectorError) -> bool {
    matches!(
        err,
        ConnectorError::Transport(TransportError::ConnectionRefused { .. })
    )
}

fn print_info(out: &InfoOutput, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string(out).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table | OutputFormat::Pretty => {
            println!("Connection Info:");
            println!("  Endpoint:     {}", out.endpoint);
            println!("  Peer ID:      {}", out.peer_id);
            println!("  Protocol:     {} {}", out.protocol, out.protocol_version);
            if out.capabilities.is_empty() {
                println!("  Capabilities: none");
            } else {
                println!("  Capabilities: {}", out.capabilities.join(", "));
            }
            println!("  State:        {}", out.state);
            println!("  Connect:      {:.2}ms", out.connect_ms);
        }
        OutputFormat::Raw => {
            println!("{}", out.peer_id);
        }
    }
}

use std::time::Duration;

use clap::{Args, Subcommand};
use hostlink_connector::{Connector, ConnectorConfig};
use hostlink_frame::{Message, Value};

use crate::exit::{connector_error, CliResult};
use crate::output::OutputFormat;

pub mod call;
pub mod info;
pub mod listen;
pub mod send;
pub mod serve;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Send a request and print the response.
    Call(CallArgs),
    /// Send a notification without waiting for anything back.
    Send(SendArgs),
    /// Subscribe to topics and print notifications as they arrive.
    Listen(ListenArgs),
    /// Run an echo service.
    Serve(ServeArgs),
    /// Connect, handshake, and print the negotiated metadata.
    Info(InfoArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat, config: ConnectorConfig) -> CliResult<i32> {
    match command {
        Command::Call(args) => call::run(args, format, config),
        Command::Send(args) => send::run(args, config),
        Command::Listen(args) => listen::run(args, format, config),
        Command::Serve(args) => serve::run(args, config),
        Command::Info(args) => info::run(args, format, config),
        Command::Version(args) => version::run(args, format),
    }
}

#[derive(Args, Debug)]
pub struct CallArgs {
    /// Service endpoint (`unix:/path`, `tcp:host:port`, or a socket path).
    pub endpoint: String,
    /// Request field as TAG=TYPE:VALUE (types: i32, i64, f64, str, hex).
    #[arg(long = "field", short = 'f', value_name = "TAG=TYPE:VALUE", value_parser = parse_field)]
    pub fields: Vec<FieldArg>,
    /// How long to wait for the response (e.g. 5s, 500ms). Defaults to the
    /// configured call timeout.
    #[arg(long, value_parser = parse_duration)]
    pub timeout: Option<Duration>,
}

#[derive(Args, Debug)]
pub struct SendArgs {
    pub endpoint: String,
    /// Publish on this topic; without it the notification carries no topic.
    #[arg(long)]
    pub topic: Option<String>,
    #[arg(long = "field", short = 'f', value_name = "TAG=TYPE:VALUE", value_parser = parse_field)]
    pub fields: Vec<FieldArg>,
}

#[derive(Args, Debug)]
pub struct ListenArgs {
    pub endpoint: String,
    /// Topics to subscribe to (repeatable or comma-separated).
    #[arg(long = "topic", short = 't', required = true, value_delimiter = ',')]
    pub topics: Vec<String>,
    /// Exit after receiving N notifications.
    #[arg(long)]
    pub count: Option<usize>,
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Endpoint to bind.
    pub endpoint: String,
}

#[derive(Args, Debug)]
pub struct InfoArgs {
    pub endpoint: String,
    /// Keep retrying the connection this long (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s", value_parser = parse_duration)]
    pub timeout: Duration,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

/// One `--field` value.
#[derive(Clone, Debug, PartialEq)]
pub struct FieldArg {
    pub tag: u32,
    pub value: Value,
}

pub fn build_message(fields: &[FieldArg]) -> Message {
    fields
        .iter()
        .fold(Message::new(), |msg, field| msg.with(field.tag, field.value.clone()))
}

/// Connect a fresh connector, mapping failures to exit codes.
pub fn connect(endpoint: &str, config: ConnectorConfig) -> CliResult<Connector> {
    let connector = Connector::new(config).map_err(|err| connector_error("invalid config", err))?;
    connector
        .connect(endpoint)
        .map_err(|err| connector_error("connect failed", err))?;
    Ok(connector)
}

/// Parse `TAG=TYPE:VALUE`; `TAG=VALUE` is shorthand for a string.
pub fn parse_field(input: &str) -> Result<FieldArg, String> {
    let (tag, rest) = input
        .split_once('=')
        .ok_or_else(|| format!("expected TAG=TYPE:VALUE, got '{input}'"))?;
    let tag: u32 = tag
        .trim()
        .parse()
        .map_err(|_| format!("invalid tag '{tag}'"))?;

    let (ty, raw) = match rest.split_once(':') {
        Some((ty, raw)) if is_type_name(ty) => (ty, raw),
        _ => ("str", rest),
    };

    let value = match ty {
        "i32" | "int32" => Value::Int32(raw.parse().map_err(|_| format!("invalid i32 '{raw}'"))?),
        "i64" | "int64" => Value::Int64(raw.parse().map_err(|_| format!("invalid i64 '{raw}'"))?),
        "f64" | "double" => Value::Double(raw.parse().map_err(|_| format!("invalid f64 '{raw}'"))?),
        "hex" | "bytes" => Value::from(parse_hex(raw)?),
        _ => Value::String(raw.to_string()),
    };
    Ok(FieldArg { tag, value })
}

fn is_type_name(ty: &str) -> bool {
    matches!(
        ty,
        "i32" | "int32" | "i64" | "int64" | "f64" | "double" | "str" | "string" | "hex" | "bytes"
    )
}

fn parse_hex(input: &str) -> Result<Vec<u8>, String> {
    if input.len() % 2 != 0 {
        return Err(format!("hex value '{input}' has an odd number of digits"));
    }
    (0..input.len())
        .step_by(2)
        .map(|i| {
            input
                .get(i..i + 2)
                .and_then(|pair| u8::from_str_radix(pair, 16).ok())
                .ok_or_else(|| format!("invalid hex value '{input}'"))
        })
        .collect()
}

/// Parse `5s`, `500ms`, or a bare number of seconds.
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let input = input.trim();
    if input.is_empty() {
        return Err("duration must not be empty".to_string());
    }

    let (number, millis) = if let Some(num) = input.strip_suffix("ms") {
        (num, true)
    } else if let Some(num) = input.strip_suffix('s') {
        (num, false)
    } else {
        (input, false)
    };

    let value: u64 = number
        .parse()
        .map_err(|_| format!("invalid duration value: {input}"))?;
    if value == 0 {
        return Err("duration must be greater than zero".to_string());
    }

    Ok(if millis {
        Duration::from_millis(value)
    } else {
        Duration::from_secs(value)
    })
}

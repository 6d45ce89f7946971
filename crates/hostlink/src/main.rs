mod cmd;
mod exit;
mod logging;
mod output;

use std::path::{Path, PathBuf};

use clap::Parser;
use hostlink_connector::ConnectorConfig;

use crate::cmd::Command;
use crate::exit::{connector_error, CliError, CliResult, USAGE};
use crate::logging::{init_logging, LogFormat, LogLevel};
use crate::output::OutputFormat;

#[derive(Parser, Debug)]
#[command(name = "hostlink", version, about = "Host-to-service connector CLI")]
struct Cli {
    /// Output format.
    #[arg(long, value_name = "FORMAT", global = true)]
    format: Option<OutputFormat>,

    /// Log output format (stderr).
    #[arg(long, value_name = "FORMAT", default_value = "text", global = true)]
    log_format: LogFormat,

    /// Minimum log level (stderr). HOSTLINK_LOG overrides it.
    #[arg(long, value_name = "LEVEL", default_value = "warn", global = true)]
    log_level: LogLevel,

    /// Connector configuration file (JSON, camelCase keys, durations in ms).
    #[arg(long, value_name = "FILE", env = "HOSTLINK_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

fn load_config(path: Option<&Path>) -> CliResult<ConnectorConfig> {
    let Some(path) = path else {
        return Ok(ConnectorConfig::default());
    };
    let json = std::fs::read_to_string(path).map_err(|err| {
        CliError::new(USAGE, format!("failed reading {}: {err}", path.display()))
    })?;
    ConnectorConfig::from_json_str(&json)
        .map_err(|err| connector_error(&format!("invalid config {}", path.display()), err))
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.log_format, cli.log_level);

    let format = cli.format.unwrap_or_else(OutputFormat::default_for_stdout);
    let result =
        load_config(cli.config.as_deref()).and_then(|config| cmd::run(cli.command, format, config));

    match result {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(err.code);
        }
    }
}

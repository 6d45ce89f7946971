use serde::Serialize;

use crate::cmd::VersionArgs;
use crate::exit::{CliResult, SUCCESS};
use crate::output::OutputFormat;

#[derive(Serialize)]
struct VersionOutput {
    name: &'static str,
    version: &'static str,
    target: &'static str,
    target_os: &'static str,
    target_arch: &'static str,
    features: Vec<&'static str>,
}

pub fn run(args: VersionArgs, format: OutputFormat) -> CliResult<i32> {
    if !args.extended {
        println!("hostlink {}", env!("CARGO_PKG_VERSION"));
        return Ok(SUCCESS);
    }

    let mut features = vec!["cli"];
    if cfg!(feature = "async") {
        features.push("async");
    }
    let out = VersionOutput {
        name: "hostlink",
        version: env!("CARGO_PKG_VERSION"),
        target: option_env!("HOSTLINK_BUILD_TARGET").unwrap_or("unknown"),
        target_os: std::env::consts::OS,
        target_arch: std::env::consts::ARCH,
        features,
    };

    match format {
        OutputFormat::Json => println!(
            "{}",
            serde_json::to_string(&out).unwrap_or_else(|_| "{}".to_string())
        ),
        _ => {
            println!("name: {}", out.name);
            println!("version: {}", out.version);
            println!("target: {}", out.target);
            println!("target_os: {}", out.target_os);
            println!("target_arch: {}", out.target_arch);
            println!("features: {}", out.features.join(", "));
        }
    }
    Ok(SUCCESS)
}

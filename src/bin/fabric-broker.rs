//! Standalone fabric broker.
//!
//! Usage: `fabric-broker [--config fabric.toml] [--host H] [--port P] [--verbose]`

use anyhow::Result;
use microbit_fabric::{FabricConfig, RadioBroker};
use simplelog::{ColorChoice, ConfigBuilder, LevelFilter, TermLogger, TerminalMode};

fn setup_logger(verbose: bool) {
    let level = if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    let config = ConfigBuilder::new().build();
    TermLogger::init(level, config, TerminalMode::Mixed, ColorChoice::Auto).ok();
}

fn arg_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.iter()
        .position(|arg| arg == flag)
        .and_then(|index| args.get(index + 1))
        .map(String::as_str)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    setup_logger(args.iter().any(|arg| arg == "--verbose"));

    let config = FabricConfig::load(arg_value(&args, "--config").unwrap_or("fabric.toml"))?;
    let host = arg_value(&args, "--host")
        .map(str::to_string)
        .unwrap_or(config.fabric_host);
    let port = match arg_value(&args, "--port") {
        Some(port) => port.parse()?,
        None => config.fabric_port,
    };

    let handle = RadioBroker::start(&host, port).await?;
    log::info!("fabric broker listening on {host}:{}", handle.local_port());

    tokio::signal::ctrl_c().await?;
    log::info!("shutting down");
    handle.shutdown().await;
    Ok(())
}

//! Standalone synchronisation server for the gossip mesh.
//!
//! Usage: `sync-server [--config fabric.toml] [--sync-port P] [--data-port P]
//!                     [--ip ADDR] [--targets a,b,c] [--interval-ms N] [--verbose]`

use anyhow::Result;
use microbit_fabric::{FabricConfig, SyncServer, SyncServerOptions};
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

    let mut options = SyncServerOptions {
        sync_port: config.sync_port,
        data_port: config.data_port,
        ip: config.ip.clone(),
        target_ips: config.target_ips.clone(),
        interval: config.interval(),
        connect_timeout: config.connect_timeout(),
    };
    if let Some(port) = arg_value(&args, "--sync-port") {
        options.sync_port = port.parse()?;
    }
    if let Some(port) = arg_value(&args, "--data-port") {
        options.data_port = port.parse()?;
    }
    if let Some(ip) = arg_value(&args, "--ip") {
        options.ip = Some(ip.to_string());
    }
    if let Some(targets) = arg_value(&args, "--targets") {
        options.target_ips = Some(targets.split(',').map(str::to_string).collect());
    }
    if let Some(interval) = arg_value(&args, "--interval-ms") {
        options.interval = std::time::Duration::from_millis(interval.parse()?);
    }

    log::info!(
        "synchronisation server starting (sync_port={}, data_port={})",
        options.sync_port,
        options.data_port
    );
    let handle = SyncServer::start(options).await?;

    tokio::signal::ctrl_c().await?;
    log::info!("shutting down");
    handle.shutdown().await;
    Ok(())
}

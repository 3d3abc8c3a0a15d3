//! Localizer Daemon - Main entry point
//!
//! Subscribes to rtl_433 events, keeps readings from registered Oregon
//! Scientific sensors and republishes them per metric to MQTT and InfluxDB.

mod bridge;
mod config;
mod influx;
mod mqtt;

use anyhow::Result;
use clap::Parser;
use localizer_core::SensorRegistry;
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "localizer")]
#[command(about = "Republish rtl_433 Oregon Scientific readings per floor and location")]
#[command(version)]
struct Args {
    /// Path to configuration file (TOML, or legacy configuration.json)
    #[arg(short, long, default_value = "localizer.toml")]
    config: PathBuf,

    /// InfluxDB API token
    #[arg(short = 't', long, env = "INFLUX_TOKEN", hide_env_values = true)]
    influx_token: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Validate configuration, print the sensor registry and exit
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("Localizer v{}", env!("CARGO_PKG_VERSION"));

    let mut config = config::load_config(&args.config)?;
    config.resolve_influx_token(args.influx_token)?;

    if args.check {
        let registry = SensorRegistry::new(config.sensors.clone());
        println!("Configuration OK, {} sensors:", registry.len());
        for sensor in registry.iter() {
            println!(
                "  - id {} channel {} -> {}/{} (published as {})",
                sensor.id,
                sensor.channel,
                sensor.floor,
                sensor.location,
                sensor.display_id()
            );
        }
        return Ok(());
    }

    bridge::run(config).await
}

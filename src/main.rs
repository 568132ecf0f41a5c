//! dht-telemetry: DHT22 sampling agent
//!
//! Reads temperature/humidity sensors on wall-clock aligned ticks and
//! forwards each reading to an MQTT broker or an HTTP ingestion endpoint.
//!
//! Features:
//! - mqtt: publish to a broker as <topic>/temperature and <topic>/humidity
//! - http: ThingSpeak-style update endpoint, one field per request
//! - library: read sensors in-process through the native sensor library

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

// === Modules ===

mod agent;
mod config;
mod error;
mod model;
mod scheduler;
mod sensors;
mod shared;
mod sinks;

use sensors::SensorReader;

// === CLI ===

#[derive(Parser)]
#[command(name = "dht-telemetry")]
#[command(about = "Sample DHT22 sensors on a fixed cadence and publish the readings")]
struct Cli {
    /// Config file (default: ~/.config/dht-telemetry/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Sample and publish forever (the default)
    Run,
    /// Read every configured sensor once and print the results
    Read,
    /// Open the config file in your editor, creating it if needed
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Config) => {
            run_config_command(cli.config)?;
        }
        Some(Commands::Read) => {
            init_tracing();
            run_read(cli.config.as_deref()).await?;
        }
        Some(Commands::Run) | None => {
            init_tracing();
            run_agent(cli.config.as_deref()).await?;
        }
    }

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// Open config file in user's editor
fn run_config_command(explicit: Option<PathBuf>) -> anyhow::Result<()> {
    let config_path = explicit
        .or_else(config::Config::path)
        .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;

    // Create config dir if needed
    if let Some(parent) = config_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    // Create config file from template if it doesn't exist
    if !config_path.exists() {
        let template = include_str!("../config.toml.example");
        std::fs::write(&config_path, template)?;
        println!("Created config file: {}", config_path.display());
    }

    // Get editor from environment or use defaults
    let editor = std::env::var("EDITOR")
        .or_else(|_| std::env::var("VISUAL"))
        .unwrap_or_else(|_| "nano".to_string());

    println!("Opening {} with {}", config_path.display(), editor);

    std::process::Command::new(&editor)
        .arg(&config_path)
        .status()
        .with_context(|| format!("Failed to start editor {}", editor))?;

    // Catch mistakes before the agent is restarted with this file
    match config::Config::load(Some(&config_path)) {
        Ok(_) => println!("Config is valid"),
        Err(e) => println!("Config has problems: {:#}", e),
    }

    Ok(())
}

/// Read the sensors once and print one line per sensor
async fn run_read(config_path: Option<&Path>) -> anyhow::Result<()> {
    let config = config::Config::load(config_path)?;
    let acquirer = sensors::Acquirer::from_config(&config.acquisition)
        .context("Sensor acquisition is unavailable")?;
    let reader = SensorReader::new(acquirer, config.retries, config.acquisition.timeout_margin());

    let sensors = config.sensor_ids();
    let readings = reader.try_read(&sensors).await?;
    for sensor in sensors {
        match readings.get(sensor) {
            Some(reading) => println!("{}", reading),
            None => println!("{}: no reading", sensor),
        }
    }
    Ok(())
}

/// Run the sampling agent until interrupted
async fn run_agent(config_path: Option<&Path>) -> anyhow::Result<()> {
    tracing::info!("Starting dht-telemetry");

    let config = Arc::new(config::Config::load(config_path)?);
    let acquirer = sensors::Acquirer::from_config(&config.acquisition)
        .context("Sensor acquisition is unavailable")?;
    let sink = sinks::Sink::from_config(&config).context("Failed to set up sink")?;

    let mut agent = agent::Agent::new(Arc::clone(&config), acquirer, sink);
    tokio::select! {
        _ = agent.run() => {}
        _ = shutdown_signal() => {
            tracing::info!("Shutdown requested");
        }
    }
    agent.shutdown().await;

    tracing::info!("dht-telemetry stopped");
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
                return;
            }
            Err(e) => tracing::warn!("Cannot listen for SIGTERM: {}", e),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("Cannot listen for ctrl-c: {}", e);
        std::future::pending::<()>().await;
    }
}

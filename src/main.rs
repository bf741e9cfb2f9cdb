//! TTN MQTT client - command line entry point
//!
//! Connects to the configured application, prints every decoded uplink as
//! one JSON line on stdout and optionally sends a downlink command.

use clap::{Parser, Subcommand};
use serde::Serialize;
use std::io::Write;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::broadcast;
use tokio::time::Duration;
use tracing::{error, info, warn};
use ttn_mqtt::config::ClientConfig;
use ttn_mqtt::observability::init_default_logging;
use ttn_mqtt::protocol::{InboundMessage, ResolvedTopics};
use ttn_mqtt::transport::mqtt::{ConnectionManager, LifecycleEvent, ManagerSettings};
use ttn_mqtt::{MessageSink, SinkListener};

/// How long to wait for the first ConnAck before sending `--downlink`
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// MQTT client for The Things Network applications
#[derive(Parser)]
#[command(name = "ttn-mqtt")]
#[command(about = "Receive uplinks and send downlinks over the TTN MQTT broker")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "TTN_MQTT_CONFIG")]
    config: Option<PathBuf>,

    /// Verbose logging (repeat for more)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect and print uplinks until interrupted
    Run {
        /// Downlink command to send once connected (at most 3 bytes)
        #[arg(long, value_name = "CMD")]
        downlink: Option<String>,
    },
    /// Validate configuration
    Config {
        /// Show the configuration and derived topics
        #[arg(long)]
        show: bool,
    },
}

/// Writes each uplink to stdout as a JSON line
struct StdoutSink;

impl MessageSink for StdoutSink {
    fn push(&self, message: InboundMessage) {
        match serde_json::to_string(&message) {
            Ok(line) => {
                let mut stdout = std::io::stdout().lock();
                if let Err(e) = writeln!(stdout, "{line}").and_then(|_| stdout.flush()) {
                    warn!("Failed to write uplink: {}", e);
                }
            }
            Err(e) => warn!("Failed to serialize uplink: {}", e),
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_default_logging(cli.verbose);

    info!("Starting ttn-mqtt v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run { downlink } => run_client(config, downlink).await,
        Commands::Config { show } => handle_config_command(config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }

    info!("Application shutdown complete");
}

fn load_configuration(
    config_path: &Option<PathBuf>,
) -> Result<ClientConfig, Box<dyn std::error::Error>> {
    if let Some(path) = config_path {
        info!("Loading configuration from: {}", path.display());
        return Ok(ClientConfig::load_from_file(path)?);
    }

    for path_str in ["ttn.toml", "config/ttn.toml"] {
        let path = PathBuf::from(path_str);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(ClientConfig::load_from_file(&path)?);
        }
    }

    Err("No configuration file found. Provide one with -c/--config or create ttn.toml".into())
}

async fn run_client(
    config: ClientConfig,
    downlink: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let connection = config.connection_config()?;
    let mut manager = ConnectionManager::with_settings(ManagerSettings::from(&config));
    let mut events = manager.events();

    manager
        .register_listener(Arc::new(SinkListener::new(StdoutSink)))
        .await;
    manager.connect(connection)?;

    if let Some(command) = downlink {
        manager.wait_until_connected(CONNECT_TIMEOUT).await?;
        let outcome = manager.publish(&command).await?;
        info!("Downlink {:?}: {:?}", command, outcome);
    }

    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    info!("Listening for uplinks...");

    let outcome = tokio::select! {
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down gracefully...");
            Ok(())
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down gracefully...");
            Ok(())
        }
        fatal = watch_lifecycle(&mut events) => Err(fatal),
    };

    if let Err(e) = manager.disconnect().await {
        error!("Error during shutdown: {}", e);
    }
    outcome.map_err(Into::into)
}

/// Log lifecycle events; returns once the connection is gone for good
async fn watch_lifecycle(events: &mut broadcast::Receiver<LifecycleEvent>) -> String {
    loop {
        match events.recv().await {
            Ok(LifecycleEvent::ConnectFailed {
                reason_code,
                message,
            }) => {
                return format!("Connection failed (reason code {reason_code:?}): {message}");
            }
            Ok(LifecycleEvent::ReconnectAbandoned { attempts }) => {
                return format!("Connection lost, gave up after {attempts} reconnection attempts");
            }
            Ok(event) => info!(event = ?event, "Connection lifecycle event"),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Missed {} lifecycle events", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => {
                return "Lifecycle channel closed".to_string();
            }
        }
    }
}

/// What `config --show` prints; the access key itself never leaves the process
#[derive(Serialize)]
struct ConfigReport<'a> {
    config: &'a ClientConfig,
    topics: ResolvedTopics,
}

fn handle_config_command(
    config: ClientConfig,
    show: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let connection = config.connection_config()?;
    let topics = ManagerSettings::from(&config).resolve_topics(&connection)?;

    if show {
        let mut masked = config.clone();
        if masked.ttn.access_key.is_some() {
            masked.ttn.access_key = Some("***".to_string());
        }
        let report = ConfigReport {
            config: &masked,
            topics,
        };
        println!("{}", toml::to_string_pretty(&report)?);
    }

    info!("Configuration validation complete");
    Ok(())
}

//! iothub-device command line entry point
//!
//! Loads a device configuration, opens a connection and sends telemetry.

use clap::{Parser, Subcommand};
use iothub_device::config::ClientConfig;
use iothub_device::device_io::DeviceIo;
use iothub_device::engine::ConnectionStatusChange;
use iothub_device::message::Message;
use iothub_device::observability::{init_default_logging, init_logging, LogFormat};
use iothub_device::status::IotHubStatusCode;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tokio::time::{sleep, Duration};
use tracing::{error, info, warn, Level};

/// Device-side IoT Hub client
#[derive(Parser)]
#[command(name = "iothub-device")]
#[command(about = "Send device telemetry to an IoT Hub over MQTT or HTTPS")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Verbose logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Open a connection, send telemetry and wait for every completion
    Send {
        /// Number of messages
        #[arg(long, default_value_t = 1)]
        count: u32,

        /// Delay between messages
        #[arg(long, default_value_t = 1000)]
        interval_ms: u64,

        /// Message body; defaults to a JSON document with a sequence number
        #[arg(long)]
        payload: Option<String>,
    },
    /// Validate configuration
    Config {
        /// Print the configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.verbose {
        0 => init_default_logging(),
        1 => init_logging(Level::DEBUG, LogFormat::Compact, false),
        _ => init_logging(Level::TRACE, LogFormat::Compact, true),
    }

    let config = match load_configuration(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Send {
            count,
            interval_ms,
            payload,
        } => run_send(config, count, Duration::from_millis(interval_ms), payload).await,
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }
}

fn load_configuration(
    config_path: &Option<PathBuf>,
) -> Result<ClientConfig, Box<dyn std::error::Error>> {
    if let Some(path) = config_path {
        info!("Loading configuration from: {}", path.display());
        return Ok(ClientConfig::load_from_file(path)?);
    }

    for path_str in ["device.toml", "config/device.toml"] {
        let path = PathBuf::from(path_str);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(ClientConfig::load_from_file(&path)?);
        }
    }

    Err("No configuration file found. Provide one with -c/--config or create device.toml".into())
}

async fn run_send(
    config: ClientConfig,
    count: u32,
    interval: Duration,
    payload: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let identity = config.identity();
    let io = DeviceIo::connect(
        config.transport.protocol,
        identity.clone(),
        config.credential()?,
        config.client_options(),
    )?;
    io.set_retry_policy(Arc::new(config.retry_policy()));
    io.register_connection_status_callback(Arc::new(|change: &ConnectionStatusChange| {
        info!(status = ?change.status, reason = ?change.reason, "Connection status");
    }));

    info!(device = %identity, protocol = %config.transport.protocol, "Opening connection");
    io.open(true).await?;

    let mut tickets = Vec::with_capacity(count as usize);
    for seq in 0..count {
        let body = payload
            .clone()
            .unwrap_or_else(|| serde_json::json!({ "seq": seq }).to_string());
        let message = Message::new(body).with_content_type("application/json");
        tickets.push(io.send_async(message)?);

        if seq + 1 < count {
            tokio::select! {
                _ = sleep(interval) => {}
                _ = tokio::signal::ctrl_c() => {
                    warn!("Interrupted, closing connection");
                    break;
                }
            }
        }
    }

    let mut outcomes: BTreeMap<String, u32> = BTreeMap::new();
    for ticket in tickets {
        let status = tokio::select! {
            status = ticket => status,
            _ = tokio::signal::ctrl_c() => {
                warn!("Interrupted while waiting for completions");
                break;
            }
        };
        *outcomes.entry(status.to_string()).or_default() += 1;
    }

    io.close().await?;

    for (status, n) in &outcomes {
        println!("{status}: {n}");
    }
    let ok = outcomes
        .get(&IotHubStatusCode::Ok.to_string())
        .copied()
        .unwrap_or(0);
    if ok < count {
        return Err(format!("{} of {count} messages were not delivered", count - ok).into());
    }
    Ok(())
}

fn handle_config_command(
    config: &ClientConfig,
    show: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    if show {
        // Only environment variable names are stored in the file
        println!("{}", toml::to_string_pretty(config)?);
    }

    if let Err(e) = config.credential() {
        warn!("Credential not available: {}", e);
    }
    info!("Configuration validation complete");
    Ok(())
}

//! Binary entrypoint for the MeshSpy CLI.
//!
//! Commands:
//! - `start [--port <path>] [--baud <n>] [--proto-version <tag>] [--server-url <url>]` - run the gateway
//! - `send-text --port <path> <TEXT>` - broadcast one text message
//! - `send-raw --port <path> <DATA>` - write raw bytes to the device
//! - `init` - create a starter `config.toml`
//! - `status` - probe the management server and print a JSON status line
//!
//! See the library crate docs for module‑level details: `meshspy::`.
use anyhow::Result;
use clap::{Parser, Subcommand};
use log::{info, warn};
use std::sync::Arc;
use std::time::Duration;

use meshspy::config::Config;
use meshspy::logutil::truncate_for_log;
use meshspy::metrics;
use meshspy::mgmtapi::Client;
use meshspy::relay::{self, RelayHandler};
use meshspy::serial::{SerialManager, READ_TIMEOUT};

#[derive(Parser)]
#[command(name = "meshspy")]
#[command(about = "Gateway between a Meshtastic serial device and the MeshSpy management server")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (can be used before or after subcommand)
    #[arg(short, long, default_value = "config.toml", global = true)]
    config: String,

    /// Verbose logging (-v, -vv for more; may appear before or after subcommand)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the gateway until Ctrl-C
    Start {
        /// Meshtastic device port (e.g., /dev/ttyUSB0)
        #[arg(short, long)]
        port: Option<String>,
        /// Baud rate
        #[arg(short = 'b', long)]
        baud: Option<u32>,
        /// Protocol version tag: "latest" or "2.1"
        #[arg(long)]
        proto_version: Option<String>,
        /// Management server base URL
        #[arg(long)]
        server_url: Option<String>,
    },
    /// Broadcast a text message on the primary channel
    SendText {
        /// Device serial port
        #[arg(short, long)]
        port: String,
        text: String,
    },
    /// Write raw bytes (the argument as UTF-8) to the device
    SendRaw {
        /// Device serial port
        #[arg(short, long)]
        port: String,
        data: String,
    },
    /// Write a default configuration file
    Init,
    /// Probe the management server and print status as JSON
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let pre_config = match cli.command {
        Commands::Init => None,
        _ => Config::load(&cli.config).await.ok(),
    };
    init_logging(&pre_config, cli.verbose);

    match cli.command {
        Commands::Start {
            port,
            baud,
            proto_version,
            server_url,
        } => {
            let mut config = pre_config.unwrap_or_else(|| {
                warn!("Could not load {}; using defaults", cli.config);
                Config::default()
            });
            if let Some(p) = port {
                config.serial.port = p;
            }
            if let Some(b) = baud {
                config.serial.baud_rate = b;
            }
            if let Some(v) = proto_version {
                config.serial.proto_version = v;
            }
            if let Some(u) = server_url {
                config.management.url = u;
            }
            config.validate()?;
            run_gateway(config).await?;
        }
        Commands::SendText { port, text } => {
            let config = pre_config.unwrap_or_default();
            let manager = open_manager(&port, &config)?;
            manager.send_text_message(&text)?;
            info!("Sent text to {}: {}", port, truncate_for_log(&text, 120));
            manager.close()?;
        }
        Commands::SendRaw { port, data } => {
            let config = pre_config.unwrap_or_default();
            let manager = open_manager(&port, &config)?;
            manager.send(data.as_bytes())?;
            info!("Sent {} raw bytes to {}", data.len(), port);
            manager.close()?;
        }
        Commands::Init => {
            Config::create_default(&cli.config).await?;
            info!("Configuration file created at {}", cli.config);
        }
        Commands::Status => {
            let config = match pre_config {
                Some(c) => c,
                None => Config::load(&cli.config).await?,
            };
            let (connected, node_count) = if config.management.url.is_empty() {
                (false, None)
            } else {
                let client =
                    Client::with_settings(&config.management.url, config.management.client_settings())?;
                match client.list_nodes().await {
                    Ok(nodes) => (client.is_connected(), Some(nodes.len())),
                    Err(e) => {
                        warn!("Management server probe failed: {}", e);
                        (client.is_connected(), None)
                    }
                }
            };
            let payload = serde_json::json!({
                "connected": connected,
                "node_count": node_count,
                "port": config.serial.port,
                "proto_version": config.serial.proto_version,
                "metrics": metrics::snapshot(),
            });
            println!("{}", payload);
        }
    }

    Ok(())
}

#[cfg(feature = "serial")]
fn open_manager(port: &str, config: &Config) -> Result<SerialManager> {
    let version = config.proto_version()?;
    Ok(SerialManager::open(port, config.serial.baud_rate, version)?)
}

#[cfg(not(feature = "serial"))]
fn open_manager(port: &str, _config: &Config) -> Result<SerialManager> {
    Err(anyhow::anyhow!(
        "cannot open {}: built without the 'serial' feature",
        port
    ))
}

async fn run_gateway(config: Config) -> Result<()> {
    info!("Starting MeshSpy v{}", env!("CARGO_PKG_VERSION"));
    let manager = Arc::new(open_manager(&config.serial.port, &config)?);

    let (mut handler, rx) = RelayHandler::channel();
    if config.management.url.is_empty() {
        info!("No management URL configured; decoded messages are only logged");
        tokio::spawn(async move {
            let mut rx = rx;
            while let Some(msg) = rx.recv().await {
                info!("{}", truncate_for_log(&msg.summary(), 200));
            }
        });
    } else {
        let client =
            Client::with_settings(&config.management.url, config.management.client_settings())?;
        info!("Relaying to management server {}", client.base_url());
        tokio::spawn(relay::run(client, rx));
    }

    let reader_manager = manager.clone();
    let mut reader = tokio::task::spawn_blocking(move || reader_manager.read_loop(&mut handler));

    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            if let Err(e) = res {
                warn!("Failed to listen for Ctrl-C: {}", e);
            }
            info!("Shutdown requested");
        }
        res = &mut reader => {
            match res {
                Ok(Ok(())) => info!("Serial read loop finished"),
                Ok(Err(e)) => warn!("Serial read loop failed: {}", e),
                Err(e) => warn!("Serial read task panicked: {}", e),
            }
        }
    }

    manager.close()?;
    if !reader.is_finished() {
        let grace = READ_TIMEOUT + Duration::from_secs(1);
        if tokio::time::timeout(grace, &mut reader).await.is_err() {
            warn!("Serial read loop did not stop within {:?}", grace);
        }
    }
    match serde_json::to_string(&metrics::snapshot()) {
        Ok(json) => info!("Final metrics: {}", json),
        Err(e) => warn!("Failed to serialize metrics: {}", e),
    }
    Ok(())
}

fn init_logging(config: &Option<Config>, verbosity: u8) {
    use std::io::Write;
    let mut builder = env_logger::Builder::new();
    // CLI verbosity overrides the configured level
    let configured = config
        .as_ref()
        .and_then(|c| c.logging.level.parse::<log::LevelFilter>().ok())
        .unwrap_or(log::LevelFilter::Info);
    let base_level = match verbosity {
        0 => configured,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    builder.filter_level(base_level);

    let log_file = config.as_ref().and_then(|c| c.logging.file.as_ref()).and_then(|file| {
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(file)
            .ok()
    });

    if let Some(f) = log_file {
        let write_mutex = std::sync::Arc::new(std::sync::Mutex::new(f));
        // Echo to the console only when stdout is a terminal
        let is_tty = atty::is(atty::Stream::Stdout);
        builder.format(move |fmt, record| {
            let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
            let line = format!("{} [{}] {}", ts, record.level(), record.args());
            if let Ok(mut guard) = write_mutex.lock() {
                let _ = writeln!(guard, "{}", line);
            }
            if is_tty {
                writeln!(fmt, "{}", line)
            } else {
                Ok(())
            }
        });
    } else {
        builder.format(|fmt, record| {
            let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
            writeln!(fmt, "{} [{}] {}", ts, record.level(), record.args())
        });
    }
    let _ = builder.try_init();
}

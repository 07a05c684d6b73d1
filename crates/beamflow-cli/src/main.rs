/*!
 * beamflow - CLI tools for remote beamline control servers.
 *
 * Thin pass-through over the library contract: `test` checks the
 * connection handshake, `devices` lists the discovered registry, and
 * `read` performs a single get on one device.
 */
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::{ArgAction, Parser, Subcommand};
use tracing::debug;

use beamflow_core::config::{Config, ConfigBuilder};
use beamflow_core::logging;
use beamflow_devices::{Descriptor, DeviceKind, Session};

#[derive(Parser)]
#[command(
    name = "beamflow",
    version,
    about = "CLI tools for remote beamline control servers"
)]
struct Cli {
    /// Server host address
    #[arg(short = 'H', long, global = true)]
    host: Option<String>,

    /// Server port
    #[arg(short, long, global = true)]
    port: Option<u16>,

    /// Connection and call timeout in milliseconds
    #[arg(short, long, global = true)]
    timeout_ms: Option<u64>,

    /// Configuration file (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Increase verbosity (use -v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Test the connection to a server
    Test,

    /// List available devices from a server
    Devices {
        /// Hide motors
        #[arg(long)]
        no_motors: bool,

        /// Hide signals
        #[arg(long)]
        no_signals: bool,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Read the current value of a device
    Read {
        /// Device name (use 'beamflow devices' to list available devices)
        name: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = logging::verbosity_filter(cli.verbose, cli.quiet);
    if let Err(e) = logging::init_with_filter(filter) {
        eprintln!("warning: {}", e);
    }

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let config = load_config(&cli)?;
    let quiet = cli.quiet;

    match cli.command {
        Command::Test => cmd_test(config, quiet).await,
        Command::Devices {
            no_motors,
            no_signals,
            json,
        } => cmd_devices(config, quiet, no_motors, no_signals, json).await,
        Command::Read { name } => cmd_read(config, &name).await,
    }
}

/// Layer defaults, optional file, environment, and CLI flags
fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut builder = ConfigBuilder::new().with_environment_prefix("beamflow");
    if let Some(path) = &cli.config {
        builder = builder.with_config_file(path);
    }
    let mut config = builder.build().context("failed to load configuration")?;

    if let Some(host) = &cli.host {
        config.endpoint.host = host.clone();
    }
    if let Some(port) = cli.port {
        config.endpoint.port = port;
    }
    if let Some(timeout_ms) = cli.timeout_ms {
        config.transport.connect_timeout_ms = timeout_ms;
        config.transport.call_timeout_ms = timeout_ms;
    }

    debug!(endpoint = %config.endpoint.address(), "configuration loaded");
    Ok(config)
}

async fn cmd_test(config: Config, quiet: bool) -> anyhow::Result<ExitCode> {
    let endpoint = config.endpoint.address();
    if !quiet {
        println!("Testing connection to control server at {}...", endpoint);
    }

    match Session::connect(config).await {
        Ok(session) => {
            if !quiet {
                println!("Connection successful ({} devices).", session.registry().len());
            }
            session.disconnect();
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            if !quiet {
                eprintln!("Connection failed: {}", e);
            }
            Ok(ExitCode::FAILURE)
        }
    }
}

async fn cmd_devices(
    config: Config,
    quiet: bool,
    no_motors: bool,
    no_signals: bool,
    json: bool,
) -> anyhow::Result<ExitCode> {
    let endpoint = config.endpoint.address();
    if !quiet && !json {
        println!("Connecting to control server at {}...", endpoint);
    }

    let session = match Session::connect(config).await {
        Ok(session) => session,
        Err(e) => {
            if !quiet {
                eprintln!("Connection failed: {}", e);
            }
            return Ok(ExitCode::FAILURE);
        }
    };

    let descriptors = session.registry().descriptors();
    let motors: Vec<&Descriptor> = descriptors
        .iter()
        .filter(|d| d.kind == DeviceKind::Motor)
        .collect();
    let signals: Vec<&Descriptor> = descriptors
        .iter()
        .filter(|d| d.kind == DeviceKind::Signal)
        .collect();
    let detectors: Vec<&Descriptor> = descriptors
        .iter()
        .filter(|d| d.kind == DeviceKind::Detector)
        .collect();

    if json {
        let mut output = serde_json::Map::new();
        if !no_motors {
            output.insert("motors".to_string(), to_json(&motors));
        }
        if !no_signals {
            output.insert("signals".to_string(), to_json(&signals));
        }
        output.insert("detectors".to_string(), to_json(&detectors));
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        if !no_motors {
            print_section("Motors", &motors);
        }
        if !no_signals {
            print_section("Signals", &signals);
        }
        if !detectors.is_empty() {
            print_section("Detectors", &detectors);
        }

        let total = if no_motors { 0 } else { motors.len() }
            + if no_signals { 0 } else { signals.len() }
            + detectors.len();
        if total == 0 {
            println!("No devices to show.");
        } else {
            println!("\nTotal: {} device(s)", total);
        }
    }

    session.disconnect();
    Ok(ExitCode::SUCCESS)
}

fn print_section(title: &str, devices: &[&Descriptor]) {
    if devices.is_empty() {
        return;
    }
    println!("\n{} ({}):", title, devices.len());
    println!("{}", "-".repeat(60));
    for device in devices {
        let mut line = format!("  {:<30}", device.name.as_str());
        if device.original_name != device.name.as_str() {
            line.push_str(&format!(" ({})", device.original_name));
        }
        if let Some(units) = &device.units {
            line.push_str(&format!(" [{}]", units));
        }
        if let Some(label) = &device.label {
            line.push_str(&format!(" - {}", label));
        }
        println!("{}", line.trim_end());
    }
}

fn to_json(devices: &[&Descriptor]) -> serde_json::Value {
    devices
        .iter()
        .map(|d| {
            serde_json::json!({
                "name": d.name.as_str(),
                "original_name": d.original_name,
                "units": d.units,
                "label": d.label,
                "read_only": d.read_only,
            })
        })
        .collect()
}

async fn cmd_read(config: Config, name: &str) -> anyhow::Result<ExitCode> {
    let session = match Session::connect(config).await {
        Ok(session) => session,
        Err(e) => {
            eprintln!("Connection failed: {}", e);
            return Ok(ExitCode::FAILURE);
        }
    };

    // Exact lookup first, then a case-insensitive pattern fallback
    let descriptor = match session.registry().find_by_name(name) {
        Some(descriptor) => Some(descriptor),
        None => session
            .registry()
            .find_by_pattern(&format!("(?i){}", name))
            .unwrap_or_default()
            .into_iter()
            .next(),
    };
    let Some(descriptor) = descriptor else {
        eprintln!("Device '{}' not found", name);
        session.disconnect();
        return Ok(ExitCode::FAILURE);
    };

    let handle = session.resolve_descriptor(&descriptor);
    let Some(readable) = handle.as_readable() else {
        eprintln!("Device '{}' does not support reading", descriptor.name);
        session.disconnect();
        return Ok(ExitCode::FAILURE);
    };

    match readable.read().await {
        Ok(reading) => {
            match reading.value.as_float() {
                Some(value) => println!("{}", value),
                None => println!("{}", serde_json::to_string(&reading.value)?),
            }
            session.disconnect();
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            eprintln!("Read failed: {}", e);
            session.disconnect();
            Ok(ExitCode::FAILURE)
        }
    }
}

//! usbwatch
//!
//! Addresses USB devices by the physical port they are plugged into and
//! switches them with hub-level primitives. One invocation either runs
//! a single command and prints the refreshed listing, or stays up as a
//! server exposing the same engine over HTTP and the INDI protocol.

use anyhow::{Context, Result, bail};
use clap::Parser;
use engine::{Command, Engine, LinuxUsb, PortAddress, UsbAccess, render_listing};
use server::{SharedEngine, config::Config, http, indi, logging::setup_logging};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "usbwatch")]
#[command(
    author,
    version,
    about = "Switch USB devices by the physical port they are plugged into"
)]
#[command(long_about = "
Lists the USB port topology and runs control commands against ports
addressed as bus-port.port... (the physical location, stable across
replugs and reboots).

EXAMPLES:
    # Show the topology
    usbwatch

    # Power-cycle whatever sits at bus 1, hub port 1, sub-port 4
    usbwatch --down 1-1.4
    usbwatch --up 1-1.4

    # Ask the driver to reinitialize the device
    usbwatch --reset 1-1.4

    # Stay up as a server on both front-ends
    usbwatch --rest --indi

CONFIGURATION:
    The server looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/usbwatch/usbwatch.toml
    3. /etc/usbwatch/usbwatch.toml
    4. Built-in defaults
")]
struct Args {
    /// Ask the bound driver to reinitialize the device at LOCATION
    #[arg(long, value_name = "LOCATION")]
    reset: Option<String>,

    /// Toggle the hub port's connection state at LOCATION
    #[arg(long, value_name = "LOCATION")]
    hard: Option<String>,

    /// Disable the hub port at LOCATION until replug or power-up
    #[arg(long, value_name = "LOCATION")]
    disable: Option<String>,

    /// Switch hub port power on at LOCATION
    #[arg(long, value_name = "LOCATION")]
    up: Option<String>,

    /// Switch hub port power off at LOCATION
    #[arg(long, value_name = "LOCATION")]
    down: Option<String>,

    /// Power the device at LOCATION off at the kernel level
    #[arg(long, value_name = "LOCATION")]
    off: Option<String>,

    /// Serve the HTTP control endpoint
    #[arg(long)]
    rest: bool,

    /// Serve the INDI protocol
    #[arg(long)]
    indi: bool,

    /// Bind address for the servers
    #[arg(long, value_name = "ADDR")]
    host: Option<String>,

    /// HTTP endpoint port
    #[arg(long, value_name = "PORT")]
    rest_port: Option<u16>,

    /// INDI server port
    #[arg(long, value_name = "PORT")]
    indi_port: Option<u16>,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,

    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<std::path::PathBuf>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,
}

impl Args {
    /// The one command flag given, if any. More than one is an error.
    fn requested_command(&self) -> Result<Option<(Command, &str)>> {
        let given: Vec<(Command, &String)> = [
            (Command::SoftReset, &self.reset),
            (Command::HardReset, &self.hard),
            (Command::Disable, &self.disable),
            (Command::PowerUp, &self.up),
            (Command::PowerDown, &self.down),
            (Command::Off, &self.off),
        ]
        .into_iter()
        .filter_map(|(command, location)| location.as_ref().map(|l| (command, l)))
        .collect();

        match given.as_slice() {
            [] => Ok(None),
            [(command, location)] => Ok(Some((*command, location.as_str()))),
            _ => bail!("Give at most one command flag per invocation"),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Handle --save-config flag early (before loading config)
    if args.save_config {
        let config = Config::default();
        let path = Config::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = if let Some(ref path) = args.config {
        Config::load(Some(path.clone())).context("Failed to load configuration")?
    } else {
        Config::load_or_default()
    };

    let log_level = if args.verbose {
        "debug"
    } else {
        &config.server.log_level
    };
    setup_logging(log_level).context("Failed to setup logging")?;

    let backend: Box<dyn UsbAccess> =
        Box::new(LinuxUsb::new().context("USB access unavailable")?);
    let engine: SharedEngine = Arc::new(Engine::with_tuning(
        backend,
        config.usb.timeout(),
        config.usb.cache_ttl(),
    ));

    if args.rest || args.indi {
        return run_servers(&args, &config, engine).await;
    }

    if let Some((command, location)) = args.requested_command()? {
        let address: PortAddress = location
            .parse()
            .with_context(|| format!("Bad location '{location}'"))?;
        let exec = engine.clone();
        let target = address.clone();
        let outcome = tokio::task::spawn_blocking(move || exec.execute(&target, command))
            .await
            .context("Dispatch task failed")?;
        match outcome.result {
            Ok(engine::Effect::AppliedGanged) => {
                println!("note: hub switches power for all ports at once");
            }
            Ok(engine::Effect::Applied) => {}
            Err(err) => bail!("{command} {address}: {err}"),
        }
    }

    let entries = tokio::task::spawn_blocking(move || engine.list())
        .await
        .context("Listing task failed")?
        .context("Topology capture failed")?;
    println!("{}", render_listing(&entries));

    Ok(())
}

/// Stay up on the requested front-ends until Ctrl-C. A server task
/// only finishes on error, and one front-end dying takes the process
/// down rather than limping along half-exposed.
async fn run_servers(args: &Args, config: &Config, engine: SharedEngine) -> Result<()> {
    info!("usbwatch v{}", env!("CARGO_PKG_VERSION"));

    let host = args.host.as_deref().unwrap_or(&config.server.host);
    let mut servers = tokio::task::JoinSet::new();

    if args.rest {
        let port = args.rest_port.unwrap_or(config.server.rest_port);
        servers.spawn(http::serve(engine.clone(), format!("{host}:{port}")));
    }
    if args.indi {
        let port = args.indi_port.unwrap_or(config.server.indi_port);
        servers.spawn(indi::serve(engine.clone(), format!("{host}:{port}")));
    }

    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Shutting down");
            Ok(())
        }
        joined = servers.join_next() => {
            let err = match joined {
                Some(Ok(Ok(()))) => anyhow::anyhow!("server task exited"),
                Some(Ok(Err(err))) => err,
                Some(Err(err)) => err.into(),
                None => unreachable!("run_servers called with a front-end selected"),
            };
            error!("Server task failed: {:#}", err);
            bail!("server terminated unexpectedly");
        }
    }
}

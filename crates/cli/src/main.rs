//! usbtmc-cli
//!
//! Command line access to USBTMC instruments: list attached instruments,
//! send commands and run queries.

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use common::setup_logging;
use port::{PortConfig, UsbtmcPort};
use protocol::{USBTMC_CLASS, USBTMC_SUBCLASS};
use rusb::UsbContext;
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

#[derive(Parser, Debug)]
#[command(name = "usbtmc-cli")]
#[command(author, version, about = "Talk to USBTMC instruments over USB")]
#[command(long_about = "
Talk to USBTMC (USB Test & Measurement Class) instruments.

EXAMPLES:
    # List attached instruments and their selection strings
    usbtmc-cli list

    # Reset an instrument
    usbtmc-cli write --device 'VID=0x0957:PID=0x4d18' '*RST'

    # Identify an instrument
    usbtmc-cli query --device 'VID=0x0957:PID=0x4d18' '*IDN?'
")]
struct Args {
    /// Path to a TOML port configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL", default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List attached USBTMC instruments
    List,

    /// Send a command without reading a reply
    Write {
        /// Device selection string, e.g. VID=0x0957:PID=0x4d18
        #[arg(short, long, value_name = "SELECTION")]
        device: String,

        /// Command text; a newline terminator is appended
        data: String,
    },

    /// Send a query and print the instrument's reply
    Query {
        /// Device selection string, e.g. VID=0x0957:PID=0x4d18
        #[arg(short, long, value_name = "SELECTION")]
        device: String,

        /// Query text; a newline terminator is appended
        data: String,

        /// Reply timeout in milliseconds
        #[arg(long, value_name = "MS", default_value_t = 5_000)]
        timeout_ms: u64,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();
    setup_logging(&args.log_level).map_err(|e| anyhow!("{}", e))?;

    let config = match &args.config {
        Some(path) => PortConfig::from_file(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => PortConfig::default(),
    };

    match args.command {
        Command::List => list_instruments(),
        Command::Write { device, data } => {
            let port = open_port(&device, config)?;
            port.send_command(terminated(&data).as_bytes(), true)
                .context("sending command")?;
            port.close().map_err(|e| anyhow!("{}", e))
        }
        Command::Query {
            device,
            data,
            timeout_ms,
        } => {
            let port = open_port(&device, config)?;
            let reply = port
                .query(
                    terminated(&data).as_bytes(),
                    Duration::from_millis(timeout_ms),
                )
                .context("running query")?;
            print!("{}", String::from_utf8_lossy(&reply));
            port.close().map_err(|e| anyhow!("{}", e))
        }
    }
}

fn open_port(selection: &str, config: PortConfig) -> Result<UsbtmcPort> {
    debug!(selection, "opening port");
    let port = UsbtmcPort::open(selection, config)
        .map_err(|e| anyhow!("{}", e))
        .with_context(|| format!("opening {}", selection))?;
    port.wait_ready(Duration::from_secs(10))
        .map_err(|e| anyhow!("{}", e))?;
    Ok(port)
}

fn terminated(data: &str) -> String {
    if data.ends_with('\n') {
        data.to_string()
    } else {
        format!("{}\n", data)
    }
}

/// Walk the bus and print a selection string for every USBTMC interface
fn list_instruments() -> Result<()> {
    let context = rusb::Context::new().context("initializing libusb")?;
    let mut found = 0usize;

    for device in context.devices().context("listing devices")?.iter() {
        let descriptor = match device.device_descriptor() {
            Ok(d) => d,
            Err(_) => continue,
        };
        let config = match device.active_config_descriptor() {
            Ok(c) => c,
            Err(_) => continue,
        };
        for interface in config.interfaces() {
            let is_usbtmc = interface.descriptors().any(|d| {
                d.class_code() == USBTMC_CLASS && d.sub_class_code() == USBTMC_SUBCLASS
            });
            if !is_usbtmc {
                continue;
            }
            let serial = device
                .open()
                .ok()
                .and_then(|h| h.read_serial_number_string_ascii(&descriptor).ok());

            let mut selection = format!(
                "VID=0x{:04X}:PID=0x{:04X}",
                descriptor.vendor_id(),
                descriptor.product_id()
            );
            if let Some(serial) = &serial {
                selection.push_str(&format!(":SID={}", serial));
            }
            if interface.number() != 0 {
                selection.push_str(&format!(":bInterfaceNumber={}", interface.number()));
            }
            println!("{}", selection);
            found += 1;
        }
    }

    if found == 0 {
        eprintln!("No USBTMC instruments found");
    }
    Ok(())
}

//! brl-usbd
//!
//! Drives BRL encoder/DAC boards over USB. Lists attached boards, runs
//! one-shot reads, writes and resets, or stays up as a service logging
//! attach and detach events.

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use common::{UsbBridge, UsbEvent, create_usb_bridge, setup_logging};
use driver::config::{self, DriverConfig};
use driver::usb::{DeviceRegistry, Session, spawn_usb_worker};
use protocol::{BoardError, Serial};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::signal;
use tracing::{error, info};

/// How long one-shot reads keep polling for the completion
const READ_DEADLINE: Duration = Duration::from_secs(1);

#[derive(Parser, Debug)]
#[command(name = "brl-usbd")]
#[command(author, version, about = "Bulk transfer driver for BRL encoder/DAC boards")]
#[command(long_about = "
Drives BRL encoder/DAC boards over USB bulk endpoints. Boards are addressed
by the decimal serial number in their USB serial string.

EXAMPLES:
    # List attached boards
    brl-usbd --list-boards

    # Reset encoders and DACs on board 3
    brl-usbd --reset 3

    # Read up to 64 bytes from board 3
    brl-usbd --read 3 --length 64

    # Write two bytes to board 3
    brl-usbd --write 3 --data 0701

    # Run as a service, logging board attach and detach
    brl-usbd --service

CONFIGURATION:
    The driver looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/brl-usb/driver.toml
    3. /etc/brl-usb/driver.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<String>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// Run until Ctrl+C, logging board events
    #[arg(long)]
    service: bool,

    /// List attached boards and exit
    #[arg(long)]
    list_boards: bool,

    /// Print board listings as JSON
    #[arg(long)]
    json: bool,

    /// Show transfer state of every board and exit
    #[arg(long)]
    status: bool,

    /// Run the encoder/DAC reset sequence on a board
    #[arg(long, value_name = "SERIAL", value_parser = parse_serial)]
    reset: Option<Serial>,

    /// Read from a board
    #[arg(long, value_name = "SERIAL", value_parser = parse_serial, requires = "length")]
    read: Option<Serial>,

    /// Number of bytes to request with --read
    #[arg(long, value_name = "N")]
    length: Option<usize>,

    /// Write to a board
    #[arg(long, value_name = "SERIAL", value_parser = parse_serial, requires = "data")]
    write: Option<Serial>,

    /// Hex payload for --write, e.g. "07 01" or "0701"
    #[arg(long, value_name = "HEX")]
    data: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,
}

fn parse_serial(raw: &str) -> Result<Serial, String> {
    Serial::parse(raw).map_err(|e| e.to_string())
}

/// Decode a hex payload, ignoring whitespace
fn parse_hex_payload(raw: &str) -> Result<Vec<u8>> {
    let digits: Vec<char> = raw.chars().filter(|c| !c.is_whitespace()).collect();
    if digits.is_empty() || digits.len() % 2 != 0 {
        return Err(anyhow!("Hex payload must be a non-empty, even number of digits"));
    }

    digits
        .chunks(2)
        .map(|pair| {
            let byte: String = pair.iter().collect();
            u8::from_str_radix(&byte, 16).with_context(|| format!("Invalid hex byte '{}'", byte))
        })
        .collect()
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = DriverConfig::default();
        let path = DriverConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = if let Some(ref path) = args.config {
        config::load_config(path).context("Failed to load configuration")?
    } else {
        DriverConfig::load_or_default()
    };

    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.driver.log_level);
    setup_logging(log_level).context("Failed to setup logging")?;

    info!("brl-usbd v{}", env!("CARGO_PKG_VERSION"));

    let payload = args.data.as_deref().map(parse_hex_payload).transpose()?;

    let registry = Arc::new(DeviceRegistry::new(
        config.usb.max_boards,
        config.device_options(),
    ));
    let settings = config.manager_settings()?;

    let (usb_bridge, worker) = create_usb_bridge();
    let usb_worker_handle = spawn_usb_worker(worker, registry.clone(), settings)
        .context("Failed to spawn USB worker thread")?;

    // The first answer from the worker means initial enumeration is done
    let result = match usb_bridge.list_boards().await {
        Ok(_) => run(&args, &config, payload, registry, usb_bridge.clone()).await,
        Err(e) => Err(anyhow!(e).context("USB worker did not start")),
    };

    info!("Shutting down USB subsystem...");
    if let Err(e) = usb_bridge.shutdown().await {
        error!("Error shutting down USB worker: {:#}", e);
    }

    match usb_worker_handle.join() {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("USB worker failed: {}", e),
        Err(e) => error!("USB worker thread panicked: {:?}", e),
    }

    result
}

async fn run(
    args: &Args,
    config: &DriverConfig,
    payload: Option<Vec<u8>>,
    registry: Arc<DeviceRegistry>,
    usb_bridge: UsbBridge,
) -> Result<()> {
    if let Some(serial) = args.reset {
        return reset_mode(registry, serial).await;
    }
    if let (Some(serial), Some(length)) = (args.read, args.length) {
        return read_mode(registry, serial, length).await;
    }
    if let (Some(serial), Some(payload)) = (args.write, payload) {
        return write_mode(registry, serial, payload).await;
    }
    if args.status {
        return status_mode(usb_bridge, args.json).await;
    }
    if args.service || config.driver.service_mode {
        return run_service(usb_bridge).await;
    }

    list_boards_mode(usb_bridge, args.json).await
}

/// Open `serial`, run `op` on a blocking thread, release
async fn with_session<T, F>(registry: Arc<DeviceRegistry>, serial: Serial, op: F) -> Result<T>
where
    F: FnOnce(&Session) -> Result<T, BoardError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let session = Session::open(&registry, serial)?;
        let result = op(&session);
        session.release();
        result
    })
    .await
    .context("Session task failed")?
    .map_err(|e| {
        let errno = e.as_errno();
        anyhow!(e).context(format!("Board {} ({})", serial, errno))
    })
}

async fn list_boards_mode(usb_bridge: UsbBridge, json: bool) -> Result<()> {
    let boards = usb_bridge
        .list_boards()
        .await
        .context("Failed to list boards")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&boards)?);
        return Ok(());
    }

    if boards.is_empty() {
        println!("No boards found.");
        return Ok(());
    }

    println!("Found {} board(s):\n", boards.len());
    for board in boards {
        let position = match (board.bus_number, board.device_address) {
            (Some(bus), Some(address)) => format!("Bus {:03} Device {:03}", bus, address),
            _ => "Bus position unknown".to_string(),
        };
        println!("  Board {}  {}", board.serial, position);
        println!(
            "      bulk in {:#04x} ({} bytes), bulk out {:#04x} ({} bytes)",
            board.in_endpoint, board.in_packet_size, board.out_endpoint, board.out_packet_size
        );
    }
    Ok(())
}

async fn status_mode(usb_bridge: UsbBridge, json: bool) -> Result<()> {
    let statuses = usb_bridge
        .board_status()
        .await
        .context("Failed to query board status")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&statuses)?);
        return Ok(());
    }

    if statuses.is_empty() {
        println!("No boards found.");
        return Ok(());
    }

    for status in statuses {
        println!(
            "  Board {}  present={} session={} read_busy={} write_busy={} read_requested={} last_read={} last_write={}",
            status.serial,
            status.present,
            status.session_open,
            status.read_busy,
            status.write_busy,
            status.read_requested,
            status.bytes_read,
            status.bytes_written
        );
    }
    Ok(())
}

async fn reset_mode(registry: Arc<DeviceRegistry>, serial: Serial) -> Result<()> {
    let report = with_session(registry, serial, |session| session.reset()).await?;

    println!("Board {} reset:", serial);
    println!("  first write:  {:?}", report.first_write);
    println!("  read request: {:?}", report.read_request);
    println!("  second write: {:?}", report.second_write);
    match report.acknowledged {
        Some(true) => println!("  acknowledged"),
        Some(false) => println!("  unexpected answer"),
        None => println!("  no answer"),
    }
    Ok(())
}

async fn read_mode(registry: Arc<DeviceRegistry>, serial: Serial, length: usize) -> Result<()> {
    let data = with_session(registry, serial, move |session| {
        session.request_read(length)?;

        let mut buffer = vec![0u8; length];
        let deadline = Instant::now() + READ_DEADLINE;
        loop {
            match session.read(&mut buffer) {
                Ok(count) => {
                    buffer.truncate(count);
                    return Ok(buffer);
                }
                Err(BoardError::Busy(_)) if Instant::now() < deadline => {
                    std::thread::sleep(Duration::from_millis(10));
                }
                Err(e) => return Err(e),
            }
        }
    })
    .await?;

    let hex: Vec<String> = data.iter().map(|b| format!("{:02x}", b)).collect();
    println!("{}", hex.join(" "));
    Ok(())
}

async fn write_mode(registry: Arc<DeviceRegistry>, serial: Serial, payload: Vec<u8>) -> Result<()> {
    let accepted = with_session(registry, serial, move |session| session.write(&payload)).await?;
    println!("Board {}: {} byte(s) submitted", serial, accepted);
    Ok(())
}

/// Log board events until Ctrl+C
async fn run_service(usb_bridge: UsbBridge) -> Result<()> {
    info!("Running in service mode, press Ctrl+C to stop");

    loop {
        tokio::select! {
            result = signal::ctrl_c() => {
                match result {
                    Ok(()) => info!("Received Ctrl+C, shutting down gracefully..."),
                    Err(e) => error!("Error waiting for Ctrl+C: {}", e),
                }
                break;
            }
            event = usb_bridge.recv_event() => {
                match event.context("USB worker stopped")? {
                    UsbEvent::BoardAttached { board } => {
                        info!("Board {} attached", board.serial);
                    }
                    UsbEvent::BoardDetached { serial } => {
                        info!("Board {} detached", serial);
                    }
                    UsbEvent::AttachFailed { bus_number, device_address, reason } => {
                        error!(
                            "Board at bus {} address {} failed to attach: {}",
                            bus_number, device_address, reason
                        );
                    }
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hex_payload() {
        assert_eq!(parse_hex_payload("0701").unwrap(), vec![0x07, 0x01]);
        assert_eq!(parse_hex_payload("07 0b ff").unwrap(), vec![0x07, 0x0b, 0xff]);
        assert!(parse_hex_payload("").is_err());
        assert!(parse_hex_payload("070").is_err());
        assert!(parse_hex_payload("zz").is_err());
    }

    #[test]
    fn test_args_parse() {
        let args = Args::try_parse_from(["brl-usbd", "--read", "3", "--length", "64"]).unwrap();
        assert_eq!(args.read, Some(Serial(3)));
        assert_eq!(args.length, Some(64));

        assert!(Args::try_parse_from(["brl-usbd", "--read", "3"]).is_err());
        assert!(Args::try_parse_from(["brl-usbd", "--reset", "x1"]).is_err());
    }
}

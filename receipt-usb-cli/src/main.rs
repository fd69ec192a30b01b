mod commands;
mod logger;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use receipt_usb::{MemoryBus, PrinterConfig, PrinterService, RusbBus, SimulatedPrinter};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// USB receipt printer tool
#[derive(Debug, Parser)]
#[command(name = "receiptctl", version)]
struct Cli {
    /// Log level when RUST_LOG is unset
    #[arg(long, env = "RECEIPT_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Write logs to a daily rolling file in this directory
    #[arg(long, env = "RECEIPT_LOG_DIR")]
    log_dir: Option<PathBuf>,

    /// Use a simulated Epson printer and dump the bytes it receives
    #[arg(long)]
    dry_run: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// List printers on the USB bus
    Scan {
        /// Print candidates as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print lines of text and cut
    Print {
        #[command(flatten)]
        target: TargetArgs,

        /// Lines to print
        #[arg(required = true)]
        lines: Vec<String>,
    },
    /// Kick the cash drawer
    Drawer {
        #[command(flatten)]
        target: TargetArgs,
    },
    /// Print a page exercising alignment, size, bold and underline
    TestPage {
        #[command(flatten)]
        target: TargetArgs,
    },
}

/// Printer selection; without `--vid` the first printer found is used
#[derive(Debug, Clone, Args)]
pub struct TargetArgs {
    /// Vendor ID in hex (e.g. 04b8)
    #[arg(long, value_parser = parse_hex_u16)]
    pub vid: Option<u16>,

    /// Product ID in hex, requires --vid
    #[arg(long, value_parser = parse_hex_u16, requires = "vid")]
    pub pid: Option<u16>,
}

fn parse_hex_u16(s: &str) -> Result<u16, String> {
    let digits = s.trim_start_matches("0x").trim_start_matches("0X");
    u16::from_str_radix(digits, 16).map_err(|e| format!("invalid hex id '{}': {}", s, e))
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    logger::init_logger(&cli.log_level, cli.log_dir.as_deref());

    let config = PrinterConfig::from_env().context("Invalid RECEIPT_* configuration")?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling");
            on_signal.cancel();
        }
    });

    if cli.dry_run {
        let bus = MemoryBus::new();
        let key = bus.attach(SimulatedPrinter::new(0x04b8, 0x0e15, 7));
        let service = PrinterService::new(bus, config);

        commands::execute(&service, &cli.command, &cancel).await?;

        let written = service.bus().written(key);
        info!(bytes = written.len(), "Dry run captured");
        println!("{}", commands::hex_dump(&written));
        return Ok(());
    }

    let bus = RusbBus::new().context("Failed to initialise libusb")?;
    let service = PrinterService::new(bus, config);
    commands::execute(&service, &cli.command, &cancel).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_definition() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_hex() {
        assert_eq!(parse_hex_u16("04b8"), Ok(0x04b8));
        assert_eq!(parse_hex_u16("0x0519"), Ok(0x0519));
        assert!(parse_hex_u16("zz").is_err());
    }

    #[test]
    fn test_pid_requires_vid() {
        let parsed = Cli::try_parse_from(["receiptctl", "drawer", "--pid", "0202"]);
        assert!(parsed.is_err());

        let parsed =
            Cli::try_parse_from(["receiptctl", "drawer", "--vid", "04b8", "--pid", "0202"]).unwrap();
        match parsed.command {
            Command::Drawer { target } => {
                assert_eq!(target.vid, Some(0x04b8));
                assert_eq!(target.pid, Some(0x0202));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}

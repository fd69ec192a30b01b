//! Subcommand implementations

use anyhow::{Context, Result, bail};
use receipt_usb::{
    Align, CandidatePrinter, CommandBuffer, CommandBuilder, Cut, PrintJob, PrintTarget,
    PrinterService, Underline, UsbBus,
};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::{Command, TargetArgs};

pub async fn execute<B: UsbBus>(
    service: &PrinterService<B>,
    command: &Command,
    cancel: &CancellationToken,
) -> Result<()> {
    match command {
        Command::Scan { json } => scan(service, *json).await,
        Command::Print { target, lines } => {
            let payload = text_receipt(service, lines)?;
            print(service, target, payload, cancel).await
        }
        Command::Drawer { target } => {
            let payload = CommandBuilder::new().init().open_drawer().build();
            print(service, target, payload, cancel).await
        }
        Command::TestPage { target } => {
            let payload = test_page(service)?;
            print(service, target, payload, cancel).await
        }
    }
}

async fn scan<B: UsbBus>(service: &PrinterService<B>, json: bool) -> Result<()> {
    let found = service.scan().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&found)?);
        return Ok(());
    }

    if found.is_empty() {
        println!("No printers found");
    }
    for (i, c) in found.iter().enumerate() {
        println!(
            "[{}] {} vendor={} known_vendor={} printer_class={} printer_interface={}",
            i,
            c.descriptor,
            c.vendor_label(),
            c.is_known_vendor,
            c.is_printer_class,
            c.descriptor.has_printer_interface()
        );
    }
    Ok(())
}

async fn print<B: UsbBus>(
    service: &PrinterService<B>,
    target: &TargetArgs,
    payload: CommandBuffer,
    cancel: &CancellationToken,
) -> Result<()> {
    let job = match resolve_target(service, target).await? {
        PrintTarget::Auto => PrintJob::new(payload),
        PrintTarget::Device(d) => PrintJob::to_device(d, payload),
    };

    let report = job
        .run(service, cancel)
        .await
        .context("Print job failed")?;

    info!(device = %report.device, attempts = report.attempts, "Printed");
    println!("Sent {} bytes to {}", report.bytes_written, report.device);
    Ok(())
}

async fn resolve_target<B: UsbBus>(
    service: &PrinterService<B>,
    target: &TargetArgs,
) -> Result<PrintTarget> {
    let Some(vid) = target.vid else {
        return Ok(PrintTarget::Auto);
    };

    let found = service.scan().await?;
    match find_device(&found, vid, target.pid) {
        Some(c) => Ok(PrintTarget::Device(c.descriptor)),
        None => bail!(
            "No printer with vid={:04x}{} on the bus",
            vid,
            target.pid.map(|p| format!(" pid={:04x}", p)).unwrap_or_default()
        ),
    }
}

fn find_device(found: &[CandidatePrinter], vid: u16, pid: Option<u16>) -> Option<&CandidatePrinter> {
    found.iter().find(|c| {
        c.descriptor.vendor_id == vid && pid.is_none_or(|p| c.descriptor.product_id == p)
    })
}

fn builder<B: UsbBus>(service: &PrinterService<B>) -> Result<CommandBuilder> {
    let encoding = service.config().encoding()?;
    Ok(CommandBuilder::with_encoding(encoding))
}

fn text_receipt<B: UsbBus>(service: &PrinterService<B>, lines: &[String]) -> Result<CommandBuffer> {
    let b = lines
        .iter()
        .fold(builder(service)?.init(), |b, line| b.line(line));
    Ok(b.feed(3).cut(Cut::Partial).build())
}

fn test_page<B: UsbBus>(service: &PrinterService<B>) -> Result<CommandBuffer> {
    let b = builder(service)?
        .init()
        .align(Align::Center)
        .size(2, 2)
        .bold(true)
        .line("TEST PAGE")
        .bold(false)
        .size(1, 1)
        .align(Align::Left)
        .line("left")
        .align(Align::Center)
        .line("center")
        .align(Align::Right)
        .line("right")
        .align(Align::Left)
        .underline(Underline::Single)
        .line("underline single")
        .underline(Underline::Double)
        .line("underline double")
        .underline(Underline::Off);

    let b = (1..=4u8).fold(b, |b, n| b.size(n, n).line(&format!("x{n}")));

    Ok(b.size(1, 1).feed(3).cut(Cut::Full).build())
}

/// Bytes as rows of 16 hex pairs
pub fn hex_dump(bytes: &[u8]) -> String {
    bytes
        .chunks(16)
        .map(|row| {
            row.iter()
                .map(|b| format!("{:02X}", b))
                .collect::<Vec<_>>()
                .join(" ")
        })
        .collect::<Vec<_>>()
        .join("\n")
}

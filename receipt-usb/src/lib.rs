//! # receipt-usb
//!
//! USB receipt printer library - discovery, connection lifecycle and ESC/POS.
//!
//! ## Scope
//!
//! This crate handles HOW bytes reach a USB receipt printer:
//! - Device discovery (vendor catalog + USB printer class)
//! - Exclusive connection lifecycle (open, claim, endpoint, transfer, close)
//! - ESC/POS command building
//! - Print jobs with a single transfer retry
//!
//! What goes on the receipt stays in application code.
//!
//! ## Example
//!
//! ```ignore
//! use receipt_usb::{Align, CommandBuilder, Cut, PrintJob, PrinterConfig, PrinterService, RusbBus};
//! use tokio_util::sync::CancellationToken;
//!
//! let service = PrinterService::new(RusbBus::new()?, PrinterConfig::from_env()?);
//!
//! let payload = CommandBuilder::new()
//!     .init()
//!     .align(Align::Center)
//!     .bold(true)
//!     .line("TABLE 12")
//!     .feed(3)
//!     .cut(Cut::Full)
//!     .build();
//!
//! let report = PrintJob::new(payload)
//!     .run(&service, &CancellationToken::new())
//!     .await?;
//! ```

pub mod bus;
mod catalog;
mod config;
mod connection;
mod error;
mod escpos;
mod job;
mod scanner;
mod service;

// Re-exports
pub use bus::{DeviceDescriptor, DeviceKey, MemoryBus, RusbBus, SimulatedPrinter, UsbBus, UsbDevice};
pub use catalog::{Classification, classify, vendor_name};
pub use config::PrinterConfig;
pub use connection::{Connection, ConnectionState, DetachOutcome};
pub use error::{DriverConflict, PrintError, PrintResult};
pub use escpos::{Align, CommandBuffer, CommandBuilder, Cut, Underline};
pub use job::{PrintJob, PrintReport, PrintTarget};
pub use scanner::{CandidatePrinter, scan};
pub use service::{ConnectionHandle, PrinterService};

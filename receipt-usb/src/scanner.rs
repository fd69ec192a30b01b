//! Printer discovery on the USB bus

use serde::Serialize;
use tracing::{debug, info, instrument};

use crate::bus::{DeviceDescriptor, UsbBus};
use crate::catalog;
use crate::error::{PrintError, PrintResult};

/// A device that looks like a receipt printer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CandidatePrinter {
    pub descriptor: DeviceDescriptor,
    /// `None` when the vendor is not in the catalog
    pub vendor_name: Option<String>,
    pub is_known_vendor: bool,
    pub is_printer_class: bool,
}

impl CandidatePrinter {
    /// Vendor name, or "unknown"
    pub fn vendor_label(&self) -> &str {
        self.vendor_name.as_deref().unwrap_or("unknown")
    }
}

/// Enumerate the bus and keep devices that are known printer vendors or
/// report the printer class, in the order the bus lists them.
///
/// Every call re-enumerates, so hot-plugged devices show up immediately.
/// An empty result is not an error.
#[instrument(skip(bus))]
pub fn scan<B: UsbBus + ?Sized>(bus: &B) -> PrintResult<Vec<CandidatePrinter>> {
    let devices = bus
        .devices()
        .map_err(|e| PrintError::DeviceUnavailable(format!("bus enumeration: {}", e)))?;

    let total = devices.len();
    let candidates: Vec<CandidatePrinter> = devices
        .into_iter()
        .filter_map(|descriptor| {
            let c = catalog::classify(&descriptor);
            if !c.is_candidate() {
                debug!(
                    device = %descriptor,
                    class = descriptor.device_class,
                    interface_class = ?descriptor.interface_class,
                    "not a printer"
                );
                return None;
            }
            Some(CandidatePrinter {
                descriptor,
                vendor_name: c.vendor_name.map(str::to_string),
                is_known_vendor: c.is_known_vendor,
                is_printer_class: c.is_printer_class,
            })
        })
        .collect();

    info!(total, found = candidates.len(), "USB scan complete");
    Ok(candidates)
}

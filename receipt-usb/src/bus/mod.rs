//! USB bus abstraction
//!
//! The connection and scanner code only talk to the bus through [`UsbBus`]
//! and [`UsbDevice`], so the same lifecycle runs against libusb
//! ([`RusbBus`]) or the in-memory [`MemoryBus`].

mod memory;
mod rusb_bus;

use std::fmt;
use std::time::Duration;

use serde::Serialize;

pub use memory::{DeviceEvent, MemoryBus, SimulatedPrinter};
pub use rusb_bus::RusbBus;

/// Standard USB class code for printers
pub const PRINTER_CLASS: u8 = 0x07;

/// A device as reported by bus enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct DeviceDescriptor {
    /// Position in the enumeration that produced this descriptor
    pub bus_index: usize,
    pub bus_number: u8,
    pub address: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    /// Class code from the device descriptor, exactly as reported
    pub device_class: u8,
    /// Class of the first interface, when the configuration could be read
    pub interface_class: Option<u8>,
}

impl DeviceDescriptor {
    /// Bus location, unique among currently attached devices
    pub fn key(&self) -> DeviceKey {
        DeviceKey {
            bus_number: self.bus_number,
            address: self.address,
        }
    }

    /// First interface declares the printer class, whatever the device class says
    pub fn has_printer_interface(&self) -> bool {
        self.interface_class == Some(PRINTER_CLASS)
    }
}

impl fmt::Display for DeviceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04x}:{:04x} (bus {} addr {})",
            self.vendor_id, self.product_id, self.bus_number, self.address
        )
    }
}

/// Physical location of a device on the bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceKey {
    pub bus_number: u8,
    pub address: u8,
}

/// Endpoint of an interface's first alternate setting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointInfo {
    /// Endpoint address, direction bit included
    pub address: u8,
    pub direction: rusb::Direction,
    pub transfer_type: rusb::TransferType,
}

/// Interface of the device's active configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceInfo {
    pub number: u8,
    pub class_code: u8,
    pub endpoints: Vec<EndpointInfo>,
}

/// Enumerates and opens devices
pub trait UsbBus: Send + Sync + 'static {
    /// Devices currently attached, in bus order
    fn devices(&self) -> rusb::Result<Vec<DeviceDescriptor>>;

    /// Open a device for exclusive use
    fn open(&self, descriptor: &DeviceDescriptor) -> rusb::Result<Box<dyn UsbDevice>>;
}

/// An opened device. Dropping it closes the device.
pub trait UsbDevice: Send {
    /// Interfaces of the active configuration, in descriptor order
    fn interfaces(&self) -> rusb::Result<Vec<InterfaceInfo>>;

    fn kernel_driver_active(&mut self, interface: u8) -> rusb::Result<bool>;

    fn detach_kernel_driver(&mut self, interface: u8) -> rusb::Result<()>;

    fn attach_kernel_driver(&mut self, interface: u8) -> rusb::Result<()>;

    fn claim_interface(&mut self, interface: u8) -> rusb::Result<()>;

    fn release_interface(&mut self, interface: u8) -> rusb::Result<()>;

    /// Write to an OUT endpoint; returns the number of bytes the device accepted
    fn write_bulk(&mut self, endpoint: u8, data: &[u8], timeout: Duration) -> rusb::Result<usize>;

    /// Clear a stall condition on an endpoint
    fn clear_halt(&mut self, endpoint: u8) -> rusb::Result<()>;
}

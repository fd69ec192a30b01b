//! libusb-backed bus

use std::time::Duration;

use rusb::{Context, Device, DeviceHandle, UsbContext};
use tracing::{debug, instrument};

use super::{DeviceDescriptor, EndpointInfo, InterfaceInfo, UsbBus, UsbDevice};

/// Bus backed by a libusb context
pub struct RusbBus {
    context: Context,
}

impl RusbBus {
    /// Create a new libusb context
    pub fn new() -> rusb::Result<Self> {
        Ok(Self {
            context: Context::new()?,
        })
    }

    fn find(&self, descriptor: &DeviceDescriptor) -> rusb::Result<Device<Context>> {
        self.context
            .devices()?
            .iter()
            .find(|dev| {
                dev.bus_number() == descriptor.bus_number && dev.address() == descriptor.address
            })
            .ok_or(rusb::Error::NoDevice)
    }
}

impl UsbBus for RusbBus {
    #[instrument(skip(self))]
    fn devices(&self) -> rusb::Result<Vec<DeviceDescriptor>> {
        let mut out = Vec::new();

        for (bus_index, dev) in self.context.devices()?.iter().enumerate() {
            let desc = match dev.device_descriptor() {
                Ok(d) => d,
                Err(e) => {
                    debug!(bus = dev.bus_number(), addr = dev.address(), error = %e, "skipping device without descriptor");
                    continue;
                }
            };

            out.push(DeviceDescriptor {
                bus_index,
                bus_number: dev.bus_number(),
                address: dev.address(),
                vendor_id: desc.vendor_id(),
                product_id: desc.product_id(),
                device_class: desc.class_code(),
                interface_class: first_interface_class(&dev),
            });
        }

        Ok(out)
    }

    fn open(&self, descriptor: &DeviceDescriptor) -> rusb::Result<Box<dyn UsbDevice>> {
        let handle = self.find(descriptor)?.open()?;
        Ok(Box::new(RusbDevice { handle }))
    }
}

/// Printers often report device class 0 ("per interface") and put the
/// printer class on the interface instead.
fn first_interface_class(dev: &Device<Context>) -> Option<u8> {
    let cfg = dev.active_config_descriptor().ok()?;
    let iface = cfg.interfaces().next()?;
    let setting = iface.descriptors().next()?;
    Some(setting.class_code())
}

struct RusbDevice {
    handle: DeviceHandle<Context>,
}

impl UsbDevice for RusbDevice {
    fn interfaces(&self) -> rusb::Result<Vec<InterfaceInfo>> {
        let cfg = self.handle.device().active_config_descriptor()?;

        let mut out = Vec::new();
        for iface in cfg.interfaces() {
            let Some(setting) = iface.descriptors().next() else {
                continue;
            };

            let endpoints = setting
                .endpoint_descriptors()
                .map(|ep| EndpointInfo {
                    address: ep.address(),
                    direction: ep.direction(),
                    transfer_type: ep.transfer_type(),
                })
                .collect();

            out.push(InterfaceInfo {
                number: setting.interface_number(),
                class_code: setting.class_code(),
                endpoints,
            });
        }

        Ok(out)
    }

    fn kernel_driver_active(&mut self, interface: u8) -> rusb::Result<bool> {
        self.handle.kernel_driver_active(interface)
    }

    fn detach_kernel_driver(&mut self, interface: u8) -> rusb::Result<()> {
        self.handle.detach_kernel_driver(interface)
    }

    fn attach_kernel_driver(&mut self, interface: u8) -> rusb::Result<()> {
        self.handle.attach_kernel_driver(interface)
    }

    fn claim_interface(&mut self, interface: u8) -> rusb::Result<()> {
        self.handle.claim_interface(interface)
    }

    fn release_interface(&mut self, interface: u8) -> rusb::Result<()> {
        self.handle.release_interface(interface)
    }

    fn write_bulk(&mut self, endpoint: u8, data: &[u8], timeout: Duration) -> rusb::Result<usize> {
        self.handle.write_bulk(endpoint, data, timeout)
    }

    fn clear_halt(&mut self, endpoint: u8) -> rusb::Result<()> {
        self.handle.clear_halt(endpoint)
    }
}

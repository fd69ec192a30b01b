//! In-memory bus
//!
//! Simulated printers with scriptable faults. Used by the tests and by
//! `receiptctl --dry-run` to capture job bytes without hardware.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rusb::{Direction, TransferType};

use super::{DeviceDescriptor, DeviceKey, EndpointInfo, InterfaceInfo, PRINTER_CLASS, UsbBus, UsbDevice};

/// Something that happened to a simulated device
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    Open,
    DetachKernelDriver(u8),
    AttachKernelDriver(u8),
    Claim(u8),
    Release(u8),
    Write(usize),
    ClearHalt(u8),
    Close,
}

/// A printer attached to a [`MemoryBus`]
#[derive(Debug, Clone)]
pub struct SimulatedPrinter {
    vendor_id: u16,
    product_id: u16,
    device_class: u8,
    location: Option<DeviceKey>,
    interfaces: Vec<InterfaceInfo>,
    kernel_driver_bound: bool,
    open_error: Option<rusb::Error>,
    detach_error: Option<rusb::Error>,
    claim_error: Option<rusb::Error>,
    write_errors: VecDeque<rusb::Error>,
    clear_halt_error: Option<rusb::Error>,
    max_chunk: Option<usize>,
    unplug_on_write: bool,
    write_delay: Option<Duration>,
}

impl SimulatedPrinter {
    /// Printer with one interface exposing a bulk IN (0x81) then a bulk OUT (0x02) endpoint
    pub fn new(vendor_id: u16, product_id: u16, device_class: u8) -> Self {
        Self {
            vendor_id,
            product_id,
            device_class,
            location: None,
            interfaces: vec![InterfaceInfo {
                number: 0,
                class_code: PRINTER_CLASS,
                endpoints: vec![
                    EndpointInfo {
                        address: 0x81,
                        direction: Direction::In,
                        transfer_type: TransferType::Bulk,
                    },
                    EndpointInfo {
                        address: 0x02,
                        direction: Direction::Out,
                        transfer_type: TransferType::Bulk,
                    },
                ],
            }],
            kernel_driver_bound: false,
            open_error: None,
            detach_error: None,
            claim_error: None,
            write_errors: VecDeque::new(),
            clear_halt_error: None,
            max_chunk: None,
            unplug_on_write: false,
            write_delay: None,
        }
    }

    /// Place the device at a fixed bus location
    pub fn at(mut self, bus_number: u8, address: u8) -> Self {
        self.location = Some(DeviceKey { bus_number, address });
        self
    }

    pub fn with_interfaces(mut self, interfaces: Vec<InterfaceInfo>) -> Self {
        self.interfaces = interfaces;
        self
    }

    /// Drop every OUT endpoint from every interface
    pub fn without_out_endpoint(mut self) -> Self {
        for iface in &mut self.interfaces {
            iface.endpoints.retain(|ep| ep.direction != Direction::Out);
        }
        self
    }

    /// Simulate an OS driver (e.g. usblp) bound to the interface
    pub fn kernel_driver_bound(mut self) -> Self {
        self.kernel_driver_bound = true;
        self
    }

    pub fn fail_open(mut self, error: rusb::Error) -> Self {
        self.open_error = Some(error);
        self
    }

    pub fn fail_detach(mut self, error: rusb::Error) -> Self {
        self.detach_error = Some(error);
        self
    }

    pub fn fail_claim(mut self, error: rusb::Error) -> Self {
        self.claim_error = Some(error);
        self
    }

    /// Errors returned by successive writes, one per write call
    pub fn fail_writes(mut self, errors: impl IntoIterator<Item = rusb::Error>) -> Self {
        self.write_errors.extend(errors);
        self
    }

    pub fn fail_clear_halt(mut self, error: rusb::Error) -> Self {
        self.clear_halt_error = Some(error);
        self
    }

    /// Accept at most `n` bytes per write call
    pub fn max_chunk(mut self, n: usize) -> Self {
        self.max_chunk = Some(n.max(1));
        self
    }

    /// Vanish from the bus on the first write
    pub fn unplug_on_write(mut self) -> Self {
        self.unplug_on_write = true;
        self
    }

    /// Block every write for `delay` before completing it
    pub fn write_delay(mut self, delay: Duration) -> Self {
        self.write_delay = Some(delay);
        self
    }
}

struct Slot {
    key: DeviceKey,
    printer: SimulatedPrinter,
    attached: bool,
    detached_driver: bool,
    written: Vec<u8>,
    events: Vec<DeviceEvent>,
}

#[derive(Default)]
struct BusState {
    slots: Vec<Slot>,
}

impl BusState {
    fn slot(&mut self, key: DeviceKey) -> rusb::Result<&mut Slot> {
        self.slots
            .iter_mut()
            .find(|s| s.key == key && s.attached)
            .ok_or(rusb::Error::NoDevice)
    }

    /// Lowest bus location no slot has used yet
    fn free_key(&self) -> DeviceKey {
        (1..=u8::MAX)
            .flat_map(|bus_number| (1..=u8::MAX).map(move |address| DeviceKey { bus_number, address }))
            .find(|key| !self.slots.iter().any(|s| s.key == *key))
            .unwrap_or(DeviceKey {
                bus_number: u8::MAX,
                address: u8::MAX,
            })
    }

    fn record(&mut self, key: DeviceKey, event: DeviceEvent) {
        if let Some(slot) = self.slots.iter_mut().find(|s| s.key == key) {
            slot.events.push(event);
        }
    }
}

/// In-memory bus holding simulated printers
#[derive(Clone, Default)]
pub struct MemoryBus {
    state: Arc<Mutex<BusState>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Plug a printer in; returns its bus location.
    ///
    /// Without [`SimulatedPrinter::at`] the device gets the lowest free
    /// location. Attaching at a taken location replaces the device there.
    pub fn attach(&self, printer: SimulatedPrinter) -> DeviceKey {
        let mut state = self.lock();
        let key = printer.location.unwrap_or_else(|| state.free_key());
        state.slots.retain(|s| s.key != key);

        state.slots.push(Slot {
            key,
            printer,
            attached: true,
            detached_driver: false,
            written: Vec::new(),
            events: Vec::new(),
        });
        key
    }

    /// Unplug a printer; open handles start failing with `NoDevice`
    pub fn unplug(&self, key: DeviceKey) {
        let mut state = self.lock();
        if let Some(slot) = state.slots.iter_mut().find(|s| s.key == key) {
            slot.attached = false;
        }
    }

    /// Bytes the device accepted so far
    pub fn written(&self, key: DeviceKey) -> Vec<u8> {
        self.lock()
            .slots
            .iter()
            .find(|s| s.key == key)
            .map(|s| s.written.clone())
            .unwrap_or_default()
    }

    /// Everything that happened to the device, in order
    pub fn events(&self, key: DeviceKey) -> Vec<DeviceEvent> {
        self.lock()
            .slots
            .iter()
            .find(|s| s.key == key)
            .map(|s| s.events.clone())
            .unwrap_or_default()
    }

    /// Number of write calls the device received
    pub fn write_calls(&self, key: DeviceKey) -> usize {
        self.events(key)
            .iter()
            .filter(|e| matches!(e, DeviceEvent::Write(_)))
            .count()
    }

    fn lock(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl UsbBus for MemoryBus {
    fn devices(&self) -> rusb::Result<Vec<DeviceDescriptor>> {
        Ok(self
            .lock()
            .slots
            .iter()
            .filter(|s| s.attached)
            .enumerate()
            .map(|(bus_index, s)| DeviceDescriptor {
                bus_index,
                bus_number: s.key.bus_number,
                address: s.key.address,
                vendor_id: s.printer.vendor_id,
                product_id: s.printer.product_id,
                device_class: s.printer.device_class,
                interface_class: s.printer.interfaces.first().map(|iface| iface.class_code),
            })
            .collect())
    }

    fn open(&self, descriptor: &DeviceDescriptor) -> rusb::Result<Box<dyn UsbDevice>> {
        let key = descriptor.key();
        let mut state = self.lock();
        let slot = state.slot(key)?;

        if let Some(e) = slot.printer.open_error {
            return Err(e);
        }
        slot.events.push(DeviceEvent::Open);

        Ok(Box::new(MemoryDevice {
            key,
            bus: self.clone(),
        }))
    }
}

struct MemoryDevice {
    key: DeviceKey,
    bus: MemoryBus,
}

impl UsbDevice for MemoryDevice {
    fn interfaces(&self) -> rusb::Result<Vec<InterfaceInfo>> {
        let mut state = self.bus.lock();
        Ok(state.slot(self.key)?.printer.interfaces.clone())
    }

    fn kernel_driver_active(&mut self, _interface: u8) -> rusb::Result<bool> {
        let mut state = self.bus.lock();
        let slot = state.slot(self.key)?;
        Ok(slot.printer.kernel_driver_bound && !slot.detached_driver)
    }

    fn detach_kernel_driver(&mut self, interface: u8) -> rusb::Result<()> {
        let mut state = self.bus.lock();
        let slot = state.slot(self.key)?;
        slot.events.push(DeviceEvent::DetachKernelDriver(interface));
        if let Some(e) = slot.printer.detach_error {
            return Err(e);
        }
        slot.detached_driver = true;
        Ok(())
    }

    fn attach_kernel_driver(&mut self, interface: u8) -> rusb::Result<()> {
        let mut state = self.bus.lock();
        let slot = state.slot(self.key)?;
        slot.events.push(DeviceEvent::AttachKernelDriver(interface));
        slot.detached_driver = false;
        Ok(())
    }

    fn claim_interface(&mut self, interface: u8) -> rusb::Result<()> {
        let mut state = self.bus.lock();
        let slot = state.slot(self.key)?;
        if let Some(e) = slot.printer.claim_error {
            return Err(e);
        }
        slot.events.push(DeviceEvent::Claim(interface));
        Ok(())
    }

    fn release_interface(&mut self, interface: u8) -> rusb::Result<()> {
        let mut state = self.bus.lock();
        let slot = state.slot(self.key)?;
        slot.events.push(DeviceEvent::Release(interface));
        Ok(())
    }

    fn write_bulk(&mut self, _endpoint: u8, data: &[u8], _timeout: Duration) -> rusb::Result<usize> {
        let delay = {
            let mut state = self.bus.lock();
            state.slot(self.key)?.printer.write_delay
        };
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }

        let mut state = self.bus.lock();
        let slot = state.slot(self.key)?;
        slot.events.push(DeviceEvent::Write(data.len()));

        if slot.printer.unplug_on_write {
            slot.attached = false;
            return Err(rusb::Error::NoDevice);
        }
        if let Some(e) = slot.printer.write_errors.pop_front() {
            return Err(e);
        }

        let n = slot.printer.max_chunk.map_or(data.len(), |max| data.len().min(max));
        slot.written.extend_from_slice(&data[..n]);
        Ok(n)
    }

    fn clear_halt(&mut self, endpoint: u8) -> rusb::Result<()> {
        let mut state = self.bus.lock();
        let slot = state.slot(self.key)?;
        slot.events.push(DeviceEvent::ClearHalt(endpoint));
        match slot.printer.clear_halt_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for MemoryDevice {
    fn drop(&mut self) {
        self.bus.lock().record(self.key, DeviceEvent::Close);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_devices_in_attach_order() {
        let bus = MemoryBus::new();
        bus.attach(SimulatedPrinter::new(0x04b8, 0x0202, 0));
        bus.attach(SimulatedPrinter::new(0x1234, 0x0001, 7));

        let devices = bus.devices().unwrap();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].vendor_id, 0x04b8);
        assert_eq!(devices[0].bus_index, 0);
        assert_eq!(devices[1].bus_index, 1);
        assert_eq!(devices[1].address, 2);
    }

    #[test]
    fn test_unplugged_device_disappears() {
        let bus = MemoryBus::new();
        let key = bus.attach(SimulatedPrinter::new(0x04b8, 0x0202, 0));
        bus.unplug(key);

        assert!(bus.devices().unwrap().is_empty());
    }

    #[test]
    fn test_auto_location_skips_taken_keys() {
        let bus = MemoryBus::new();
        let fixed = bus.attach(SimulatedPrinter::new(0x04b8, 0x0202, 7).at(1, 1));
        let auto = bus.attach(SimulatedPrinter::new(0x0519, 0x0003, 7));

        assert_eq!(fixed, DeviceKey { bus_number: 1, address: 1 });
        assert_eq!(auto, DeviceKey { bus_number: 1, address: 2 });
        assert_eq!(bus.devices().unwrap().len(), 2);
    }

    #[test]
    fn test_many_attaches_get_distinct_keys() {
        let bus = MemoryBus::new();
        let keys: Vec<DeviceKey> = (0..300)
            .map(|_| bus.attach(SimulatedPrinter::new(0x04b8, 0x0202, 7)))
            .collect();

        let unique: std::collections::HashSet<_> = keys.iter().collect();
        assert_eq!(unique.len(), 300);
        assert_eq!(keys[255], DeviceKey { bus_number: 2, address: 1 });
        assert_eq!(bus.devices().unwrap().len(), 300);
    }

    #[test]
    fn test_attach_at_taken_location_replaces() {
        let bus = MemoryBus::new();
        let first = bus.attach(SimulatedPrinter::new(0x04b8, 0x0202, 7).at(3, 9));
        let second = bus.attach(SimulatedPrinter::new(0x0519, 0x0003, 7).at(3, 9));

        assert_eq!(first, second);
        let devices = bus.devices().unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].vendor_id, 0x0519);
    }

    #[test]
    fn test_chunked_write() {
        let bus = MemoryBus::new();
        let key = bus.attach(SimulatedPrinter::new(0x04b8, 0x0202, 0).max_chunk(2));
        let desc = bus.devices().unwrap()[0];

        let mut dev = bus.open(&desc).unwrap();
        let n = dev.write_bulk(0x02, b"abc", Duration::from_secs(1)).unwrap();
        assert_eq!(n, 2);
        assert_eq!(bus.written(key), b"ab");

        drop(dev);
        assert_eq!(bus.events(key).last(), Some(&DeviceEvent::Close));
    }
}

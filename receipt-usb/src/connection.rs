//! Printer connection lifecycle
//!
//! ```text
//! Closed ─open─▶ Opened ─claim─▶ InterfaceClaimed ─locate_out_endpoint─▶ Ready
//!                                                                          │
//!                                              Ready ◀─ok── Transferring ◀─┘
//!                                                           └─err─▶ Failed
//! any ─close─▶ Closed
//! ```
//!
//! A [`Connection`] closes itself on drop, so every early return releases
//! the interface and closes the device.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashSet;
use rusb::Direction;
use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

use crate::bus::{DeviceDescriptor, DeviceKey, UsbBus, UsbDevice};
use crate::config::PrinterConfig;
use crate::error::{DriverConflict, PrintError, PrintResult};

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    Closed,
    Opened,
    InterfaceClaimed,
    Ready,
    Transferring,
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Result of trying to free the interface from an OS driver
#[derive(Debug, Clone)]
pub enum DetachOutcome {
    /// No driver was bound
    NotBound,
    Detached,
    /// The platform cannot report or detach kernel drivers
    Unsupported,
    /// The driver is still bound; claim may still work
    Failed(DriverConflict),
}

/// Exclusive hold on a bus location, released on drop
pub(crate) struct DeviceLease {
    leases: Arc<DashSet<DeviceKey>>,
    key: DeviceKey,
}

impl DeviceLease {
    /// `None` when the device already has a live connection
    pub(crate) fn acquire(leases: &Arc<DashSet<DeviceKey>>, key: DeviceKey) -> Option<Self> {
        leases.insert(key).then(|| Self {
            leases: Arc::clone(leases),
            key,
        })
    }
}

impl Drop for DeviceLease {
    fn drop(&mut self) {
        self.leases.remove(&self.key);
    }
}

/// One physical connection to a printer
pub struct Connection {
    descriptor: DeviceDescriptor,
    device: Option<Box<dyn UsbDevice>>,
    state: ConnectionState,
    interface: Option<u8>,
    endpoint: Option<u8>,
    detached_driver: bool,
    detach_kernel_driver: bool,
    timeout: Duration,
    lease: Option<DeviceLease>,
}

impl Connection {
    /// Open the device for exclusive access
    #[instrument(skip(bus, config), fields(device = %descriptor))]
    pub fn open<B: UsbBus + ?Sized>(
        bus: &B,
        descriptor: &DeviceDescriptor,
        config: &PrinterConfig,
    ) -> PrintResult<Self> {
        let device = bus.open(descriptor).map_err(|e| match e {
            rusb::Error::Access => PrintError::PermissionDenied(descriptor.to_string()),
            other => PrintError::DeviceUnavailable(format!("{}: {}", descriptor, other)),
        })?;

        info!("Device opened");
        Ok(Self {
            descriptor: *descriptor,
            device: Some(device),
            state: ConnectionState::Opened,
            interface: None,
            endpoint: None,
            detached_driver: false,
            detach_kernel_driver: config.detach_kernel_driver,
            timeout: config.transfer_timeout(),
            lease: None,
        })
    }

    /// Open, claim and locate the OUT endpoint in one go.
    ///
    /// On failure the half-built connection is dropped, which closes it.
    pub fn establish<B: UsbBus + ?Sized>(
        bus: &B,
        descriptor: &DeviceDescriptor,
        config: &PrinterConfig,
    ) -> PrintResult<Self> {
        let mut conn = Self::open(bus, descriptor, config)?;
        conn.claim()?;
        conn.locate_out_endpoint()?;
        Ok(conn)
    }

    pub fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == ConnectionState::Ready
    }

    /// Claimed interface number
    pub fn interface(&self) -> Option<u8> {
        self.interface
    }

    /// OUT endpoint address once located
    pub fn endpoint(&self) -> Option<u8> {
        self.endpoint
    }

    pub(crate) fn hold_lease(&mut self, lease: DeviceLease) {
        self.lease = Some(lease);
    }

    /// Claim the first interface, detaching a conflicting OS driver first
    #[instrument(skip(self), fields(device = %self.descriptor))]
    pub fn claim(&mut self) -> PrintResult<u8> {
        self.expect_state("claim", ConnectionState::Opened)?;
        let device = self.device_mut("claim")?;

        let first = match device.interfaces() {
            Ok(list) => list.first().map(|iface| iface.number),
            Err(e) => {
                error!(error = %e, "Reading interfaces failed");
                return Err(self.fail(PrintError::Claim {
                    interface: 0,
                    reason: e.to_string(),
                }));
            }
        };
        let Some(number) = first else {
            return Err(self.fail(PrintError::Claim {
                interface: 0,
                reason: "device has no interfaces".to_string(),
            }));
        };

        if self.detach_kernel_driver {
            match self.detach_conflicting_driver(number) {
                DetachOutcome::Detached => {
                    info!(interface = number, "Kernel driver detached");
                    self.detached_driver = true;
                }
                DetachOutcome::Failed(conflict) => {
                    warn!(%conflict, "Continuing with claim");
                }
                DetachOutcome::NotBound | DetachOutcome::Unsupported => {}
            }
        }

        let device = self.device_mut("claim")?;
        if let Err(e) = device.claim_interface(number) {
            error!(interface = number, error = %e, "Interface claim failed");
            return Err(self.fail(PrintError::Claim {
                interface: number,
                reason: e.to_string(),
            }));
        }

        self.interface = Some(number);
        self.state = ConnectionState::InterfaceClaimed;
        info!(interface = number, "Interface claimed");
        Ok(number)
    }

    /// Best-effort detach of an OS driver bound to `interface`
    pub fn detach_conflicting_driver(&mut self, interface: u8) -> DetachOutcome {
        let Some(device) = self.device.as_mut() else {
            return DetachOutcome::Unsupported;
        };

        match device.kernel_driver_active(interface) {
            Ok(false) => DetachOutcome::NotBound,
            Err(rusb::Error::NotSupported) => DetachOutcome::Unsupported,
            Ok(true) => match device.detach_kernel_driver(interface) {
                Ok(()) => DetachOutcome::Detached,
                Err(rusb::Error::NotSupported) => DetachOutcome::Unsupported,
                Err(e) => DetachOutcome::Failed(DriverConflict {
                    interface,
                    reason: e.to_string(),
                }),
            },
            Err(e) => DetachOutcome::Failed(DriverConflict {
                interface,
                reason: format!("driver query: {}", e),
            }),
        }
    }

    /// Find the first OUT endpoint of the claimed interface
    #[instrument(skip(self), fields(device = %self.descriptor))]
    pub fn locate_out_endpoint(&mut self) -> PrintResult<u8> {
        self.expect_state("locate endpoint", ConnectionState::InterfaceClaimed)?;
        let number = self.interface.unwrap_or_default();
        let device = self.device_mut("locate endpoint")?;

        let interfaces = match device.interfaces() {
            Ok(list) => list,
            Err(rusb::Error::NoDevice) => {
                error!("Device disconnected during endpoint discovery");
                self.force_closed();
                return Err(PrintError::DeviceUnavailable(format!(
                    "{} disconnected",
                    self.descriptor
                )));
            }
            Err(e) => {
                error!(error = %e, "Reading interfaces failed");
                return Err(self.fail(PrintError::DeviceUnavailable(format!(
                    "{}: {}",
                    self.descriptor, e
                ))));
            }
        };

        let found = interfaces
            .into_iter()
            .find(|iface| iface.number == number)
            .and_then(|iface| {
                iface
                    .endpoints
                    .into_iter()
                    .find(|ep| ep.direction == Direction::Out)
            });

        let Some(endpoint) = found else {
            error!(interface = number, "No OUT endpoint, printing impossible");
            return Err(self.fail(PrintError::EndpointNotFound { interface: number }));
        };

        debug!(endpoint = format_args!("{:#04x}", endpoint.address), kind = ?endpoint.transfer_type, "OUT endpoint located");
        self.endpoint = Some(endpoint.address);
        self.state = ConnectionState::Ready;
        Ok(endpoint.address)
    }

    /// Write the whole buffer to the OUT endpoint.
    ///
    /// A partial write keeps going from where the device stopped. Hot unplug
    /// closes the connection; other failures leave it `Failed`.
    #[instrument(skip(self, data), fields(device = %self.descriptor, data_len = data.len()))]
    pub fn transfer(&mut self, data: &[u8]) -> PrintResult<usize> {
        self.expect_state("transfer", ConnectionState::Ready)?;
        let endpoint = self.endpoint.unwrap_or_default();
        let timeout = self.timeout;
        self.state = ConnectionState::Transferring;

        let device = self.device_mut("transfer")?;
        let mut sent = 0;
        while sent < data.len() {
            match device.write_bulk(endpoint, &data[sent..], timeout) {
                Ok(0) => {
                    return Err(self.fail(PrintError::Transfer(
                        "device accepted no bytes".to_string(),
                    )));
                }
                Ok(n) => {
                    sent += n;
                    debug!(sent, total = data.len(), "chunk written");
                }
                Err(rusb::Error::Timeout) => {
                    warn!(sent, "Device did not acknowledge");
                    return Err(self.fail(PrintError::Timeout(format!(
                        "{} after {} ms ({} of {} bytes sent)",
                        self.descriptor,
                        timeout.as_millis(),
                        sent,
                        data.len()
                    ))));
                }
                Err(rusb::Error::NoDevice) => {
                    error!(sent, "Device disconnected during transfer");
                    self.force_closed();
                    return Err(PrintError::Transfer(format!(
                        "{} disconnected",
                        self.descriptor
                    )));
                }
                Err(e) => {
                    warn!(sent, error = %e, "Write failed");
                    return Err(self.fail(PrintError::Transfer(e.to_string())));
                }
            }
        }

        self.state = ConnectionState::Ready;
        info!(bytes = sent, "Transfer complete");
        Ok(sent)
    }

    /// Bring a connection that failed mid-transfer back to `Ready` by
    /// clearing the endpoint halt.
    ///
    /// Clearing the halt is best-effort. Only a device that is gone keeps
    /// the connection from coming back; it is closed and `Transfer` returned.
    #[instrument(skip(self), fields(device = %self.descriptor))]
    pub fn recover(&mut self) -> PrintResult<()> {
        self.expect_state("recover", ConnectionState::Failed)?;
        let Some(endpoint) = self.endpoint else {
            return Err(PrintError::InvalidState {
                op: "recover",
                state: self.state,
            });
        };

        let device = self.device_mut("recover")?;
        match device.clear_halt(endpoint) {
            Ok(()) => debug!("Endpoint halt cleared"),
            Err(rusb::Error::NoDevice) => {
                self.force_closed();
                return Err(PrintError::Transfer(format!("{} disconnected", self.descriptor)));
            }
            Err(e) => warn!(endpoint, error = %e, "Clearing endpoint halt failed"),
        }

        self.state = ConnectionState::Ready;
        Ok(())
    }

    /// Release the interface and close the device. Idempotent; cleanup
    /// failures are logged, never returned.
    pub fn close(&mut self) {
        if let Some(mut device) = self.device.take() {
            if let Some(number) = self.interface.take() {
                if let Err(e) = device.release_interface(number) {
                    warn!(device = %self.descriptor, interface = number, error = %e, "Release failed");
                }
                if self.detached_driver
                    && let Err(e) = device.attach_kernel_driver(number)
                {
                    debug!(device = %self.descriptor, error = %e, "Kernel driver not re-attached");
                }
            }
            drop(device);
            info!(device = %self.descriptor, "Connection closed");
        }

        self.detached_driver = false;
        self.endpoint = None;
        self.interface = None;
        self.state = ConnectionState::Closed;
        self.lease = None;
    }

    fn expect_state(&self, op: &'static str, expected: ConnectionState) -> PrintResult<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(PrintError::InvalidState {
                op,
                state: self.state,
            })
        }
    }

    fn device_mut(&mut self, op: &'static str) -> PrintResult<&mut Box<dyn UsbDevice>> {
        let state = self.state;
        self.device
            .as_mut()
            .ok_or(PrintError::InvalidState { op, state })
    }

    fn fail(&mut self, err: PrintError) -> PrintError {
        self.state = ConnectionState::Failed;
        err
    }

    /// The device is gone: nothing to release, just drop the handle
    fn force_closed(&mut self) {
        self.device = None;
        self.interface = None;
        self.detached_driver = false;
        self.close();
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("descriptor", &self.descriptor)
            .field("state", &self.state)
            .field("interface", &self.interface)
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

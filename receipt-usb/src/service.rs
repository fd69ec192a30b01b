//! Host-facing printer service
//!
//! The narrow boundary the application talks to: `scan`, `connect`,
//! `print`, `disconnect`. Blocking USB calls run on tokio's blocking pool;
//! each connection sits behind an async mutex so transfers on it are
//! serialized, and a device can only have one live connection at a time.

use std::sync::Arc;

use dashmap::DashSet;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{instrument, warn};

use crate::bus::{DeviceDescriptor, DeviceKey, UsbBus};
use crate::config::PrinterConfig;
use crate::connection::{Connection, ConnectionState, DeviceLease};
use crate::error::{PrintError, PrintResult};
use crate::job::{PrintJob, PrintReport};
use crate::scanner::{self, CandidatePrinter};

/// Handle to a live connection
///
/// Cloning shares the same connection.
#[derive(Clone)]
pub struct ConnectionHandle {
    descriptor: DeviceDescriptor,
    inner: Arc<Mutex<Connection>>,
}

impl ConnectionHandle {
    pub fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    pub async fn state(&self) -> ConnectionState {
        self.inner.lock().await.state()
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("descriptor", &self.descriptor)
            .finish()
    }
}

/// Printer service over a USB bus
pub struct PrinterService<B: UsbBus> {
    bus: Arc<B>,
    config: PrinterConfig,
    leases: Arc<DashSet<DeviceKey>>,
}

impl<B: UsbBus> PrinterService<B> {
    pub fn new(bus: B, config: PrinterConfig) -> Self {
        Self {
            bus: Arc::new(bus),
            config,
            leases: Arc::new(DashSet::new()),
        }
    }

    pub fn config(&self) -> &PrinterConfig {
        &self.config
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    /// Enumerate candidate printers
    pub async fn scan(&self) -> PrintResult<Vec<CandidatePrinter>> {
        let bus = Arc::clone(&self.bus);
        run_blocking(move || scanner::scan(bus.as_ref())).await
    }

    /// Open, claim and locate the OUT endpoint of a device
    #[instrument(skip(self), fields(device = %descriptor))]
    pub async fn connect(&self, descriptor: DeviceDescriptor) -> PrintResult<ConnectionHandle> {
        let lease = DeviceLease::acquire(&self.leases, descriptor.key()).ok_or_else(|| {
            PrintError::DeviceUnavailable(format!("{} already has a live connection", descriptor))
        })?;

        let bus = Arc::clone(&self.bus);
        let config = self.config.clone();
        let conn = run_blocking(move || {
            let mut conn = Connection::establish(bus.as_ref(), &descriptor, &config)?;
            conn.hold_lease(lease);
            Ok(conn)
        })
        .await?;

        Ok(ConnectionHandle {
            descriptor,
            inner: Arc::new(Mutex::new(conn)),
        })
    }

    /// Send bytes over a connection.
    ///
    /// Waits at most the configured ack deadline. When it expires the caller
    /// gets `Timeout`; the write itself cannot be recalled and the connection
    /// stays locked until the device gives up.
    #[instrument(skip(self, handle, data), fields(device = %handle.descriptor, data_len = data.len()))]
    pub async fn print(&self, handle: &ConnectionHandle, data: &[u8]) -> PrintResult<usize> {
        let mut conn = Arc::clone(&handle.inner).lock_owned().await;
        let data = data.to_vec();
        let task = tokio::task::spawn_blocking(move || conn.transfer(&data));

        let deadline = self.config.ack_deadline();
        match tokio::time::timeout(deadline, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(PrintError::Transfer(format!("transfer task failed: {}", e))),
            Err(_) => Err(PrintError::Timeout(format!(
                "{} did not acknowledge within {} ms",
                handle.descriptor,
                deadline.as_millis()
            ))),
        }
    }

    /// Clear a failed transfer so the connection can be retried
    pub async fn recover(&self, handle: &ConnectionHandle) -> PrintResult<()> {
        let mut conn = Arc::clone(&handle.inner).lock_owned().await;
        run_blocking(move || conn.recover()).await
    }

    /// Close the connection. Idempotent, never fails from the caller's side.
    pub async fn disconnect(&self, handle: &ConnectionHandle) {
        let mut conn = Arc::clone(&handle.inner).lock_owned().await;
        let result = tokio::task::spawn_blocking(move || conn.close()).await;
        if let Err(e) = result {
            warn!(device = %handle.descriptor, error = %e, "Disconnect task failed");
        }
    }

    /// Run a print job end to end
    pub async fn run_job(
        &self,
        job: PrintJob,
        cancel: &CancellationToken,
    ) -> PrintResult<PrintReport> {
        job.run(self, cancel).await
    }
}

async fn run_blocking<T, F>(f: F) -> PrintResult<T>
where
    F: FnOnce() -> PrintResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| PrintError::DeviceUnavailable(format!("USB task failed: {}", e)))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{DeviceEvent, MemoryBus, SimulatedPrinter};
    use std::time::Duration;

    fn service_with(printer: SimulatedPrinter) -> (PrinterService<MemoryBus>, DeviceKey) {
        let bus = MemoryBus::new();
        let key = bus.attach(printer);
        (PrinterService::new(bus, PrinterConfig::default()), key)
    }

    #[tokio::test]
    async fn test_scan_connect_print_disconnect() {
        let (service, key) = service_with(SimulatedPrinter::new(0x04b8, 0x0202, 0));

        let found = service.scan().await.unwrap();
        assert_eq!(found.len(), 1);

        let handle = service.connect(found[0].descriptor).await.unwrap();
        assert_eq!(handle.state().await, ConnectionState::Ready);

        assert_eq!(service.print(&handle, b"\x1B\x40").await.unwrap(), 2);
        assert_eq!(service.bus().written(key), b"\x1B\x40");

        service.disconnect(&handle).await;
        assert_eq!(handle.state().await, ConnectionState::Closed);

        // idempotent
        service.disconnect(&handle).await;
        assert_eq!(handle.state().await, ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_one_live_connection_per_device() {
        let (service, _) = service_with(SimulatedPrinter::new(0x04b8, 0x0202, 7));
        let desc = service.scan().await.unwrap()[0].descriptor;

        let first = service.connect(desc).await.unwrap();
        let err = service.connect(desc).await.unwrap_err();
        assert!(matches!(err, PrintError::DeviceUnavailable(_)));

        service.disconnect(&first).await;
        let again = service.connect(desc).await.unwrap();
        service.disconnect(&again).await;
    }

    #[tokio::test]
    async fn test_failed_connect_releases_lease() {
        let (service, key) = service_with(
            SimulatedPrinter::new(0x04b8, 0x0202, 7).fail_claim(rusb::Error::Busy),
        );
        let desc = service.scan().await.unwrap()[0].descriptor;

        for _ in 0..2 {
            let err = service.connect(desc).await.unwrap_err();
            assert!(matches!(err, PrintError::Claim { .. }));
        }
        assert_eq!(service.bus().write_calls(key), 0);
        assert_eq!(service.bus().events(key).last(), Some(&DeviceEvent::Close));
    }

    #[tokio::test]
    async fn test_print_after_disconnect_is_rejected() {
        let (service, key) = service_with(SimulatedPrinter::new(0x04b8, 0x0202, 7));
        let desc = service.scan().await.unwrap()[0].descriptor;
        let handle = service.connect(desc).await.unwrap();
        service.disconnect(&handle).await;

        let err = service.print(&handle, b"x").await.unwrap_err();
        assert!(matches!(err, PrintError::InvalidState { .. }));
        assert_eq!(service.bus().write_calls(key), 0);
    }

    #[tokio::test]
    async fn test_stalled_device_times_out() {
        let bus = MemoryBus::new();
        bus.attach(
            SimulatedPrinter::new(0x04b8, 0x0202, 7).write_delay(Duration::from_millis(500)),
        );
        let config = PrinterConfig {
            transfer_timeout_ms: 20,
            ack_grace_ms: 20,
            ..PrinterConfig::default()
        };
        let service = PrinterService::new(bus, config);
        let desc = service.scan().await.unwrap()[0].descriptor;
        let handle = service.connect(desc).await.unwrap();

        let err = service.print(&handle, b"slow").await.unwrap_err();
        assert!(matches!(err, PrintError::Timeout(_)));

        // waits for the blocked write to finish, then closes
        service.disconnect(&handle).await;
        assert_eq!(handle.state().await, ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_unbounded_grace_still_prints() {
        let bus = MemoryBus::new();
        let key = bus.attach(SimulatedPrinter::new(0x04b8, 0x0202, 7));
        let config = PrinterConfig {
            ack_grace_ms: u64::MAX,
            ..PrinterConfig::default()
        };
        let service = PrinterService::new(bus, config);
        let desc = service.scan().await.unwrap()[0].descriptor;
        let handle = service.connect(desc).await.unwrap();

        assert_eq!(service.print(&handle, b"\x1B\x40").await.unwrap(), 2);
        assert_eq!(service.bus().written(key), b"\x1B\x40");
        service.disconnect(&handle).await;
    }

    #[tokio::test]
    async fn test_concurrent_prints_are_serialized() {
        let (service, key) = service_with(SimulatedPrinter::new(0x04b8, 0x0202, 7).max_chunk(1));
        let desc = service.scan().await.unwrap()[0].descriptor;
        let handle = service.connect(desc).await.unwrap();

        let (a, b) = tokio::join!(
            service.print(&handle, b"aaaa"),
            service.print(&handle, b"bbbb")
        );
        assert_eq!(a.unwrap(), 4);
        assert_eq!(b.unwrap(), 4);

        let written = service.bus().written(key);
        assert!(written == b"aaaabbbb" || written == b"bbbbaaaa");
    }
}

//! Print job orchestration

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::bus::{DeviceDescriptor, UsbBus};
use crate::error::{PrintError, PrintResult};
use crate::escpos::CommandBuffer;
use crate::scanner::CandidatePrinter;
use crate::service::{ConnectionHandle, PrinterService};

/// Which printer a job goes to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrintTarget {
    /// First printer found by a fresh scan
    Auto,
    Device(DeviceDescriptor),
}

/// Outcome of a successful job
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PrintReport {
    pub device: DeviceDescriptor,
    /// Transfers performed, retry included
    pub attempts: u32,
    pub bytes_written: usize,
}

/// One print request
#[derive(Debug, Clone)]
pub struct PrintJob {
    target: PrintTarget,
    payload: CommandBuffer,
}

impl PrintJob {
    /// Job for whichever printer a scan finds first
    pub fn new(payload: CommandBuffer) -> Self {
        Self {
            target: PrintTarget::Auto,
            payload,
        }
    }

    pub fn to_device(descriptor: DeviceDescriptor, payload: CommandBuffer) -> Self {
        Self {
            target: PrintTarget::Device(descriptor),
            payload,
        }
    }

    pub fn target(&self) -> PrintTarget {
        self.target
    }

    pub fn payload(&self) -> &CommandBuffer {
        &self.payload
    }

    /// Resolve the target, connect, send the payload and disconnect.
    ///
    /// A `Transfer` error is retried once after clearing the endpoint; every
    /// other error is final. The connection is closed on every path. If
    /// `cancel` fires mid-transfer the job returns `Cancelled` without
    /// waiting; bytes already sent stay sent and the connection closes once
    /// the write returns.
    #[instrument(skip_all, fields(target = ?self.target, bytes = self.payload.len()))]
    pub async fn run<B: UsbBus>(
        self,
        service: &PrinterService<B>,
        cancel: &CancellationToken,
    ) -> PrintResult<PrintReport> {
        let descriptor = match self.target {
            PrintTarget::Device(d) => d,
            PrintTarget::Auto => select_candidate(&service.scan().await?)?,
        };

        let handle = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(PrintError::Cancelled),
            result = service.connect(descriptor) => result?,
        };

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(PrintError::Cancelled),
            result = self.send(service, &handle) => result,
        };

        match &outcome {
            // Dropping the handle closes the connection once any in-flight
            // write releases it.
            Err(PrintError::Cancelled) => warn!(device = %descriptor, "Print job cancelled"),
            _ => service.disconnect(&handle).await,
        }

        let (attempts, bytes_written) = outcome?;
        info!(device = %descriptor, attempts, bytes_written, "Print job complete");
        Ok(PrintReport {
            device: descriptor,
            attempts,
            bytes_written,
        })
    }

    async fn send<B: UsbBus>(
        &self,
        service: &PrinterService<B>,
        handle: &ConnectionHandle,
    ) -> PrintResult<(u32, usize)> {
        let err = match service.print(handle, &self.payload).await {
            Ok(n) => return Ok((1, n)),
            Err(e) => e,
        };

        if !err.is_retryable() || !service.config().retry_transfer {
            return Err(err);
        }

        warn!(error = %err, "Transfer failed, retrying once");
        if let Err(e) = service.recover(handle).await {
            warn!(error = %e, "Connection not recoverable, giving up");
            return Err(err);
        }

        let n = service.print(handle, &self.payload).await?;
        Ok((2, n))
    }
}

/// Index-0 policy: the first candidate in bus order wins.
fn select_candidate(candidates: &[CandidatePrinter]) -> PrintResult<DeviceDescriptor> {
    let first = candidates.first().ok_or(PrintError::NoPrinterFound)?;
    if candidates.len() > 1 {
        warn!(
            count = candidates.len(),
            chosen = %first.descriptor,
            "Several printers qualify, using the first"
        );
    }
    Ok(first.descriptor)
}

//! Error types for the USB printer library

use thiserror::Error;

use crate::connection::ConnectionState;

/// Printer error types
#[derive(Debug, Error)]
pub enum PrintError {
    /// Scan found no qualifying device
    #[error("No printer found")]
    NoPrinterFound,

    /// The OS refused access to the device
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Device could not be opened or enumerated
    #[error("Device unavailable: {0}")]
    DeviceUnavailable(String),

    /// Interface claim failed outright
    #[error("Claim of interface {interface} failed: {reason}")]
    Claim { interface: u8, reason: String },

    /// Claimed interface has no OUT endpoint
    #[error("No OUT endpoint on interface {interface}")]
    EndpointNotFound { interface: u8 },

    /// Write to the device failed or was rejected
    #[error("Transfer failed: {0}")]
    Transfer(String),

    /// Device did not acknowledge in time
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Operation not allowed from the connection's current state
    #[error("Cannot {op} while connection is {state}")]
    InvalidState {
        op: &'static str,
        state: ConnectionState,
    },

    /// Job cancelled before any byte was sent
    #[error("Print job cancelled")]
    Cancelled,

    /// Invalid printer configuration
    #[error("Invalid config: {0}")]
    InvalidConfig(String),
}

impl PrintError {
    /// Stable error code for host applications
    pub fn kind(&self) -> &'static str {
        match self {
            PrintError::NoPrinterFound => "DISCOVERY",
            PrintError::PermissionDenied(_) => "PERMISSION",
            PrintError::DeviceUnavailable(_) => "DEVICE_UNAVAILABLE",
            PrintError::Claim { .. } => "CLAIM",
            PrintError::EndpointNotFound { .. } => "ENDPOINT_NOT_FOUND",
            PrintError::Transfer(_) => "TRANSFER",
            PrintError::Timeout(_) => "TIMEOUT",
            PrintError::InvalidState { .. } => "INVALID_STATE",
            PrintError::Cancelled => "CANCELLED",
            PrintError::InvalidConfig(_) => "INVALID_CONFIG",
        }
    }

    /// Whether a print job may retry after this error
    pub fn is_retryable(&self) -> bool {
        matches!(self, PrintError::Transfer(_))
    }
}

/// A kernel driver stayed bound after a detach attempt.
///
/// Not an error path: claim usually still succeeds, so this is only logged.
#[derive(Debug, Clone, Error)]
#[error("Kernel driver on interface {interface} could not be detached: {reason}")]
pub struct DriverConflict {
    pub interface: u8,
    pub reason: String,
}

/// Result type for printer operations
pub type PrintResult<T> = Result<T, PrintError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transfer_is_retryable() {
        assert!(PrintError::Transfer("pipe".into()).is_retryable());
        assert!(!PrintError::Timeout("5s".into()).is_retryable());
        assert!(!PrintError::Claim { interface: 0, reason: "busy".into() }.is_retryable());
        assert!(!PrintError::NoPrinterFound.is_retryable());
    }

    #[test]
    fn test_invalid_state_message() {
        let e = PrintError::InvalidState {
            op: "transfer",
            state: ConnectionState::Failed,
        };
        assert_eq!(e.to_string(), "Cannot transfer while connection is Failed");
        assert_eq!(e.kind(), "INVALID_STATE");
    }
}

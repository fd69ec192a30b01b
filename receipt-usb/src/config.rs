//! Printer configuration

use std::time::Duration;

use encoding_rs::Encoding;
use serde::{Deserialize, Serialize};

use crate::error::{PrintError, PrintResult};

/// Connection and transfer settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrinterConfig {
    /// Device-level write timeout
    pub transfer_timeout_ms: u64,
    /// Extra time the async layer waits on top of the device timeout
    pub ack_grace_ms: u64,
    /// Try to detach an OS driver bound to the printer interface
    pub detach_kernel_driver: bool,
    /// Retry a failed transfer once
    pub retry_transfer: bool,
    /// WHATWG label of the text encoding (e.g. "utf-8", "gbk", "windows-1252")
    pub text_encoding: String,
}

impl Default for PrinterConfig {
    fn default() -> Self {
        Self {
            transfer_timeout_ms: 5000,
            ack_grace_ms: 1000,
            detach_kernel_driver: true,
            retry_transfer: true,
            text_encoding: "utf-8".to_string(),
        }
    }
}

impl PrinterConfig {
    /// Read `RECEIPT_*` environment variables over the defaults
    pub fn from_env() -> PrintResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with a custom variable source
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> PrintResult<Self> {
        let mut config = Self::default();

        if let Some(v) = lookup("RECEIPT_TRANSFER_TIMEOUT_MS") {
            config.transfer_timeout_ms = parse_number("RECEIPT_TRANSFER_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = lookup("RECEIPT_ACK_GRACE_MS") {
            config.ack_grace_ms = parse_number("RECEIPT_ACK_GRACE_MS", &v)?;
        }
        if let Some(v) = lookup("RECEIPT_DETACH_KERNEL_DRIVER") {
            config.detach_kernel_driver = parse_flag("RECEIPT_DETACH_KERNEL_DRIVER", &v)?;
        }
        if let Some(v) = lookup("RECEIPT_RETRY_TRANSFER") {
            config.retry_transfer = parse_flag("RECEIPT_RETRY_TRANSFER", &v)?;
        }
        if let Some(v) = lookup("RECEIPT_TEXT_ENCODING") {
            config.text_encoding = v.trim().to_string();
        }

        config.validate()?;
        Ok(config)
    }

    /// Check values that serde cannot
    pub fn validate(&self) -> PrintResult<()> {
        if self.transfer_timeout_ms == 0 {
            return Err(PrintError::InvalidConfig(
                "transfer timeout must be greater than zero".to_string(),
            ));
        }
        self.encoding()?;
        Ok(())
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_millis(self.transfer_timeout_ms)
    }

    /// Longest the async layer waits for one transfer
    pub fn ack_deadline(&self) -> Duration {
        Duration::from_millis(self.transfer_timeout_ms.saturating_add(self.ack_grace_ms))
    }

    /// Resolve the configured text encoding
    pub fn encoding(&self) -> PrintResult<&'static Encoding> {
        Encoding::for_label(self.text_encoding.as_bytes()).ok_or_else(|| {
            PrintError::InvalidConfig(format!("Unknown text encoding: {}", self.text_encoding))
        })
    }
}

fn parse_number(key: &str, value: &str) -> PrintResult<u64> {
    value
        .trim()
        .parse()
        .map_err(|_| PrintError::InvalidConfig(format!("{}: not a number: {}", key, value)))
}

fn parse_flag(key: &str, value: &str) -> PrintResult<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(PrintError::InvalidConfig(format!(
            "{}: not a boolean: {}",
            key, value
        ))),
    }
}

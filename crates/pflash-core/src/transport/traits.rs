//! Channel abstraction for the partial flashing characteristic.
//!
//! The engine writes commands and waits for notifications on its own
//! receive queue with an explicit deadline. Implementations: the routed
//! BLE channel, a scripted mock and a simulated device.

use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Read failed: {0}")]
    ReadFailed(String),

    #[error("Device disconnected")]
    Disconnected,

    #[error("Timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Device did not reconnect within {timeout_ms}ms")]
    ReconnectTimeout { timeout_ms: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    pub fn timeout(timeout: Duration) -> Self {
        TransportError::Timeout {
            timeout_ms: timeout.as_millis() as u64,
        }
    }
}

/// Single write/notify channel to one device.
pub trait FlashChannel: Send + Sync {
    /// Write one command (write without response).
    fn write(&self, data: &[u8]) -> Result<(), TransportError>;

    /// Wait up to `timeout` for the next notification.
    fn recv(&self, timeout: Duration) -> Result<Vec<u8>, TransportError>;

    /// Check if the link is up.
    fn is_connected(&self) -> bool;

    /// Wait for the device to come back after a requested reboot.
    fn reconnect(&self, timeout: Duration) -> Result<(), TransportError>;

    /// Key the device is known by.
    fn device_id(&self) -> &str;

    /// Drop notifications still queued from an earlier exchange.
    fn drain(&self) -> usize {
        let mut dropped = 0;
        while self.recv(Duration::ZERO).is_ok() {
            dropped += 1;
        }
        dropped
    }
}

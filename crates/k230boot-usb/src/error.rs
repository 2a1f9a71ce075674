//! Error types for the USB transport

use thiserror::Error;

/// Result type for USB operations
pub type Result<T> = std::result::Result<T, UsbError>;

/// Errors that can occur while opening the loader device
#[derive(Debug, Error)]
pub enum UsbError {
    /// No device in ROM mode
    #[error("K230 boot ROM not found (VID:29f1 PID:0230); is the board in USB boot mode?")]
    DeviceNotFound,
    /// No device with the requested serial number
    #[error("no K230 boot ROM with serial number {0:?}")]
    SerialNotFound(String),
    /// Failed to open device
    #[error("failed to open device: {0}")]
    OpenFailed(String),
    /// Failed to claim interface
    #[error("failed to claim interface: {0}")]
    ClaimFailed(String),
    /// A required endpoint is missing from the descriptors
    #[error("no bulk {0} endpoint on the loader interface")]
    EndpointNotFound(&'static str),
    /// The bus speed is not one the loader runs at
    #[error("unsupported USB speed {0}")]
    UnsupportedSpeed(String),
}

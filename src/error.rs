//! Error types for scanning, connecting and printing.

use thiserror::Error;

use crate::protocol::PrinterFault;

/// Everything that can go wrong between the host and a label printer.
#[derive(Debug, Error)]
pub enum Error {
    /// BLE stack error (adapter, GATT, notifications).
    #[error(transparent)]
    Ble(#[from] btleplug::Error),

    #[error("no Bluetooth adapter available")]
    NoAdapter,

    /// The peripheral could not be connected or is missing the expected services.
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("printer not connected")]
    NotConnected,

    /// Another operation holds the connection (a print job or a pending connect).
    #[error("busy: {0}")]
    Busy(String),

    #[error("unknown peripheral: {0}")]
    UnknownPeripheral(String),

    /// A print job failed validation before anything was sent.
    #[error("invalid job: {0}")]
    InvalidJob(String),

    /// Malformed packet from the device.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("printer rejected the job")]
    Rejected,

    /// The device reported a hardware condition that stops printing.
    #[error("printer fault: {0}")]
    Fault(PrinterFault),

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("print cancelled")]
    Cancelled,

    #[error("no font available for text rendering")]
    FontUnavailable,

    #[error("invalid font data: {0}")]
    InvalidFont(String),

    #[error(transparent)]
    Image(#[from] image::ImageError),

    /// A remote image was referenced but never downloaded.
    #[error("remote image not resolved: {0}")]
    UnresolvedImage(String),

    /// A background task died before reporting.
    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Result type for printer operations
pub type Result<T> = std::result::Result<T, Error>;

//! sfprint: find, connect to and print labels on BLE thermal label printers.
//!
//! Main modules:
//! - model: label documents (elements, media, job settings)
//! - raster: document to 1-bit print-head bitmap
//! - protocol: packet framing and the pluggable command encoder
//! - transport: BLE central/link seams, with `ble` (btleplug) and `mock` backends
//! - session: one print job over a link
//! - sdk: the public facade with connection state and events

use std::sync::{Mutex, MutexGuard};

pub mod ble;
pub mod config;
pub mod device;
pub mod dithering;
pub mod error;
pub mod fetch;
pub mod font;
pub mod mock;
pub mod model;
pub mod protocol;
pub mod raster;
pub mod sdk;
pub mod session;
pub mod transport;

pub use ble::BleCentral;
pub use config::{GattProfile, SdkConfig};
pub use device::{DeviceCatalog, DeviceModel};
pub use dithering::ImageDithering;
pub use error::{Error, Result};
pub use font::FontBook;
pub use model::{
    Alignment, ElementContent, FontSpec, FontStyle, MediaRotation, PaperType, PrintElement, PrintJobConfig,
    PrintPage,
};
pub use protocol::{CommandEncoder, FramedEncoder, PrinterFault, PrinterState, PrinterStatus};
pub use raster::{LabelBitmap, Rasterizer};
pub use sdk::{Initiator, JobStatus, PrintHandle, PrintOutcome, PrinterSdk, SdkEvent};
pub use session::{PageJob, PrintProgress};
pub use transport::{Central, Peripheral, PeripheralId, Transport};

/// Lock a std mutex, ignoring poisoning.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

//! SDK configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::device::DeviceModel;
use crate::error::Result;
use crate::raster::DEFAULT_DOTS_PER_MM;

/// GATT layout of the printer: one service with control, data and notify
/// characteristics. Control and data may be the same characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GattProfile {
    pub service: Uuid,
    pub control: Uuid,
    pub data: Uuid,
    pub notify: Uuid,
}

impl Default for GattProfile {
    fn default() -> Self {
        Self {
            service: Uuid::from_u128(0x0000ae30_0000_1000_8000_00805f9b34fb),
            control: Uuid::from_u128(0x0000ae01_0000_1000_8000_00805f9b34fb),
            data: Uuid::from_u128(0x0000ae03_0000_1000_8000_00805f9b34fb),
            notify: Uuid::from_u128(0x0000ae02_0000_1000_8000_00805f9b34fb),
        }
    }
}

/// Tunables for scanning, connecting and print sessions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SdkConfig {
    /// Print head resolution.
    pub dots_per_mm: f32,
    /// Bytes per data write.
    pub chunk_size: usize,
    /// Wait for the GATT connection to come up.
    #[serde(with = "millis")]
    pub connect_timeout: Duration,
    /// Wait for a reply to a control packet.
    #[serde(with = "millis")]
    pub ack_timeout: Duration,
    /// Wait for each label to come out.
    #[serde(with = "millis")]
    pub page_timeout: Duration,
    /// Query device status before each job and refuse to print on a fault.
    pub check_status: bool,
    /// Capacity of the event broadcast channel.
    pub event_capacity: usize,
    /// Timeout for downloading remote images.
    #[serde(with = "millis")]
    pub http_timeout: Duration,
    /// After a local hang-up, disconnect reports for the same printer are
    /// ignored this long.
    #[serde(with = "millis")]
    pub disconnect_grace: Duration,
    pub gatt: GattProfile,
    /// Product models for display names and icons.
    pub devices: Vec<DeviceModel>,
}

impl Default for SdkConfig {
    fn default() -> Self {
        Self {
            dots_per_mm: DEFAULT_DOTS_PER_MM,
            chunk_size: 180,
            connect_timeout: Duration::from_secs(10),
            ack_timeout: Duration::from_secs(2),
            page_timeout: Duration::from_secs(60),
            check_status: true,
            event_capacity: 64,
            http_timeout: Duration::from_secs(15),
            disconnect_grace: Duration::from_secs(2),
            gatt: GattProfile::default(),
            devices: Vec::new(),
        }
    }
}

impl SdkConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn with_dots_per_mm(mut self, dots_per_mm: f32) -> Self {
        self.dots_per_mm = dots_per_mm;
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    pub fn with_page_timeout(mut self, timeout: Duration) -> Self {
        self.page_timeout = timeout;
        self
    }

    pub fn with_status_check(mut self, check_status: bool) -> Self {
        self.check_status = check_status;
        self
    }

    pub fn with_disconnect_grace(mut self, grace: Duration) -> Self {
        self.disconnect_grace = grace;
        self
    }

    pub fn with_device(mut self, model: DeviceModel) -> Self {
        self.devices.push(model);
        self
    }

    pub fn with_gatt(mut self, gatt: GattProfile) -> Self {
        self.gatt = gatt;
        self
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

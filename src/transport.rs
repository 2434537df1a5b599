//! Transport seams: a [`Central`] finds and connects peripherals, a
//! [`Transport`] moves bytes over one connected link.
//!
//! [`crate::ble`] implements both on btleplug; [`crate::mock`] implements
//! both in memory.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Stable identifier of a peripheral as reported by the platform.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeripheralId(pub String);

impl fmt::Display for PeripheralId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeripheralId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A discovered printer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peripheral {
    pub id: PeripheralId,
    /// Advertised local name, if any.
    pub name: Option<String>,
    pub rssi: Option<i16>,
}

impl Peripheral {
    pub fn new(id: impl Into<String>, name: Option<&str>) -> Self {
        Self {
            id: PeripheralId(id.into()),
            name: name.map(str::to_string),
            rssi: None,
        }
    }
}

/// Radio-level events the SDK listens to for its whole lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CentralEvent {
    Discovered(Peripheral),
    /// The link to this peripheral dropped, whoever ended it.
    Disconnected(PeripheralId),
}

/// Byte pipe to one connected printer.
#[async_trait]
pub trait Transport: Send {
    /// Write a control packet.
    async fn write_control(&mut self, data: &[u8]) -> Result<()>;
    /// Write bitmap data.
    async fn write_data(&mut self, data: &[u8]) -> Result<()>;
    /// Wait for the next notification from the printer.
    async fn read_notification(&mut self, timeout: Duration) -> Result<Vec<u8>>;
    async fn disconnect(&mut self) -> Result<()>;
}

/// The host's Bluetooth central role.
#[async_trait]
pub trait Central: Send + Sync + 'static {
    type Link: Transport + 'static;

    /// Event stream. Called once when the SDK starts.
    async fn events(&self) -> Result<BoxStream<'static, CentralEvent>>;

    /// Start continuous discovery. It runs until [`Central::stop_scan`].
    async fn start_scan(&self) -> Result<()>;

    async fn stop_scan(&self) -> Result<()>;

    async fn connect(&self, peripheral: &Peripheral) -> Result<Self::Link>;
}

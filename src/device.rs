//! Cosmetic lookups from advertised names to product names and icons.
//!
//! The SDK ships no product list. Applications register the models they
//! know, through [`SdkConfig::devices`](crate::SdkConfig::devices) or
//! [`PrinterSdk::register_device_model`](crate::PrinterSdk::register_device_model);
//! names that match nothing pass through unchanged.

use serde::{Deserialize, Serialize};

/// Name shown for peripherals that advertise no name.
pub const UNKNOWN_DEVICE: &str = "Unknown device";
/// Icon for names that match no registered model.
pub const GENERIC_ICON: &str = "printer_generic.png";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceModel {
    /// Advertised-name prefix, matched case-insensitively.
    pub prefix: String,
    pub display_name: String,
    /// Icon asset name.
    pub icon: String,
}

impl DeviceModel {
    pub fn new(prefix: impl Into<String>, display_name: impl Into<String>, icon: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            display_name: display_name.into(),
            icon: icon.into(),
        }
    }
}

/// Registered models, longest prefix first.
#[derive(Debug, Clone, Default)]
pub struct DeviceCatalog {
    models: Vec<DeviceModel>,
}

impl DeviceCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `model`, replacing any model with the same prefix.
    pub fn register(&mut self, model: DeviceModel) {
        self.models
            .retain(|m| !m.prefix.eq_ignore_ascii_case(&model.prefix));
        self.models.push(model);
        // longest prefix wins
        self.models.sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()));
    }

    pub fn with_model(mut self, model: DeviceModel) -> Self {
        self.register(model);
        self
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    pub fn lookup(&self, peripheral_name: &str) -> Option<&DeviceModel> {
        let name = peripheral_name.trim().to_ascii_uppercase();
        self.models
            .iter()
            .find(|m| name.starts_with(&m.prefix.to_ascii_uppercase()))
    }

    /// Product name for an advertised name; unknown names pass through.
    pub fn device_name(&self, peripheral_name: Option<&str>) -> String {
        match peripheral_name.map(str::trim) {
            None | Some("") => UNKNOWN_DEVICE.to_string(),
            Some(name) => self
                .lookup(name)
                .map(|m| m.display_name.clone())
                .unwrap_or_else(|| name.to_string()),
        }
    }

    pub fn device_image(&self, peripheral_name: Option<&str>) -> String {
        peripheral_name
            .and_then(|name| self.lookup(name))
            .map(|m| m.icon.clone())
            .unwrap_or_else(|| GENERIC_ICON.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> DeviceCatalog {
        DeviceCatalog::new()
            .with_model(DeviceModel::new("LP", "Label Printer", "lp.png"))
            .with_model(DeviceModel::new("LP Pro", "Label Printer Pro", "lp_pro.png"))
    }

    #[test]
    fn test_longest_prefix_wins() {
        let catalog = catalog();
        assert_eq!(catalog.device_name(Some("LP Pro-1A2B")), "Label Printer Pro");
        assert_eq!(catalog.device_name(Some("lp-0001")), "Label Printer");
        assert_eq!(catalog.device_image(Some("LP PRO_88")), "lp_pro.png");
    }

    #[test]
    fn test_unknown_and_missing_names() {
        let catalog = catalog();
        assert_eq!(catalog.device_name(None), UNKNOWN_DEVICE);
        assert_eq!(catalog.device_name(Some("  ")), UNKNOWN_DEVICE);
        assert_eq!(catalog.device_name(Some("Headphones")), "Headphones");
        assert_eq!(catalog.device_image(None), GENERIC_ICON);
        assert_eq!(catalog.device_image(Some("Headphones")), GENERIC_ICON);
    }

    #[test]
    fn test_empty_catalog_passes_names_through() {
        let catalog = DeviceCatalog::new();
        assert!(catalog.is_empty());
        assert_eq!(catalog.device_name(Some("T50M-77")), "T50M-77");
        assert_eq!(catalog.device_image(Some("T50M-77")), GENERIC_ICON);
    }

    #[test]
    fn test_register_replaces_same_prefix() {
        let mut catalog = catalog();
        catalog.register(DeviceModel::new("lp", "Renamed", "renamed.png"));
        assert_eq!(catalog.len(), 2);
        assert_eq!(catalog.device_name(Some("LP-1")), "Renamed");
    }
}

//! Device descriptors produced by enumeration.
//!
//! A [`Descriptor`] lives for one enumeration pass.  Consumers receive the
//! full list every pass and must treat it as a replacement snapshot;
//! [`DescriptorDiff`] is what the facade computes internally to decide
//! whether anything changed.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Which channel mechanism produced a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Local bridge daemon over HTTP.
    Bridge,
    /// Direct USB HID access.
    Hid,
    /// Browser-mediated USB, gated by user consent.
    WebUsb,
}

impl BackendKind {
    pub const ALL: [BackendKind; 3] = [BackendKind::Bridge, BackendKind::Hid, BackendKind::WebUsb];

    /// Short identifier used in configuration files and on the CLI.
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Bridge => "bridge",
            BackendKind::Hid => "hid",
            BackendKind::WebUsb => "webusb",
        }
    }

    /// Human-readable backend name used in events and logs.
    pub fn display_name(&self) -> &'static str {
        match self {
            BackendKind::Bridge => "BridgeTransport",
            BackendKind::Hid => "HidTransport",
            BackendKind::WebUsb => "WebUsbTransport",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "bridge" => Ok(BackendKind::Bridge),
            "hid" | "usb" => Ok(BackendKind::Hid),
            "webusb" => Ok(BackendKind::WebUsb),
            other => Err(format!("unknown backend: {other}")),
        }
    }
}

/// One enumerable device instance as seen by a backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    /// Backend-specific path or id; unique within one backend.
    pub path: String,
    #[serde(rename = "backendType")]
    pub backend: BackendKind,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub vendor_id: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub product_id: Option<u16>,
    /// Session currently reported by the backend itself (bridge daemons track this).
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub session_hint: Option<String>,
    /// `true` for a debug-link interface.
    #[serde(default)]
    pub debug: bool,
}

impl Descriptor {
    pub fn new(path: impl Into<String>, backend: BackendKind) -> Self {
        Self {
            path: path.into(),
            backend,
            vendor_id: None,
            product_id: None,
            session_hint: None,
            debug: false,
        }
    }

    pub fn with_ids(mut self, vendor_id: u16, product_id: u16) -> Self {
        self.vendor_id = Some(vendor_id);
        self.product_id = Some(product_id);
        self
    }
}

/// Difference between two enumeration snapshots, keyed by path.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DescriptorDiff {
    pub added: Vec<Descriptor>,
    pub removed: Vec<Descriptor>,
    /// The newer snapshot in enumeration order.
    pub descriptors: Vec<Descriptor>,
}

impl DescriptorDiff {
    /// Compares `previous` with `current`.
    pub fn between(previous: &[Descriptor], current: &[Descriptor]) -> Self {
        let before: HashSet<&str> = previous.iter().map(|d| d.path.as_str()).collect();
        let after: HashSet<&str> = current.iter().map(|d| d.path.as_str()).collect();

        Self {
            added: current
                .iter()
                .filter(|d| !before.contains(d.path.as_str()))
                .cloned()
                .collect(),
            removed: previous
                .iter()
                .filter(|d| !after.contains(d.path.as_str()))
                .cloned()
                .collect(),
            descriptors: current.to_vec(),
        }
    }

    /// `true` when no device appeared or disappeared.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(path: &str) -> Descriptor {
        Descriptor::new(path, BackendKind::Hid)
    }

    #[test]
    fn test_diff_detects_removed_device() {
        // Arrange
        let before = vec![d("A"), d("B")];
        let after = vec![d("B")];

        // Act
        let diff = DescriptorDiff::between(&before, &after);

        // Assert
        assert!(!diff.is_empty());
        assert!(diff.added.is_empty());
        assert_eq!(diff.removed, vec![d("A")]);
        assert_eq!(diff.descriptors, after);
    }

    #[test]
    fn test_diff_detects_added_device() {
        let diff = DescriptorDiff::between(&[d("A")], &[d("A"), d("C")]);
        assert_eq!(diff.added, vec![d("C")]);
        assert!(diff.removed.is_empty());
    }

    #[test]
    fn test_diff_ignores_reordering_and_hint_changes() {
        let mut b = d("B");
        b.session_hint = Some("4".to_string());
        let diff = DescriptorDiff::between(&[d("A"), d("B")], &[b, d("A")]);
        assert!(diff.is_empty());
    }

    #[test]
    fn test_backend_kind_parses_config_names() {
        assert_eq!("bridge".parse::<BackendKind>(), Ok(BackendKind::Bridge));
        assert_eq!("HID".parse::<BackendKind>(), Ok(BackendKind::Hid));
        assert_eq!("webusb".parse::<BackendKind>(), Ok(BackendKind::WebUsb));
        assert!("serial".parse::<BackendKind>().is_err());
    }

    #[test]
    fn test_descriptor_serializes_backend_type() {
        let json = serde_json::to_value(Descriptor::new("1-1", BackendKind::WebUsb)).unwrap();
        assert_eq!(json["path"], "1-1");
        assert_eq!(json["backendType"], "webusb");
        assert!(json.get("vendorId").is_none());
    }
}

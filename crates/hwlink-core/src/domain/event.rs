//! Lifecycle events of the active channel backend.
//!
//! Events are delivered to subscribers and discarded; nothing is persisted.
//! Serialized form:
//!
//! ```json
//! { "type": "START",   "payload": { "backendType": "bridge", "version": "2.0.33", "outdated": false } }
//! { "type": "CHANGED", "payload": { "backendType": "hid", "status": "running", "devices": { ... } } }
//! ```

use serde::{Deserialize, Serialize};

use crate::domain::descriptor::{BackendKind, DescriptorDiff};
use crate::error::{ErrorKind, TransportError};

/// Coarse state of the active backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendStatus {
    Stopped,
    Running,
    Error,
}

/// Version details reported by a bridge daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeInfo {
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub latest: Option<String>,
    pub outdated: bool,
}

/// Hint that the host is missing device permission rules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UdevInfo {
    /// Path of the OS-level device node that could not be opened.
    pub device_path: String,
    /// Suggested rules file name.
    pub rules_file: String,
}

impl UdevInfo {
    pub fn for_device(device_path: impl Into<String>) -> Self {
        Self {
            device_path: device_path.into(),
            rules_file: "51-hwlink.rules".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartInfo {
    pub backend_type: BackendKind,
    pub version: String,
    pub outdated: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub bridge_info: Option<BridgeInfo>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub udev_info: Option<UdevInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopInfo {
    pub backend_type: BackendKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeInfo {
    pub backend_type: BackendKind,
    pub status: BackendStatus,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
    /// Present when the descriptor set changed.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub devices: Option<DescriptorDiff>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorInfo {
    pub error: ErrorKind,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub message: Option<String>,
    /// Backend-native code, e.g. an HTTP status or OS errno.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub bridge_info: Option<BridgeInfo>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub udev_info: Option<UdevInfo>,
}

impl From<TransportError> for ErrorInfo {
    fn from(e: TransportError) -> Self {
        Self {
            error: e.kind,
            message: e.message,
            code: None,
            bridge_info: None,
            udev_info: None,
        }
    }
}

/// One lifecycle notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum TransportEvent {
    #[serde(rename = "START")]
    Started(StartInfo),
    #[serde(rename = "STOP")]
    Stopped(StopInfo),
    #[serde(rename = "CHANGED")]
    Changed(ChangeInfo),
    #[serde(rename = "ERROR")]
    Error(ErrorInfo),
}

impl TransportEvent {
    /// Backend the event refers to, when it names one.
    pub fn backend(&self) -> Option<BackendKind> {
        match self {
            TransportEvent::Started(i) => Some(i.backend_type),
            TransportEvent::Stopped(i) => Some(i.backend_type),
            TransportEvent::Changed(i) => Some(i.backend_type),
            TransportEvent::Error(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::descriptor::Descriptor;
    use serde_json::json;

    #[test]
    fn test_start_event_uses_adjacent_tagging() {
        // Arrange
        let ev = TransportEvent::Started(StartInfo {
            backend_type: BackendKind::Bridge,
            version: "2.0.33".to_string(),
            outdated: false,
            bridge_info: None,
            udev_info: None,
        });

        // Act
        let value = serde_json::to_value(&ev).unwrap();

        // Assert
        assert_eq!(
            value,
            json!({
                "type": "START",
                "payload": { "backendType": "bridge", "version": "2.0.33", "outdated": false }
            })
        );
    }

    #[test]
    fn test_error_event_carries_kind_and_udev_hint() {
        let mut info = ErrorInfo::from(TransportError::unreachable("permission denied"));
        info.udev_info = Some(UdevInfo::for_device("/dev/hidraw3"));

        let value = serde_json::to_value(TransportEvent::Error(info)).unwrap();

        assert_eq!(value["type"], "ERROR");
        assert_eq!(value["payload"]["error"], "DeviceUnreachable");
        assert_eq!(value["payload"]["udevInfo"]["devicePath"], "/dev/hidraw3");
        assert!(value["payload"].get("code").is_none());
    }

    #[test]
    fn test_changed_event_round_trips_with_device_diff() {
        let devices = DescriptorDiff::between(&[], &[Descriptor::new("A", BackendKind::Hid)]);
        let ev = TransportEvent::Changed(ChangeInfo {
            backend_type: BackendKind::Hid,
            status: BackendStatus::Running,
            name: Some("HidTransport".to_string()),
            error: None,
            devices: Some(devices),
        });

        let text = serde_json::to_string(&ev).unwrap();
        let back: TransportEvent = serde_json::from_str(&text).unwrap();

        assert!(text.contains("\"status\":\"running\""));
        assert_eq!(back, ev);
        assert_eq!(back.backend(), Some(BackendKind::Hid));
    }
}

//! Builds real backends from configuration.

use std::sync::Arc;

use hwlink_core::domain::BackendKind;
use tracing::warn;

use super::bridge::{BridgeBackend, BridgeSettings};
use super::usb::UsbSettings;
use super::{BackendFactory, ChannelBackend};

/// Creates a fresh backend of the requested kind on every probe.
///
/// USB kinds need the `hid` feature; without it they are reported as
/// unavailable and the facade moves on to the next candidate.
#[derive(Debug, Clone, Default)]
pub struct ConfiguredFactory {
    pub bridge: BridgeSettings,
    pub usb: UsbSettings,
}

impl ConfiguredFactory {
    pub fn new(bridge: BridgeSettings, usb: UsbSettings) -> Self {
        Self { bridge, usb }
    }

    #[cfg(feature = "hid")]
    fn usb_backend(&self, kind: BackendKind) -> Option<Arc<dyn ChannelBackend>> {
        use super::hidapi_host::HidApiHost;
        use super::usb::{FirstDevicePrompt, UsbBackend};

        let host = match HidApiHost::new() {
            Ok(host) => Arc::new(host),
            Err(e) => {
                warn!(backend = %kind, error = %e, "HID stack unavailable");
                return None;
            }
        };
        let backend = match kind {
            BackendKind::Hid => UsbBackend::hid(host, self.usb.clone()),
            _ => UsbBackend::webusb(host, Arc::new(FirstDevicePrompt), self.usb.clone()),
        };
        Some(Arc::new(backend))
    }

    #[cfg(not(feature = "hid"))]
    fn usb_backend(&self, _kind: BackendKind) -> Option<Arc<dyn ChannelBackend>> {
        None
    }
}

impl BackendFactory for ConfiguredFactory {
    fn create(&self, kind: BackendKind) -> Option<Arc<dyn ChannelBackend>> {
        match kind {
            BackendKind::Bridge => match BridgeBackend::new(self.bridge.clone()) {
                Ok(backend) => Some(Arc::new(backend)),
                Err(e) => {
                    warn!(error = %e, "cannot construct bridge client");
                    None
                }
            },
            BackendKind::Hid | BackendKind::WebUsb => self.usb_backend(kind),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bridge_is_always_constructible() {
        let factory = ConfiguredFactory::default();

        let backend = factory.create(BackendKind::Bridge);

        assert_eq!(backend.map(|b| b.kind()), Some(BackendKind::Bridge));
    }

    #[cfg(not(feature = "hid"))]
    #[test]
    fn test_usb_kinds_unavailable_without_hid_feature() {
        let factory = ConfiguredFactory::default();

        assert!(factory.create(BackendKind::Hid).is_none());
        assert!(factory.create(BackendKind::WebUsb).is_none());
    }
}

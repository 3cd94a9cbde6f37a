//! USB backends: direct HID access and consent-gated WebUSB.
//!
//! Both variants sit on a [`UsbHost`], a small blocking interface over the
//! OS device layer (hidapi in production, [`MockUsbHost`](super::mock::MockUsbHost)
//! in tests).  Blocking calls run on tokio's blocking pool so no runtime
//! worker is ever parked on a device read.
//!
//! The WebUSB variant mirrors the browser permission model: only devices the
//! user granted through [`request_device_selection`](ChannelBackend::request_device_selection)
//! are enumerated, and a grant lasts until the device leaves the bus.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use hwlink_core::domain::{BackendKind, Descriptor, UdevInfo};
use hwlink_core::error::{TransportError, TransportResult};
use hwlink_core::protocol::{FrameConfig, DEFAULT_PACKET_SIZE};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{BackendInfo, ChannelBackend, ChannelHandle};

/// Native failures reported by a [`UsbHost`] or [`UsbDevice`].
#[derive(Debug, Error)]
pub enum UsbError {
    #[error("device not found: {0}")]
    NotFound(String),
    #[error("permission denied opening {0}")]
    PermissionDenied(String),
    #[error("device busy: {0}")]
    Busy(String),
    #[error("device disconnected: {0}")]
    Disconnected(String),
    #[error("USB I/O error: {0}")]
    Io(String),
}

impl From<UsbError> for TransportError {
    fn from(e: UsbError) -> Self {
        match e {
            UsbError::NotFound(_) | UsbError::PermissionDenied(_) | UsbError::Busy(_) => {
                TransportError::unreachable(e.to_string())
            }
            UsbError::Disconnected(_) | UsbError::Io(_) => TransportError::disconnected(e.to_string()),
        }
    }
}

/// One device as listed by the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsbDeviceInfo {
    pub path: String,
    pub vendor_id: u16,
    pub product_id: u16,
    /// `true` for a debug-link interface.
    pub debug: bool,
}

impl UsbDeviceInfo {
    pub fn new(path: impl Into<String>, vendor_id: u16, product_id: u16) -> Self {
        Self {
            path: path.into(),
            vendor_id,
            product_id,
            debug: false,
        }
    }
}

/// Blocking access to the OS device layer.
pub trait UsbHost: Send + Sync {
    fn devices(&self) -> Result<Vec<UsbDeviceInfo>, UsbError>;
    fn open(&self, path: &str) -> Result<Box<dyn UsbDevice>, UsbError>;
}

/// An opened device.  Dropping it closes the OS handle.
pub trait UsbDevice: Send {
    /// Writes one packet, returning the number of bytes accepted.
    fn write(&mut self, data: &[u8]) -> Result<usize, UsbError>;
    /// Reads one packet into `buf`.  Returns `Ok(0)` when `timeout` elapses.
    fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, UsbError>;
}

/// Vendor/product filter applied during enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsbFilter {
    pub vendor_id: u16,
    /// `None` accepts every product of the vendor.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub product_id: Option<u16>,
}

impl UsbFilter {
    pub fn matches(&self, info: &UsbDeviceInfo) -> bool {
        self.vendor_id == info.vendor_id && self.product_id.map_or(true, |p| p == info.product_id)
    }
}

/// Runtime settings shared by both USB variants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsbSettings {
    pub packet_size: usize,
    /// Longest single blocking read; longer waits are split into slices.
    pub read_slice: Duration,
    /// Empty means "accept every device".
    pub filters: Vec<UsbFilter>,
}

impl Default for UsbSettings {
    fn default() -> Self {
        Self {
            packet_size: DEFAULT_PACKET_SIZE,
            read_slice: Duration::from_millis(200),
            filters: Vec::new(),
        }
    }
}

/// Stand-in for the browser's device chooser.
pub trait DevicePrompt: Send + Sync {
    /// Returns the path the user picked, or `None` if they cancelled.
    fn choose(&self, candidates: &[UsbDeviceInfo]) -> Option<String>;
}

impl<F> DevicePrompt for F
where
    F: Fn(&[UsbDeviceInfo]) -> Option<String> + Send + Sync,
{
    fn choose(&self, candidates: &[UsbDeviceInfo]) -> Option<String> {
        self(candidates)
    }
}

/// Picks the first candidate without asking.  Used by the headless CLI.
#[derive(Debug, Default, Clone, Copy)]
pub struct FirstDevicePrompt;

impl DevicePrompt for FirstDevicePrompt {
    fn choose(&self, candidates: &[UsbDeviceInfo]) -> Option<String> {
        candidates.first().map(|c| c.path.clone())
    }
}

struct Consent {
    prompt: Arc<dyn DevicePrompt>,
    granted: Mutex<HashSet<String>>,
}

type SharedDevice = Arc<Mutex<Box<dyn UsbDevice>>>;

struct OpenChannel {
    path: String,
    device: SharedDevice,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn blocking<T, F>(f: F) -> TransportResult<T>
where
    F: FnOnce() -> Result<T, UsbError> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => result.map_err(TransportError::from),
        Err(e) => Err(TransportError::unknown(format!("USB worker failed: {e}"))),
    }
}

/// [`ChannelBackend`] over a [`UsbHost`].
pub struct UsbBackend {
    kind: BackendKind,
    host: Arc<dyn UsbHost>,
    settings: UsbSettings,
    consent: Option<Consent>,
    channels: Mutex<HashMap<String, OpenChannel>>,
    udev: Mutex<Option<UdevInfo>>,
}

impl UsbBackend {
    /// Direct HID access: every matching device is visible.
    pub fn hid(host: Arc<dyn UsbHost>, settings: UsbSettings) -> Self {
        Self::build(BackendKind::Hid, host, settings, None)
    }

    /// WebUSB: only devices granted through `prompt` are visible.
    pub fn webusb(host: Arc<dyn UsbHost>, prompt: Arc<dyn DevicePrompt>, settings: UsbSettings) -> Self {
        let consent = Consent {
            prompt,
            granted: Mutex::new(HashSet::new()),
        };
        Self::build(BackendKind::WebUsb, host, settings, Some(consent))
    }

    fn build(
        kind: BackendKind,
        host: Arc<dyn UsbHost>,
        settings: UsbSettings,
        consent: Option<Consent>,
    ) -> Self {
        Self {
            kind,
            host,
            settings,
            consent,
            channels: Mutex::new(HashMap::new()),
            udev: Mutex::new(None),
        }
    }

    async fn matching_devices(&self) -> TransportResult<Vec<UsbDeviceInfo>> {
        let host = Arc::clone(&self.host);
        let all = blocking(move || host.devices()).await?;
        Ok(all
            .into_iter()
            .filter(|d| self.settings.filters.is_empty() || self.settings.filters.iter().any(|f| f.matches(d)))
            .collect())
    }

    fn descriptor(&self, info: &UsbDeviceInfo) -> Descriptor {
        let mut d = Descriptor::new(&info.path, self.kind).with_ids(info.vendor_id, info.product_id);
        d.debug = info.debug;
        d
    }

    fn is_granted(&self, path: &str) -> bool {
        match &self.consent {
            Some(c) => lock(&c.granted).contains(path),
            None => true,
        }
    }

    fn device_for(&self, handle: &ChannelHandle) -> TransportResult<SharedDevice> {
        lock(&self.channels)
            .get(&handle.token)
            .map(|c| Arc::clone(&c.device))
            .ok_or_else(|| TransportError::disconnected(format!("channel to {} is closed", handle.path)))
    }

    fn record_permission_failure(&self, path: &str) {
        if cfg!(target_os = "linux") {
            *lock(&self.udev) = Some(UdevInfo::for_device(path));
        }
    }
}

#[async_trait]
impl ChannelBackend for UsbBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn frame_config(&self) -> FrameConfig {
        FrameConfig::with_packet_size(self.settings.packet_size)
    }

    async fn init(&self) -> TransportResult<BackendInfo> {
        let devices = self
            .matching_devices()
            .await
            .map_err(|e| TransportError::unavailable(format!("USB host unavailable: {e}")))?;
        info!(backend = %self.kind, visible = devices.len(), "USB host ready");
        Ok(BackendInfo::version(env!("CARGO_PKG_VERSION")))
    }

    async fn enumerate(&self) -> TransportResult<Vec<Descriptor>> {
        let devices = self.matching_devices().await?;

        if let Some(consent) = &self.consent {
            let present: HashSet<&str> = devices.iter().map(|d| d.path.as_str()).collect();
            lock(&consent.granted).retain(|p| {
                let keep = present.contains(p.as_str());
                if !keep {
                    debug!(path = %p, "dropping grant for departed device");
                }
                keep
            });
        }

        Ok(devices
            .iter()
            .filter(|d| self.is_granted(&d.path))
            .map(|d| self.descriptor(d))
            .collect())
    }

    async fn open(
        &self,
        descriptor: &Descriptor,
        previous: Option<String>,
    ) -> TransportResult<ChannelHandle> {
        if !self.is_granted(&descriptor.path) {
            return Err(TransportError::unreachable(format!(
                "access to {} was not granted",
                descriptor.path
            )));
        }

        let host = Arc::clone(&self.host);
        let path = descriptor.path.clone();
        let device = match tokio::task::spawn_blocking(move || host.open(&path)).await {
            Ok(Ok(device)) => device,
            Ok(Err(UsbError::PermissionDenied(p))) => {
                warn!(path = %p, "permission denied opening device");
                self.record_permission_failure(&p);
                return Err(UsbError::PermissionDenied(p).into());
            }
            Ok(Err(e)) => return Err(TransportError::unreachable(e.to_string())),
            Err(e) => return Err(TransportError::unknown(format!("USB worker failed: {e}"))),
        };
        *lock(&self.udev) = None;

        // One OS handle per device; older channels on this path are dropped
        // only after the new open succeeded.
        let token = Uuid::new_v4().to_string();
        let mut channels = lock(&self.channels);
        if let Some(prev) = previous {
            channels.remove(&prev);
        }
        channels.retain(|_, c| c.path != descriptor.path);
        channels.insert(
            token.clone(),
            OpenChannel {
                path: descriptor.path.clone(),
                device: Arc::new(Mutex::new(device)),
            },
        );
        drop(channels);
        debug!(path = %descriptor.path, backend = %self.kind, "channel opened");
        Ok(ChannelHandle::new(&descriptor.path, self.kind, token))
    }

    async fn close(&self, handle: &ChannelHandle) -> TransportResult<()> {
        if lock(&self.channels).remove(&handle.token).is_some() {
            debug!(path = %handle.path, "channel closed");
        }
        Ok(())
    }

    async fn write(&self, handle: &ChannelHandle, data: &[u8]) -> TransportResult<()> {
        let device = self.device_for(handle)?;
        let data = data.to_vec();
        let expected = data.len();
        let written = blocking(move || {
            let mut dev = lock(&device);
            dev.write(&data)
        })
        .await?;
        if written < expected {
            return Err(TransportError::disconnected(format!(
                "short write: {written} of {expected} bytes"
            )));
        }
        Ok(())
    }

    async fn read(&self, handle: &ChannelHandle, timeout: Duration) -> TransportResult<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return Err(TransportError::timeout(format!(
                    "no data from {} within {timeout:?}",
                    handle.path
                )));
            }
            let slice = left.min(self.settings.read_slice);
            let device = self.device_for(handle)?;
            let size = self.settings.packet_size;
            let chunk = blocking(move || {
                let mut buf = vec![0u8; size];
                let n = lock(&device).read_timeout(&mut buf, slice)?;
                buf.truncate(n);
                Ok(buf)
            })
            .await?;
            if !chunk.is_empty() {
                return Ok(chunk);
            }
        }
    }

    async fn request_device_selection(&self) -> TransportResult<Option<Descriptor>> {
        let Some(consent) = &self.consent else {
            return Ok(None);
        };
        let candidates: Vec<UsbDeviceInfo> = self
            .matching_devices()
            .await?
            .into_iter()
            .filter(|d| !lock(&consent.granted).contains(&d.path))
            .collect();

        let Some(chosen) = consent.prompt.choose(&candidates) else {
            debug!("device selection cancelled");
            return Ok(None);
        };
        let Some(info) = candidates.iter().find(|c| c.path == chosen) else {
            return Err(TransportError::unreachable(format!(
                "selected device {chosen} is not available"
            )));
        };
        lock(&consent.granted).insert(chosen.clone());
        info!(path = %chosen, "device access granted");
        Ok(Some(self.descriptor(info)))
    }

    fn udev_hint(&self) -> Option<UdevInfo> {
        lock(&self.udev).clone()
    }

    async fn stop(&self) {
        lock(&self.channels).clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::backend::mock::MockUsbHost;
    use hwlink_core::error::ErrorKind;
    use hwlink_core::protocol::LogicalMessage;

    const VID: u16 = 0x1209;
    const PID: u16 = 0x53c1;

    fn host_with(paths: &[&str]) -> MockUsbHost {
        paths
            .iter()
            .fold(MockUsbHost::new(), |h, p| h.with_device(UsbDeviceInfo::new(*p, VID, PID)))
    }

    fn fast_settings() -> UsbSettings {
        UsbSettings {
            read_slice: Duration::from_millis(10),
            ..UsbSettings::default()
        }
    }

    #[tokio::test]
    async fn test_hid_enumerate_applies_vendor_filter() {
        // Arrange
        let host = host_with(&["a"]).with_device(UsbDeviceInfo::new("other", 0x046d, 0xc52b));
        let settings = UsbSettings {
            filters: vec![UsbFilter {
                vendor_id: VID,
                product_id: None,
            }],
            ..fast_settings()
        };
        let backend = UsbBackend::hid(Arc::new(host), settings);

        // Act
        let found = backend.enumerate().await.unwrap();

        // Assert
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].path, "a");
        assert_eq!(found[0].vendor_id, Some(VID));
        assert_eq!(found[0].backend, BackendKind::Hid);
    }

    #[tokio::test]
    async fn test_hid_call_round_trips_through_packets() {
        let backend = UsbBackend::hid(Arc::new(host_with(&["a"])), fast_settings());
        let d = backend.enumerate().await.unwrap().remove(0);
        let handle = backend.open(&d, None).await.unwrap();

        let response = backend
            .call(&handle, &LogicalMessage::new(4, vec![9; 200]), Duration::from_secs(2))
            .await
            .unwrap();

        assert_eq!(response, LogicalMessage::new(5, vec![9; 200]));
    }

    #[tokio::test]
    async fn test_hid_read_times_out_on_silent_device() {
        let host = host_with(&["a"]);
        host.set_silent(true);
        let backend = UsbBackend::hid(Arc::new(host), fast_settings());
        let d = backend.enumerate().await.unwrap().remove(0);
        let handle = backend.open(&d, None).await.unwrap();

        let err = backend.read(&handle, Duration::from_millis(30)).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn test_hid_unplugged_device_reports_disconnected() {
        let host = host_with(&["a"]);
        let backend = UsbBackend::hid(Arc::new(host.clone()), fast_settings());
        let d = backend.enumerate().await.unwrap().remove(0);
        let handle = backend.open(&d, None).await.unwrap();

        host.unplug("a");
        let err = backend.write(&handle, &[b'?'; 64]).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::DeviceDisconnected);
    }

    #[tokio::test]
    async fn test_hid_permission_denied_is_unreachable_with_udev_hint_on_linux() {
        let host = host_with(&["/dev/hidraw0"]);
        host.deny("/dev/hidraw0");
        let backend = UsbBackend::hid(Arc::new(host), fast_settings());
        let d = Descriptor::new("/dev/hidraw0", BackendKind::Hid);

        let err = backend.open(&d, None).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::DeviceUnreachable);
        assert_eq!(backend.udev_hint().is_some(), cfg!(target_os = "linux"));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let backend = UsbBackend::hid(Arc::new(host_with(&["a"])), fast_settings());
        let d = backend.enumerate().await.unwrap().remove(0);
        let handle = backend.open(&d, None).await.unwrap();

        assert!(backend.close(&handle).await.is_ok());
        assert!(backend.close(&handle).await.is_ok());
    }

    #[tokio::test]
    async fn test_webusb_lists_only_granted_devices() {
        // Arrange
        let prompt: Arc<dyn DevicePrompt> =
            Arc::new(|c: &[UsbDeviceInfo]| c.iter().find(|d| d.path == "b").map(|d| d.path.clone()));
        let host = host_with(&["a", "b"]);
        let backend = UsbBackend::webusb(Arc::new(host.clone()), prompt, fast_settings());

        // Act
        let before = backend.enumerate().await.unwrap();
        let granted = backend.request_device_selection().await.unwrap();
        let after = backend.enumerate().await.unwrap();

        // Assert
        assert!(before.is_empty());
        assert_eq!(granted.map(|d| d.path), Some("b".to_string()));
        assert_eq!(after.iter().map(|d| d.path.as_str()).collect::<Vec<_>>(), vec!["b"]);
    }

    #[tokio::test]
    async fn test_webusb_grant_is_dropped_when_device_leaves() {
        // Arrange
        let host = host_with(&["a"]);
        let backend = UsbBackend::webusb(Arc::new(host.clone()), Arc::new(FirstDevicePrompt), fast_settings());
        backend.request_device_selection().await.unwrap();
        assert_eq!(backend.enumerate().await.unwrap().len(), 1);

        // Act
        host.unplug("a");
        let while_gone = backend.enumerate().await.unwrap();
        host.plug(UsbDeviceInfo::new("a", VID, PID));
        let after_replug = backend.enumerate().await.unwrap();

        // Assert: a returning device needs a fresh grant.
        assert!(while_gone.is_empty());
        assert!(after_replug.is_empty());
    }

    #[tokio::test]
    async fn test_webusb_refuses_to_open_ungranted_device() {
        let backend = UsbBackend::webusb(
            Arc::new(host_with(&["a"])),
            Arc::new(FirstDevicePrompt),
            fast_settings(),
        );

        let err = backend
            .open(&Descriptor::new("a", BackendKind::WebUsb), None)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::DeviceUnreachable);
    }

    #[tokio::test]
    async fn test_cancelled_selection_returns_none() {
        let prompt: Arc<dyn DevicePrompt> = Arc::new(|_: &[UsbDeviceInfo]| None);
        let backend = UsbBackend::webusb(Arc::new(host_with(&["a"])), prompt, fast_settings());

        assert_eq!(backend.request_device_selection().await.unwrap(), None);
    }
}

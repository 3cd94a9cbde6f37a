//! [`UsbHost`] backed by the system HID stack through `hidapi`.
//!
//! Only compiled with the `hid` feature, since it links against
//! libudev/hidraw, IOKit or hid.dll.

use std::ffi::CString;
use std::sync::Mutex;
use std::time::Duration;

use hidapi::{HidApi, HidDevice, HidError};

use super::usb::{UsbDevice, UsbDeviceInfo, UsbError, UsbHost};

/// HID usage page of the debug-link interface.
const DEBUG_USAGE_PAGE: u16 = 0xFF01;

pub struct HidApiHost {
    api: Mutex<HidApi>,
}

impl HidApiHost {
    pub fn new() -> Result<Self, UsbError> {
        let api = HidApi::new().map_err(map_error)?;
        Ok(Self {
            api: Mutex::new(api),
        })
    }
}

fn map_error(e: HidError) -> UsbError {
    let text = e.to_string();
    let lower = text.to_ascii_lowercase();
    if lower.contains("permission denied") || lower.contains("access denied") {
        UsbError::PermissionDenied(text)
    } else if lower.contains("busy") {
        UsbError::Busy(text)
    } else {
        UsbError::Io(text)
    }
}

impl UsbHost for HidApiHost {
    fn devices(&self) -> Result<Vec<UsbDeviceInfo>, UsbError> {
        let mut api = self
            .api
            .lock()
            .map_err(|_| UsbError::Io("hidapi lock poisoned".to_string()))?;
        api.refresh_devices().map_err(map_error)?;
        Ok(api
            .device_list()
            .map(|d| UsbDeviceInfo {
                path: d.path().to_string_lossy().into_owned(),
                vendor_id: d.vendor_id(),
                product_id: d.product_id(),
                debug: d.usage_page() == DEBUG_USAGE_PAGE,
            })
            .collect())
    }

    fn open(&self, path: &str) -> Result<Box<dyn UsbDevice>, UsbError> {
        let cpath = CString::new(path).map_err(|_| UsbError::NotFound(path.to_string()))?;
        let api = self
            .api
            .lock()
            .map_err(|_| UsbError::Io("hidapi lock poisoned".to_string()))?;
        let device = api.open_path(&cpath).map_err(|e| match map_error(e) {
            UsbError::Io(text) => UsbError::NotFound(format!("{path}: {text}")),
            other => other,
        })?;
        Ok(Box::new(HidApiDevice { device }))
    }
}

struct HidApiDevice {
    device: HidDevice,
}

impl UsbDevice for HidApiDevice {
    fn write(&mut self, data: &[u8]) -> Result<usize, UsbError> {
        // Report id 0 precedes the packet on every platform.
        let mut report = Vec::with_capacity(data.len() + 1);
        report.push(0x00);
        report.extend_from_slice(data);
        let written = self
            .device
            .write(&report)
            .map_err(|e| UsbError::Disconnected(e.to_string()))?;
        Ok(written.saturating_sub(1))
    }

    fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, UsbError> {
        let ms = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX);
        self.device
            .read_timeout(buf, ms)
            .map_err(|e| UsbError::Disconnected(e.to_string()))
    }
}

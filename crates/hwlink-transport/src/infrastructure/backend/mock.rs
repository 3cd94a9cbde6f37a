//! In-memory device hosts for tests and demos.
//!
//! [`MockBackend`] implements [`ChannelBackend`] directly; [`MockUsbHost`]
//! sits one level lower and feeds the real [`UsbBackend`](super::usb::UsbBackend).
//! Both drive an [`EmulatedDevice`] that decodes request packets with the
//! real framer and queues a framed response, so the full packet path is
//! exercised without hardware.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use hwlink_core::domain::{BackendKind, Descriptor};
use hwlink_core::error::{TransportError, TransportResult};
use hwlink_core::protocol::{encode, Decoded, FrameConfig, LogicalMessage, PacketDecoder, Packet};

use super::usb::{UsbDevice, UsbDeviceInfo, UsbError, UsbHost};
use super::{BackendInfo, ChannelBackend, ChannelHandle};

/// Computes the emulated device's answer to one request.
pub type Responder = Arc<dyn Fn(&LogicalMessage) -> LogicalMessage + Send + Sync>;

/// Default responder: echoes the payload with `message_type + 1`.
pub fn echo_responder() -> Responder {
    Arc::new(|req: &LogicalMessage| {
        LogicalMessage::new(req.message_type.wrapping_add(1), req.payload.clone())
    })
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ── Emulated device ───────────────────────────────────────────────────────────

/// Firmware stand-in: reassembles requests and queues framed responses.
pub struct EmulatedDevice {
    frame: FrameConfig,
    decoder: PacketDecoder,
    outbox: VecDeque<Vec<u8>>,
    responder: Responder,
    /// Requests fully received so far.
    pub requests: Vec<LogicalMessage>,
}

impl EmulatedDevice {
    pub fn new(frame: FrameConfig, responder: Responder) -> TransportResult<Self> {
        Ok(Self {
            frame,
            decoder: PacketDecoder::new(frame)?,
            outbox: VecDeque::new(),
            responder,
            requests: Vec::new(),
        })
    }

    /// Accepts one written packet.
    pub fn receive(&mut self, bytes: &[u8]) -> TransportResult<()> {
        if let Decoded::Complete(request) = self.decoder.push(&Packet::from_bytes(bytes))? {
            let response = (self.responder)(&request);
            self.requests.push(request);
            for packet in encode(&response, &self.frame)? {
                self.outbox.push_back(packet.into_bytes());
            }
        }
        Ok(())
    }

    pub fn next_packet(&mut self) -> Option<Vec<u8>> {
        self.outbox.pop_front()
    }
}

// ── MockBackend ───────────────────────────────────────────────────────────────

#[derive(Default)]
struct MockState {
    devices: Vec<Descriptor>,
    init_error: Option<TransportError>,
    enumerate_error: Option<TransportError>,
    call_error: Option<TransportError>,
    silent: bool,
    /// Responses stay queued but reads see nothing.
    withheld: bool,
    /// Paths held by someone outside this process.
    foreign: HashSet<String>,
    open: HashMap<String, EmulatedDevice>,
    next_token: u64,
    opens: usize,
    closes: usize,
    stops: usize,
}

/// Scriptable [`ChannelBackend`] backed by emulated devices.
pub struct MockBackend {
    kind: BackendKind,
    frame: FrameConfig,
    version: String,
    responder: Responder,
    state: Mutex<MockState>,
}

impl MockBackend {
    pub fn new(kind: BackendKind) -> Self {
        Self {
            kind,
            frame: FrameConfig::default(),
            version: "1.0.0".to_string(),
            responder: echo_responder(),
            state: Mutex::new(MockState::default()),
        }
    }

    pub fn with_device(self, descriptor: Descriptor) -> Self {
        lock(&self.state).devices.push(descriptor);
        self
    }

    pub fn with_responder(mut self, responder: Responder) -> Self {
        self.responder = responder;
        self
    }

    pub fn with_frame_config(mut self, frame: FrameConfig) -> Self {
        self.frame = frame;
        self
    }

    /// Replaces the device list returned by the next enumeration.
    pub fn set_devices(&self, devices: Vec<Descriptor>) {
        let mut state = lock(&self.state);
        let present: HashSet<&str> = devices.iter().map(|d| d.path.as_str()).collect();
        state.open.retain(|token, _| {
            token
                .rsplit_once('#')
                .map(|(path, _)| present.contains(path))
                .unwrap_or(false)
        });
        state.devices = devices;
    }

    pub fn fail_init(&self, error: Option<TransportError>) {
        lock(&self.state).init_error = error;
    }

    /// Makes every enumeration fail until cleared with `None`.
    pub fn fail_enumerate(&self, error: Option<TransportError>) {
        lock(&self.state).enumerate_error = error;
    }

    /// Makes every call fail until cleared with `None`.
    pub fn fail_calls(&self, error: Option<TransportError>) {
        lock(&self.state).call_error = error;
    }

    /// A silent device accepts writes but never answers.
    pub fn set_silent(&self, silent: bool) {
        lock(&self.state).silent = silent;
    }

    /// While set, answers are queued but not delivered, like a device that
    /// responds only after the caller gave up.
    pub fn withhold_responses(&self, withheld: bool) {
        lock(&self.state).withheld = withheld;
    }

    /// Marks `path` as held by another process.
    pub fn hold_elsewhere(&self, path: &str) {
        lock(&self.state).foreign.insert(path.to_string());
    }

    pub fn open_count(&self) -> usize {
        lock(&self.state).opens
    }

    pub fn close_count(&self) -> usize {
        lock(&self.state).closes
    }

    pub fn stop_count(&self) -> usize {
        lock(&self.state).stops
    }

    /// Requests received by every channel opened so far and still open.
    pub fn requests(&self) -> Vec<LogicalMessage> {
        lock(&self.state)
            .open
            .values()
            .flat_map(|d| d.requests.iter().cloned())
            .collect()
    }
}

#[async_trait]
impl ChannelBackend for MockBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn frame_config(&self) -> FrameConfig {
        self.frame
    }

    async fn init(&self) -> TransportResult<BackendInfo> {
        match lock(&self.state).init_error.clone() {
            Some(e) => Err(e),
            None => Ok(BackendInfo::version(self.version.clone())),
        }
    }

    async fn enumerate(&self) -> TransportResult<Vec<Descriptor>> {
        let state = lock(&self.state);
        match &state.enumerate_error {
            Some(e) => Err(e.clone()),
            None => Ok(state.devices.clone()),
        }
    }

    async fn open(
        &self,
        descriptor: &Descriptor,
        previous: Option<String>,
    ) -> TransportResult<ChannelHandle> {
        let mut state = lock(&self.state);
        if !state.devices.iter().any(|d| d.path == descriptor.path) {
            return Err(TransportError::unreachable(format!(
                "device not found: {}",
                descriptor.path
            )));
        }
        if state.foreign.contains(&descriptor.path) {
            if previous.is_none() {
                return Err(TransportError::unreachable("device is in use"));
            }
            state.foreign.remove(&descriptor.path);
        }
        if let Some(prev) = previous {
            state.open.remove(&prev);
        }

        state.next_token += 1;
        let token = format!("{}#{}", descriptor.path, state.next_token);
        let device = EmulatedDevice::new(self.frame, Arc::clone(&self.responder))?;
        state.open.insert(token.clone(), device);
        state.opens += 1;
        Ok(ChannelHandle::new(&descriptor.path, self.kind, token))
    }

    async fn close(&self, handle: &ChannelHandle) -> TransportResult<()> {
        let mut state = lock(&self.state);
        if state.open.remove(&handle.token).is_some() {
            state.closes += 1;
        }
        Ok(())
    }

    async fn write(&self, handle: &ChannelHandle, data: &[u8]) -> TransportResult<()> {
        let mut state = lock(&self.state);
        if let Some(e) = state.call_error.clone() {
            return Err(e);
        }
        let silent = state.silent;
        let device = state
            .open
            .get_mut(&handle.token)
            .ok_or_else(|| TransportError::disconnected(format!("{} is gone", handle.path)))?;
        device.receive(data)?;
        if silent {
            device.outbox.clear();
        }
        Ok(())
    }

    async fn read(&self, handle: &ChannelHandle, timeout: Duration) -> TransportResult<Vec<u8>> {
        let next = {
            let mut state = lock(&self.state);
            let withheld = state.withheld;
            let device = state
                .open
                .get_mut(&handle.token)
                .ok_or_else(|| TransportError::disconnected(format!("{} is gone", handle.path)))?;
            if withheld {
                None
            } else {
                device.next_packet()
            }
        };
        match next {
            Some(packet) => Ok(packet),
            None => {
                tokio::time::sleep(timeout).await;
                Err(TransportError::timeout("mock device produced no data"))
            }
        }
    }

    async fn stop(&self) {
        let mut state = lock(&self.state);
        state.open.clear();
        state.stops += 1;
    }
}

// ── MockUsbHost ───────────────────────────────────────────────────────────────

#[derive(Default)]
struct HostState {
    devices: Vec<UsbDeviceInfo>,
    denied: HashSet<String>,
    unplugged: HashSet<String>,
    silent: bool,
    opened: usize,
}

/// [`UsbHost`] whose devices are [`EmulatedDevice`]s.
#[derive(Clone)]
pub struct MockUsbHost {
    state: Arc<Mutex<HostState>>,
    responder: Responder,
    packet_size: usize,
}

impl MockUsbHost {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(HostState::default())),
            responder: echo_responder(),
            packet_size: hwlink_core::protocol::DEFAULT_PACKET_SIZE,
        }
    }

    pub fn with_device(self, info: UsbDeviceInfo) -> Self {
        lock(&self.state).devices.push(info);
        self
    }

    pub fn with_responder(mut self, responder: Responder) -> Self {
        self.responder = responder;
        self
    }

    /// Opening `path` will fail with a permission error.
    pub fn deny(&self, path: &str) {
        lock(&self.state).denied.insert(path.to_string());
    }

    /// Removes `path` from the bus; open handles start failing.
    pub fn unplug(&self, path: &str) {
        let mut state = lock(&self.state);
        state.devices.retain(|d| d.path != path);
        state.unplugged.insert(path.to_string());
    }

    /// Puts a device (back) on the bus.
    pub fn plug(&self, info: UsbDeviceInfo) {
        let mut state = lock(&self.state);
        state.unplugged.remove(&info.path);
        state.devices.push(info);
    }

    pub fn set_silent(&self, silent: bool) {
        lock(&self.state).silent = silent;
    }

    pub fn opened(&self) -> usize {
        lock(&self.state).opened
    }
}

impl Default for MockUsbHost {
    fn default() -> Self {
        Self::new()
    }
}

impl UsbHost for MockUsbHost {
    fn devices(&self) -> Result<Vec<UsbDeviceInfo>, UsbError> {
        Ok(lock(&self.state).devices.clone())
    }

    fn open(&self, path: &str) -> Result<Box<dyn UsbDevice>, UsbError> {
        let mut state = lock(&self.state);
        if state.denied.contains(path) {
            return Err(UsbError::PermissionDenied(path.to_string()));
        }
        if !state.devices.iter().any(|d| d.path == path) {
            return Err(UsbError::NotFound(path.to_string()));
        }
        state.opened += 1;
        let frame = FrameConfig::with_packet_size(self.packet_size);
        let device = EmulatedDevice::new(frame, Arc::clone(&self.responder))
            .map_err(|e| UsbError::Io(e.to_string()))?;
        Ok(Box::new(MockUsbDevice {
            path: path.to_string(),
            host: Arc::clone(&self.state),
            device,
        }))
    }
}

struct MockUsbDevice {
    path: String,
    host: Arc<Mutex<HostState>>,
    device: EmulatedDevice,
}

impl MockUsbDevice {
    fn check_present(&self) -> Result<bool, UsbError> {
        let host = lock(&self.host);
        if host.unplugged.contains(&self.path) {
            return Err(UsbError::Disconnected(self.path.clone()));
        }
        Ok(host.silent)
    }
}

impl UsbDevice for MockUsbDevice {
    fn write(&mut self, data: &[u8]) -> Result<usize, UsbError> {
        let silent = self.check_present()?;
        self.device
            .receive(data)
            .map_err(|e| UsbError::Io(e.to_string()))?;
        if silent {
            self.device.outbox.clear();
        }
        Ok(data.len())
    }

    fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, UsbError> {
        self.check_present()?;
        match self.device.next_packet() {
            Some(packet) => {
                let n = packet.len().min(buf.len());
                buf[..n].copy_from_slice(&packet[..n]);
                Ok(n)
            }
            None => {
                std::thread::sleep(timeout);
                Ok(0)
            }
        }
    }
}

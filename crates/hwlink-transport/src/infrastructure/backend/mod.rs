//! Channel backends: the mechanisms that actually reach a device.
//!
//! Every backend implements [`ChannelBackend`], the capability set
//! `{enumerate, open, close, write, read}` plus a full request/response
//! [`call`](ChannelBackend::call).  Packet-oriented backends (USB HID,
//! WebUSB) get `call` for free from [`exchange_packets`]; the bridge daemon
//! speaks whole messages and overrides it.
//!
//! Backends map their native failures (HTTP statuses, daemon strings, OS
//! errors) onto [`TransportError`] before returning.  Nothing above this
//! module sees `reqwest::Error`, [`usb::UsbError`] or friends.
//!
//! # Testability
//!
//! [`mock::MockBackend`] is an in-memory device host that decodes request
//! packets and answers with framed responses.  Unit tests additionally get a
//! `mockall`-generated `MockChannelBackend` for "never touched" assertions.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hwlink_core::domain::{BackendKind, BridgeInfo, Descriptor, UdevInfo};
use hwlink_core::error::{ErrorKind, TransportError, TransportResult};
use hwlink_core::protocol::{encode, Decoded, FrameConfig, LogicalMessage, StreamDecoder};
use tokio::time::Instant;
use tracing::{debug, trace};

pub mod bridge;
pub mod factory;
pub mod mock;
pub mod usb;

#[cfg(feature = "hid")]
pub mod hidapi_host;

/// Backend-level handle to one open raw channel.
///
/// `token` is backend-specific: the daemon session id for the bridge, a
/// per-open identifier for USB backends.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelHandle {
    pub path: String,
    pub backend: BackendKind,
    pub token: String,
}

impl ChannelHandle {
    pub fn new(path: impl Into<String>, backend: BackendKind, token: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            backend,
            token: token.into(),
        }
    }
}

/// What a backend reports once it has been probed successfully.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendInfo {
    pub version: String,
    pub outdated: bool,
    pub bridge_info: Option<BridgeInfo>,
}

impl BackendInfo {
    pub fn version(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            outdated: false,
            bridge_info: None,
        }
    }
}

/// Capability interface implemented by every channel mechanism.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChannelBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Packet geometry used by [`exchange_packets`].
    fn frame_config(&self) -> FrameConfig {
        FrameConfig::default()
    }

    /// Availability probe.  Fails when the backend cannot be used at all.
    async fn init(&self) -> TransportResult<BackendInfo>;

    /// Side-effect-free device listing; called repeatedly by the poller.
    async fn enumerate(&self) -> TransportResult<Vec<Descriptor>>;

    /// Opens an exclusive raw channel to `descriptor`.
    ///
    /// `previous` names the channel token being superseded, if any, so a
    /// backend can hand the device over instead of reporting it busy.
    async fn open(
        &self,
        descriptor: &Descriptor,
        previous: Option<String>,
    ) -> TransportResult<ChannelHandle>;

    /// Closes `handle`.  Closing an already-closed handle is not an error.
    async fn close(&self, handle: &ChannelHandle) -> TransportResult<()>;

    async fn write(&self, handle: &ChannelHandle, data: &[u8]) -> TransportResult<()>;

    /// Reads whatever the device delivers next, failing with `Timeout`
    /// once `timeout` elapses.
    async fn read(&self, handle: &ChannelHandle, timeout: Duration) -> TransportResult<Vec<u8>>;

    /// One request/response exchange bounded by a single deadline.
    async fn call(
        &self,
        handle: &ChannelHandle,
        message: &LogicalMessage,
        timeout: Duration,
    ) -> TransportResult<LogicalMessage> {
        exchange_packets(self, handle, message, timeout).await
    }

    /// Asks the user to grant access to a device.  Backends without a
    /// consent step return `Ok(None)`.
    async fn request_device_selection(&self) -> TransportResult<Option<Descriptor>> {
        Ok(None)
    }

    /// Permission hint gathered by the most recent failure, if any.
    fn udev_hint(&self) -> Option<UdevInfo> {
        None
    }

    /// Releases backend-wide resources.  Open handles become invalid.
    async fn stop(&self) {}
}

/// How long [`exchange_packets`] listens for leftovers before writing.
pub const STALE_DRAIN_WINDOW: Duration = Duration::from_millis(2);

/// Writes every packet of `message` and reads until a whole response decodes.
///
/// The decoder lives only for this exchange, so a timeout or a dropped
/// future discards any partial response with it.  A device may still answer
/// an abandoned request afterwards; those packets are drained and dropped
/// before the next request goes out.
pub async fn exchange_packets<B>(
    backend: &B,
    handle: &ChannelHandle,
    message: &LogicalMessage,
    timeout: Duration,
) -> TransportResult<LogicalMessage>
where
    B: ChannelBackend + ?Sized,
{
    let config = backend.frame_config();
    let deadline = Instant::now() + timeout;

    let packets = encode(message, &config)?;
    drain_stale(backend, handle, deadline).await?;
    trace!(
        path = %handle.path,
        message_type = message.message_type,
        packets = packets.len(),
        "writing request"
    );
    for packet in &packets {
        backend.write(handle, packet.as_bytes()).await?;
    }

    let mut decoder = StreamDecoder::new(config)?;
    loop {
        let left = deadline.saturating_duration_since(Instant::now());
        if left.is_zero() {
            return Err(TransportError::timeout(format!(
                "no complete response from {} within {timeout:?}",
                handle.path
            )));
        }
        let chunk = backend.read(handle, left).await?;
        if let Decoded::Complete(response) = decoder.feed(&chunk)? {
            return Ok(response);
        }
    }
}

/// Discards whatever the device has queued from an earlier exchange.
async fn drain_stale<B>(backend: &B, handle: &ChannelHandle, deadline: Instant) -> TransportResult<()>
where
    B: ChannelBackend + ?Sized,
{
    let mut dropped = 0usize;
    loop {
        let window = deadline
            .saturating_duration_since(Instant::now())
            .min(STALE_DRAIN_WINDOW);
        if window.is_zero() {
            break;
        }
        match backend.read(handle, window).await {
            Ok(chunk) if chunk.is_empty() => break,
            Ok(chunk) => dropped += chunk.len(),
            Err(e) if e.kind() == ErrorKind::Timeout => break,
            Err(e) => return Err(e),
        }
    }
    if dropped > 0 {
        debug!(path = %handle.path, bytes = dropped, "dropped stale response data");
    }
    Ok(())
}

/// Produces backend instances for the facade's availability probing.
pub trait BackendFactory: Send + Sync {
    /// Returns `None` when `kind` is not compiled in or not configured.
    fn create(&self, kind: BackendKind) -> Option<Arc<dyn ChannelBackend>>;
}

/// A fixed set of ready-made backends, looked up by kind.
impl BackendFactory for Vec<Arc<dyn ChannelBackend>> {
    fn create(&self, kind: BackendKind) -> Option<Arc<dyn ChannelBackend>> {
        self.iter().find(|b| b.kind() == kind).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockBackend;
    use super::*;

    #[tokio::test]
    async fn test_exchange_packets_round_trips_multi_packet_message() {
        // Arrange
        let backend = MockBackend::new(BackendKind::Hid).with_device(Descriptor::new("A", BackendKind::Hid));
        let descriptor = Descriptor::new("A", BackendKind::Hid);
        let handle = backend.open(&descriptor, None).await.unwrap();
        let request = LogicalMessage::new(7, vec![0x42; 300]);

        // Act
        let response = backend
            .call(&handle, &request, Duration::from_secs(1))
            .await
            .unwrap();

        // Assert: the mock device echoes the payload with type + 1.
        assert_eq!(response.message_type, 8);
        assert_eq!(response.payload, request.payload);
    }

    #[tokio::test]
    async fn test_exchange_packets_times_out_when_device_is_silent() {
        let backend = MockBackend::new(BackendKind::Hid).with_device(Descriptor::new("A", BackendKind::Hid));
        backend.set_silent(true);
        let handle = backend
            .open(&Descriptor::new("A", BackendKind::Hid), None)
            .await
            .unwrap();

        let err = backend
            .call(&handle, &LogicalMessage::new(1, vec![1]), Duration::from_millis(50))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn test_late_response_is_not_returned_to_the_next_call() {
        // Arrange: the first answer only shows up after its call gave up
        let backend = MockBackend::new(BackendKind::Hid).with_device(Descriptor::new("A", BackendKind::Hid));
        let handle = backend
            .open(&Descriptor::new("A", BackendKind::Hid), None)
            .await
            .unwrap();
        backend.withhold_responses(true);
        let abandoned = backend
            .call(&handle, &LogicalMessage::new(1, vec![0xAA; 120]), Duration::from_millis(30))
            .await;
        backend.withhold_responses(false);

        // Act
        let response = backend
            .call(&handle, &LogicalMessage::new(3, vec![0xBB; 10]), Duration::from_secs(1))
            .await
            .unwrap();

        // Assert
        assert_eq!(abandoned.unwrap_err().kind(), ErrorKind::Timeout);
        assert_eq!(response, LogicalMessage::new(4, vec![0xBB; 10]));
    }

    #[tokio::test]
    async fn test_drain_propagates_disconnect() {
        let backend = MockBackend::new(BackendKind::Hid).with_device(Descriptor::new("A", BackendKind::Hid));
        let handle = ChannelHandle::new("A", BackendKind::Hid, "never-opened");

        let err = backend
            .call(&handle, &LogicalMessage::new(1, vec![1]), Duration::from_secs(1))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::DeviceDisconnected);
    }

    #[test]
    fn test_vec_factory_finds_backend_by_kind() {
        let backends: Vec<Arc<dyn ChannelBackend>> = vec![
            Arc::new(MockBackend::new(BackendKind::Bridge)),
            Arc::new(MockBackend::new(BackendKind::Hid)),
        ];

        assert_eq!(
            backends.create(BackendKind::Hid).map(|b| b.kind()),
            Some(BackendKind::Hid)
        );
        assert!(backends.create(BackendKind::WebUsb).is_none());
    }
}

//! Bridge protocol client: a [`ChannelBackend`] over a local HTTP daemon.
//!
//! Every operation is one `POST` to the daemon:
//!
//! | Endpoint                         | Purpose                               |
//! |----------------------------------|---------------------------------------|
//! | `/`                              | version probe, `{"version": ".."}`    |
//! | `/enumerate`                     | device list with daemon session hints |
//! | `/acquire/{path}/{previous}`     | open; `previous` is a session or null |
//! | `/release/{session}`             | close                                 |
//! | `/call/{session}`                | write one message and read the reply  |
//! | `/post/{session}`                | write only                            |
//! | `/read/{session}`                | read only                             |
//!
//! Message bodies are hex strings of the unchunked `[type:2][length:4][payload]`
//! form; the daemon does the packet chunking itself.
//!
//! Non-2xx responses never surface as HTTP errors.  The body is parsed as
//! JSON (falling back to raw text) and the daemon's message is run through
//! [`classify_daemon_error`].

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use hwlink_core::domain::{BackendKind, BridgeInfo, Descriptor};
use hwlink_core::error::{ErrorKind, TransportError, TransportResult};
use hwlink_core::protocol::{decode_unchunked, encode_unchunked, LogicalMessage};
use reqwest::header::CONTENT_TYPE;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::{BackendInfo, ChannelBackend, ChannelHandle};

pub const DEFAULT_BRIDGE_URL: &str = "http://127.0.0.1:21325";

// ── Errors ────────────────────────────────────────────────────────────────────

/// Failures talking to the daemon, before taxonomy mapping.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Connection refused, DNS failure, aborted request.
    #[error("bridge unreachable: {0}")]
    Unreachable(String),

    #[error("bridge request timed out")]
    Timeout,

    /// The daemon answered with a non-2xx status.
    #[error("bridge returned HTTP {status}: {message}")]
    Daemon { status: u16, message: String },

    /// A 2xx response whose body could not be understood.
    #[error("unexpected bridge response: {0}")]
    InvalidResponse(String),
}

impl From<reqwest::Error> for BridgeError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            BridgeError::Timeout
        } else {
            BridgeError::Unreachable(e.to_string())
        }
    }
}

impl From<BridgeError> for TransportError {
    fn from(e: BridgeError) -> Self {
        match e {
            BridgeError::Unreachable(msg) => TransportError::unavailable(format!("bridge unreachable: {msg}")),
            BridgeError::Timeout => TransportError::timeout("bridge request timed out"),
            BridgeError::Daemon { message, .. } => classify_daemon_error(&message),
            BridgeError::InvalidResponse(msg) => TransportError::malformed(msg),
        }
    }
}

/// Known daemon error strings, matched case-insensitively as substrings in
/// table order.
const DAEMON_ERRORS: &[(&str, ErrorKind)] = &[
    ("device disconnected during action", ErrorKind::DeviceDisconnected),
    ("closed device", ErrorKind::DeviceDisconnected),
    ("malformed protobuf", ErrorKind::MalformedProtocol),
    ("malformed wire format", ErrorKind::MalformedProtocol),
    ("malformed data", ErrorKind::MalformedProtocol),
    ("wrong previous session", ErrorKind::SessionStale),
    ("session not found", ErrorKind::SessionStale),
    ("device not found", ErrorKind::DeviceUnreachable),
    ("other call in progress", ErrorKind::DeviceUnreachable),
    ("device is in use", ErrorKind::DeviceUnreachable),
    ("libusb_error_access", ErrorKind::DeviceUnreachable),
    ("libusb_error_busy", ErrorKind::DeviceUnreachable),
];

/// Maps a daemon error string onto the taxonomy.
///
/// The original string is always kept as the error message; unrecognised
/// strings become [`ErrorKind::Unknown`].
pub fn classify_daemon_error(message: &str) -> TransportError {
    let lower = message.to_ascii_lowercase();
    let kind = DAEMON_ERRORS
        .iter()
        .find(|(needle, _)| lower.contains(needle))
        .map(|(_, kind)| *kind)
        .unwrap_or(ErrorKind::Unknown);
    TransportError::new(kind, message)
}

/// Extracts the daemon's message from an error response body.
fn error_message(status: u16, body: &str) -> String {
    match serde_json::from_str::<serde_json::Value>(body) {
        Ok(serde_json::Value::Object(map)) => match map.get("error") {
            Some(serde_json::Value::String(s)) => return s.clone(),
            Some(other) => return other.to_string(),
            None => {}
        },
        Ok(serde_json::Value::String(s)) => return s,
        _ => {}
    }
    let trimmed = body.trim();
    if trimmed.is_empty() {
        format!("HTTP {status}")
    } else {
        trimmed.to_string()
    }
}

// ── Request bodies ────────────────────────────────────────────────────────────

/// Request payload.  Exactly one shape per request, never mixed.
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    Empty,
    Text(String),
    Binary(Vec<u8>),
    Json(serde_json::Value),
}

impl Body {
    /// Content type inferred from the payload shape.
    pub fn content_type(&self) -> &'static str {
        match self {
            Body::Empty | Body::Text(_) => "text/plain",
            Body::Binary(_) => "application/octet-stream",
            Body::Json(_) => "application/json",
        }
    }

    fn into_bytes(self) -> Vec<u8> {
        match self {
            Body::Empty => Vec::new(),
            Body::Text(s) => s.into_bytes(),
            Body::Binary(b) => b,
            Body::Json(v) => v.to_string().into_bytes(),
        }
    }
}

/// Per-request knobs.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestOptions {
    /// Send no `Content-Type` header at all.
    pub skip_content_type: bool,
    /// Overrides the client-wide request timeout.
    pub timeout: Option<Duration>,
}

// ── Daemon response shapes ────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct VersionResponse {
    version: String,
}

#[derive(Debug, Deserialize)]
struct AcquireResponse {
    session: String,
}

#[derive(Debug, Deserialize)]
struct BridgeDevice {
    path: String,
    #[serde(default)]
    session: Option<String>,
    #[serde(default)]
    vendor: Option<u16>,
    #[serde(default)]
    product: Option<u16>,
    #[serde(default)]
    debug: bool,
}

/// `true` when dotted version `current` is strictly older than `latest`.
pub fn is_outdated(current: &str, latest: &str) -> bool {
    fn parts(v: &str) -> Vec<u64> {
        v.trim_start_matches('v')
            .split('.')
            .map(|p| p.trim().parse().unwrap_or(0))
            .collect()
    }
    let (a, b) = (parts(current), parts(latest));
    let len = a.len().max(b.len());
    for i in 0..len {
        let (x, y) = (a.get(i).copied().unwrap_or(0), b.get(i).copied().unwrap_or(0));
        if x != y {
            return x < y;
        }
    }
    false
}

// ── Backend ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeSettings {
    pub url: String,
    pub request_timeout: Duration,
    /// Newest known daemon version, used to flag outdated installs.
    pub latest_version: Option<String>,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            url: DEFAULT_BRIDGE_URL.to_string(),
            request_timeout: Duration::from_secs(10),
            latest_version: None,
        }
    }
}

pub struct BridgeBackend {
    client: reqwest::Client,
    settings: BridgeSettings,
    version: Mutex<Option<String>>,
}

impl BridgeBackend {
    pub fn new(settings: BridgeSettings) -> TransportResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(settings.request_timeout)
            .build()
            .map_err(|e| TransportError::unavailable(format!("cannot build HTTP client: {e}")))?;
        Ok(Self {
            client,
            settings,
            version: Mutex::new(None),
        })
    }

    pub fn url(&self) -> &str {
        &self.settings.url
    }

    /// Version reported by the last successful probe.
    pub fn version(&self) -> Option<String> {
        self.version
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Issues one `POST`, returning the body of a 2xx response.
    pub async fn post(
        &self,
        endpoint: &str,
        body: Body,
        options: RequestOptions,
    ) -> Result<String, BridgeError> {
        let url = format!("{}{}", self.settings.url.trim_end_matches('/'), endpoint);
        let mut request = self.client.post(&url);
        if !options.skip_content_type {
            request = request.header(CONTENT_TYPE, body.content_type());
        }
        if let Some(timeout) = options.timeout {
            request = request.timeout(timeout);
        }

        let response = request.body(body.into_bytes()).send().await?;
        let status = response.status();
        let text = response.text().await?;
        debug!(%url, status = status.as_u16(), "bridge response");

        if status.is_success() {
            Ok(text)
        } else {
            let message = error_message(status.as_u16(), &text);
            warn!(%url, status = status.as_u16(), %message, "bridge reported an error");
            Err(BridgeError::Daemon {
                status: status.as_u16(),
                message,
            })
        }
    }

    async fn post_json<T: for<'de> Deserialize<'de>>(
        &self,
        endpoint: &str,
        body: Body,
    ) -> TransportResult<T> {
        let text = self.post(endpoint, body, RequestOptions::default()).await?;
        serde_json::from_str(&text)
            .map_err(|e| BridgeError::InvalidResponse(format!("{endpoint}: {e}")).into())
    }

    fn decode_hex(text: &str) -> TransportResult<Vec<u8>> {
        hex::decode(text.trim())
            .map_err(|e| TransportError::malformed(format!("bridge returned invalid hex: {e}")))
    }
}

#[async_trait]
impl ChannelBackend for BridgeBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Bridge
    }

    async fn init(&self) -> TransportResult<BackendInfo> {
        let probe: VersionResponse = self.post_json("/", Body::Empty).await?;
        let latest = self.settings.latest_version.clone();
        let outdated = latest
            .as_deref()
            .map_or(false, |l| is_outdated(&probe.version, l));

        *self
            .version
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(probe.version.clone());
        info!(url = %self.settings.url, version = %probe.version, outdated, "bridge daemon found");

        Ok(BackendInfo {
            version: probe.version.clone(),
            outdated,
            bridge_info: Some(BridgeInfo {
                version: probe.version,
                latest,
                outdated,
            }),
        })
    }

    async fn enumerate(&self) -> TransportResult<Vec<Descriptor>> {
        let devices: Vec<BridgeDevice> = self.post_json("/enumerate", Body::Empty).await?;
        Ok(devices
            .into_iter()
            .map(|d| {
                let mut desc = Descriptor::new(d.path, BackendKind::Bridge);
                desc.vendor_id = d.vendor;
                desc.product_id = d.product;
                desc.session_hint = d.session;
                desc.debug = d.debug;
                desc
            })
            .collect())
    }

    async fn open(
        &self,
        descriptor: &Descriptor,
        previous: Option<String>,
    ) -> TransportResult<ChannelHandle> {
        let previous = previous
            .or_else(|| descriptor.session_hint.clone())
            .unwrap_or_else(|| "null".to_string());
        let endpoint = format!("/acquire/{}/{}", descriptor.path, previous);
        let acquired: AcquireResponse = self.post_json(&endpoint, Body::Empty).await?;
        debug!(path = %descriptor.path, session = %acquired.session, "bridge session acquired");
        Ok(ChannelHandle::new(&descriptor.path, BackendKind::Bridge, acquired.session))
    }

    async fn close(&self, handle: &ChannelHandle) -> TransportResult<()> {
        let endpoint = format!("/release/{}", handle.token);
        match self.post(&endpoint, Body::Empty, RequestOptions::default()).await {
            Ok(_) => Ok(()),
            Err(e) => {
                let mapped = TransportError::from(e);
                // Already released or taken over: nothing left to close.
                if mapped.kind() == ErrorKind::SessionStale {
                    Ok(())
                } else {
                    Err(mapped)
                }
            }
        }
    }

    async fn write(&self, handle: &ChannelHandle, data: &[u8]) -> TransportResult<()> {
        let endpoint = format!("/post/{}", handle.token);
        self.post(&endpoint, Body::Text(hex::encode(data)), RequestOptions::default())
            .await?;
        Ok(())
    }

    async fn read(&self, handle: &ChannelHandle, timeout: Duration) -> TransportResult<Vec<u8>> {
        let endpoint = format!("/read/{}", handle.token);
        let options = RequestOptions {
            timeout: Some(timeout),
            ..RequestOptions::default()
        };
        let text = self.post(&endpoint, Body::Empty, options).await?;
        Self::decode_hex(&text)
    }

    async fn call(
        &self,
        handle: &ChannelHandle,
        message: &LogicalMessage,
        timeout: Duration,
    ) -> TransportResult<LogicalMessage> {
        let endpoint = format!("/call/{}", handle.token);
        let wire = encode_unchunked(message)?;
        let options = RequestOptions {
            timeout: Some(timeout),
            ..RequestOptions::default()
        };
        let text = self
            .post(&endpoint, Body::Text(hex::encode(wire)), options)
            .await?;
        Ok(decode_unchunked(&Self::decode_hex(&text)?)?)
    }
}

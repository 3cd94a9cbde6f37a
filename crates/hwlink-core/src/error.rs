//! Uniform error taxonomy and result envelope.
//!
//! Every backend speaks its own failure dialect (HTTP status codes and daemon
//! strings, OS errno values, framing errors).  Before a failure leaves a
//! component it is mapped onto one of the seven [`ErrorKind`]s and wrapped in
//! a [`TransportError`].  Nothing above the backends ever sees a
//! backend-specific error type.
//!
//! Rust callers get [`TransportResult<T>`].  [`ResultEnvelope<T>`] is the same
//! outcome in its serialized shape:
//!
//! ```json
//! { "success": true,  "payload": { ... } }
//! { "success": false, "error": "DeviceDisconnected", "message": "closed device" }
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::protocol::codec::ProtocolError;

/// Closed set of failure categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// The device went away while in use.
    DeviceDisconnected,
    /// The device could not be opened or acquired.
    DeviceUnreachable,
    /// The session was superseded or released.
    SessionStale,
    /// Framing or encoding on the wire was invalid.
    MalformedProtocol,
    /// An operation did not complete before its deadline.
    Timeout,
    /// No backend could be started or reached.
    TransportUnavailable,
    /// Anything not covered above.
    Unknown,
}

impl ErrorKind {
    pub const ALL: [ErrorKind; 7] = [
        ErrorKind::DeviceDisconnected,
        ErrorKind::DeviceUnreachable,
        ErrorKind::SessionStale,
        ErrorKind::MalformedProtocol,
        ErrorKind::Timeout,
        ErrorKind::TransportUnavailable,
        ErrorKind::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::DeviceDisconnected => "DeviceDisconnected",
            ErrorKind::DeviceUnreachable => "DeviceUnreachable",
            ErrorKind::SessionStale => "SessionStale",
            ErrorKind::MalformedProtocol => "MalformedProtocol",
            ErrorKind::Timeout => "Timeout",
            ErrorKind::TransportUnavailable => "TransportUnavailable",
            ErrorKind::Unknown => "Unknown",
        }
    }

    /// Kinds that must reach the caller untouched: re-acquire, abort or reconnect.
    ///
    /// These are never retried inside the transport.
    pub fn requires_caller_action(&self) -> bool {
        matches!(
            self,
            ErrorKind::SessionStale | ErrorKind::MalformedProtocol | ErrorKind::DeviceDisconnected
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failure that has crossed a component boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportError {
    pub kind: ErrorKind,
    /// Diagnostic detail, e.g. the raw daemon string for [`ErrorKind::Unknown`].
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub message: Option<String>,
}

/// Result type returned by every public transport operation.
pub type TransportResult<T> = Result<T, TransportError>;

impl TransportError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: Some(message.into()),
        }
    }

    pub fn from_kind(kind: ErrorKind) -> Self {
        Self {
            kind,
            message: None,
        }
    }

    pub fn disconnected(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::DeviceDisconnected, message)
    }

    pub fn unreachable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::DeviceUnreachable, message)
    }

    pub fn stale(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::SessionStale, message)
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::MalformedProtocol, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::TransportUnavailable, message)
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unknown, message)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(m) => write!(f, "{}: {m}", self.kind),
            None => write!(f, "{}", self.kind),
        }
    }
}

impl std::error::Error for TransportError {}

impl From<ProtocolError> for TransportError {
    fn from(e: ProtocolError) -> Self {
        TransportError::malformed(e.to_string())
    }
}

impl From<ErrorKind> for TransportError {
    fn from(kind: ErrorKind) -> Self {
        TransportError::from_kind(kind)
    }
}

// ── Envelope ──────────────────────────────────────────────────────────────────

/// Serialized form of a [`TransportResult`].
///
/// Every response has the same shape, so a consumer can always inspect
/// `success` first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultEnvelope<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub payload: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub message: Option<String>,
}

impl<T> ResultEnvelope<T> {
    pub fn ok(payload: T) -> Self {
        Self {
            success: true,
            payload: Some(payload),
            error: None,
            message: None,
        }
    }

    pub fn err(error: TransportError) -> Self {
        Self {
            success: false,
            payload: None,
            error: Some(error.kind),
            message: error.message,
        }
    }

    /// Converts back to a [`TransportResult`].
    ///
    /// An envelope claiming success without a payload, or failure without a
    /// kind, is reported as [`ErrorKind::MalformedProtocol`].
    pub fn into_result(self) -> TransportResult<T> {
        match (self.success, self.payload, self.error) {
            (true, Some(payload), _) => Ok(payload),
            (false, _, Some(kind)) => Err(TransportError {
                kind,
                message: self.message,
            }),
            (true, None, _) => Err(TransportError::malformed("success envelope without payload")),
            (false, _, None) => Err(TransportError::malformed("error envelope without error kind")),
        }
    }
}

impl<T> From<TransportResult<T>> for ResultEnvelope<T> {
    fn from(result: TransportResult<T>) -> Self {
        match result {
            Ok(payload) => Self::ok(payload),
            Err(e) => Self::err(e),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

//! Domain types shared by every transport backend.
//!
//! Nothing in here performs I/O.  The types describe *what* the transport
//! layer talks about (devices, sessions, lifecycle events) so the async
//! machinery in `hwlink-transport` and any consumer above it agree on one
//! vocabulary.

/// Enumerated device instances and snapshot diffing.
pub mod descriptor;

/// Lifecycle events emitted by the transport facade.
pub mod event;

/// Exclusive-access session tokens.
pub mod session;

pub use descriptor::{BackendKind, Descriptor, DescriptorDiff};
pub use event::{
    BackendStatus, BridgeInfo, ChangeInfo, ErrorInfo, StartInfo, StopInfo, TransportEvent,
    UdevInfo,
};
pub use session::{Session, SessionId, SessionIdGenerator};

//! # hwlink-core
//!
//! I/O-free foundation of the hwlink device transport.
//!
//! - **`protocol`** – Splits variable-length [`LogicalMessage`]s into
//!   fixed-size packets and reassembles them, plus the unchunked form spoken
//!   by the bridge daemon.
//!
//! - **`error`** – The closed [`ErrorKind`] taxonomy every backend failure is
//!   mapped onto, and the serializable [`ResultEnvelope`].
//!
//! - **`domain`** – Descriptors, sessions and lifecycle events shared by the
//!   arbitrator, the facade and their consumers.
//!
//! The async machinery lives in `hwlink-transport`; nothing here touches a
//! socket, a device node or a runtime.

pub mod domain;
pub mod error;
pub mod protocol;

pub use domain::{
    BackendKind, BackendStatus, Descriptor, DescriptorDiff, Session, SessionId, TransportEvent,
};
pub use error::{ErrorKind, ResultEnvelope, TransportError, TransportResult};
pub use protocol::{
    decode, encode, Decoded, FrameConfig, LogicalMessage, Packet, PacketDecoder, PacketSequence,
    ProtocolError, StreamDecoder,
};

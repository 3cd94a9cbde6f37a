//! Message and packet types moved by the framer.
//!
//! A [`LogicalMessage`] is what callers exchange with the device: a numeric
//! message type plus an opaque payload.  The payload encoding belongs to the
//! layer above this crate and is never inspected here.
//!
//! On the wire a logical message becomes a [`PacketSequence`]: an ordered list
//! of fixed-capacity [`Packet`]s.
//!
//! ```text
//! first packet:        ['?']['#']['#'][type:2][length:4][payload ...][0 padding]
//! continuation packet: ['?'][payload ...][0 padding]
//! ```
//!
//! All multi-byte integers are big-endian.

use serde::{Deserialize, Serialize};

// ── Wire constants ────────────────────────────────────────────────────────────

/// Marker byte at the start of every packet.
pub const PACKET_MARKER: u8 = b'?';

/// Two magic bytes that follow the marker in the first packet of a sequence.
pub const HEADER_MAGIC: [u8; 2] = [b'#', b'#'];

/// Bytes used by the first-packet header: marker + magic + type + length.
pub const FIRST_HEADER_SIZE: usize = 1 + 2 + 2 + 4;

/// Bytes used by a continuation header: the marker only.
pub const CONTINUATION_HEADER_SIZE: usize = 1;

/// Packet capacity used by USB HID devices (one interrupt report).
pub const DEFAULT_PACKET_SIZE: usize = 64;

/// Largest payload the decoder will accept before allocating.
pub const DEFAULT_MAX_PAYLOAD: usize = 16 * 1024 * 1024;

/// Header size of the unchunked form `[type:2][length:4]` used by the bridge daemon.
pub const BRIDGE_HEADER_SIZE: usize = 2 + 4;

// ── Framing configuration ─────────────────────────────────────────────────────

/// Backend-defined framing parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameConfig {
    /// Fixed capacity of every packet in bytes, headers included.
    pub packet_size: usize,
    /// Upper bound on the declared payload length.
    pub max_payload: usize,
}

impl FrameConfig {
    /// Creates a config with the given packet size and the default payload cap.
    pub fn with_packet_size(packet_size: usize) -> Self {
        Self {
            packet_size,
            ..Self::default()
        }
    }

    /// Payload bytes carried by the first packet.
    pub fn first_capacity(&self) -> usize {
        self.packet_size.saturating_sub(FIRST_HEADER_SIZE)
    }

    /// Payload bytes carried by every continuation packet.
    pub fn continuation_capacity(&self) -> usize {
        self.packet_size.saturating_sub(CONTINUATION_HEADER_SIZE)
    }
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            packet_size: DEFAULT_PACKET_SIZE,
            max_payload: DEFAULT_MAX_PAYLOAD,
        }
    }
}

// ── Logical message ───────────────────────────────────────────────────────────

/// One request or response exchanged with the device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogicalMessage {
    /// Message type id as understood by the device firmware.
    pub message_type: u16,
    /// Opaque encoded payload.
    pub payload: Vec<u8>,
}

impl LogicalMessage {
    pub fn new(message_type: u16, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            message_type,
            payload: payload.into(),
        }
    }

    /// Number of packets this message occupies under `config`.
    pub fn packet_count(&self, config: &FrameConfig) -> usize {
        let first = config.first_capacity();
        if self.payload.len() <= first {
            return 1;
        }
        let rest = self.payload.len() - first;
        1 + rest.div_ceil(config.continuation_capacity().max(1))
    }
}

// ── Packets ───────────────────────────────────────────────────────────────────

/// A single fixed-capacity wire packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    bytes: Vec<u8>,
}

impl Packet {
    /// Wraps raw bytes received from a backend.
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            bytes: bytes.into(),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// `true` when the packet starts with the packet marker.
    pub fn has_marker(&self) -> bool {
        self.bytes.first() == Some(&PACKET_MARKER)
    }

    /// `true` when the marker is followed by the header magic.
    ///
    /// This alone does not make the packet a header: while a message is in
    /// progress every marked packet is a continuation, and continuation
    /// payload may begin with `##`.  Only a decoder at rest treats it as one.
    pub fn has_header_magic(&self) -> bool {
        self.has_marker() && self.bytes.len() >= 3 && self.bytes[1..3] == HEADER_MAGIC
    }
}

/// Ordered packets representing one logical message.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PacketSequence {
    packets: Vec<Packet>,
}

impl PacketSequence {
    pub(crate) fn from_packets(packets: Vec<Packet>) -> Self {
        Self { packets }
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Packet> {
        self.packets.iter()
    }

    /// Concatenation of every packet, as it would appear on a byte stream.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.packets.iter().flat_map(|p| p.as_bytes().iter().copied()).collect()
    }
}

impl IntoIterator for PacketSequence {
    type Item = Packet;
    type IntoIter = std::vec::IntoIter<Packet>;

    fn into_iter(self) -> Self::IntoIter {
        self.packets.into_iter()
    }
}

impl<'a> IntoIterator for &'a PacketSequence {
    type Item = &'a Packet;
    type IntoIter = std::slice::Iter<'a, Packet>;

    fn into_iter(self) -> Self::IntoIter {
        self.packets.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_frame_config_capacities() {
        let cfg = FrameConfig::default();
        assert_eq!(cfg.packet_size, 64);
        assert_eq!(cfg.first_capacity(), 55);
        assert_eq!(cfg.continuation_capacity(), 63);
    }

    #[test]
    fn test_packet_count_for_empty_payload_is_one() {
        let msg = LogicalMessage::new(0, Vec::new());
        assert_eq!(msg.packet_count(&FrameConfig::default()), 1);
    }

    #[test]
    fn test_packet_count_crosses_into_second_packet() {
        let cfg = FrameConfig::default();
        assert_eq!(LogicalMessage::new(1, vec![0; 55]).packet_count(&cfg), 1);
        assert_eq!(LogicalMessage::new(1, vec![0; 56]).packet_count(&cfg), 2);
        assert_eq!(LogicalMessage::new(1, vec![0; 55 + 63]).packet_count(&cfg), 2);
        assert_eq!(LogicalMessage::new(1, vec![0; 55 + 64]).packet_count(&cfg), 3);
    }

    #[test]
    fn test_packet_marker_and_magic_detection() {
        let first = Packet::from_bytes(vec![b'?', b'#', b'#', 0, 1]);
        let cont = Packet::from_bytes(vec![b'?', 7, 7]);
        let junk = Packet::from_bytes(vec![0x00, b'#', b'#']);

        assert!(first.has_marker());
        assert!(first.has_header_magic());
        assert!(cont.has_marker());
        assert!(!cont.has_header_magic());
        assert!(!junk.has_marker());
        assert!(!junk.has_header_magic());
    }
}

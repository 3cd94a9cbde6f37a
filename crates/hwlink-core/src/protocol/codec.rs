//! Packet framer: splits logical messages into fixed-size packets and
//! reassembles them.
//!
//! Wire format (see [`crate::protocol::messages`]):
//! ```text
//! first:        [?][#][#][type:2][length:4][payload...][0-padding]
//! continuation: [?][payload...][0-padding]
//! ```
//!
//! Decoding is a pure accumulator.  [`PacketDecoder`] consumes whole packets;
//! [`StreamDecoder`] sits in front of it and re-cuts arbitrary read chunks
//! into packets, so the result never depends on how a backend split its reads.
//!
//! Nothing here retries or suspends.  Errors are returned verbatim.

use thiserror::Error;
use tracing::debug;

use crate::protocol::messages::{
    FrameConfig, LogicalMessage, Packet, PacketSequence, BRIDGE_HEADER_SIZE,
    CONTINUATION_HEADER_SIZE, FIRST_HEADER_SIZE, HEADER_MAGIC, PACKET_MARKER,
};

/// Errors raised while framing or unframing messages.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The packet size leaves no room for payload after the header.
    #[error("invalid packet size {0}: must be larger than the {FIRST_HEADER_SIZE}-byte header")]
    InvalidPacketSize(usize),

    /// The payload (or a declared length) exceeds the configured limit.
    #[error("payload of {len} bytes exceeds the {max}-byte limit")]
    PayloadTooLarge { len: usize, max: usize },

    /// A packet handed to the decoder does not have the configured capacity.
    #[error("packet has {actual} bytes, expected {expected}")]
    WrongPacketLength { expected: usize, actual: usize },

    /// The first byte of a packet is not the packet marker.
    #[error("bad packet marker: 0x{0:02X}")]
    BadMarker(u8),

    /// A continuation packet arrived with no header in progress.
    #[error("continuation packet without an active header")]
    MissingHeader,

    /// A header packet followed an already completed message.
    #[error("unexpected header packet; {remaining} payload bytes were still outstanding")]
    UnexpectedHeader { remaining: usize },

    /// More payload bytes arrived than the header declared.
    #[error("received more bytes than the declared length of {declared}")]
    LengthOverflow { declared: usize },

    /// The packet stream ended before the declared length was satisfied.
    #[error("message incomplete: {remaining} payload bytes outstanding")]
    Incomplete { remaining: usize },

    /// The byte slice is shorter than the minimum required length.
    #[error("insufficient data: need at least {needed} bytes, got {available}")]
    InsufficientData { needed: usize, available: usize },
}

/// Result of pushing bytes into a decoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// More packets are needed.
    Incomplete,
    /// The declared length was satisfied.
    Complete(LogicalMessage),
}

// ── Encoding ──────────────────────────────────────────────────────────────────

/// Splits `msg` into a zero-padded [`PacketSequence`].
///
/// # Errors
///
/// Returns [`ProtocolError::InvalidPacketSize`] for unusable packet sizes and
/// [`ProtocolError::PayloadTooLarge`] when the payload exceeds `max_payload`.
///
/// # Examples
///
/// ```rust
/// use hwlink_core::protocol::{decode, encode, FrameConfig, LogicalMessage};
///
/// let cfg = FrameConfig::default();
/// let msg = LogicalMessage::new(55, vec![1, 2, 3]);
/// let packets = encode(&msg, &cfg).unwrap();
/// assert_eq!(packets.len(), 1);
/// assert_eq!(decode(&packets, &cfg).unwrap(), msg);
/// ```
pub fn encode(msg: &LogicalMessage, config: &FrameConfig) -> Result<PacketSequence, ProtocolError> {
    validate_config(config)?;
    let len = msg.payload.len();
    check_payload_len(len, config)?;

    let mut packets = Vec::with_capacity(msg.packet_count(config));

    let mut first = Vec::with_capacity(config.packet_size);
    first.push(PACKET_MARKER);
    first.extend_from_slice(&HEADER_MAGIC);
    first.extend_from_slice(&msg.message_type.to_be_bytes());
    first.extend_from_slice(&(len as u32).to_be_bytes());
    let head = len.min(config.first_capacity());
    first.extend_from_slice(&msg.payload[..head]);
    first.resize(config.packet_size, 0);
    packets.push(Packet::from_bytes(first));

    for chunk in msg.payload[head..].chunks(config.continuation_capacity()) {
        let mut buf = Vec::with_capacity(config.packet_size);
        buf.push(PACKET_MARKER);
        buf.extend_from_slice(chunk);
        buf.resize(config.packet_size, 0);
        packets.push(Packet::from_bytes(buf));
    }

    Ok(PacketSequence::from_packets(packets))
}

/// Reassembles exactly one message from an ordered packet list.
///
/// # Errors
///
/// Any framing error from [`PacketDecoder::push`], [`ProtocolError::Incomplete`]
/// if the packets run out first (`remaining` is 0 when there were none), or
/// [`ProtocolError::UnexpectedHeader`] / [`ProtocolError::MissingHeader`] if
/// packets follow the completed message.
pub fn decode<'a, I>(packets: I, config: &FrameConfig) -> Result<LogicalMessage, ProtocolError>
where
    I: IntoIterator<Item = &'a Packet>,
{
    let mut decoder = PacketDecoder::new(*config)?;
    let mut done: Option<LogicalMessage> = None;

    for packet in packets {
        if done.is_some() {
            // The decoder is at rest here, so header magic really is a header.
            if packet.has_header_magic() {
                return Err(ProtocolError::UnexpectedHeader { remaining: 0 });
            }
            return Err(ProtocolError::MissingHeader);
        }
        if let Decoded::Complete(msg) = decoder.push(packet)? {
            done = Some(msg);
        }
    }

    match done {
        Some(msg) => Ok(msg),
        None => Err(ProtocolError::Incomplete {
            remaining: decoder.remaining().unwrap_or(0),
        }),
    }
}

// ── Packet decoder ────────────────────────────────────────────────────────────

#[derive(Debug)]
struct Partial {
    message_type: u16,
    declared: usize,
    payload: Vec<u8>,
}

/// Accumulates whole packets into a [`LogicalMessage`].
///
/// After an error or a completed message the decoder is back at rest and
/// ready for the next header packet.
#[derive(Debug)]
pub struct PacketDecoder {
    config: FrameConfig,
    partial: Option<Partial>,
}

impl PacketDecoder {
    /// # Errors
    ///
    /// Returns [`ProtocolError::InvalidPacketSize`] for unusable packet sizes.
    pub fn new(config: FrameConfig) -> Result<Self, ProtocolError> {
        validate_config(&config)?;
        Ok(Self {
            config,
            partial: None,
        })
    }

    pub fn config(&self) -> &FrameConfig {
        &self.config
    }

    /// Payload bytes still outstanding, or `None` when no header is active.
    pub fn remaining(&self) -> Option<usize> {
        self.partial
            .as_ref()
            .map(|p| p.declared - p.payload.len())
    }

    /// `true` while a header has been seen and the message is not complete.
    pub fn in_progress(&self) -> bool {
        self.partial.is_some()
    }

    /// Drops any partially assembled message.
    pub fn reset(&mut self) {
        self.partial = None;
    }

    /// Feeds one packet.
    ///
    /// # Errors
    ///
    /// Returns a [`ProtocolError`] for wrong-length packets, bad markers,
    /// continuation packets without a header, oversized declared lengths, or
    /// non-zero bytes past the declared length.
    /// The decoder is reset on every error.
    pub fn push(&mut self, packet: &Packet) -> Result<Decoded, ProtocolError> {
        let result = self.push_inner(packet.as_bytes());
        if result.is_err() {
            self.partial = None;
        }
        result
    }

    fn push_inner(&mut self, bytes: &[u8]) -> Result<Decoded, ProtocolError> {
        if bytes.len() != self.config.packet_size {
            return Err(ProtocolError::WrongPacketLength {
                expected: self.config.packet_size,
                actual: bytes.len(),
            });
        }
        if bytes[0] != PACKET_MARKER {
            return Err(ProtocolError::BadMarker(bytes[0]));
        }

        // Mid-message every marked packet is a continuation, even when its
        // payload happens to begin with the header magic.
        let body = if self.partial.is_some() {
            &bytes[CONTINUATION_HEADER_SIZE..]
        } else if bytes[1..3] == HEADER_MAGIC {
            let message_type = u16::from_be_bytes([bytes[3], bytes[4]]);
            let declared = u32::from_be_bytes([bytes[5], bytes[6], bytes[7], bytes[8]]) as usize;
            check_payload_len(declared, &self.config)?;
            self.partial = Some(Partial {
                message_type,
                declared,
                payload: Vec::with_capacity(declared),
            });
            &bytes[FIRST_HEADER_SIZE..]
        } else {
            return Err(ProtocolError::MissingHeader);
        };

        self.absorb(body)
    }

    fn absorb(&mut self, body: &[u8]) -> Result<Decoded, ProtocolError> {
        let Some(partial) = self.partial.as_mut() else {
            return Err(ProtocolError::MissingHeader);
        };

        let wanted = partial.declared - partial.payload.len();
        let take = wanted.min(body.len());
        partial.payload.extend_from_slice(&body[..take]);

        if partial.payload.len() < partial.declared {
            return Ok(Decoded::Incomplete);
        }

        // Whatever follows the declared length must be padding.
        if body[take..].iter().any(|&b| b != 0) {
            return Err(ProtocolError::LengthOverflow {
                declared: partial.declared,
            });
        }

        match self.partial.take() {
            Some(done) => Ok(Decoded::Complete(LogicalMessage {
                message_type: done.message_type,
                payload: done.payload,
            })),
            None => Err(ProtocolError::MissingHeader),
        }
    }
}

// ── Stream decoder ────────────────────────────────────────────────────────────

/// Re-cuts raw read chunks into packets before handing them to a [`PacketDecoder`].
///
/// A backend may return more or fewer bytes than one packet per read; the
/// stream decoder buffers the remainder.  Bytes following a completed message
/// stay buffered and are consumed by the next [`feed`](Self::feed) call.
#[derive(Debug)]
pub struct StreamDecoder {
    packets: PacketDecoder,
    pending: Vec<u8>,
}

impl StreamDecoder {
    /// # Errors
    ///
    /// Returns [`ProtocolError::InvalidPacketSize`] for unusable packet sizes.
    pub fn new(config: FrameConfig) -> Result<Self, ProtocolError> {
        Ok(Self {
            packets: PacketDecoder::new(config)?,
            pending: Vec::with_capacity(config.packet_size),
        })
    }

    /// Bytes received but not yet forming a whole packet.
    pub fn buffered(&self) -> usize {
        self.pending.len()
    }

    /// Payload bytes still outstanding for the message in progress.
    pub fn remaining(&self) -> Option<usize> {
        self.packets.remaining()
    }

    /// Discards buffered bytes and any partially assembled message.
    ///
    /// Used when a read is cancelled or times out mid-sequence so leftovers
    /// can never bleed into the next message.
    pub fn reset(&mut self) {
        if !self.pending.is_empty() || self.packets.in_progress() {
            debug!(
                buffered = self.pending.len(),
                remaining = ?self.packets.remaining(),
                "discarding partial packet sequence"
            );
        }
        self.pending.clear();
        self.packets.reset();
    }

    /// Appends `chunk` and decodes as many whole packets as possible.
    ///
    /// # Errors
    ///
    /// Propagates [`PacketDecoder::push`] errors.  Buffered bytes are dropped
    /// on error.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Decoded, ProtocolError> {
        self.pending.extend_from_slice(chunk);
        let size = self.packets.config().packet_size;

        while self.pending.len() >= size {
            let packet = Packet::from_bytes(self.pending.drain(..size).collect::<Vec<u8>>());
            match self.packets.push(&packet) {
                Ok(Decoded::Complete(msg)) => return Ok(Decoded::Complete(msg)),
                Ok(Decoded::Incomplete) => {}
                Err(e) => {
                    self.pending.clear();
                    return Err(e);
                }
            }
        }
        Ok(Decoded::Incomplete)
    }
}

// ── Unchunked form ────────────────────────────────────────────────────────────

/// Serializes `msg` as `[type:2][length:4][payload]` without packet chunking.
///
/// The bridge daemon does its own chunking and expects this form (hex encoded).
///
/// # Errors
///
/// Returns [`ProtocolError::PayloadTooLarge`] if the payload does not fit a `u32` length.
pub fn encode_unchunked(msg: &LogicalMessage) -> Result<Vec<u8>, ProtocolError> {
    let len = msg.payload.len();
    if len > u32::MAX as usize {
        return Err(ProtocolError::PayloadTooLarge {
            len,
            max: u32::MAX as usize,
        });
    }
    let mut buf = Vec::with_capacity(BRIDGE_HEADER_SIZE + len);
    buf.extend_from_slice(&msg.message_type.to_be_bytes());
    buf.extend_from_slice(&(len as u32).to_be_bytes());
    buf.extend_from_slice(&msg.payload);
    Ok(buf)
}

/// Parses the `[type:2][length:4][payload]` form.
///
/// # Errors
///
/// Returns [`ProtocolError::InsufficientData`] when bytes are missing and
/// [`ProtocolError::LengthOverflow`] when bytes follow the declared payload.
pub fn decode_unchunked(bytes: &[u8]) -> Result<LogicalMessage, ProtocolError> {
    if bytes.len() < BRIDGE_HEADER_SIZE {
        return Err(ProtocolError::InsufficientData {
            needed: BRIDGE_HEADER_SIZE,
            available: bytes.len(),
        });
    }
    let message_type = u16::from_be_bytes([bytes[0], bytes[1]]);
    let declared = u32::from_be_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]) as usize;
    let body = &bytes[BRIDGE_HEADER_SIZE..];

    if body.len() < declared {
        return Err(ProtocolError::InsufficientData {
            needed: BRIDGE_HEADER_SIZE + declared,
            available: bytes.len(),
        });
    }
    if body.len() > declared {
        return Err(ProtocolError::LengthOverflow { declared });
    }
    Ok(LogicalMessage::new(message_type, body.to_vec()))
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn validate_config(config: &FrameConfig) -> Result<(), ProtocolError> {
    if config.packet_size <= FIRST_HEADER_SIZE {
        return Err(ProtocolError::InvalidPacketSize(config.packet_size));
    }
    Ok(())
}

fn check_payload_len(len: usize, config: &FrameConfig) -> Result<(), ProtocolError> {
    let max = config.max_payload.min(u32::MAX as usize);
    if len > max {
        return Err(ProtocolError::PayloadTooLarge { len, max });
    }
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────

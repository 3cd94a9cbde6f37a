//! Wire framing: logical messages, packets, and the chunking codec.

pub mod codec;
pub mod messages;

pub use codec::{
    decode, decode_unchunked, encode, encode_unchunked, Decoded, PacketDecoder, ProtocolError,
    StreamDecoder,
};
pub use messages::*;

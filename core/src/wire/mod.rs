//! Wire Protocol — binary packet framing for the BLE mesh
//!
//! This module provides:
//! - Packet: the unit exchanged over the radio (fixed header + optional fields)
//! - Codec: big-endian framing with exact-length validation on decode
//! - Adaptive DEFLATE compression for payloads that look compressible
//! - Fragmentation: splitting oversized packets across several radio writes
//!
//! Layout (big-endian, no padding):
//! [1]  version
//! [1]  type
//! [1]  ttl
//! [8]  timestamp (ms)
//! [1]  flags
//! [2]  payload_length
//! [8]  sender_id
//! [8]  recipient_id   (iff HAS_RECIPIENT)
//! [N]  payload        (iff IS_COMPRESSED: [2] original_size + deflate stream)
//! [64] signature      (iff HAS_SIGNATURE)

pub mod codec;
pub mod compress;
pub mod fragment;
pub mod packet;

pub use codec::{decode, encode};
pub use fragment::{FragmentAssembler, FragmentHeader};
pub use packet::{flags, Packet, PacketType, PeerId};

use thiserror::Error;

/// Current wire protocol version; anything else is rejected
pub const PROTOCOL_VERSION: u8 = 1;

/// version + type + ttl + timestamp + flags + payload_length
pub const HEADER_SIZE: usize = 14;
pub const SENDER_ID_SIZE: usize = 8;
pub const RECIPIENT_ID_SIZE: usize = 8;
pub const SIGNATURE_SIZE: usize = 64;

/// Largest payload the u16 length field can describe
pub const MAX_PAYLOAD: usize = u16::MAX as usize;

/// Wire codec errors. Every variant means "malformed packet": the input is
/// dropped and never relayed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("Buffer too short: need {need} bytes, got {got}")]
    BufferTooShort { need: usize, got: usize },

    #[error("Unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    #[error("Length mismatch: frame declares {declared} bytes, buffer holds {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("Compressed payload missing original size prefix")]
    MissingSizePrefix,

    #[error("Decompression failed: {0}")]
    DecompressionFailed(String),

    #[error("Decompressed size mismatch: expected {expected}, got {actual}")]
    SizeMismatch { expected: usize, actual: usize },

    #[error("Payload too large: {0} bytes (max {MAX})", MAX = MAX_PAYLOAD)]
    PayloadTooLarge(usize),

    #[error("Malformed fragment: {0}")]
    MalformedFragment(&'static str),
}

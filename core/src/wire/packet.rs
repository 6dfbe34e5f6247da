// Packet model — what travels between radios

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::{PROTOCOL_VERSION, SIGNATURE_SIZE};

/// Flag bits carried in the frame header
pub mod flags {
    /// Recipient ID field present
    pub const HAS_RECIPIENT: u8 = 0x01;
    /// Signature field present
    pub const HAS_SIGNATURE: u8 = 0x02;
    /// Payload is `[u16 original_size][deflate stream]`
    pub const IS_COMPRESSED: u8 = 0x04;
}

/// Logical peer identifier: 8 bytes on the wire.
///
/// Not bound to any radio address or key. Longer logical IDs are truncated,
/// shorter ones zero-padded.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerId(pub [u8; 8]);

impl PeerId {
    /// Reserved recipient meaning "every peer"
    pub const BROADCAST: PeerId = PeerId([0xFF; 8]);

    pub fn new(bytes: [u8; 8]) -> Self {
        Self(bytes)
    }

    /// Random peer ID for a fresh node
    pub fn random() -> Self {
        use rand::RngCore;
        let mut bytes = [0u8; 8];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Truncate or zero-pad arbitrary bytes to 8.
    pub fn from_slice_lossy(bytes: &[u8]) -> Self {
        let mut id = [0u8; 8];
        let n = bytes.len().min(8);
        id[..n].copy_from_slice(&bytes[..n]);
        Self(id)
    }

    /// UTF-8 bytes of a logical ID, truncated or zero-padded to 8.
    pub fn from_str_lossy(id: &str) -> Self {
        Self::from_slice_lossy(id.as_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.to_hex())
    }
}

/// Parses the 16-hex-character form produced by `Display`.
impl FromStr for PeerId {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 8];
        hex::decode_to_slice(s, &mut bytes)?;
        Ok(Self(bytes))
    }
}

/// Packet type enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    /// Nickname announcement (0x01)
    Announce = 0x01,
    /// 96-byte public key bundle (0x02)
    KeyExchange = 0x02,
    /// Peer leaving the mesh (0x03)
    Leave = 0x03,
    /// Chat message payload (0x04)
    Message = 0x04,
    FragmentStart = 0x05,
    FragmentContinue = 0x06,
    FragmentEnd = 0x07,
    RoomAnnounce = 0x08,
    RoomRetention = 0x09,
    /// Delivery acknowledgement for a private message (0x0A)
    DeliveryAck = 0x0A,
    DeliveryStatusRequest = 0x0B,
    /// Read receipt for a private message (0x0C)
    ReadReceipt = 0x0C,
}

impl PacketType {
    /// Convert from u8; unknown values yield `None` (they still decode and relay)
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(PacketType::Announce),
            0x02 => Some(PacketType::KeyExchange),
            0x03 => Some(PacketType::Leave),
            0x04 => Some(PacketType::Message),
            0x05 => Some(PacketType::FragmentStart),
            0x06 => Some(PacketType::FragmentContinue),
            0x07 => Some(PacketType::FragmentEnd),
            0x08 => Some(PacketType::RoomAnnounce),
            0x09 => Some(PacketType::RoomRetention),
            0x0A => Some(PacketType::DeliveryAck),
            0x0B => Some(PacketType::DeliveryStatusRequest),
            0x0C => Some(PacketType::ReadReceipt),
            _ => None,
        }
    }

    pub fn as_u8(&self) -> u8 {
        *self as u8
    }

    pub fn is_fragment(&self) -> bool {
        matches!(
            self,
            PacketType::FragmentStart | PacketType::FragmentContinue | PacketType::FragmentEnd
        )
    }
}

/// A decoded wire packet.
///
/// The payload is always held uncompressed; compression is purely an
/// encoding concern. Flags are derived from the optional fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Protocol version (0x01)
    pub version: u8,
    /// Raw packet type (see `PacketType`)
    pub packet_type: u8,
    /// Remaining hop budget
    pub ttl: u8,
    /// Sender clock, ms since epoch. Not validated against ours.
    pub timestamp: u64,
    /// Originating node
    pub sender_id: PeerId,
    /// Addressed peer, or `PeerId::BROADCAST`
    pub recipient_id: Option<PeerId>,
    /// Opaque payload bytes
    pub payload: Vec<u8>,
    /// Ed25519 signature over the payload
    pub signature: Option<[u8; SIGNATURE_SIZE]>,
}

impl Packet {
    /// Build an unaddressed, unsigned packet stamped with the current time
    pub fn new(packet_type: PacketType, ttl: u8, sender_id: PeerId, payload: Vec<u8>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            packet_type: packet_type.as_u8(),
            ttl,
            timestamp: crate::now_millis(),
            sender_id,
            recipient_id: None,
            payload,
            signature: None,
        }
    }

    pub fn with_recipient(mut self, recipient: PeerId) -> Self {
        self.recipient_id = Some(recipient);
        self
    }

    pub fn with_signature(mut self, signature: [u8; SIGNATURE_SIZE]) -> Self {
        self.signature = Some(signature);
        self
    }

    /// Attach a signature of arbitrary length, zero-padded or truncated to 64 bytes
    pub fn with_signature_bytes(mut self, signature: &[u8]) -> Self {
        let mut sig = [0u8; SIGNATURE_SIZE];
        let n = signature.len().min(SIGNATURE_SIZE);
        sig[..n].copy_from_slice(&signature[..n]);
        self.signature = Some(sig);
        self
    }

    pub fn packet_type(&self) -> Option<PacketType> {
        PacketType::from_u8(self.packet_type)
    }

    /// Header flags implied by the optional fields (compression excluded)
    pub fn flags(&self) -> u8 {
        let mut bits = 0u8;
        if self.recipient_id.is_some() {
            bits |= flags::HAS_RECIPIENT;
        }
        if self.signature.is_some() {
            bits |= flags::HAS_SIGNATURE;
        }
        bits
    }

    /// True when the local node at `local_id` should consume this packet
    pub fn is_for(&self, local_id: &PeerId) -> bool {
        match &self.recipient_id {
            None => true,
            Some(r) => r.is_broadcast() || r == local_id,
        }
    }

    /// Copy for the next hop: identical except `ttl - 1`
    pub fn relay_copy(&self) -> Self {
        let mut copy = self.clone();
        copy.ttl = self.ttl.saturating_sub(1);
        copy
    }
}

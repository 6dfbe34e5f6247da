// Fragmentation — splitting encoded packets across several radio writes
//
// A fragment is an ordinary packet whose payload starts with a 13-byte
// header. The data it carries is a slice of the *encoded* original packet,
// so reassembly ends in a normal `decode`.

use std::collections::{BTreeMap, HashMap};

use tracing::debug;

use super::codec;
use super::packet::{Packet, PacketType, PeerId};
use super::{WireError, HEADER_SIZE, MAX_PAYLOAD, RECIPIENT_ID_SIZE, SENDER_ID_SIZE, SIGNATURE_SIZE};

/// Largest encoded packet a reassembly may produce
const MAX_REASSEMBLED: usize =
    HEADER_SIZE + SENDER_ID_SIZE + RECIPIENT_ID_SIZE + MAX_PAYLOAD + SIGNATURE_SIZE;

/// Concurrent incomplete assemblies kept before the oldest is evicted
const MAX_ASSEMBLIES: usize = 128;

/// Header at the front of every fragment payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentHeader {
    pub fragment_id: [u8; 8],
    pub index: u16,
    pub total: u16,
    pub original_type: u8,
}

impl FragmentHeader {
    /// fragment_id(8) + index(2) + total(2) + original_type(1)
    pub const SIZE: usize = 13;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[..8].copy_from_slice(&self.fragment_id);
        out[8..10].copy_from_slice(&self.index.to_be_bytes());
        out[10..12].copy_from_slice(&self.total.to_be_bytes());
        out[12] = self.original_type;
        out
    }

    /// Split a fragment payload into its header and data slice
    pub fn parse(payload: &[u8]) -> Result<(Self, &[u8]), WireError> {
        if payload.len() < Self::SIZE {
            return Err(WireError::MalformedFragment("header truncated"));
        }
        let mut fragment_id = [0u8; 8];
        fragment_id.copy_from_slice(&payload[..8]);
        let header = Self {
            fragment_id,
            index: u16::from_be_bytes([payload[8], payload[9]]),
            total: u16::from_be_bytes([payload[10], payload[11]]),
            original_type: payload[12],
        };
        if header.total == 0 {
            return Err(WireError::MalformedFragment("zero total"));
        }
        if header.index >= header.total {
            return Err(WireError::MalformedFragment("index out of range"));
        }
        Ok((header, &payload[Self::SIZE..]))
    }
}

/// Split `packet` into fragment packets carrying at most `fragment_size`
/// bytes of its encoding each. Every fragment keeps the original ttl,
/// timestamp, sender and recipient.
pub fn split(packet: &Packet, fragment_size: usize) -> Result<Vec<Packet>, WireError> {
    if fragment_size == 0 {
        return Err(WireError::MalformedFragment("zero fragment size"));
    }

    let encoded = codec::encode(packet)?;
    let chunks: Vec<&[u8]> = encoded.chunks(fragment_size).collect();
    let total = u16::try_from(chunks.len()).map_err(|_| WireError::PayloadTooLarge(encoded.len()))?;

    let mut fragment_id = [0u8; 8];
    {
        use rand::RngCore;
        rand::thread_rng().fill_bytes(&mut fragment_id);
    }

    let last = chunks.len() - 1;
    let fragments = chunks
        .into_iter()
        .enumerate()
        .map(|(i, chunk)| {
            let kind = match i {
                0 => PacketType::FragmentStart,
                i if i == last => PacketType::FragmentEnd,
                _ => PacketType::FragmentContinue,
            };
            let header = FragmentHeader {
                fragment_id,
                index: i as u16,
                total,
                original_type: packet.packet_type,
            };
            let mut payload = Vec::with_capacity(FragmentHeader::SIZE + chunk.len());
            payload.extend_from_slice(&header.to_bytes());
            payload.extend_from_slice(chunk);

            Packet {
                version: packet.version,
                packet_type: kind.as_u8(),
                ttl: packet.ttl,
                timestamp: packet.timestamp,
                sender_id: packet.sender_id,
                recipient_id: packet.recipient_id,
                payload,
                signature: None,
            }
        })
        .collect();

    Ok(fragments)
}

struct Assembly {
    original_type: u8,
    total: u16,
    pieces: BTreeMap<u16, Vec<u8>>,
    bytes: usize,
    started_at: u64,
}

/// Collects fragments per (sender, fragment_id) until complete
#[derive(Default)]
pub struct FragmentAssembler {
    assemblies: HashMap<(PeerId, [u8; 8]), Assembly>,
}

impl FragmentAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one fragment packet. Returns the reassembled packet once the
    /// last missing piece arrives.
    pub fn accept(&mut self, fragment: &Packet, now: u64) -> Result<Option<Packet>, WireError> {
        let (header, data) = FragmentHeader::parse(&fragment.payload)?;
        let key = (fragment.sender_id, header.fragment_id);

        if !self.assemblies.contains_key(&key) && self.assemblies.len() >= MAX_ASSEMBLIES {
            self.evict_oldest();
        }

        let assembly = self.assemblies.entry(key).or_insert_with(|| Assembly {
            original_type: header.original_type,
            total: header.total,
            pieces: BTreeMap::new(),
            bytes: 0,
            started_at: now,
        });

        if assembly.total != header.total || assembly.original_type != header.original_type {
            self.assemblies.remove(&key);
            return Err(WireError::MalformedFragment("inconsistent header"));
        }

        if !assembly.pieces.contains_key(&header.index) {
            assembly.bytes += data.len();
            if assembly.bytes > MAX_REASSEMBLED {
                self.assemblies.remove(&key);
                return Err(WireError::MalformedFragment("reassembly too large"));
            }
            assembly.pieces.insert(header.index, data.to_vec());
        }

        if assembly.pieces.len() < assembly.total as usize {
            return Ok(None);
        }

        let Some(assembly) = self.assemblies.remove(&key) else {
            return Ok(None);
        };
        let mut encoded = Vec::with_capacity(assembly.bytes);
        for piece in assembly.pieces.into_values() {
            encoded.extend_from_slice(&piece);
        }

        debug!(
            "Reassembled {} fragments from {} ({} bytes)",
            assembly.total,
            fragment.sender_id,
            encoded.len()
        );
        codec::decode(&encoded).map(Some)
    }

    /// Drop assemblies started more than `timeout_ms` before `now`.
    /// Returns how many were purged.
    pub fn purge_expired(&mut self, now: u64, timeout_ms: u64) -> usize {
        let before = self.assemblies.len();
        self.assemblies
            .retain(|_, a| now.saturating_sub(a.started_at) <= timeout_ms);
        before - self.assemblies.len()
    }

    pub fn pending(&self) -> usize {
        self.assemblies.len()
    }

    fn evict_oldest(&mut self) {
        if let Some(key) = self
            .assemblies
            .iter()
            .min_by_key(|(_, a)| a.started_at)
            .map(|(k, _)| *k)
        {
            self.assemblies.remove(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn large_packet(len: usize) -> Packet {
        // Distinct bytes keep the payload from compressing below the threshold
        let payload: Vec<u8> = (0..len).map(|i| (i * 7 % 251) as u8).collect();
        Packet::new(PacketType::Message, 5, PeerId::from_str_lossy("origin"), payload)
            .with_recipient(PeerId::BROADCAST)
            .with_signature([3u8; 64])
    }

    #[test]
    fn test_header_roundtrip() {
        let header = FragmentHeader {
            fragment_id: *b"frag-id!",
            index: 2,
            total: 5,
            original_type: 0x04,
        };
        let mut payload = header.to_bytes().to_vec();
        payload.extend_from_slice(b"data");
        let (parsed, data) = FragmentHeader::parse(&payload).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(data, b"data");
    }

    #[test]
    fn test_header_rejects_bad_index() {
        let header = FragmentHeader {
            fragment_id: [0; 8],
            index: 3,
            total: 3,
            original_type: 0x04,
        };
        assert!(FragmentHeader::parse(&header.to_bytes()).is_err());
        assert!(FragmentHeader::parse(&[0u8; 5]).is_err());
    }

    #[test]
    fn test_split_marks_start_continue_end() {
        let packet = large_packet(1200);
        let fragments = split(&packet, 469).unwrap();
        assert_eq!(fragments.len(), 3);
        assert_eq!(fragments[0].packet_type(), Some(PacketType::FragmentStart));
        assert_eq!(fragments[1].packet_type(), Some(PacketType::FragmentContinue));
        assert_eq!(fragments[2].packet_type(), Some(PacketType::FragmentEnd));
        for f in &fragments {
            assert_eq!(f.ttl, packet.ttl);
            assert_eq!(f.sender_id, packet.sender_id);
            assert_eq!(f.recipient_id, packet.recipient_id);
        }
    }

    #[test]
    fn test_reassembly_out_of_order() {
        let packet = large_packet(1500);
        let mut fragments = split(&packet, 400).unwrap();
        fragments.reverse();

        let mut assembler = FragmentAssembler::new();
        let mut result = None;
        for f in &fragments {
            result = assembler.accept(f, 1_000).unwrap();
        }
        assert_eq!(result, Some(packet));
        assert_eq!(assembler.pending(), 0);
    }

    #[test]
    fn test_duplicate_fragment_ignored() {
        let packet = large_packet(800);
        let fragments = split(&packet, 469).unwrap();
        assert_eq!(fragments.len(), 2);
        let mut assembler = FragmentAssembler::new();

        assert!(assembler.accept(&fragments[0], 0).unwrap().is_none());
        assert!(assembler.accept(&fragments[0], 0).unwrap().is_none());
        let done = assembler.accept(&fragments[1], 0).unwrap();
        assert_eq!(done.unwrap().payload, packet.payload);
    }

    #[test]
    fn test_purge_expired() {
        let fragments = split(&large_packet(900), 469).unwrap();
        let mut assembler = FragmentAssembler::new();
        assembler.accept(&fragments[0], 1_000).unwrap();

        assert_eq!(assembler.purge_expired(20_000, 30_000), 0);
        assert_eq!(assembler.purge_expired(31_001, 30_000), 1);
        assert_eq!(assembler.pending(), 0);
    }

    #[test]
    fn test_inconsistent_total_rejected() {
        let fragments = split(&large_packet(900), 469).unwrap();
        let mut assembler = FragmentAssembler::new();
        assembler.accept(&fragments[0], 0).unwrap();

        let mut forged = fragments[1].clone();
        forged.payload[10..12].copy_from_slice(&9u16.to_be_bytes());
        assert!(assembler.accept(&forged, 0).is_err());
        assert_eq!(assembler.pending(), 0);
    }
}

// Relay engine — decide, per inbound frame, whether to deliver and/or forward
//
// Deliver and forward are independent: a broadcast is both delivered here
// and passed on. Only ttl gates forwarding.

use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, HashSet, VecDeque};
use tracing::{debug, warn};

use crate::wire::{self, Packet, PeerId, WireError};

/// Outcome of processing an inbound frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayDecision {
    /// Packet is well-formed and new
    Accept {
        packet: Packet,
        /// Addressed to us, to broadcast, or unaddressed
        deliver: bool,
        /// Re-encoded copy with ttl - 1, if it should travel further
        forward: Option<Forward>,
    },
    /// Packet is dropped; never delivered, never forwarded
    Drop(DropReason),
}

/// An encoded relay copy and the neighbours it goes to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Forward {
    pub data: Vec<u8>,
    pub targets: Vec<PeerId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    /// Failed to decode
    Malformed(WireError),
    /// Already seen via another path
    Duplicate,
    /// Our own packet echoed back
    OwnPacket,
}

/// Bounded FIFO set of packet digests
struct SeenCache {
    ids: HashSet<[u8; 32]>,
    order: VecDeque<[u8; 32]>,
    capacity: usize,
}

impl SeenCache {
    fn new(capacity: usize) -> Self {
        Self {
            ids: HashSet::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Record `digest`; false if it was already present
    fn insert(&mut self, digest: [u8; 32]) -> bool {
        if !self.ids.insert(digest) {
            return false;
        }
        self.order.push_back(digest);
        while self.ids.len() > self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.ids.remove(&old);
            }
        }
        true
    }

    fn len(&self) -> usize {
        self.ids.len()
    }
}

/// Stable identity of a packet across hops. TTL changes per hop and the
/// signature is optional, so neither is hashed.
pub fn packet_digest(packet: &Packet) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&[packet.packet_type]);
    hasher.update(packet.sender_id.as_bytes());
    match &packet.recipient_id {
        Some(r) => {
            hasher.update(&[1]);
            hasher.update(r.as_bytes());
        }
        None => {
            hasher.update(&[0]);
        }
    }
    hasher.update(&packet.timestamp.to_be_bytes());
    hasher.update(&packet.payload);
    *hasher.finalize().as_bytes()
}

/// Relay decisions plus the connected-peer set they depend on
pub struct RelayEngine {
    local_id: PeerId,
    neighbours: RwLock<BTreeSet<PeerId>>,
    seen: Mutex<SeenCache>,
}

impl RelayEngine {
    pub fn new(local_id: PeerId, seen_capacity: usize) -> Self {
        Self {
            local_id,
            neighbours: RwLock::new(BTreeSet::new()),
            seen: Mutex::new(SeenCache::new(seen_capacity)),
        }
    }

    pub fn local_id(&self) -> PeerId {
        self.local_id
    }

    /// Returns true if the peer was not already connected
    pub fn add_peer(&self, peer: PeerId) -> bool {
        self.neighbours.write().insert(peer)
    }

    /// Returns true if the peer was connected
    pub fn remove_peer(&self, peer: &PeerId) -> bool {
        self.neighbours.write().remove(peer)
    }

    pub fn replace_peers(&self, peers: BTreeSet<PeerId>) {
        *self.neighbours.write() = peers;
    }

    pub fn is_connected(&self, peer: &PeerId) -> bool {
        self.neighbours.read().contains(peer)
    }

    /// Immutable snapshot of the connected set
    pub fn peers(&self) -> BTreeSet<PeerId> {
        self.neighbours.read().clone()
    }

    /// Record a packet as seen. False if it had been seen before.
    pub fn mark_seen(&self, packet: &Packet) -> bool {
        self.seen.lock().insert(packet_digest(packet))
    }

    pub fn seen_count(&self) -> usize {
        self.seen.lock().len()
    }

    /// Run the inbound pipeline on raw bytes that arrived from `from`.
    pub fn process_inbound(&self, data: &[u8], from: Option<PeerId>) -> RelayDecision {
        let packet = match wire::decode(data) {
            Ok(p) => p,
            Err(e) => {
                warn!("Dropping malformed packet ({} bytes): {}", data.len(), e);
                return RelayDecision::Drop(DropReason::Malformed(e));
            }
        };

        if packet.sender_id == self.local_id {
            debug!("Dropping own packet echoed back");
            return RelayDecision::Drop(DropReason::OwnPacket);
        }

        if !self.mark_seen(&packet) {
            debug!("Dropping duplicate packet from {}", packet.sender_id);
            return RelayDecision::Drop(DropReason::Duplicate);
        }

        let deliver = packet.is_for(&self.local_id);
        let forward = self.forward_copy(&packet, from);

        debug!(
            "Accepted type=0x{:02x} from {} ttl={} deliver={} forward_to={}",
            packet.packet_type,
            packet.sender_id,
            packet.ttl,
            deliver,
            forward.as_ref().map_or(0, |f| f.targets.len())
        );

        RelayDecision::Accept {
            packet,
            deliver,
            forward,
        }
    }

    /// Relay copy for every neighbour except the one it came from (and the
    /// originator, should it be a neighbour). None once ttl is spent.
    fn forward_copy(&self, packet: &Packet, from: Option<PeerId>) -> Option<Forward> {
        if packet.ttl <= 1 {
            return None;
        }

        let targets: Vec<PeerId> = self
            .neighbours
            .read()
            .iter()
            .filter(|p| Some(**p) != from && **p != packet.sender_id)
            .copied()
            .collect();
        if targets.is_empty() {
            return None;
        }

        match wire::encode(&packet.relay_copy()) {
            Ok(data) => Some(Forward { data, targets }),
            Err(e) => {
                warn!("Failed to re-encode relay copy: {}", e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::PacketType;

    fn id(s: &str) -> PeerId {
        PeerId::from_str_lossy(s)
    }

    fn engine_with(peers: &[&str]) -> RelayEngine {
        let engine = RelayEngine::new(id("local"), 100);
        for p in peers {
            engine.add_peer(id(p));
        }
        engine
    }

    fn frame(ttl: u8, sender: &str, recipient: Option<PeerId>) -> Vec<u8> {
        let mut packet = Packet::new(PacketType::Message, ttl, id(sender), b"hello".to_vec());
        packet.recipient_id = recipient;
        wire::encode(&packet).unwrap()
    }

    #[test]
    fn test_malformed_never_relayed() {
        let engine = engine_with(&["a", "b"]);
        let decision = engine.process_inbound(&[1, 2, 3], Some(id("a")));
        assert!(matches!(
            decision,
            RelayDecision::Drop(DropReason::Malformed(WireError::BufferTooShort { .. }))
        ));
    }

    #[test]
    fn test_ttl_one_delivered_not_forwarded() {
        let engine = engine_with(&["a", "b"]);
        match engine.process_inbound(&frame(1, "origin", None), Some(id("a"))) {
            RelayDecision::Accept { deliver, forward, .. } => {
                assert!(deliver);
                assert!(forward.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_forward_decrements_and_excludes_arrival_peer() {
        let engine = engine_with(&["a", "b", "c"]);
        match engine.process_inbound(&frame(5, "origin", Some(PeerId::BROADCAST)), Some(id("a"))) {
            RelayDecision::Accept { deliver, forward, .. } => {
                assert!(deliver);
                let forward = forward.unwrap();
                assert_eq!(forward.targets, vec![id("b"), id("c")]);
                assert_eq!(wire::decode(&forward.data).unwrap().ttl, 4);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_unicast_for_other_forwarded_not_delivered() {
        let engine = engine_with(&["a", "b"]);
        match engine.process_inbound(&frame(3, "origin", Some(id("far"))), Some(id("a"))) {
            RelayDecision::Accept { deliver, forward, .. } => {
                assert!(!deliver);
                assert_eq!(forward.unwrap().targets, vec![id("b")]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_unicast_for_us_still_forwarded_when_ttl_allows() {
        let engine = engine_with(&["a", "b"]);
        match engine.process_inbound(&frame(3, "origin", Some(id("local"))), Some(id("a"))) {
            RelayDecision::Accept { deliver, forward, .. } => {
                assert!(deliver);
                assert!(forward.is_some());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_duplicate_dropped_even_with_lower_ttl() {
        let engine = engine_with(&["a", "b"]);
        let original = Packet::new(PacketType::Message, 5, id("origin"), b"x".to_vec());
        let first = wire::encode(&original).unwrap();
        let relayed = wire::encode(&original.relay_copy()).unwrap();

        assert!(matches!(engine.process_inbound(&first, Some(id("a"))), RelayDecision::Accept { .. }));
        assert_eq!(
            engine.process_inbound(&relayed, Some(id("b"))),
            RelayDecision::Drop(DropReason::Duplicate)
        );
    }

    #[test]
    fn test_own_packet_dropped() {
        let engine = engine_with(&["a"]);
        assert_eq!(
            engine.process_inbound(&frame(5, "local", None), Some(id("a"))),
            RelayDecision::Drop(DropReason::OwnPacket)
        );
    }

    #[test]
    fn test_originator_not_targeted() {
        let engine = engine_with(&["origin", "b"]);
        match engine.process_inbound(&frame(4, "origin", None), None) {
            RelayDecision::Accept { forward, .. } => {
                assert_eq!(forward.unwrap().targets, vec![id("b")]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_no_other_neighbours_means_no_forward() {
        let engine = engine_with(&["a"]);
        match engine.process_inbound(&frame(7, "origin", None), Some(id("a"))) {
            RelayDecision::Accept { forward, .. } => assert!(forward.is_none()),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_seen_cache_is_bounded_fifo() {
        let mut cache = SeenCache::new(2);
        assert!(cache.insert([1; 32]));
        assert!(cache.insert([2; 32]));
        assert!(!cache.insert([1; 32]));
        assert!(cache.insert([3; 32]));
        assert_eq!(cache.len(), 2);
        // [1] was evicted first
        assert!(cache.insert([1; 32]));
    }

    #[test]
    fn test_peer_set_management() {
        let engine = engine_with(&[]);
        assert!(engine.add_peer(id("a")));
        assert!(!engine.add_peer(id("a")));
        assert!(engine.is_connected(&id("a")));
        assert!(engine.remove_peer(&id("a")));
        assert!(!engine.remove_peer(&id("a")));

        engine.replace_peers([id("x"), id("y")].into_iter().collect());
        assert_eq!(engine.peers().len(), 2);
    }
}

// Mesh service — one node: codec, crypto, relay and retry behind one facade
//
// The service owns every piece of per-node state. Transports push events in
// through `handle_transport_event`; the host drives the retry queue with
// `run_retry_tick` or `spawn_retry_loop`. No lock is held across a transport
// send or a sink callback.

use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use crate::config::MeshConfig;
use crate::crypto::{LocalKeys, PeerEncryptionStore, RoomKey};
use crate::message::{self, DeliveryAck, DeliveryStatus, Message, ReadReceipt};
use crate::relay::{DropReason, RelayDecision, RelayEngine};
use crate::store::{RetryQueue, RetryRequest, RetrySender, RetryableMessage, TickReport};
use crate::transport::{DeliverySink, Transport, TransportEvent};
use crate::wire::{self, FragmentAssembler, Packet, PacketType, PeerId};
use crate::{MeshError, SystemTimeSource, TimeSource};

/// What happened locally to a delivered packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalOutcome {
    /// Handed to the sink
    MessageDelivered { message_id: String },
    /// Key bundle stored; `new` when we had no key for this peer before
    PeerKeyed { peer: PeerId, new: bool },
    PeerAnnounced { peer: PeerId, nickname: String },
    PeerLeft { peer: PeerId },
    /// An ack or read receipt advanced one of our messages
    StatusUpdated { message_id: String, status: DeliveryStatus },
    /// Fragment stored, packet not complete yet
    FragmentBuffered,
    /// Well-formed packet we could not make sense of (bad signature,
    /// undecryptable, malformed payload)
    Undeliverable(String),
    /// Nothing to do here
    Ignored,
}

/// Result of feeding one inbound frame to the service
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InboundReport {
    /// Set when the relay engine dropped the frame
    pub dropped: Option<DropReason>,
    /// Set when the packet was for this node
    pub local: Option<LocalOutcome>,
    /// Neighbours the relay copy was handed to
    pub forwarded_to: usize,
}

/// Position of a status in the delivery lifecycle. Updates never move
/// backwards; `Failed` only replaces a status that has not reached a peer.
fn status_rank(status: &DeliveryStatus) -> u8 {
    match status {
        DeliveryStatus::Sending => 0,
        DeliveryStatus::Sent => 1,
        DeliveryStatus::PartiallyDelivered { .. } => 2,
        DeliveryStatus::Delivered { .. } => 3,
        DeliveryStatus::Read { .. } => 4,
        DeliveryStatus::Failed { .. } => 5,
    }
}

fn supersedes(new: &DeliveryStatus, current: &DeliveryStatus) -> bool {
    match new {
        DeliveryStatus::Failed { .. } => status_rank(current) <= 1,
        _ => {
            !matches!(current, DeliveryStatus::Failed { .. })
                && status_rank(new) > status_rank(current)
        }
    }
}

/// Delivery statuses of our own messages, oldest evicted first
struct StatusCache {
    statuses: HashMap<String, DeliveryStatus>,
    order: VecDeque<String>,
    capacity: usize,
}

impl StatusCache {
    fn new(capacity: usize) -> Self {
        Self {
            statuses: HashMap::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    fn get(&self, message_id: &str) -> Option<&DeliveryStatus> {
        self.statuses.get(message_id)
    }

    fn contains(&self, message_id: &str) -> bool {
        self.statuses.contains_key(message_id)
    }

    /// Start tracking a new message
    fn track(&mut self, message_id: &str, status: DeliveryStatus) {
        if self
            .statuses
            .insert(message_id.to_string(), status)
            .is_none()
        {
            self.order.push_back(message_id.to_string());
        }
        while self.statuses.len() > self.capacity {
            match self.order.pop_front() {
                Some(old) => {
                    self.statuses.remove(&old);
                }
                None => break,
            }
        }
    }

    /// Replace the status of a tracked message; untracked ids are ignored
    fn update(&mut self, message_id: &str, status: DeliveryStatus) {
        if let Some(current) = self.statuses.get_mut(message_id) {
            *current = status;
        }
    }

    fn len(&self) -> usize {
        self.statuses.len()
    }
}

pub struct MeshService {
    nickname: String,
    local_id: PeerId,
    config: MeshConfig,
    crypto: PeerEncryptionStore,
    relay: RelayEngine,
    retry: RetryQueue,
    fragments: Mutex<FragmentAssembler>,
    transport: Arc<dyn Transport>,
    sink: Arc<dyn DeliverySink>,
    /// Last nickname announced by each peer
    nicknames: RwLock<HashMap<PeerId, String>>,
    /// Announced peers and when we last heard anything from them
    announced: RwLock<HashMap<PeerId, u64>>,
    rooms: RwLock<HashMap<String, RoomKey>>,
    /// Status of messages this node originated and still tracks
    outgoing: Mutex<StatusCache>,
    running: AtomicBool,
    last_announce: AtomicU64,
    time: Arc<dyn TimeSource>,
}

impl MeshService {
    pub fn new(
        nickname: impl Into<String>,
        local_id: PeerId,
        keys: LocalKeys,
        config: MeshConfig,
        transport: Arc<dyn Transport>,
        sink: Arc<dyn DeliverySink>,
    ) -> Self {
        let relay = RelayEngine::new(local_id, config.seen_cache_capacity);
        let retry = RetryQueue::new(&config);
        let outgoing = StatusCache::new(config.status_cache_capacity);
        Self {
            nickname: nickname.into(),
            local_id,
            config,
            crypto: PeerEncryptionStore::new(keys),
            relay,
            retry,
            fragments: Mutex::new(FragmentAssembler::new()),
            transport,
            sink,
            nicknames: RwLock::new(HashMap::new()),
            announced: RwLock::new(HashMap::new()),
            rooms: RwLock::new(HashMap::new()),
            outgoing: Mutex::new(outgoing),
            running: AtomicBool::new(false),
            last_announce: AtomicU64::new(0),
            time: Arc::new(SystemTimeSource),
        }
    }

    /// Replace the clock used for retry scheduling and fragment expiry
    pub fn with_time_source(mut self, time: Arc<dyn TimeSource>) -> Self {
        self.time = time;
        self
    }

    pub fn nickname(&self) -> &str {
        &self.nickname
    }

    pub fn local_id(&self) -> PeerId {
        self.local_id
    }

    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    pub fn crypto(&self) -> &PeerEncryptionStore {
        &self.crypto
    }

    pub fn relay(&self) -> &RelayEngine {
        &self.relay
    }

    pub fn retry_queue(&self) -> &RetryQueue {
        &self.retry
    }

    pub fn now_millis(&self) -> u64 {
        self.time.now_millis()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn peer_nickname(&self, peer: &PeerId) -> Option<String> {
        self.nicknames.read().get(peer).cloned()
    }

    /// Peers that announced themselves, with their nicknames
    pub fn known_peers(&self) -> Vec<(PeerId, String)> {
        let mut peers: Vec<_> = self
            .nicknames
            .read()
            .iter()
            .map(|(id, nick)| (*id, nick.clone()))
            .collect();
        peers.sort();
        peers
    }

    /// Direct neighbours plus peers heard over the mesh within
    /// `peer_timeout_ms`
    pub fn connected_snapshot(&self) -> BTreeSet<PeerId> {
        self.reachable_at(self.time.now_millis())
    }

    fn reachable_at(&self, now: u64) -> BTreeSet<PeerId> {
        let timeout = self.config.peer_timeout_ms;
        let mut connected = self.relay.peers();
        connected.extend(
            self.announced
                .read()
                .iter()
                .filter(|(_, heard)| now.saturating_sub(**heard) <= timeout)
                .map(|(peer, _)| *peer),
        );
        connected
    }

    pub fn delivery_status(&self, message_id: &str) -> Option<DeliveryStatus> {
        self.outgoing.lock().get(message_id).cloned()
    }

    /// Number of our own messages whose status is still tracked
    pub fn tracked_messages(&self) -> usize {
        self.outgoing.lock().len()
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Go online: pick up current neighbours and broadcast our key bundle
    /// and nickname.
    pub fn start(&self) -> Result<(), MeshError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!(
            "Mesh service started as {} ({}), key {}",
            self.nickname,
            self.local_id,
            self.crypto.local_bundle().fingerprint()
        );
        for peer in self.transport.connected_peers() {
            self.relay.add_peer(peer);
        }
        let greeted = self
            .transmit(self.key_exchange_packet(), None)
            .and_then(|()| self.transmit(self.announce_packet(), None));
        if let Err(e) = greeted {
            self.running.store(false, Ordering::SeqCst);
            warn!("Mesh service failed to start: {}", e);
            return Err(e);
        }
        self.last_announce
            .store(self.time.now_millis(), Ordering::SeqCst);
        Ok(())
    }

    /// Say goodbye and stop handling traffic. Queued retries are kept.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let leave = self.originate(PacketType::Leave, self.nickname.as_bytes().to_vec());
        if let Err(e) = self.transmit(leave, None) {
            warn!("Failed to broadcast leave: {}", e);
        }
        info!("Mesh service stopped");
    }

    // ------------------------------------------------------------------
    // Transport events
    // ------------------------------------------------------------------

    pub fn handle_transport_event(&self, event: TransportEvent) {
        trace!("{}: {}", self.local_id, event);
        match event {
            TransportEvent::PeerConnected(peer) => self.peer_connected(peer),
            TransportEvent::PeerDisconnected(peer) => self.peer_disconnected(peer),
            TransportEvent::DataReceived { from, data } => {
                self.on_receive(&data, Some(from));
            }
        }
    }

    /// A neighbour came into range. It gets our key bundle and nickname
    /// directly so it can talk to us without waiting for a rebroadcast.
    pub fn peer_connected(&self, peer: PeerId) {
        if !self.relay.add_peer(peer) {
            return;
        }
        info!("Peer connected: {}", peer);
        if !self.is_running() {
            return;
        }
        for packet in [self.key_exchange_packet(), self.announce_packet()] {
            if let Err(e) = self.transmit(packet, Some(peer)) {
                warn!("Failed to greet {}: {}", peer, e);
            }
        }
    }

    pub fn peer_disconnected(&self, peer: PeerId) {
        if !self.relay.remove_peer(&peer) {
            return;
        }
        info!("Peer disconnected: {}", peer);
        let was_announced = self.announced.write().remove(&peer).is_some();
        if was_announced {
            self.nicknames.write().remove(&peer);
            self.sink.on_peer_left(peer);
        }
    }

    /// Process one inbound frame: dedupe, relay onwards, and handle locally
    /// if it is for us.
    pub fn on_receive(&self, data: &[u8], from: Option<PeerId>) -> InboundReport {
        if !self.is_running() {
            debug!("Ignoring {} bytes while stopped", data.len());
            return InboundReport::default();
        }

        match self.relay.process_inbound(data, from) {
            RelayDecision::Drop(reason) => InboundReport {
                dropped: Some(reason),
                ..Default::default()
            },
            RelayDecision::Accept {
                packet,
                deliver,
                forward,
            } => {
                let mut report = InboundReport::default();
                self.heard_from(packet.sender_id);
                if let Some(forward) = forward {
                    for target in &forward.targets {
                        match self.transport.send(&forward.data, Some(*target)) {
                            Ok(()) => report.forwarded_to += 1,
                            Err(e) => debug!("Relay to {} failed: {}", target, e),
                        }
                    }
                }
                if deliver {
                    report.local = Some(self.handle_local(packet));
                }
                report
            }
        }
    }

    /// Refresh the last-heard time of an announced peer
    fn heard_from(&self, peer: PeerId) {
        let now = self.time.now_millis();
        if let Some(heard) = self.announced.write().get_mut(&peer) {
            *heard = now;
        }
    }

    fn handle_local(&self, packet: Packet) -> LocalOutcome {
        let sender = packet.sender_id;
        match packet.packet_type() {
            Some(PacketType::Message) => self.handle_message(packet),
            Some(PacketType::KeyExchange) => self.handle_key_exchange(sender, &packet.payload),
            Some(PacketType::Announce) => self.handle_announce(sender, &packet.payload),
            Some(PacketType::Leave) => self.handle_leave(sender),
            Some(PacketType::DeliveryAck) => self.handle_delivery_ack(&packet),
            Some(PacketType::ReadReceipt) => self.handle_read_receipt(&packet),
            Some(kind) if kind.is_fragment() => self.handle_fragment(packet),
            other => {
                debug!(
                    "No local handling for packet type 0x{:02x} ({:?}) from {}",
                    packet.packet_type, other, sender
                );
                LocalOutcome::Ignored
            }
        }
    }

    fn handle_key_exchange(&self, sender: PeerId, payload: &[u8]) -> LocalOutcome {
        match self.crypto.add_peer_bundle_bytes(sender, payload) {
            Ok(new) => {
                if new {
                    info!("Established session with {}", sender);
                    // Answer so the peer can derive the same key
                    for packet in [self.key_exchange_packet(), self.announce_packet()] {
                        if let Err(e) = self.transmit(packet, None) {
                            warn!("Failed to answer key exchange from {}: {}", sender, e);
                        }
                    }
                }
                LocalOutcome::PeerKeyed { peer: sender, new }
            }
            Err(e) => {
                warn!("Rejected key bundle from {}: {}", sender, e);
                LocalOutcome::Undeliverable(e.to_string())
            }
        }
    }

    fn handle_announce(&self, sender: PeerId, payload: &[u8]) -> LocalOutcome {
        let nickname = String::from_utf8_lossy(payload).into_owned();
        self.nicknames.write().insert(sender, nickname.clone());
        let now = self.time.now_millis();
        let joined = self.announced.write().insert(sender, now).is_none();
        if joined {
            debug!("{} is {}", sender, nickname);
            self.sink.on_peer_joined(sender, &nickname);
        }
        LocalOutcome::PeerAnnounced {
            peer: sender,
            nickname,
        }
    }

    /// Neighbour membership stays with the transport's connect and
    /// disconnect events; a peer that left may come straight back.
    fn handle_leave(&self, sender: PeerId) -> LocalOutcome {
        self.nicknames.write().remove(&sender);
        self.announced.write().remove(&sender);
        self.sink.on_peer_left(sender);
        LocalOutcome::PeerLeft { peer: sender }
    }

    fn handle_fragment(&self, packet: Packet) -> LocalOutcome {
        let now = self.time.now_millis();
        let result = {
            let mut fragments = self.fragments.lock();
            fragments.purge_expired(now, self.config.fragment_timeout_ms);
            fragments.accept(&packet, now)
        };

        match result {
            Ok(None) => LocalOutcome::FragmentBuffered,
            Ok(Some(full)) => {
                if full.packet_type().map_or(false, |kind| kind.is_fragment()) {
                    warn!("Reassembled packet from {} is itself a fragment", full.sender_id);
                    return LocalOutcome::Undeliverable("nested fragment".into());
                }
                if full.sender_id == self.local_id
                    || !full.is_for(&self.local_id)
                    || !self.relay.mark_seen(&full)
                {
                    return LocalOutcome::Ignored;
                }
                debug!("Reassembled {} byte payload from {}", full.payload.len(), full.sender_id);
                self.handle_local(full)
            }
            Err(e) => {
                debug!("Bad fragment from {}: {}", packet.sender_id, e);
                LocalOutcome::Undeliverable(e.to_string())
            }
        }
    }

    fn handle_message(&self, packet: Packet) -> LocalOutcome {
        let sender = packet.sender_id;

        if let Some(signature) = &packet.signature {
            match self.crypto.verify(&sender, signature, &packet.payload) {
                Ok(true) => {}
                Ok(false) => {
                    warn!("Invalid signature on message from {}", sender);
                    return LocalOutcome::Undeliverable("invalid signature".into());
                }
                Err(_) => trace!("No verifying key for {}, accepting unverified", sender),
            }
        }

        let mut msg = match message::decode_payload(&packet.payload) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("Malformed message payload from {}: {}", sender, e);
                return LocalOutcome::Undeliverable(e.to_string());
            }
        };

        if msg.is_private {
            if packet.recipient_id != Some(self.local_id) {
                return LocalOutcome::Ignored;
            }
            if msg.is_encrypted {
                let ciphertext = msg.encrypted_content.take().unwrap_or_default();
                let plaintext = match self.crypto.decrypt(&sender, &ciphertext) {
                    Ok(plaintext) => plaintext,
                    Err(e) => {
                        warn!("Cannot decrypt private message from {}: {}", sender, e);
                        return LocalOutcome::Undeliverable(e.to_string());
                    }
                };
                match String::from_utf8(plaintext) {
                    Ok(text) => {
                        msg.content = text;
                        msg.is_encrypted = false;
                    }
                    Err(_) => {
                        return LocalOutcome::Undeliverable("decrypted content is not UTF-8".into())
                    }
                }
            }
            if let Err(e) = self.send_delivery_ack(&msg, &packet) {
                warn!("Failed to ack {}: {}", msg.id, e);
            }
        } else if msg.is_encrypted {
            self.open_room_message(&mut msg);
        }

        let message_id = msg.id.clone();
        self.sink.on_message(msg, sender);
        LocalOutcome::MessageDelivered { message_id }
    }

    /// Decrypt in place when we hold the room key; otherwise leave the
    /// message encrypted for the host to deal with.
    fn open_room_message(&self, msg: &mut Message) {
        let Some(room) = msg.room.clone() else {
            return;
        };
        let Some(key) = self.rooms.read().get(&room).cloned() else {
            trace!("No key for room {}", room);
            return;
        };
        let opened = msg
            .encrypted_content
            .as_deref()
            .and_then(|ciphertext| key.decrypt(ciphertext).ok());
        match opened.and_then(|p| String::from_utf8(p).ok()) {
            Some(text) => {
                msg.content = text;
                msg.is_encrypted = false;
                msg.encrypted_content = None;
            }
            None => debug!("Room key for {} did not open message {}", room, msg.id),
        }
    }

    fn handle_delivery_ack(&self, packet: &Packet) -> LocalOutcome {
        if packet.recipient_id != Some(self.local_id) {
            return LocalOutcome::Ignored;
        }
        match DeliveryAck::from_bytes(&packet.payload) {
            Ok(ack) => {
                debug!(
                    "Ack for {} from {} after {} hops",
                    ack.original_message_id, ack.recipient_nickname, ack.hop_count
                );
                let status = DeliveryStatus::Delivered {
                    nickname: ack.recipient_nickname,
                    at: ack.timestamp,
                };
                self.apply_status(&ack.original_message_id, status)
            }
            Err(e) => LocalOutcome::Undeliverable(MeshError::InvalidAck(e.to_string()).to_string()),
        }
    }

    fn handle_read_receipt(&self, packet: &Packet) -> LocalOutcome {
        if packet.recipient_id != Some(self.local_id) {
            return LocalOutcome::Ignored;
        }
        match ReadReceipt::from_bytes(&packet.payload) {
            Ok(receipt) => {
                let status = DeliveryStatus::Read {
                    nickname: receipt.reader_nickname,
                    at: receipt.timestamp,
                };
                self.apply_status(&receipt.original_message_id, status)
            }
            Err(e) => LocalOutcome::Undeliverable(MeshError::InvalidAck(e.to_string()).to_string()),
        }
    }

    /// Advance a tracked message's status and tell the sink
    fn apply_status(&self, message_id: &str, status: DeliveryStatus) -> LocalOutcome {
        {
            let mut outgoing = self.outgoing.lock();
            let advance = outgoing
                .get(message_id)
                .map_or(false, |current| supersedes(&status, current));
            if !advance {
                return LocalOutcome::Ignored;
            }
            outgoing.update(message_id, status.clone());
        }
        self.sink.on_status(message_id, status.clone());
        LocalOutcome::StatusUpdated {
            message_id: message_id.to_string(),
            status,
        }
    }

    // ------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------

    /// Public broadcast, optionally tagged with a room (sent in the clear).
    /// Queued for retry when nobody is in range.
    pub fn send_message(
        &self,
        content: &str,
        mentions: Vec<String>,
        room: Option<String>,
    ) -> Result<Message, MeshError> {
        self.ensure_running()?;
        let mut msg = Message::new(&self.nickname, content).with_sender_peer_id(self.local_id.to_hex());
        if !mentions.is_empty() {
            msg = msg.with_mentions(mentions.clone());
        }
        if let Some(room) = &room {
            msg = msg.with_room(room.clone());
        }

        if !self.relay.peers().is_empty() {
            match self.transmit_message(&msg, None) {
                Ok(()) => return Ok(msg),
                Err(e) => warn!("Broadcast {} failed: {}", msg.id, e),
            }
        }

        let request = match room {
            Some(room) => RetryRequest::room(&msg.id, content, room, None),
            None => RetryRequest::broadcast(&msg.id, content),
        };
        self.enqueue(with_mentions(request, mentions));
        Ok(msg)
    }

    /// Encrypted direct message. Queued when the recipient is out of reach
    /// or we have no session with it yet.
    pub fn send_private_message(
        &self,
        content: &str,
        to_peer: PeerId,
        recipient_nickname: &str,
    ) -> Result<Message, MeshError> {
        self.ensure_running()?;
        let mut msg = Message::private(&self.nickname, content, recipient_nickname)
            .with_sender_peer_id(self.local_id.to_hex());
        self.outgoing.lock().track(&msg.id, DeliveryStatus::Sending);

        let reachable = self.connected_snapshot().contains(&to_peer);
        let keyed = self.crypto.has_shared_secret(&to_peer);
        if reachable && keyed {
            match self.dispatch_private(&msg.id, content, to_peer, recipient_nickname) {
                Ok(()) => {
                    self.apply_status(&msg.id, DeliveryStatus::Sent);
                    msg.delivery_status = self.delivery_status(&msg.id);
                    return Ok(msg);
                }
                Err(e) => warn!("Private send {} to {} failed: {}", msg.id, to_peer, e),
            }
        } else {
            debug!(
                "Deferring {} to {} (reachable: {}, keyed: {})",
                msg.id, to_peer, reachable, keyed
            );
        }

        self.enqueue(RetryRequest::private(&msg.id, content, to_peer, recipient_nickname));
        msg.delivery_status = self.delivery_status(&msg.id);
        Ok(msg)
    }

    /// Room message encrypted with `room_key`, or with the key registered by
    /// `join_room` when none is given.
    pub fn send_room_message(
        &self,
        content: &str,
        mentions: Vec<String>,
        room: &str,
        room_key: Option<RoomKey>,
    ) -> Result<Message, MeshError> {
        self.ensure_running()?;
        let key = match room_key {
            Some(key) => key,
            None => self
                .rooms
                .read()
                .get(room)
                .cloned()
                .ok_or_else(|| MeshError::UnknownRoom(room.to_string()))?,
        };

        let mut msg = Message::new(&self.nickname, content)
            .with_sender_peer_id(self.local_id.to_hex())
            .with_room(room);
        if !mentions.is_empty() {
            msg = msg.with_mentions(mentions.clone());
        }

        if !self.relay.peers().is_empty() {
            match self.dispatch_room(&msg.id, content, msg.mentions.clone(), room, &key) {
                Ok(()) => return Ok(msg),
                Err(e) => warn!("Room send {} to {} failed: {}", msg.id, room, e),
            }
        }

        self.enqueue(with_mentions(
            RetryRequest::room(&msg.id, content, room, Some(key)),
            mentions,
        ));
        Ok(msg)
    }

    /// Tell `to_peer` we have read its message `message_id`
    pub fn send_read_receipt(&self, message_id: &str, to_peer: PeerId) -> Result<(), MeshError> {
        self.ensure_running()?;
        let receipt = ReadReceipt::new(message_id, self.local_id.to_hex(), &self.nickname);
        let payload = receipt
            .to_bytes()
            .map_err(|e| MeshError::InvalidAck(e.to_string()))?;
        let packet = self
            .originate(PacketType::ReadReceipt, payload)
            .with_recipient(to_peer);
        self.transmit(packet, self.route_to(to_peer))
    }

    /// Derive and remember the key for `room`. Slow: runs the full PBKDF2.
    pub fn join_room(&self, room: &str, password: &str) {
        let key = RoomKey::derive(room, password);
        self.add_room_key(room, key);
    }

    pub fn add_room_key(&self, room: &str, key: RoomKey) {
        info!("Joined room {}", room);
        self.rooms.write().insert(room.to_string(), key);
    }

    pub fn leave_room(&self, room: &str) -> bool {
        self.rooms.write().remove(room).is_some()
    }

    pub fn joined_rooms(&self) -> Vec<String> {
        let mut rooms: Vec<_> = self.rooms.read().keys().cloned().collect();
        rooms.sort();
        rooms
    }

    /// One pass over the retry queue at `now`, plus housekeeping: stale
    /// fragments and silent peers are dropped and our announce is refreshed.
    pub fn run_retry_tick(&self, now: u64) -> TickReport {
        let purged = self
            .fragments
            .lock()
            .purge_expired(now, self.config.fragment_timeout_ms);
        if purged > 0 {
            debug!("Purged {} stale fragment assemblies", purged);
        }
        self.expire_peers(now);
        self.refresh_announce(now);
        let connected = self.reachable_at(now);
        self.retry.tick(now, &connected, self)
    }

    /// Forget announced peers that are not neighbours and have been silent
    /// for longer than `peer_timeout_ms`
    fn expire_peers(&self, now: u64) {
        let timeout = self.config.peer_timeout_ms;
        let neighbours = self.relay.peers();
        let expired: Vec<PeerId> = {
            let mut announced = self.announced.write();
            let stale: Vec<PeerId> = announced
                .iter()
                .filter(|(peer, heard)| {
                    !neighbours.contains(*peer) && now.saturating_sub(**heard) > timeout
                })
                .map(|(peer, _)| *peer)
                .collect();
            for peer in &stale {
                announced.remove(peer);
            }
            stale
        };
        if !expired.is_empty() {
            let mut nicknames = self.nicknames.write();
            for peer in &expired {
                nicknames.remove(peer);
            }
        }
        for peer in &expired {
            info!("Peer {} timed out", peer);
            self.sink.on_peer_left(*peer);
        }
    }

    fn refresh_announce(&self, now: u64) {
        if !self.is_running() {
            return;
        }
        let last = self.last_announce.load(Ordering::SeqCst);
        if now.saturating_sub(last) < self.config.announce_interval_ms {
            return;
        }
        self.last_announce.store(now, Ordering::SeqCst);
        if let Err(e) = self.transmit(self.announce_packet(), None) {
            warn!("Failed to refresh announce: {}", e);
        }
    }

    fn ensure_running(&self) -> Result<(), MeshError> {
        if self.is_running() {
            Ok(())
        } else {
            Err(MeshError::NotRunning)
        }
    }

    fn enqueue(&self, request: RetryRequest) {
        let message_id = request.message_id().to_string();
        if !self.retry.add_for_retry(request, self.time.now_millis()) {
            self.apply_status(
                &message_id,
                DeliveryStatus::Failed {
                    reason: "retry queue full".into(),
                },
            );
        }
    }

    /// Unicast when `peer` is a neighbour, flood otherwise
    fn route_to(&self, peer: PeerId) -> Option<PeerId> {
        if self.relay.is_connected(&peer) {
            Some(peer)
        } else {
            None
        }
    }

    /// Stamp and sign a packet from this node
    fn originate(&self, kind: PacketType, payload: Vec<u8>) -> Packet {
        let signature = self.crypto.sign(&payload);
        Packet::new(kind, self.config.default_ttl, self.local_id, payload).with_signature(signature)
    }

    fn key_exchange_packet(&self) -> Packet {
        let bundle = self.crypto.local_bundle().to_bytes().to_vec();
        self.originate(PacketType::KeyExchange, bundle)
    }

    fn announce_packet(&self) -> Packet {
        self.originate(PacketType::Announce, self.nickname.as_bytes().to_vec())
    }

    /// The ack's hop count is an estimate: it assumes the sender stamped
    /// the packet with the same `default_ttl` this node uses.
    fn send_delivery_ack(&self, msg: &Message, received: &Packet) -> Result<(), MeshError> {
        let hop_count = self.config.default_ttl.saturating_sub(received.ttl);
        let ack = DeliveryAck::new(&msg.id, self.local_id.to_hex(), &self.nickname, hop_count);
        let payload = ack
            .to_bytes()
            .map_err(|e| MeshError::InvalidAck(e.to_string()))?;
        let packet = self
            .originate(PacketType::DeliveryAck, payload)
            .with_recipient(received.sender_id);
        self.transmit(packet, self.route_to(received.sender_id))
    }

    fn transmit_message(&self, msg: &Message, recipient: Option<PeerId>) -> Result<(), MeshError> {
        let packet = self.originate(PacketType::Message, message::encode_payload(msg));
        match recipient {
            Some(peer) => self.transmit(packet.with_recipient(peer), self.route_to(peer)),
            None => self.transmit(packet.with_recipient(PeerId::BROADCAST), None),
        }
    }

    /// Encode and hand to the transport, fragmenting oversized packets
    fn transmit(&self, packet: Packet, target: Option<PeerId>) -> Result<(), MeshError> {
        let encoded = wire::encode(&packet)?;
        if encoded.len() <= self.config.fragment_threshold {
            self.transport.send(&encoded, target)?;
            return Ok(());
        }

        let fragments = wire::fragment::split(&packet, self.config.fragment_size)?;
        debug!(
            "Sending {} byte packet as {} fragments",
            encoded.len(),
            fragments.len()
        );
        for fragment in &fragments {
            self.transport.send(&wire::encode(fragment)?, target)?;
        }
        Ok(())
    }

    fn dispatch_broadcast(
        &self,
        message_id: &str,
        content: &str,
        mentions: Option<Vec<String>>,
        room: Option<String>,
    ) -> Result<(), MeshError> {
        let mut msg = Message::new(&self.nickname, content)
            .with_id(message_id)
            .with_sender_peer_id(self.local_id.to_hex());
        msg.mentions = mentions;
        msg.room = room;
        self.transmit_message(&msg, None)
    }

    fn dispatch_room(
        &self,
        message_id: &str,
        content: &str,
        mentions: Option<Vec<String>>,
        room: &str,
        key: &RoomKey,
    ) -> Result<(), MeshError> {
        let ciphertext = key.encrypt(content.as_bytes())?;
        let mut msg = Message::new(&self.nickname, "")
            .with_id(message_id)
            .with_sender_peer_id(self.local_id.to_hex())
            .with_room(room)
            .with_encrypted_content(ciphertext);
        msg.mentions = mentions;
        self.transmit_message(&msg, None)
    }

    fn dispatch_private(
        &self,
        message_id: &str,
        content: &str,
        peer: PeerId,
        recipient_nickname: &str,
    ) -> Result<(), MeshError> {
        let ciphertext = self.crypto.encrypt(&peer, content.as_bytes())?;
        let msg = Message::private(&self.nickname, "", recipient_nickname)
            .with_id(message_id)
            .with_sender_peer_id(self.local_id.to_hex())
            .with_encrypted_content(ciphertext);
        self.transmit_message(&msg, Some(peer))
    }
}

fn with_mentions(request: RetryRequest, mentions: Vec<String>) -> RetryRequest {
    if mentions.is_empty() {
        request
    } else {
        request.with_mentions(mentions)
    }
}

impl RetrySender for MeshService {
    fn resend_private(&self, entry: &RetryableMessage) -> Result<(), MeshError> {
        self.ensure_running()?;
        let peer = entry
            .recipient_peer_id
            .ok_or(MeshError::UnknownPeer(PeerId::BROADCAST))?;
        let nickname = entry.recipient_nickname.as_deref().unwrap_or_default();
        self.dispatch_private(&entry.id, &entry.content, peer, nickname)?;
        self.apply_status(&entry.id, DeliveryStatus::Sent);
        Ok(())
    }

    fn resend_room(&self, entry: &RetryableMessage) -> Result<(), MeshError> {
        self.ensure_running()?;
        let room = entry.room.as_deref().unwrap_or_default();
        let key = entry
            .room_key
            .as_ref()
            .ok_or_else(|| MeshError::UnknownRoom(room.to_string()))?;
        self.dispatch_room(&entry.id, &entry.content, entry.mentions.clone(), room, key)
    }

    fn resend_broadcast(&self, entry: &RetryableMessage) -> Result<(), MeshError> {
        self.ensure_running()?;
        self.dispatch_broadcast(
            &entry.id,
            &entry.content,
            entry.mentions.clone(),
            entry.room.clone(),
        )
    }

    fn on_retry_exhausted(&self, entry: &RetryableMessage) {
        let status = DeliveryStatus::Failed {
            reason: format!("no route after {} attempts", entry.retry_count),
        };
        let tracked = self.outgoing.lock().contains(&entry.id);
        if tracked {
            self.apply_status(&entry.id, status);
        } else {
            // Broadcasts are not tracked but still get a final word
            self.sink.on_status(&entry.id, status);
        }
    }
}

// ============================================================================
// RETRY LOOP
// ============================================================================

/// Handle to a running retry loop
pub struct RetryLoopHandle {
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl RetryLoopHandle {
    /// Stop the loop and wait for it to exit
    pub async fn shutdown(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Err(e) = (&mut self.task).await {
            warn!("Retry loop ended abnormally: {}", e);
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Run `run_retry_tick` every `retry_interval_ms` on the current tokio
/// runtime until the handle is shut down.
pub fn spawn_retry_loop(service: Arc<MeshService>) -> RetryLoopHandle {
    let (stop_tx, mut stop_rx) = oneshot::channel();
    let period = service.config().retry_interval();

    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = service.run_retry_tick(service.now_millis());
                    if report != TickReport::default() {
                        debug!(
                            "Retry tick: {} resent, {} rescheduled, {} dropped, {} queued",
                            report.resent, report.rescheduled, report.dropped, report.remaining
                        );
                    }
                }
                _ = &mut stop_rx => break,
            }
        }
        debug!("Retry loop stopped");
    });

    RetryLoopHandle {
        stop: Some(stop_tx),
        task,
    }
}

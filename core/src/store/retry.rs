// Retry queue — time-driven re-send of messages that could not go out
//
// Entries wait until their next_retry_time, then are resent if the route
// looks usable (recipient connected for private messages, anyone connected
// otherwise). Each miss pushes the next attempt further out: after the
// n-th miss the wait is interval * (n + 1). The queue is bounded and
// rejects new entries when full rather than evicting old ones.

use parking_lot::Mutex;
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

use crate::config::MeshConfig;
use crate::crypto::RoomKey;
use crate::wire::PeerId;
use crate::MeshError;

/// A queued message and everything needed to send it again
#[derive(Debug, Clone)]
pub struct RetryableMessage {
    /// ID of the message being retried
    pub id: String,
    pub content: String,
    pub mentions: Option<Vec<String>>,
    pub room: Option<String>,
    pub is_private: bool,
    pub recipient_peer_id: Option<PeerId>,
    pub recipient_nickname: Option<String>,
    pub room_key: Option<RoomKey>,
    pub retry_count: u32,
    pub max_retries: u32,
    /// Milliseconds since epoch
    pub next_retry_time: u64,
}

/// How an entry gets resent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryRoute {
    Private,
    Room,
    Broadcast,
}

impl RetryableMessage {
    pub fn route(&self) -> RetryRoute {
        if self.is_private {
            RetryRoute::Private
        } else if self.room.is_some() && self.room_key.is_some() {
            RetryRoute::Room
        } else {
            RetryRoute::Broadcast
        }
    }

    /// Whether the route is usable given the connected peers
    fn can_send(&self, connected: &BTreeSet<PeerId>) -> bool {
        match self.route() {
            RetryRoute::Private => self
                .recipient_peer_id
                .map_or(false, |peer| connected.contains(&peer)),
            RetryRoute::Room | RetryRoute::Broadcast => !connected.is_empty(),
        }
    }
}

/// What to enqueue. Built with one of the route constructors.
#[derive(Debug, Clone)]
pub struct RetryRequest {
    message_id: String,
    content: String,
    mentions: Option<Vec<String>>,
    room: Option<String>,
    recipient: Option<(PeerId, String)>,
    room_key: Option<RoomKey>,
}

impl RetryRequest {
    pub fn broadcast(message_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
            content: content.into(),
            mentions: None,
            room: None,
            recipient: None,
            room_key: None,
        }
    }

    pub fn private(
        message_id: impl Into<String>,
        content: impl Into<String>,
        peer: PeerId,
        nickname: impl Into<String>,
    ) -> Self {
        Self {
            recipient: Some((peer, nickname.into())),
            ..Self::broadcast(message_id, content)
        }
    }

    /// Room message; without a key it is retried like a plain broadcast
    pub fn room(
        message_id: impl Into<String>,
        content: impl Into<String>,
        room: impl Into<String>,
        key: Option<RoomKey>,
    ) -> Self {
        Self {
            room: Some(room.into()),
            room_key: key,
            ..Self::broadcast(message_id, content)
        }
    }

    pub fn with_mentions(mut self, mentions: Vec<String>) -> Self {
        self.mentions = Some(mentions);
        self
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }
}

/// The send capability a tick resends through.
///
/// Implementations must not enqueue back into the queue being ticked; a
/// failed resend is reported with `Err` and the queue reschedules it.
#[cfg_attr(test, mockall::automock)]
pub trait RetrySender: Send + Sync {
    fn resend_private(&self, entry: &RetryableMessage) -> Result<(), MeshError>;
    fn resend_room(&self, entry: &RetryableMessage) -> Result<(), MeshError>;
    fn resend_broadcast(&self, entry: &RetryableMessage) -> Result<(), MeshError>;
    /// Called once for each entry dropped after its last attempt
    fn on_retry_exhausted(&self, entry: &RetryableMessage);
}

/// Counts from a single tick
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub resent: usize,
    pub rescheduled: usize,
    pub dropped: usize,
    /// Queue length once the tick finished
    pub remaining: usize,
}

/// Bounded retry queue
pub struct RetryQueue {
    entries: Mutex<Vec<RetryableMessage>>,
    interval_ms: u64,
    max_retries: u32,
    capacity: usize,
}

impl RetryQueue {
    pub fn new(config: &MeshConfig) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            interval_ms: config.retry_interval_ms,
            max_retries: config.max_retries,
            capacity: config.max_retry_queue,
        }
    }

    /// Enqueue for a first retry one interval from `now`.
    ///
    /// Returns false when the queue is full or the message is already queued.
    pub fn add_for_retry(&self, request: RetryRequest, now: u64) -> bool {
        let mut entries = self.entries.lock();

        if entries.len() >= self.capacity {
            warn!(
                "Retry queue full ({} entries), rejecting message {}",
                self.capacity, request.message_id
            );
            return false;
        }
        if entries.iter().any(|e| e.id == request.message_id) {
            debug!("Message {} already queued for retry", request.message_id);
            return false;
        }

        let (recipient_peer_id, recipient_nickname) = match request.recipient {
            Some((peer, nick)) => (Some(peer), Some(nick)),
            None => (None, None),
        };

        entries.push(RetryableMessage {
            id: request.message_id,
            content: request.content,
            mentions: request.mentions,
            room: request.room,
            is_private: recipient_peer_id.is_some(),
            recipient_peer_id,
            recipient_nickname,
            room_key: request.room_key,
            retry_count: 0,
            max_retries: self.max_retries,
            next_retry_time: now.saturating_add(self.interval_ms),
        });
        true
    }

    /// One pass over the queue. `connected` is a snapshot taken by the caller.
    ///
    /// Due entries are taken out under the lock, processed without it, and
    /// the survivors put back, so a sender may safely inspect the queue.
    pub fn tick(
        &self,
        now: u64,
        connected: &BTreeSet<PeerId>,
        sender: &dyn RetrySender,
    ) -> TickReport {
        let due: Vec<RetryableMessage> = {
            let mut entries = self.entries.lock();
            let (due, waiting): (Vec<_>, Vec<_>) =
                entries.drain(..).partition(|e| e.next_retry_time <= now);
            *entries = waiting;
            due
        };

        let mut report = TickReport::default();
        let mut survivors = Vec::new();

        for mut entry in due {
            if entry.retry_count >= entry.max_retries {
                info!(
                    "Giving up on message {} after {} retries",
                    entry.id, entry.retry_count
                );
                sender.on_retry_exhausted(&entry);
                report.dropped += 1;
                continue;
            }

            if entry.can_send(connected) {
                let result = match entry.route() {
                    RetryRoute::Private => sender.resend_private(&entry),
                    RetryRoute::Room => sender.resend_room(&entry),
                    RetryRoute::Broadcast => sender.resend_broadcast(&entry),
                };
                match result {
                    Ok(()) => {
                        debug!("Resent message {} ({:?})", entry.id, entry.route());
                        report.resent += 1;
                        continue;
                    }
                    Err(e) => warn!("Resend of message {} failed: {}", entry.id, e),
                }
            }

            entry.next_retry_time = now.saturating_add(
                self.interval_ms
                    .saturating_mul(u64::from(entry.retry_count) + 2),
            );
            entry.retry_count += 1;
            report.rescheduled += 1;
            survivors.push(entry);
        }

        let mut entries = self.entries.lock();
        entries.extend(survivors);
        report.remaining = entries.len();
        report
    }

    pub fn clear_queue(&self) {
        self.entries.lock().clear();
    }

    pub fn count(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Copy of every queued entry
    pub fn snapshot(&self) -> Vec<RetryableMessage> {
        self.entries.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::predicate::*;

    const T0: u64 = 1_000_000;

    fn queue() -> RetryQueue {
        RetryQueue::new(&MeshConfig::default())
    }

    fn peers(ids: &[&str]) -> BTreeSet<PeerId> {
        ids.iter().map(|s| PeerId::from_str_lossy(s)).collect()
    }

    #[test]
    fn test_capacity_rejects_51st() {
        let q = queue();
        for i in 0..50 {
            assert!(q.add_for_retry(RetryRequest::broadcast(format!("m{i}"), "x"), T0));
        }
        assert!(!q.add_for_retry(RetryRequest::broadcast("m50", "x"), T0));
        assert_eq!(q.count(), 50);
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let q = queue();
        assert!(q.add_for_retry(RetryRequest::broadcast("same", "x"), T0));
        assert!(!q.add_for_retry(RetryRequest::broadcast("same", "y"), T0));
        assert_eq!(q.count(), 1);
    }

    #[test]
    fn test_not_due_is_untouched() {
        let q = queue();
        q.add_for_retry(RetryRequest::broadcast("m", "x"), T0);
        let sender = MockRetrySender::new();

        let report = q.tick(T0 + 4_999, &peers(&["a"]), &sender);
        assert_eq!(report, TickReport { remaining: 1, ..Default::default() });
        assert_eq!(q.snapshot()[0].retry_count, 0);
    }

    #[test]
    fn test_broadcast_resent_when_anyone_connected() {
        let q = queue();
        q.add_for_retry(RetryRequest::broadcast("m", "hello"), T0);

        let mut sender = MockRetrySender::new();
        sender
            .expect_resend_broadcast()
            .withf(|e| e.content == "hello")
            .times(1)
            .returning(|_| Ok(()));

        let report = q.tick(T0 + 5_000, &peers(&["a"]), &sender);
        assert_eq!(report.resent, 1);
        assert_eq!(q.count(), 0);
    }

    #[test]
    fn test_private_waits_for_recipient_with_linear_backoff() {
        let q = queue();
        let bob = PeerId::from_str_lossy("bob");
        q.add_for_retry(RetryRequest::private("m", "psst", bob, "bob"), T0);

        let mut sender = MockRetrySender::new();
        sender.expect_resend_private().never();

        // First miss: retry_count 0 -> 1, wait 5s * 2
        let now = T0 + 5_000;
        q.tick(now, &peers(&["carol"]), &sender);
        let e = &q.snapshot()[0];
        assert_eq!(e.retry_count, 1);
        assert_eq!(e.next_retry_time, now + 10_000);

        // Second miss: wait 5s * 3
        let now = now + 10_000;
        q.tick(now, &BTreeSet::new(), &sender);
        let e = &q.snapshot()[0];
        assert_eq!(e.retry_count, 2);
        assert_eq!(e.next_retry_time, now + 15_000);
    }

    #[test]
    fn test_private_resent_when_recipient_connected() {
        let q = queue();
        let bob = PeerId::from_str_lossy("bob");
        q.add_for_retry(RetryRequest::private("m", "psst", bob, "bob"), T0);

        let mut sender = MockRetrySender::new();
        sender
            .expect_resend_private()
            .withf(move |e| e.recipient_peer_id == Some(bob) && e.recipient_nickname.as_deref() == Some("bob"))
            .times(1)
            .returning(|_| Ok(()));

        let report = q.tick(T0 + 5_000, &peers(&["bob"]), &sender);
        assert_eq!(report.resent, 1);
        assert!(q.is_empty());
    }

    #[test]
    fn test_room_with_key_uses_room_route() {
        let q = queue();
        let key = RoomKey::from_bytes([5; 32]);
        q.add_for_retry(
            RetryRequest::room("m", "hi room", "#mesh", Some(key))
                .with_mentions(vec!["bob".into()]),
            T0,
        );

        let mut sender = MockRetrySender::new();
        sender
            .expect_resend_room()
            .withf(|e| e.room.as_deref() == Some("#mesh") && e.room_key.is_some())
            .times(1)
            .returning(|_| Ok(()));

        assert_eq!(q.tick(T0 + 5_000, &peers(&["a"]), &sender).resent, 1);
    }

    #[test]
    fn test_room_without_key_is_broadcast() {
        let q = queue();
        q.add_for_retry(RetryRequest::room("m", "hi", "#open", None), T0);
        assert_eq!(q.snapshot()[0].route(), RetryRoute::Broadcast);
    }

    #[test]
    fn test_exhausted_entry_dropped_not_resent() {
        let q = queue();
        let bob = PeerId::from_str_lossy("bob");
        q.add_for_retry(RetryRequest::private("m", "psst", bob, "bob"), T0);

        let mut sender = MockRetrySender::new();
        sender.expect_resend_private().never();
        sender
            .expect_on_retry_exhausted()
            .withf(|e| e.id == "m" && e.retry_count == 3)
            .times(1)
            .return_const(());

        // Three misses with nobody connected
        for _ in 0..3 {
            let now = q.snapshot()[0].next_retry_time;
            q.tick(now, &BTreeSet::new(), &sender);
        }
        assert_eq!(q.snapshot()[0].retry_count, 3);

        // Recipient is back, but the budget is spent
        let now = q.snapshot()[0].next_retry_time;
        let report = q.tick(now, &peers(&["bob"]), &sender);
        assert_eq!(report.dropped, 1);
        assert_eq!(report.remaining, 0);
    }

    #[test]
    fn test_failed_resend_is_rescheduled() {
        let q = queue();
        q.add_for_retry(RetryRequest::broadcast("m", "x"), T0);

        let mut sender = MockRetrySender::new();
        sender
            .expect_resend_broadcast()
            .times(1)
            .returning(|_| Err(MeshError::NotRunning));

        let report = q.tick(T0 + 5_000, &peers(&["a"]), &sender);
        assert_eq!(report.rescheduled, 1);
        assert_eq!(q.snapshot()[0].retry_count, 1);
    }

    #[test]
    fn test_clear_queue() {
        let q = queue();
        q.add_for_retry(RetryRequest::broadcast("a", "x"), T0);
        q.add_for_retry(RetryRequest::broadcast("b", "x"), T0);
        q.clear_queue();
        assert_eq!(q.count(), 0);
    }

    #[test]
    fn test_ordering_is_preserved_for_waiting_entries() {
        let q = queue();
        q.add_for_retry(RetryRequest::broadcast("early", "x"), T0);
        q.add_for_retry(RetryRequest::broadcast("late", "x"), T0 + 3_000);

        let mut sender = MockRetrySender::new();
        sender.expect_resend_broadcast().with(always()).times(1).returning(|_| Ok(()));

        q.tick(T0 + 5_000, &peers(&["a"]), &sender);
        let ids: Vec<String> = q.snapshot().into_iter().map(|e| e.id).collect();
        assert_eq!(ids, vec!["late".to_string()]);
    }
}

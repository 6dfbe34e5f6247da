// Message types — the literal point of this app

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Delivery status of a sent private message.
///
/// Local tracking state only; never serialized onto the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryStatus {
    /// Handed to the send path, not yet on the radio
    Sending,
    /// Left this device
    Sent,
    /// Recipient's device acknowledged it
    Delivered { nickname: String, at: u64 },
    /// Recipient opened it
    Read { nickname: String, at: u64 },
    /// Gave up
    Failed { reason: String },
    /// Room delivery reached some of the members
    PartiallyDelivered { reached: u32, total: u32 },
}

/// A chat message, carried as the payload of a `Message` packet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Unique message ID (UUID v4)
    pub id: String,
    /// Sender nickname
    pub sender: String,
    /// UTF-8 text; empty when `is_encrypted`
    pub content: String,
    /// Unix timestamp (milliseconds)
    pub timestamp: u64,
    pub is_relay: bool,
    pub original_sender: Option<String>,
    pub is_private: bool,
    pub recipient_nickname: Option<String>,
    /// Logical peer ID of the sender (distinct from the wire sender_id)
    pub sender_peer_id: Option<String>,
    pub mentions: Option<Vec<String>>,
    /// Room / channel name
    pub room: Option<String>,
    pub is_encrypted: bool,
    /// Ciphertext standing in for `content` when `is_encrypted`
    pub encrypted_content: Option<Vec<u8>>,
    /// Local delivery tracking; `None` for anything received off the wire
    pub delivery_status: Option<DeliveryStatus>,
}

impl Message {
    /// A fresh public message stamped with a new ID and the current time
    pub fn new(sender: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            sender: sender.into(),
            content: content.into(),
            timestamp: crate::now_millis(),
            is_relay: false,
            original_sender: None,
            is_private: false,
            recipient_nickname: None,
            sender_peer_id: None,
            mentions: None,
            room: None,
            is_encrypted: false,
            encrypted_content: None,
            delivery_status: None,
        }
    }

    /// A fresh private message; starts out as `Sending`
    pub fn private(
        sender: impl Into<String>,
        content: impl Into<String>,
        recipient_nickname: impl Into<String>,
    ) -> Self {
        let mut msg = Self::new(sender, content);
        msg.is_private = true;
        msg.recipient_nickname = Some(recipient_nickname.into());
        msg.delivery_status = Some(DeliveryStatus::Sending);
        msg
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_sender_peer_id(mut self, peer_id: impl Into<String>) -> Self {
        self.sender_peer_id = Some(peer_id.into());
        self
    }

    pub fn with_mentions(mut self, mentions: Vec<String>) -> Self {
        self.mentions = Some(mentions);
        self
    }

    pub fn with_room(mut self, room: impl Into<String>) -> Self {
        self.room = Some(room.into());
        self
    }

    /// Replace the content with ciphertext
    pub fn with_encrypted_content(mut self, ciphertext: Vec<u8>) -> Self {
        self.content.clear();
        self.is_encrypted = true;
        self.encrypted_content = Some(ciphertext);
        self
    }

    /// Mark as a relayed copy of someone else's message
    pub fn as_relay_of(mut self, original_sender: impl Into<String>) -> Self {
        self.is_relay = true;
        self.original_sender = Some(original_sender.into());
        self
    }

    /// True when this message mentions `nickname`
    pub fn mentions_nickname(&self, nickname: &str) -> bool {
        self.mentions
            .as_ref()
            .map_or(false, |m| m.iter().any(|n| n == nickname))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_message_has_unique_id() {
        let a = Message::new("alice", "hi");
        let b = Message::new("alice", "hi");
        assert_ne!(a.id, b.id);
        assert!(Uuid::parse_str(&a.id).is_ok());
        assert!(a.delivery_status.is_none());
    }

    #[test]
    fn test_private_starts_sending() {
        let msg = Message::private("alice", "psst", "bob");
        assert!(msg.is_private);
        assert_eq!(msg.recipient_nickname.as_deref(), Some("bob"));
        assert_eq!(msg.delivery_status, Some(DeliveryStatus::Sending));
    }

    #[test]
    fn test_encrypted_content_clears_plaintext() {
        let msg = Message::new("alice", "secret").with_encrypted_content(vec![1, 2, 3]);
        assert!(msg.is_encrypted);
        assert!(msg.content.is_empty());
        assert_eq!(msg.encrypted_content, Some(vec![1, 2, 3]));
    }

    #[test]
    fn test_mentions() {
        let msg = Message::new("alice", "hey @bob").with_mentions(vec!["bob".into()]);
        assert!(msg.mentions_nickname("bob"));
        assert!(!msg.mentions_nickname("carol"));
        assert!(!Message::new("a", "b").mentions_nickname("bob"));
    }
}

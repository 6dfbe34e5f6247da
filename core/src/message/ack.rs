// Delivery acknowledgements and read receipts — JSON packet payloads

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Sent by the recipient of a private message once it has been delivered
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryAck {
    pub original_message_id: String,
    pub ack_id: String,
    /// Hex peer ID of the acknowledging node
    pub recipient_id: String,
    pub recipient_nickname: String,
    pub timestamp: u64,
    /// Hops the original message travelled (initial ttl minus arrival ttl)
    pub hop_count: u8,
}

impl DeliveryAck {
    pub fn new(
        original_message_id: impl Into<String>,
        recipient_id: impl Into<String>,
        recipient_nickname: impl Into<String>,
        hop_count: u8,
    ) -> Self {
        Self {
            original_message_id: original_message_id.into(),
            ack_id: Uuid::new_v4().to_string(),
            recipient_id: recipient_id.into(),
            recipient_nickname: recipient_nickname.into(),
            timestamp: crate::now_millis(),
            hop_count,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Sent by the recipient of a private message once it has been read
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadReceipt {
    pub original_message_id: String,
    pub receipt_id: String,
    /// Hex peer ID of the reader
    pub reader_id: String,
    pub reader_nickname: String,
    pub timestamp: u64,
}

impl ReadReceipt {
    pub fn new(
        original_message_id: impl Into<String>,
        reader_id: impl Into<String>,
        reader_nickname: impl Into<String>,
    ) -> Self {
        Self {
            original_message_id: original_message_id.into(),
            receipt_id: Uuid::new_v4().to_string(),
            reader_id: reader_id.into(),
            reader_nickname: reader_nickname.into(),
            timestamp: crate::now_millis(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

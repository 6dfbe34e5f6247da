// Message module — chat messages, their binary payload form, and receipts

pub mod ack;
pub mod codec;
pub mod types;

pub use ack::{DeliveryAck, ReadReceipt};
pub use codec::{decode_payload, encode_payload, PayloadError};
pub use types::{DeliveryStatus, Message};

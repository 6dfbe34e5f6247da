// BLE Mesh Core — store-and-forward messaging spine
//
// One shared core for every platform shell. Transport (radio), UI and key
// persistence live outside; this crate only turns messages into bytes,
// bytes into messages, and decides what gets relayed and retried.

pub mod config;
pub mod crypto;
pub mod message;
pub mod relay;
pub mod service;
pub mod store;
pub mod transport;
pub mod wire;

use thiserror::Error;

pub use config::MeshConfig;
pub use crypto::{
    CryptoError, EphemeralKeySource, KeyBundle, KeySource, LocalKeys, PeerEncryptionStore, RoomKey,
};
pub use message::{DeliveryAck, DeliveryStatus, Message, PayloadError, ReadReceipt};
pub use relay::{DropReason, RelayDecision, RelayEngine};
pub use service::{spawn_retry_loop, InboundReport, LocalOutcome, MeshService, RetryLoopHandle};
pub use store::{RetryQueue, RetryRequest, RetrySender, RetryableMessage, TickReport};
pub use transport::{
    ChannelSink, DeliverySink, LocalHub, LocalNode, LocalTransport, MeshEvent, Transport,
    TransportError, TransportEvent,
};
pub use wire::{Packet, PacketType, PeerId, WireError};

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Top-level error for operations on the mesh service.
///
/// Decode failures (`Wire`, `Payload`) are never fatal: the caller drops the
/// input and carries on. Crypto failures are surfaced so the message can be
/// treated as undeliverable.
#[derive(Debug, Error)]
pub enum MeshError {
    #[error("Malformed packet: {0}")]
    Wire(#[from] WireError),
    #[error("Malformed payload: {0}")]
    Payload(#[from] PayloadError),
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Unknown peer {0}")]
    UnknownPeer(PeerId),
    #[error("Unknown room {0}")]
    UnknownRoom(String),
    #[error("Service not running")]
    NotRunning,
    #[error("Invalid ack payload: {0}")]
    InvalidAck(String),
}

// ============================================================================
// TIME
// ============================================================================

/// Source of wall-clock milliseconds. Injected so the retry tick can be
/// driven deterministically in tests.
pub trait TimeSource: Send + Sync {
    fn now_millis(&self) -> u64;
}

/// Wall clock backed by `SystemTime`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    fn now_millis(&self) -> u64 {
        now_millis()
    }
}

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

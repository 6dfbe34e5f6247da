//! Capability interfaces between the mesh core and its collaborators
//!
//! The core never touches a radio. It sees a `Transport` that moves opaque
//! frames to neighbours, and reports results to a `DeliverySink`.

use std::collections::BTreeSet;
use std::fmt;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::warn;

use crate::message::{DeliveryStatus, Message};
use crate::wire::PeerId;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Peer {0} is not reachable")]
    PeerUnreachable(PeerId),

    #[error("Transport closed")]
    Closed,

    #[error("Send failed: {0}")]
    SendFailed(String),
}

/// Moves frames between this node and its directly connected peers.
///
/// Sends are fire-and-forget: `Ok` means the frame was handed to the radio,
/// not that anyone received it.
#[cfg_attr(test, mockall::automock)]
pub trait Transport: Send + Sync {
    /// Send to one peer, or to every connected peer when `target` is `None`
    fn send(&self, data: &[u8], target: Option<PeerId>) -> Result<(), TransportError>;

    /// Peers currently in radio range
    fn connected_peers(&self) -> BTreeSet<PeerId>;
}

/// Events a transport pushes into the core
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    PeerConnected(PeerId),
    PeerDisconnected(PeerId),
    DataReceived { from: PeerId, data: Vec<u8> },
}

impl fmt::Display for TransportEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportEvent::PeerConnected(p) => write!(f, "PeerConnected({})", p),
            TransportEvent::PeerDisconnected(p) => write!(f, "PeerDisconnected({})", p),
            TransportEvent::DataReceived { from, data } => {
                write!(f, "DataReceived {{ from: {}, {} bytes }}", from, data.len())
            }
        }
    }
}

/// Receives decoded messages and delivery status updates
#[cfg_attr(test, mockall::automock)]
pub trait DeliverySink: Send + Sync {
    /// A fully decoded (and, where possible, decrypted) message
    fn on_message(&self, message: Message, from: PeerId);

    /// Status change for a message this node sent
    fn on_status(&self, message_id: &str, status: DeliveryStatus);

    fn on_peer_joined(&self, _peer: PeerId, _nickname: &str) {}

    fn on_peer_left(&self, _peer: PeerId) {}
}

/// Everything a `ChannelSink` forwards
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeshEvent {
    MessageReceived { message: Message, from: PeerId },
    StatusChanged { message_id: String, status: DeliveryStatus },
    PeerJoined { peer: PeerId, nickname: String },
    PeerLeft { peer: PeerId },
}

/// `DeliverySink` that turns callbacks into `MeshEvent`s on a bounded channel.
///
/// Never blocks the mesh: when the consumer falls behind, events are dropped
/// with a warning.
#[derive(Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<MeshEvent>,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<MeshEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    fn push(&self, event: MeshEvent) {
        if let Err(e) = self.tx.try_send(event) {
            warn!("Dropping mesh event: {}", e);
        }
    }
}

impl DeliverySink for ChannelSink {
    fn on_message(&self, message: Message, from: PeerId) {
        self.push(MeshEvent::MessageReceived { message, from });
    }

    fn on_status(&self, message_id: &str, status: DeliveryStatus) {
        self.push(MeshEvent::StatusChanged {
            message_id: message_id.to_string(),
            status,
        });
    }

    fn on_peer_joined(&self, peer: PeerId, nickname: &str) {
        self.push(MeshEvent::PeerJoined {
            peer,
            nickname: nickname.to_string(),
        });
    }

    fn on_peer_left(&self, peer: PeerId) {
        self.push(MeshEvent::PeerLeft { peer });
    }
}

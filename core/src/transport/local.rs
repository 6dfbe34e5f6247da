// In-memory transport — any number of endpoints on one hub
//
// Links model radio range: a frame only reaches endpoints linked to the
// sender. Delivery is an unbounded channel push, so nothing here blocks or
// needs a runtime.

use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use super::abstraction::{Transport, TransportError, TransportEvent};
use crate::service::MeshService;
use crate::wire::PeerId;

/// Upper bound on events one `pump_until_idle` call will process
const MAX_PUMPED_EVENTS: usize = 100_000;

#[derive(Default)]
struct HubState {
    endpoints: HashMap<PeerId, mpsc::UnboundedSender<TransportEvent>>,
    links: BTreeSet<(PeerId, PeerId)>,
}

impl HubState {
    fn neighbours(&self, id: &PeerId) -> BTreeSet<PeerId> {
        self.links
            .iter()
            .filter_map(|(a, b)| {
                if a == id {
                    Some(*b)
                } else if b == id {
                    Some(*a)
                } else {
                    None
                }
            })
            .collect()
    }

    fn emit(&self, to: &PeerId, event: TransportEvent) {
        if let Some(tx) = self.endpoints.get(to) {
            // Receiver gone means the node shut down; nothing to do
            let _ = tx.send(event);
        }
    }
}

fn link_key(a: PeerId, b: PeerId) -> (PeerId, PeerId) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

/// Shared medium connecting `LocalTransport` endpoints
#[derive(Clone, Default)]
pub struct LocalHub {
    state: Arc<Mutex<HubState>>,
}

impl LocalHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an endpoint. Returns its transport and the stream of events
    /// addressed to it.
    pub fn endpoint(&self, id: PeerId) -> (LocalTransport, mpsc::UnboundedReceiver<TransportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().endpoints.insert(id, tx);
        (
            LocalTransport {
                id,
                hub: self.clone(),
            },
            rx,
        )
    }

    /// Bring two endpoints into range; both sides see `PeerConnected`
    pub fn link(&self, a: PeerId, b: PeerId) {
        let mut state = self.state.lock();
        if a == b || !state.links.insert(link_key(a, b)) {
            return;
        }
        debug!("Link up {} <-> {}", a, b);
        state.emit(&a, TransportEvent::PeerConnected(b));
        state.emit(&b, TransportEvent::PeerConnected(a));
    }

    /// Take two endpoints out of range; both sides see `PeerDisconnected`
    pub fn unlink(&self, a: PeerId, b: PeerId) {
        let mut state = self.state.lock();
        if !state.links.remove(&link_key(a, b)) {
            return;
        }
        debug!("Link down {} <-> {}", a, b);
        state.emit(&a, TransportEvent::PeerDisconnected(b));
        state.emit(&b, TransportEvent::PeerDisconnected(a));
    }

    pub fn neighbours(&self, id: &PeerId) -> BTreeSet<PeerId> {
        self.state.lock().neighbours(id)
    }
}

/// One node's view of the hub
#[derive(Clone)]
pub struct LocalTransport {
    id: PeerId,
    hub: LocalHub,
}

impl LocalTransport {
    pub fn id(&self) -> PeerId {
        self.id
    }
}

impl Transport for LocalTransport {
    fn send(&self, data: &[u8], target: Option<PeerId>) -> Result<(), TransportError> {
        let state = self.hub.state.lock();
        let neighbours = state.neighbours(&self.id);

        let targets: Vec<PeerId> = match target {
            Some(peer) if neighbours.contains(&peer) => vec![peer],
            Some(peer) => return Err(TransportError::PeerUnreachable(peer)),
            None => neighbours.into_iter().collect(),
        };

        for to in targets {
            trace!("{} -> {} ({} bytes)", self.id, to, data.len());
            state.emit(
                &to,
                TransportEvent::DataReceived {
                    from: self.id,
                    data: data.to_vec(),
                },
            );
        }
        Ok(())
    }

    fn connected_peers(&self) -> BTreeSet<PeerId> {
        self.hub.neighbours(&self.id)
    }
}

/// A mesh node wired to a `LocalHub`
pub struct LocalNode {
    pub service: Arc<MeshService>,
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

/// Feed every queued transport event into its node until no node has any
/// left. Returns the number of events handled.
pub fn pump_until_idle(nodes: &mut [LocalNode]) -> usize {
    let mut handled = 0;
    loop {
        let mut progress = false;
        for node in nodes.iter_mut() {
            while let Ok(event) = node.events.try_recv() {
                node.service.handle_transport_event(event);
                handled += 1;
                progress = true;
                if handled >= MAX_PUMPED_EVENTS {
                    return handled;
                }
            }
        }
        if !progress {
            return handled;
        }
    }
}

//! Retry loop lifecycle under a paused tokio clock
//!
//! The services read time from a clock backed by `tokio::time::Instant`, so
//! advancing the paused runtime moves both the retry loop's ticker and the
//! queue's notion of "now".
//!
//! Run with: cargo test --test integration_retry_lifecycle

use std::sync::Arc;
use std::time::Duration;

use blemesh_core::transport::pump_until_idle;
use blemesh_core::{
    spawn_retry_loop, ChannelSink, DeliveryStatus, LocalHub, LocalKeys, LocalNode, MeshConfig,
    MeshEvent, MeshService, PeerId, TimeSource,
};
use tokio::sync::mpsc;

struct TokioClock {
    origin: tokio::time::Instant,
    base: u64,
}

impl TokioClock {
    fn new() -> Self {
        Self {
            origin: tokio::time::Instant::now(),
            base: 1_700_000_000_000,
        }
    }
}

impl TimeSource for TokioClock {
    fn now_millis(&self) -> u64 {
        self.base + self.origin.elapsed().as_millis() as u64
    }
}

fn config() -> MeshConfig {
    MeshConfig {
        retry_interval_ms: 1_000,
        ..MeshConfig::default()
    }
}

fn node(
    hub: &LocalHub,
    name: &str,
    clock: Arc<TokioClock>,
) -> (LocalNode, mpsc::Receiver<MeshEvent>) {
    let id = PeerId::from_str_lossy(name);
    let (transport, events) = hub.endpoint(id);
    let (sink, rx) = ChannelSink::new(1024);
    let service = MeshService::new(
        name,
        id,
        LocalKeys::generate(),
        config(),
        Arc::new(transport),
        Arc::new(sink),
    )
    .with_time_source(clock);
    service.start().expect("start");
    (
        LocalNode {
            service: Arc::new(service),
            events,
        },
        rx,
    )
}

fn drain(rx: &mut mpsc::Receiver<MeshEvent>) -> Vec<MeshEvent> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        out.push(event);
    }
    out
}

#[tokio::test(start_paused = true)]
async fn test_loop_resends_once_peer_is_reachable() {
    let clock = Arc::new(TokioClock::new());
    let hub = LocalHub::new();
    let (alice, mut alice_rx) = node(&hub, "alice", clock.clone());
    let (bob, mut bob_rx) = node(&hub, "bob", clock);
    let alice_service = alice.service.clone();
    let bob_id = bob.service.local_id();
    let mut nodes = vec![alice, bob];

    let sent = alice_service
        .send_private_message("queued hello", bob_id, "bob")
        .unwrap();
    assert_eq!(alice_service.retry_queue().count(), 1);

    let handle = spawn_retry_loop(alice_service.clone());

    hub.link(alice_service.local_id(), bob_id);
    pump_until_idle(&mut nodes);

    tokio::time::sleep(Duration::from_millis(1_500)).await;
    assert!(alice_service.retry_queue().is_empty());

    pump_until_idle(&mut nodes);
    handle.shutdown().await;

    let delivered: Vec<_> = drain(&mut bob_rx)
        .into_iter()
        .filter_map(|event| match event {
            MeshEvent::MessageReceived { message, .. } => Some(message),
            _ => None,
        })
        .collect();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].id, sent.id);
    assert_eq!(delivered[0].content, "queued hello");

    let statuses: Vec<_> = drain(&mut alice_rx)
        .into_iter()
        .filter_map(|event| match event {
            MeshEvent::StatusChanged { status, .. } => Some(status),
            _ => None,
        })
        .collect();
    assert_eq!(statuses.first(), Some(&DeliveryStatus::Sent));
    assert!(matches!(statuses.last(), Some(DeliveryStatus::Delivered { .. })));
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_message_fails_after_backoff() {
    let clock = Arc::new(TokioClock::new());
    let hub = LocalHub::new();
    let (alice, mut alice_rx) = node(&hub, "alice", clock);
    let service = alice.service.clone();

    let sent = service
        .send_private_message("nobody home", PeerId::from_str_lossy("ghost"), "ghost")
        .unwrap();
    let handle = spawn_retry_loop(service.clone());

    // Attempts fall due at +1s, +3s, +6s; the entry is dropped at +10s
    tokio::time::sleep(Duration::from_millis(9_500)).await;
    assert_eq!(service.retry_queue().count(), 1);
    assert_eq!(service.retry_queue().snapshot()[0].retry_count, 3);

    tokio::time::sleep(Duration::from_millis(1_000)).await;
    assert!(service.retry_queue().is_empty());
    handle.shutdown().await;

    let failed = drain(&mut alice_rx).into_iter().any(|event| {
        matches!(
            event,
            MeshEvent::StatusChanged { message_id, status: DeliveryStatus::Failed { .. } }
                if message_id == sent.id
        )
    });
    assert!(failed);
    assert!(matches!(
        service.delivery_status(&sent.id),
        Some(DeliveryStatus::Failed { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_stops_ticking() {
    let clock = Arc::new(TokioClock::new());
    let hub = LocalHub::new();
    let (alice, _rx) = node(&hub, "alice", clock);
    let service = alice.service.clone();

    service.send_message("into the void", vec![], None).unwrap();
    let handle = spawn_retry_loop(service.clone());
    handle.shutdown().await;

    tokio::time::sleep(Duration::from_secs(30)).await;
    let queued = service.retry_queue().snapshot();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].retry_count, 0);
}

#[tokio::test(start_paused = true)]
async fn test_stopped_service_keeps_queue() {
    let clock = Arc::new(TokioClock::new());
    let hub = LocalHub::new();
    let (alice, _rx) = node(&hub, "alice", clock.clone());
    let (bob, _bob_rx) = node(&hub, "bob", clock);
    let service = alice.service.clone();
    let mut nodes = vec![alice, bob];

    service.send_message("later", vec![], None).unwrap();
    service.stop();

    hub.link(service.local_id(), PeerId::from_str_lossy("bob"));
    pump_until_idle(&mut nodes);

    let handle = spawn_retry_loop(service.clone());
    tokio::time::sleep(Duration::from_millis(1_500)).await;
    handle.shutdown().await;

    // Resend failed with NotRunning, so the entry was pushed back
    let queued = service.retry_queue().snapshot();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].retry_count, 1);
}

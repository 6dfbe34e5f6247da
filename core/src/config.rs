// Core tunables — every knob the mesh core reads lives here

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for the mesh core.
///
/// Defaults match the protocol constants used by the deployed clients; only
/// change them when every node in the mesh changes them too.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// TTL stamped on packets this node originates
    pub default_ttl: u8,
    /// Retry tick period in milliseconds (also the backoff base)
    pub retry_interval_ms: u64,
    /// Resend attempts before a queued message is dropped
    pub max_retries: u32,
    /// Retry queue capacity; enqueues beyond it are rejected
    pub max_retry_queue: usize,
    /// Packet digests remembered for duplicate suppression
    pub seen_cache_capacity: usize,
    /// Encoded packets larger than this are split into fragments
    pub fragment_threshold: usize,
    /// Bytes of packet data carried by each fragment
    pub fragment_size: usize,
    /// Incomplete fragment assemblies are purged after this long
    pub fragment_timeout_ms: u64,
    /// How often a running node rebroadcasts its nickname
    pub announce_interval_ms: u64,
    /// A peer heard only over the mesh is dropped after this much silence
    pub peer_timeout_ms: u64,
    /// Delivery statuses kept for messages this node originated
    pub status_cache_capacity: usize,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            default_ttl: 7,
            retry_interval_ms: 5_000,
            max_retries: 3,
            max_retry_queue: 50,
            seen_cache_capacity: 1_000,
            fragment_threshold: 512,
            fragment_size: 469,
            fragment_timeout_ms: 30_000,
            announce_interval_ms: 20_000,
            peer_timeout_ms: 60_000,
            status_cache_capacity: 1_000,
        }
    }
}

impl MeshConfig {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }
}

//! Store-and-forward relaying for the mesh
//!
//! Every node floods what it hears to its other neighbours until the
//! packet's ttl runs out. Duplicate and echo suppression keep the flood
//! from looping.

pub mod engine;

pub use engine::{packet_digest, DropReason, Forward, RelayDecision, RelayEngine};

// Transport module — the boundary between the mesh core and the radio

pub mod abstraction;
pub mod local;

pub use abstraction::{
    ChannelSink, DeliverySink, MeshEvent, Transport, TransportError, TransportEvent,
};
pub use local::{pump_until_idle, LocalHub, LocalNode, LocalTransport};

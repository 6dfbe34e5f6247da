// Store module — in-memory queue of messages awaiting another attempt

pub mod retry;

pub use retry::{RetryQueue, RetryRequest, RetryRoute, RetrySender, RetryableMessage, TickReport};

//! The `broker` module is the hub of the messaging fabric: connection and
//! topic bookkeeping, fan-out, and the in-process local bus.

pub mod connection;
pub mod engine;
pub mod local_bus;
pub mod message;
pub mod topic;

pub use engine::BrokerState;
pub use local_bus::{LocalBus, MessageTypeRegistry};
pub use message::{Envelope, MessageMetadata, TypedMessage};

#[cfg(test)]
mod tests;

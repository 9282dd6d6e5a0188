//! Client side of the messaging fabric.
//!
//! - `connection`: one WebSocket to the broker with invocations, reconnects
//!   and connection hooks
//! - `publisher`: typed publishing with `PublishResult` outcomes
//! - `consumer`: typed per-topic handlers, re-subscribed after reconnects

pub mod connection;
pub mod consumer;
pub mod publisher;

pub use connection::{BrokerConnection, ConnectionEvent, ConnectionObserver, ConnectionState};
pub use consumer::MessageConsumer;
pub use publisher::{MessagePublisher, PublishResult};

#[cfg(test)]
mod tests;

//! The `transport` module is responsible for network communication between
//! the broker and its clients via WebSockets.
//!
//! It defines the JSON frame protocol used in both directions and implements
//! the broker's WebSocket server: connection handling, frame parsing, and
//! forwarding client requests to the `BrokerState`.

pub mod message;
pub mod websocket;

pub use message::{ClientMessage, Invocation, ServerMessage};
pub use websocket::{serve, start_websocket_server};

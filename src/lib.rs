//! # meshbus
//!
//! `meshbus` is the messaging fabric between services: a WebSocket message
//! broker with topic fan-out, the client that publishes and consumes through
//! it, and a discovery client that resolves service names to endpoints with a
//! TTL cache and stale fallback.
//!
//! ## Core Modules
//!
//! - `broker`: connection registrations, topic subscriptions, fan-out and the
//!   in-process local bus.
//! - `client`: broker connection with reconnects, the message publisher and
//!   the message consumer.
//! - `config`: layered configuration loading.
//! - `discovery`: service cache, discovery client and registration agent.
//! - `transport`: wire protocol and the broker's WebSocket server.
//! - `utils`: error types and logging setup.

pub mod broker;
pub mod client;
pub mod config;
pub mod discovery;
pub mod transport;
pub mod utils;

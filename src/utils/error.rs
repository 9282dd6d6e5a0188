//! Error types shared across `meshbus`.
//!
//! Public entry points of the broker, publisher and discovery client convert
//! these into result values (`PublishResult`, `Option`, `bool`) instead of
//! returning them, so most of them are only seen inside the crate and in logs.

use thiserror::Error;

/// Failures inside the broker while handling one request.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("unknown message type '{0}'")]
    UnknownMessageType(String),

    #[error("failed to decode payload of '{message_type}': {source}")]
    Decode {
        message_type: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode frame: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("connection {0} is not attached to the broker")]
    UnknownConnection(String),
}

/// Failures of the client side of the broker connection.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("failed to connect to broker at {url}: {source}")]
    Connect {
        url: String,
        #[source]
        source: Box<tungstenite::Error>,
    },

    #[error("not connected to the broker")]
    NotConnected,

    #[error("reconnect to the broker in progress")]
    Reconnecting,

    #[error("broker connection has been closed")]
    Closed,

    #[error("broker did not answer '{operation}' within {timeout_ms}ms")]
    InvocationTimeout { operation: String, timeout_ms: u64 },

    #[error("broker rejected '{operation}': {message}")]
    Remote { operation: String, message: String },

    #[error("serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Failures talking to the discovery authority.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("discovery request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("discovery authority answered {0}")]
    Status(reqwest::StatusCode),

    #[error("invalid discovery url: {0}")]
    Url(String),
}

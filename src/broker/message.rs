//! Message definitions shared by the broker and its clients
//!
//! Payloads travel as JSON text next to a type identifier. The identifier is
//! what the broker's local bus uses to find a decoder, so both sides must agree
//! on it: types implement [`TypedMessage`] and by default use their Rust type
//! path as identifier.
//!
//! Notes on `MessageMetadata` fields:
//! - `source_service`: name of the publishing service
//! - `correlation_id`: opaque id used to tie related messages together
//! - `timestamp`: set by the publisher when the metadata is created
//! - `headers`: free-form string headers, omitted from the wire when empty

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A message type that can be published through the fabric.
pub trait TypedMessage: Serialize + DeserializeOwned + Send + Sync + 'static {
    fn message_type() -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// Identifier used for a batch (JSON array) of `message_type` values.
pub fn batch_type(message_type: &str) -> String {
    format!("{message_type}[]")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageMetadata {
    pub source_service: String,
    pub correlation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
}

impl MessageMetadata {
    /// Metadata for `source_service` with a fresh correlation id.
    pub fn new(source_service: impl Into<String>) -> Self {
        Self {
            source_service: source_service.into(),
            correlation_id: Uuid::new_v4().to_string(),
            timestamp: Some(Utc::now()),
            headers: HashMap::new(),
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = correlation_id.into();
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }
}

/// One `publishMessage` request as seen by the broker engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub topic: String,
    pub message_type: String,
    pub message_payload: String,
    #[serde(default)]
    pub metadata: Option<MessageMetadata>,
}

//! In-process delivery for messages passing through the broker
//!
//! The broker hands every published message to a [`LocalBus`] before fanning
//! it out to remote subscribers, so code running inside the broker process can
//! react to fabric traffic without opening a connection to itself.
//!
//! Payloads arrive as JSON text plus a type identifier. A
//! [`MessageTypeRegistry`] maps identifiers to decoders; it is populated at
//! startup (or implicitly by [`LocalBus::subscribe`]). Identifiers that were
//! never registered cannot be delivered locally.
//!
//! Subscription patterns may use `*` for a whole dot-separated segment:
//! `orders.*` matches `orders.created` but not `orders.created.eu`.

use std::any::Any;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, warn};

use crate::broker::message::{MessageMetadata, TypedMessage, batch_type};
use crate::utils::error::BrokerError;

type AnyMessage = Arc<dyn Any + Send + Sync>;
type Decoder = Arc<dyn Fn(&str) -> Result<Vec<AnyMessage>, serde_json::Error> + Send + Sync>;
type LocalHandler = Arc<dyn Fn(&(dyn Any + Send + Sync), &MessageMetadata) -> Option<bool> + Send + Sync>;

/// Known message types, by identifier.
#[derive(Default)]
pub struct MessageTypeRegistry {
    decoders: DashMap<String, Decoder>,
}

impl MessageTypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `T` and the batch form `T[]`.
    pub fn register<T: TypedMessage>(&self) {
        let single: Decoder = Arc::new(|payload: &str| -> Result<Vec<AnyMessage>, serde_json::Error> {
            let message: T = serde_json::from_str(payload)?;
            Ok(vec![Arc::new(message) as AnyMessage])
        });
        let batch: Decoder = Arc::new(|payload: &str| -> Result<Vec<AnyMessage>, serde_json::Error> {
            let messages: Vec<T> = serde_json::from_str(payload)?;
            Ok(messages
                .into_iter()
                .map(|m| Arc::new(m) as AnyMessage)
                .collect())
        });

        self.decoders.insert(T::message_type().to_string(), single);
        self.decoders.insert(batch_type(T::message_type()), batch);
    }

    pub fn contains(&self, message_type: &str) -> bool {
        self.decoders.contains_key(message_type)
    }

    fn decode(&self, message_type: &str, payload: &str) -> Result<Vec<AnyMessage>, BrokerError> {
        // clone the decoder out so the shard lock is not held while decoding
        let decoder = self
            .decoders
            .get(message_type)
            .map(|d| d.value().clone())
            .ok_or_else(|| BrokerError::UnknownMessageType(message_type.to_string()))?;

        decoder(payload).map_err(|source| BrokerError::Decode {
            message_type: message_type.to_string(),
            source,
        })
    }
}

/// Topic-pattern based in-process publish/subscribe.
#[derive(Default)]
pub struct LocalBus {
    registry: MessageTypeRegistry,
    handlers: DashMap<String, Vec<LocalHandler>>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn registry(&self) -> &MessageTypeRegistry {
        &self.registry
    }

    /// Subscribe to messages of type `T` on topics matching `pattern`.
    ///
    /// The handler returns whether it processed the message; `false` is logged.
    pub fn subscribe<T, F>(&self, pattern: &str, handler: F)
    where
        T: TypedMessage,
        F: Fn(&T, &MessageMetadata) -> bool + Send + Sync + 'static,
    {
        self.registry.register::<T>();

        let erased: LocalHandler = Arc::new(
            move |message: &(dyn Any + Send + Sync), metadata: &MessageMetadata| {
                message
                    .downcast_ref::<T>()
                    .map(|typed| handler(typed, metadata))
            },
        );

        self.handlers
            .entry(pattern.to_string())
            .or_default()
            .push(erased);
        debug!(pattern, message_type = T::message_type(), "local subscription added");
    }

    pub fn unsubscribe(&self, pattern: &str) {
        self.handlers.remove(pattern);
    }

    pub fn has_subscribers(&self, topic: &str) -> bool {
        self.handlers
            .iter()
            .any(|entry| topic_matches(entry.key(), topic))
    }

    /// Deliver one message to every matching local handler.
    ///
    /// Returns the number of handler invocations. Topics without local
    /// subscribers are skipped before decoding, so unregistered types only
    /// fail when somebody is actually listening.
    pub fn publish(
        &self,
        topic: &str,
        message_type: &str,
        payload: &str,
        metadata: &MessageMetadata,
    ) -> Result<usize, BrokerError> {
        let matching: Vec<LocalHandler> = self
            .handlers
            .iter()
            .filter(|entry| topic_matches(entry.key(), topic))
            .flat_map(|entry| entry.value().clone())
            .collect();

        if matching.is_empty() {
            return Ok(0);
        }

        let messages = self.registry.decode(message_type, payload)?;

        let mut delivered = 0;
        for message in &messages {
            for handler in &matching {
                match handler(&**message, metadata) {
                    Some(true) => delivered += 1,
                    Some(false) => {
                        delivered += 1;
                        warn!(topic, message_type, "local handler reported failure");
                    }
                    // handler registered for another type on the same pattern
                    None => {}
                }
            }
        }

        Ok(delivered)
    }
}

/// Exact match, or per-segment `*` wildcard match.
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    if pattern == topic {
        return true;
    }
    if !pattern.contains('*') {
        return false;
    }

    let pattern_parts: Vec<&str> = pattern.split('.').collect();
    let topic_parts: Vec<&str> = topic.split('.').collect();

    pattern_parts.len() == topic_parts.len()
        && pattern_parts
            .iter()
            .zip(&topic_parts)
            .all(|(p, t)| *p == "*" || p == t)
}

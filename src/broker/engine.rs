//! Broker engine
//!
//! `BrokerState` is the bookkeeping behind the hub:
//! - which connection belongs to which service (`registerService`)
//! - which connections are subscribed to which topic (`subscribeToTopic`)
//! - fan-out of published messages to every subscriber of a topic
//! - best-effort hand-off of each message to the in-process [`LocalBus`]
//!
//! Concurrency and usage notes:
//! - One `BrokerState` is created by the process's composition root and shared
//!   as `Arc<BrokerState>` with the transport. All maps are `DashMap`s, so the
//!   public API takes `&self` and never needs an outer lock.
//! - Per-topic read-modify-write goes through `entry`/`retain`/`remove_if_mut`,
//!   which hold the shard lock for the whole update. A topic is never left in
//!   the map with an empty subscriber set.
//! - Nothing here writes to sockets. Frames are serialized once and pushed to
//!   each connection's channel; the transport's writer task does the I/O.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, error, info, warn};
use tungstenite::protocol::Message as WsMessage;

use crate::broker::connection::Connection;
use crate::broker::local_bus::LocalBus;
use crate::broker::message::{Envelope, MessageMetadata};
use crate::broker::topic::{ConnectionId, Topic};
use crate::transport::message::ServerMessage;
use crate::utils::error::BrokerError;

/// Name logged for connections that never called `registerService`.
pub const UNKNOWN_SERVICE: &str = "unknown";

pub struct BrokerState {
    connections: DashMap<ConnectionId, Connection>,
    services: DashMap<ConnectionId, String>,
    topics: DashMap<String, Topic>,
    local_bus: Arc<LocalBus>,
    max_connections: usize,
}

impl Default for BrokerState {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for BrokerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerState")
            .field("connections", &self.connections.len())
            .field("services", &self.services.len())
            .field("topics", &self.topics.len())
            .field("max_connections", &self.max_connections)
            .finish()
    }
}

impl BrokerState {
    pub fn new() -> Self {
        Self::new_with_local_bus(Arc::new(LocalBus::new()))
    }

    pub fn new_with_local_bus(local_bus: Arc<LocalBus>) -> Self {
        Self {
            connections: DashMap::new(),
            services: DashMap::new(),
            topics: DashMap::new(),
            local_bus,
            max_connections: usize::MAX,
        }
    }

    pub fn with_max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections;
        self
    }

    pub fn local_bus(&self) -> &Arc<LocalBus> {
        &self.local_bus
    }

    /// Track a freshly connected client. Returns `false` when the broker is
    /// at its connection limit; the caller is expected to drop the socket.
    ///
    /// The limit check is not atomic with the insert, so concurrent handshakes
    /// may overshoot it slightly.
    pub fn attach(&self, connection: Connection) -> bool {
        if self.connections.len() >= self.max_connections {
            warn!(
                connection_id = %connection.id,
                max = self.max_connections,
                "connection refused, broker at capacity"
            );
            return false;
        }

        info!(connection_id = %connection.id, "client connected");
        self.connections.insert(connection.id.clone(), connection);
        true
    }

    /// Forget a closed connection: its registration and every subscription.
    /// Topics left without subscribers are removed.
    pub fn detach(&self, connection_id: &str) -> Option<String> {
        let service_name = self.services.remove(connection_id).map(|(_, name)| name);
        self.connections.remove(connection_id);

        self.topics.retain(|topic, subscribers| {
            subscribers.unsubscribe(connection_id);
            if subscribers.is_empty() {
                debug!(topic, "removing topic without subscribers");
            }
            !subscribers.is_empty()
        });

        warn!(
            service = service_name.as_deref().unwrap_or(UNKNOWN_SERVICE),
            connection_id, "client disconnected"
        );
        service_name
    }

    /// Associate `connection_id` with `service_name`, replacing any earlier
    /// name for the same connection. Acknowledges with `onServiceRegistered`.
    pub fn register_service(&self, connection_id: &str, service_name: &str) -> Option<String> {
        let previous = self
            .services
            .insert(connection_id.to_string(), service_name.to_string());

        match &previous {
            Some(old) if old != service_name => {
                info!(connection_id, old, service = service_name, "service re-registered under a new name")
            }
            _ => info!(connection_id, service = service_name, "service registered"),
        }

        self.notify_or_log(
            connection_id,
            &ServerMessage::ServiceRegistered {
                service_name: service_name.to_string(),
            },
        );
        previous
    }

    /// Add the connection to `topic`'s subscriber set, creating the topic on
    /// first use. Acknowledges with `onTopicSubscribed`.
    pub fn subscribe(&self, connection_id: &str, topic: &str) -> usize {
        let count = {
            let mut entry = self
                .topics
                .entry(topic.to_string())
                .or_insert_with(|| Topic::new(topic));
            entry.subscribe(connection_id.to_string());
            entry.subscribers.len()
        };

        info!(
            service = %self.service_name_or_unknown(connection_id),
            topic,
            subscribers = count,
            "subscribed to topic"
        );

        self.notify_or_log(
            connection_id,
            &ServerMessage::TopicSubscribed {
                topic: topic.to_string(),
            },
        );
        count
    }

    /// Remove the connection from `topic`; drops the topic once empty.
    pub fn unsubscribe(&self, connection_id: &str, topic: &str) {
        let removed = self.topics.remove_if_mut(topic, |_, subscribers| {
            subscribers.unsubscribe(connection_id);
            subscribers.is_empty()
        });

        if removed.is_some() {
            debug!(topic, "removing topic without subscribers");
        }
        info!(
            service = %self.service_name_or_unknown(connection_id),
            topic, "unsubscribed from topic"
        );
    }

    /// Publish one message on behalf of `connection_id`.
    ///
    /// Local delivery comes first and can never abort the broadcast. Returns
    /// the number of subscriber connections the frame was queued for. On
    /// failure the caller also receives `onPublishFailed`.
    pub fn publish(&self, connection_id: &str, envelope: Envelope) -> Result<usize, BrokerError> {
        let service_name = self.service_name_or_unknown(connection_id);
        let Envelope {
            topic,
            message_type,
            message_payload,
            metadata,
        } = envelope;
        let metadata = metadata.unwrap_or_else(|| MessageMetadata::new(service_name.clone()));

        info!(
            service = %service_name,
            topic,
            message_type = short_type_name(&message_type),
            "publishing message"
        );

        self.deliver_locally(&topic, &message_type, &message_payload, &metadata);

        let frame = ServerMessage::MessageReceived {
            topic: topic.clone(),
            message_type,
            message_payload,
            metadata,
        };

        match self.broadcast(&topic, &frame) {
            Ok(count) => {
                info!(topic, subscribers = count, "message broadcast");
                Ok(count)
            }
            Err(e) => {
                error!(topic, error = %e, "failed to publish");
                self.notify_or_log(
                    connection_id,
                    &ServerMessage::PublishFailed {
                        topic: topic.clone(),
                        error: e.to_string(),
                    },
                );
                Err(e)
            }
        }
    }

    /// Tell a client that its invocation has finished.
    pub fn complete(&self, connection_id: &str, invocation_id: String, error: Option<String>) {
        self.notify_or_log(
            connection_id,
            &ServerMessage::Completion {
                invocation_id,
                error,
            },
        );
    }

    /// Send one frame to one connection.
    pub fn notify(&self, connection_id: &str, frame: &ServerMessage) -> Result<(), BrokerError> {
        let text = serde_json::to_string(frame)?;
        let connection = self
            .connections
            .get(connection_id)
            .ok_or_else(|| BrokerError::UnknownConnection(connection_id.to_string()))?;

        if !connection.send(WsMessage::text(text)) {
            debug!(connection_id, "writer gone, frame dropped");
        }
        Ok(())
    }

    /// Ask the transport to close one connection. Cleanup happens when the
    /// socket actually closes.
    pub fn close_connection(&self, connection_id: &str) -> bool {
        match self.connections.get(connection_id) {
            Some(connection) => connection.send(WsMessage::Close(None)),
            None => false,
        }
    }

    /// Close every connection, e.g. on shutdown. Returns how many were asked.
    pub fn close_all(&self) -> usize {
        self.connections
            .iter()
            .filter(|connection| connection.send(WsMessage::Close(None)))
            .count()
    }

    pub fn service_name(&self, connection_id: &str) -> Option<String> {
        self.services.get(connection_id).map(|name| name.value().clone())
    }

    pub fn connections_for_service(&self, service_name: &str) -> Vec<ConnectionId> {
        self.services
            .iter()
            .filter(|entry| entry.value() == service_name)
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub fn subscribers(&self, topic: &str) -> Vec<ConnectionId> {
        self.topics
            .get(topic)
            .map(|t| t.subscribers.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn has_topic(&self, topic: &str) -> bool {
        self.topics.contains_key(topic)
    }

    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    fn service_name_or_unknown(&self, connection_id: &str) -> String {
        self.service_name(connection_id)
            .unwrap_or_else(|| UNKNOWN_SERVICE.to_string())
    }

    fn deliver_locally(&self, topic: &str, message_type: &str, payload: &str, metadata: &MessageMetadata) {
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            self.local_bus.publish(topic, message_type, payload, metadata)
        }));

        match outcome {
            Ok(Ok(0)) => {}
            Ok(Ok(delivered)) => debug!(topic, delivered, "published to local bus"),
            Ok(Err(e)) => warn!(topic, error = %e, "failed to publish to local bus (non-critical)"),
            Err(_) => warn!(topic, "local handler panicked (non-critical)"),
        }
    }

    fn broadcast(&self, topic: &str, frame: &ServerMessage) -> Result<usize, BrokerError> {
        // snapshot so the topic's shard lock is not held while sending
        let subscribers = self.subscribers(topic);
        if subscribers.is_empty() {
            return Ok(0);
        }

        let message = WsMessage::text(serde_json::to_string(frame)?);

        let mut delivered = 0;
        for subscriber in &subscribers {
            match self.connections.get(subscriber) {
                Some(connection) if connection.send(message.clone()) => delivered += 1,
                Some(_) => warn!(topic, connection_id = %subscriber, "subscriber writer gone"),
                None => warn!(topic, connection_id = %subscriber, "no connection for subscriber"),
            }
        }
        Ok(delivered)
    }

    /// [`notify`](Self::notify), logging a failure instead of returning it.
    pub(crate) fn notify_or_log(&self, connection_id: &str, frame: &ServerMessage) {
        if let Err(e) = self.notify(connection_id, frame) {
            warn!(connection_id, error = %e, "failed to notify client");
        }
    }
}

/// Last path segment of a type identifier, for logs.
fn short_type_name(message_type: &str) -> &str {
    message_type.rsplit("::").next().unwrap_or(message_type)
}

//! Message publisher.
//!
//! Publishes typed messages through the broker under this process's service
//! name. Every publish reports its outcome as a [`PublishResult`]; errors are
//! logged and never returned.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::broker::message::{MessageMetadata, TypedMessage, batch_type};
use crate::client::connection::{BrokerConnection, ConnectionEvent, ConnectionObserver};
use crate::config::PublisherSettings;
use crate::transport::message::{ClientMessage, ServerMessage};
use crate::utils::error::ClientError;

/// Outcome of one publish call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    /// For batches: number of messages in the batch, not a delivery count.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscriber_count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PublishResult {
    pub fn ok(message_id: impl Into<String>) -> Self {
        Self {
            success: true,
            message_id: Some(message_id.into()),
            subscriber_count: None,
            error: None,
        }
    }

    pub fn ok_with_count(message_id: impl Into<String>, subscriber_count: usize) -> Self {
        Self {
            subscriber_count: Some(subscriber_count),
            ..Self::ok(message_id)
        }
    }

    pub fn fail(error: impl Into<String>) -> Self {
        Self {
            success: false,
            message_id: None,
            subscriber_count: None,
            error: Some(error.into()),
        }
    }
}

/// Registers the service on every (re)connect.
pub(crate) struct RegisterOnConnect {
    pub(crate) service_name: String,
}

#[async_trait]
impl ConnectionObserver for RegisterOnConnect {
    async fn on_connected(&self, connection: &BrokerConnection) -> Result<(), ClientError> {
        connection
            .invoke_unchecked(ClientMessage::RegisterService {
                service_name: self.service_name.clone(),
            })
            .await?;
        info!(service = %self.service_name, "registered with broker");
        Ok(())
    }
}

pub struct MessagePublisher {
    connection: BrokerConnection,
    service_name: String,
    connect_lock: Mutex<()>,
}

impl MessagePublisher {
    pub fn new(settings: &PublisherSettings) -> Self {
        let connection = BrokerConnection::with_options(
            settings.broker_url.clone(),
            settings.reconnect_delays(),
            settings.invocation_timeout(),
        );
        Self::with_connection(connection, settings.service_name.clone())
    }

    pub fn with_connection(connection: BrokerConnection, service_name: impl Into<String>) -> Self {
        let service_name = service_name.into();
        connection.add_observer(Arc::new(RegisterOnConnect {
            service_name: service_name.clone(),
        }));
        Self {
            connection,
            service_name,
            connect_lock: Mutex::new(()),
        }
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn connection(&self) -> &BrokerConnection {
        &self.connection
    }

    pub fn lifecycle(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.connection.lifecycle()
    }

    /// Broker frames such as `onPublishFailed`.
    pub fn events(&self) -> broadcast::Receiver<ServerMessage> {
        self.connection.frames()
    }

    /// Connect and register unless already connected.
    ///
    /// Fails fast while a background reconnect is running.
    pub async fn ensure_connected(&self) -> Result<(), ClientError> {
        if self.connection.state().ready()? {
            return Ok(());
        }

        let _guard = self.connect_lock.lock().await;
        if self.connection.state().ready()? {
            return Ok(());
        }
        self.connection.start().await
    }

    pub async fn publish<T: TypedMessage>(
        &self,
        message: &T,
        topic: &str,
        metadata: Option<MessageMetadata>,
    ) -> PublishResult {
        let payload = match serde_json::to_string(message) {
            Ok(payload) => payload,
            Err(e) => {
                error!(topic, error = %e, "failed to serialize message");
                return PublishResult::fail(e.to_string());
            }
        };

        match self
            .send(topic, T::message_type().to_string(), payload, metadata)
            .await
        {
            Ok(()) => PublishResult::ok(Uuid::new_v4().to_string()),
            Err(e) => PublishResult::fail(e.to_string()),
        }
    }

    /// Publish a list of messages as one payload typed `T[]`.
    pub async fn publish_batch<T: TypedMessage>(
        &self,
        messages: &[T],
        topic: &str,
        metadata: Option<MessageMetadata>,
    ) -> PublishResult {
        let payload = match serde_json::to_string(messages) {
            Ok(payload) => payload,
            Err(e) => {
                error!(topic, error = %e, "failed to serialize batch");
                return PublishResult::fail(e.to_string());
            }
        };

        match self
            .send(topic, batch_type(T::message_type()), payload, metadata)
            .await
        {
            Ok(()) => PublishResult::ok_with_count(Uuid::new_v4().to_string(), messages.len()),
            Err(e) => PublishResult::fail(e.to_string()),
        }
    }

    /// Publish an already serialized payload.
    pub async fn publish_raw(
        &self,
        topic: &str,
        message_type: &str,
        payload: String,
        metadata: Option<MessageMetadata>,
    ) -> PublishResult {
        match self
            .send(topic, message_type.to_string(), payload, metadata)
            .await
        {
            Ok(()) => PublishResult::ok(Uuid::new_v4().to_string()),
            Err(e) => PublishResult::fail(e.to_string()),
        }
    }

    /// Close the broker connection. Later publishes fail.
    pub fn close(&self) {
        self.connection.close();
    }

    async fn send(
        &self,
        topic: &str,
        message_type: String,
        message_payload: String,
        metadata: Option<MessageMetadata>,
    ) -> Result<(), ClientError> {
        let outcome = async {
            self.ensure_connected().await?;
            let metadata =
                metadata.unwrap_or_else(|| MessageMetadata::new(self.service_name.clone()));
            self.connection
                .invoke(ClientMessage::PublishMessage {
                    topic: topic.to_string(),
                    message_type,
                    message_payload,
                    metadata: Some(metadata),
                })
                .await
        }
        .await;

        match &outcome {
            Ok(()) => debug!(topic, "message published"),
            Err(e) => error!(topic, error = %e, "failed to publish message"),
        }
        outcome
    }
}

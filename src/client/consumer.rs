//! Message consumer.
//!
//! Typed handlers are registered per topic. Received payloads are decoded to
//! the handler's type; a decode error or a handler returning `false` is
//! logged and the next handler still runs.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::broker::message::MessageMetadata;
use crate::client::connection::{BrokerConnection, ConnectionObserver};
use crate::config::PublisherSettings;
use crate::transport::message::{ClientMessage, ServerMessage};
use crate::utils::error::ClientError;

type ConsumerHandler = Arc<
    dyn Fn(&str, MessageMetadata) -> Result<BoxFuture<'static, bool>, serde_json::Error>
        + Send
        + Sync,
>;

type Handlers = Arc<DashMap<String, Vec<ConsumerHandler>>>;

/// Registers the service, re-subscribes every topic with handlers and
/// dispatches `onMessageReceived` frames.
struct ConsumerHooks {
    service_name: String,
    handlers: Handlers,
}

#[async_trait]
impl ConnectionObserver for ConsumerHooks {
    async fn on_connected(&self, connection: &BrokerConnection) -> Result<(), ClientError> {
        connection
            .invoke_unchecked(ClientMessage::RegisterService {
                service_name: self.service_name.clone(),
            })
            .await?;
        info!(service = %self.service_name, "consumer registered with broker");

        let topics: Vec<String> = self.handlers.iter().map(|e| e.key().clone()).collect();
        for topic in topics {
            connection
                .invoke_unchecked(ClientMessage::SubscribeToTopic {
                    topic: topic.clone(),
                })
                .await?;
            info!(topic, "re-subscribed to topic");
        }
        Ok(())
    }

    async fn on_frame(&self, frame: &ServerMessage) {
        let ServerMessage::MessageReceived {
            topic,
            message_type,
            message_payload,
            metadata,
        } = frame
        else {
            return;
        };
        debug!(topic, message_type, "message received");

        // clone the list so no shard lock is held across handler awaits
        let handlers = match self.handlers.get(topic) {
            Some(handlers) => handlers.clone(),
            None => {
                warn!(topic, "no handlers for topic");
                return;
            }
        };

        for handler in handlers {
            match handler(message_payload.as_str(), metadata.clone()) {
                Ok(handled) => {
                    if !handled.await {
                        warn!(topic, message_type, "handler did not accept message");
                    }
                }
                Err(e) => error!(topic, message_type, error = %e, "failed to decode message"),
            }
        }
    }
}

pub struct MessageConsumer {
    connection: BrokerConnection,
    handlers: Handlers,
    connect_lock: Mutex<()>,
}

impl MessageConsumer {
    pub fn new(settings: &PublisherSettings) -> Self {
        let connection = BrokerConnection::with_options(
            settings.broker_url.clone(),
            settings.reconnect_delays(),
            settings.invocation_timeout(),
        );
        Self::with_connection(connection, settings.service_name.clone())
    }

    pub fn with_connection(connection: BrokerConnection, service_name: impl Into<String>) -> Self {
        let handlers: Handlers = Arc::new(DashMap::new());
        connection.add_observer(Arc::new(ConsumerHooks {
            service_name: service_name.into(),
            handlers: handlers.clone(),
        }));
        Self {
            connection,
            handlers,
            connect_lock: Mutex::new(()),
        }
    }

    pub fn connection(&self) -> &BrokerConnection {
        &self.connection
    }

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

    /// Handle every `T` published on `topic`. A batch published with
    /// `publish_batch` is received as `Vec<T>`.
    pub async fn subscribe<T, F, Fut>(&self, topic: &str, handler: F) -> Result<(), ClientError>
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(T, MessageMetadata) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        self.ensure_connected().await?;

        let handler: ConsumerHandler = Arc::new(
            move |payload: &str,
                  metadata: MessageMetadata|
                  -> Result<BoxFuture<'static, bool>, serde_json::Error> {
                let message: T = serde_json::from_str(payload)?;
                Ok(handler(message, metadata).boxed())
            },
        );
        self.handlers
            .entry(topic.to_string())
            .or_default()
            .push(handler);

        self.connection
            .invoke(ClientMessage::SubscribeToTopic {
                topic: topic.to_string(),
            })
            .await?;
        info!(topic, message_type = std::any::type_name::<T>(), "subscribed to topic");
        Ok(())
    }

    /// Drop every handler of `topic` and stop receiving it.
    pub async fn unsubscribe(&self, topic: &str) -> Result<(), ClientError> {
        self.handlers.remove(topic);
        self.connection
            .invoke(ClientMessage::UnsubscribeFromTopic {
                topic: topic.to_string(),
            })
            .await
    }

    pub fn close(&self) {
        self.connection.close();
    }
}

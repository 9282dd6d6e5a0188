//! Wire protocol between the broker and its clients.
//!
//! Every frame is a JSON text message tagged by `type`. Client requests may
//! carry an `invocationId`; the broker answers those with a `completion`
//! frame once the operation has run.

use serde::{Deserialize, Serialize};

use crate::broker::message::MessageMetadata;

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    RegisterService {
        service_name: String,
    },
    SubscribeToTopic {
        topic: String,
    },
    UnsubscribeFromTopic {
        topic: String,
    },
    PublishMessage {
        topic: String,
        message_type: String,
        message_payload: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<MessageMetadata>,
    },
}

impl ClientMessage {
    /// Operation name used in logs and errors.
    pub fn operation(&self) -> &'static str {
        match self {
            ClientMessage::RegisterService { .. } => "registerService",
            ClientMessage::SubscribeToTopic { .. } => "subscribeToTopic",
            ClientMessage::UnsubscribeFromTopic { .. } => "unsubscribeFromTopic",
            ClientMessage::PublishMessage { .. } => "publishMessage",
        }
    }
}

/// A client request plus its optional invocation id.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Invocation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invocation_id: Option<String>,
    #[serde(flatten)]
    pub message: ClientMessage,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    #[serde(rename = "onServiceRegistered")]
    ServiceRegistered { service_name: String },

    #[serde(rename = "onTopicSubscribed")]
    TopicSubscribed { topic: String },

    #[serde(rename = "onMessageReceived")]
    MessageReceived {
        topic: String,
        message_type: String,
        message_payload: String,
        metadata: MessageMetadata,
    },

    #[serde(rename = "onPublishFailed")]
    PublishFailed { topic: String, error: String },

    #[serde(rename = "completion")]
    Completion {
        invocation_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    #[serde(rename = "error")]
    Error { message: String },
}

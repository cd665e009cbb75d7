use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::event::QueueName;

/// A delivery as seen by the dispatcher, detached from the broker types.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub body: Vec<u8>,
    pub message_id: Option<String>,
    pub redelivery_count: u32,
    pub published_at: Option<DateTime<Utc>>,
}

impl InboundMessage {
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            body: body.into(),
            message_id: None,
            redelivery_count: 0,
            published_at: None,
        }
    }

    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }

    pub fn with_redelivery_count(mut self, redelivery_count: u32) -> Self {
        self.redelivery_count = redelivery_count;
        self
    }
}

#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub queue: QueueName,
    pub body: Vec<u8>,
    pub message_id: String,
    pub published_at: DateTime<Utc>,
    pub redelivery_count: u32,
}

impl OutboundMessage {
    pub fn new(queue: QueueName, body: Vec<u8>, published_at: DateTime<Utc>) -> Self {
        Self {
            queue,
            body,
            message_id: Uuid::new_v4().to_string(),
            published_at,
            redelivery_count: 0,
        }
    }

    /// Copy of an inbound delivery scheduled for another attempt on the same queue.
    pub fn redelivery(queue: QueueName, message: &InboundMessage, attempt: u32) -> Self {
        Self {
            queue,
            body: message.body.clone(),
            message_id: message
                .message_id
                .clone()
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            published_at: message.published_at.unwrap_or_else(Utc::now),
            redelivery_count: attempt,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqMessage {
    pub queue: QueueName,
    pub message_id: Option<String>,
    pub body: String,
    pub failure_reason: String,
    pub redelivery_count: u32,
    pub failed_at: String,
}

impl DlqMessage {
    pub fn new(queue: QueueName, message: &InboundMessage, failure_reason: String) -> Self {
        Self {
            queue,
            message_id: message.message_id.clone(),
            body: String::from_utf8_lossy(&message.body).into_owned(),
            failure_reason,
            redelivery_count: message.redelivery_count,
            failed_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        }
    }
}

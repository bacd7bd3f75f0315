use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::error::{BrokerError, BrokerResult};

/// Header that carries the correlation ID of an async publish
pub const CORRELATION_HEADER: &str = "x-correlation-id";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishOptions {
    /// Partitioning key; a UUID is generated when absent or empty
    pub key: Option<String>,
    pub partition: Option<i32>,
    pub headers: HashMap<String, String>,
    pub disable_payload_logging: bool,
}

impl PublishOptions {
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_partition(mut self, partition: i32) -> Self {
        self.partition = Some(partition);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn without_payload_logging(mut self) -> Self {
        self.disable_payload_logging = true;
        self
    }
}

/// Outgoing message as handed to a transport
#[derive(Debug, Clone, PartialEq)]
pub struct ProducerMessage {
    pub topic: String,
    pub key: String,
    pub partition: Option<i32>,
    pub headers: HashMap<String, String>,
    pub payload: Bytes,
}

impl ProducerMessage {
    pub fn payload_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

/// Position assigned by the broker to a delivered message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub partition: i32,
    pub offset: i64,
}

pub fn prepare(
    topic: &str,
    payload: impl Into<Bytes>,
    options: &PublishOptions,
) -> BrokerResult<ProducerMessage> {
    if topic.is_empty() {
        return Err(BrokerError::EmptyTopic);
    }
    let payload = payload.into();
    if payload.is_empty() {
        return Err(BrokerError::NoPayload);
    }

    let key = match options.key.as_deref() {
        Some(key) if !key.is_empty() => key.to_string(),
        _ => Uuid::new_v4().to_string(),
    };

    Ok(ProducerMessage {
        topic: topic.to_string(),
        key,
        partition: options.partition,
        headers: options.headers.clone(),
        payload,
    })
}

/// Correlation ID stamped on `message` at enqueue, if any
pub fn correlation_id(message: &ProducerMessage) -> Option<&str> {
    message
        .headers
        .get(CORRELATION_HEADER)
        .map(String::as_str)
        .filter(|id| !id.is_empty())
}

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Position of a message in an ordered partition
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: String,
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]@{}", self.topic, self.partition, self.offset)
    }
}

/// Inbound message handed to a consume handler
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub id: MessageId,
    pub payload: Bytes,
    pub headers: HashMap<String, String>,
}

impl Envelope {
    pub fn new(id: MessageId, payload: impl Into<Bytes>) -> Self {
        Self {
            id,
            payload: payload.into(),
            headers: HashMap::new(),
        }
    }

    /// Build from raw client fields. Keys and header bytes are decoded lossily;
    /// a repeated header name keeps its last value.
    pub fn from_raw<I, K, V>(
        topic: impl Into<String>,
        partition: i32,
        offset: i64,
        key: Option<&[u8]>,
        payload: impl Into<Bytes>,
        headers: I,
    ) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<[u8]>,
        V: AsRef<[u8]>,
    {
        let headers = headers
            .into_iter()
            .map(|(k, v)| {
                (
                    String::from_utf8_lossy(k.as_ref()).into_owned(),
                    String::from_utf8_lossy(v.as_ref()).into_owned(),
                )
            })
            .collect();

        Self {
            id: MessageId {
                topic: topic.into(),
                partition,
                offset,
                key: key
                    .map(|k| String::from_utf8_lossy(k).into_owned())
                    .unwrap_or_default(),
            },
            payload: payload.into(),
            headers,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn payload_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

//! Error types for broker plumbing

use thiserror::Error;

use crate::config::ConfigError;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("topic is empty")]
    EmptyTopic,

    #[error("no payload provided")]
    NoPayload,

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Transport closed: {0}")]
    TransportClosed(String),

    #[error("Commit failed for {topic}[{partition}] at offset {offset}: {reason}")]
    Commit {
        topic: String,
        partition: i32,
        offset: i64,
        reason: String,
    },

    #[error("Publish queue is full")]
    QueueFull,

    #[error("Producer listener has stopped")]
    ProducerClosed,

    #[error("Correlation ID already pending: {0}")]
    DuplicateCorrelation(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

impl BrokerError {
    /// Errors that end a processing loop rather than a single message.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            BrokerError::Transport(_)
                | BrokerError::TransportClosed(_)
                | BrokerError::Commit { .. }
                | BrokerError::Redis(_)
        )
    }
}

pub type BrokerResult<T> = Result<T, BrokerError>;

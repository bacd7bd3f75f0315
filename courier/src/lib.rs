//! Reliable message consumption and correlated async publishing for broker-backed services

// Re-export common dependencies
pub use anyhow;
pub use async_trait;
pub use bytes;
pub use tokio_util::sync::CancellationToken;
pub use tracing;

pub mod backoff;
pub mod commit;
pub mod config;
pub mod consumer;
pub mod envelope;
pub mod error;
pub mod observability;
pub mod producer;
pub mod pubsub;
pub mod report;

pub use backoff::BackoffPolicy;
pub use commit::{CommitRecord, CommitTracker, OffsetCommitter};
pub use config::{BrokerConfig, ConfigError, ConfigResult, IngressMode};
pub use consumer::{ConsumerGroup, MessageHandler, MessageSource, PartitionConsumer, RetryPipeline};
pub use envelope::{Envelope, MessageId};
pub use error::{BrokerError, BrokerResult};
pub use producer::{AsyncProducer, AsyncProducerListener, PublishOptions, SyncProducer};
pub use pubsub::{PubSubHandler, PubSubMessage, RedisPubSub, RedisSubscriber};
pub use report::{Disposition, LogReporter, MetricsReporter, ProcessOutcome, Reporter};

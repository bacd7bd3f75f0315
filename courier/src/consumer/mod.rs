//! Consume side: per-message retry pipeline and the per-partition group driver.

pub mod group;
pub mod pipeline;

pub use group::{ConsumerGroup, MessageSource, PartitionConsumer, PartitionSummary};
pub use pipeline::{MessageHandler, RetryPipeline};

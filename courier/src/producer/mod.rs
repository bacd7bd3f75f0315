//! Publish side: message preparation, sync and async producers.

pub mod async_producer;
pub mod message;
pub mod pending;
pub mod sync_producer;

pub use async_producer::{
    AsyncProducer, AsyncProducerListener, Delivered, DeliveryFailure, DeliveryTransport,
    TransportLink,
};
pub use message::{correlation_id, Position, ProducerMessage, PublishOptions, CORRELATION_HEADER};
pub use pending::{PendingEntry, PendingTable};
pub use sync_producer::{SyncProducer, SyncTransport};

//! Span constructors for consume, commit, enqueue and produce operations

use tracing::{field, Span};

use crate::envelope::MessageId;

pub const SYSTEM: &str = "kafka";

pub fn consume_span(client_id: &str, id: &MessageId) -> Span {
    tracing::info_span!(
        "kafka.consume",
        messaging.system = SYSTEM,
        messaging.client.id = %client_id,
        messaging.destination.name = %id.topic,
        messaging.destination.partition.id = id.partition,
        messaging.kafka.message.key = %id.key,
        messaging.kafka.offset = id.offset,
    )
}

pub fn commit_span(id: &MessageId) -> Span {
    tracing::debug_span!(
        "kafka.commit",
        messaging.system = SYSTEM,
        messaging.destination.name = %id.topic,
        messaging.destination.partition.id = id.partition,
        messaging.kafka.offset = id.offset,
    )
}

pub fn enqueue_span(client_id: &str, topic: &str, key: &str) -> Span {
    tracing::info_span!(
        "kafka.enqueue",
        messaging.system = SYSTEM,
        messaging.client.id = %client_id,
        messaging.destination.name = %topic,
        messaging.kafka.message.key = %key,
    )
}

/// Produce span whose partition, offset and error are filled in once the
/// transport reports an outcome.
pub fn produce_span(client_id: &str, topic: &str, key: &str, correlation_id: &str) -> Span {
    tracing::info_span!(
        "kafka.produce",
        messaging.system = SYSTEM,
        messaging.client.id = %client_id,
        messaging.destination.name = %topic,
        messaging.kafka.message.key = %key,
        messaging.message.id = %correlation_id,
        messaging.destination.partition.id = field::Empty,
        messaging.kafka.offset = field::Empty,
        error = field::Empty,
    )
}

pub fn record_delivery(span: &Span, partition: i32, offset: i64) {
    span.record("messaging.destination.partition.id", partition);
    span.record("messaging.kafka.offset", offset);
}

pub fn record_error(span: &Span, error: &dyn std::fmt::Display) {
    span.record("error", field::display(error));
}

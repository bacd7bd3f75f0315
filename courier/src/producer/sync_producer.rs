use async_trait::async_trait;
use bytes::Bytes;
use tracing::{info, Instrument};

use super::message::{self, Position, ProducerMessage, PublishOptions};
use crate::config::BrokerConfig;
use crate::error::BrokerResult;
use crate::observability::spans;

/// Round-trip send: resolves once the broker has stored the message
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SyncTransport: Send + Sync {
    async fn send(&self, message: ProducerMessage) -> BrokerResult<Position>;

    async fn close(&self) -> BrokerResult<()>;
}

pub struct SyncProducer<T> {
    transport: T,
    client_id: String,
    disable_payload_logging: bool,
}

impl<T: SyncTransport> SyncProducer<T> {
    pub fn new(config: &BrokerConfig, transport: T) -> BrokerResult<Self> {
        config.validate()?;
        let client_id = config.client_id();
        info!(client_id = %client_id, "SyncProducer initialized");

        Ok(Self {
            transport,
            client_id,
            disable_payload_logging: config.producer.disable_payload_logging,
        })
    }

    pub async fn send(
        &self,
        topic: &str,
        payload: impl Into<Bytes>,
        options: PublishOptions,
    ) -> BrokerResult<Position> {
        let message = message::prepare(topic, payload, &options)?;
        let span = spans::produce_span(&self.client_id, &message.topic, &message.key, "");
        let disable_payload_logging = options.disable_payload_logging || self.disable_payload_logging;

        async move {
            if disable_payload_logging {
                info!(topic = %message.topic, "[sync_producer] Sending message");
            } else {
                info!(
                    topic = %message.topic,
                    payload = %message.payload_str(),
                    "[sync_producer] Sending message"
                );
            }

            let topic = message.topic.clone();
            match self.transport.send(message).await {
                Ok(position) => {
                    spans::record_delivery(&tracing::Span::current(), position.partition, position.offset);
                    info!(
                        topic = %topic,
                        partition = position.partition,
                        offset = position.offset,
                        "[sync_producer] Send message success"
                    );
                    Ok(position)
                }
                Err(err) => {
                    spans::record_error(&tracing::Span::current(), &err);
                    Err(err)
                }
            }
        }
        .instrument(span)
        .await
    }

    pub async fn close(&self) -> BrokerResult<()> {
        self.transport.close().await
    }
}

//! Non-blocking publisher with correlated delivery outcomes.
//!
//! [`AsyncProducer`] only enqueues. A single [`AsyncProducerListener`] task owns
//! the table of pending publishes, hands messages to the transport and matches
//! each success or failure the transport reports back to its pending entry by
//! the `x-correlation-id` header.

use async_trait::async_trait;
use bytes::Bytes;
use std::future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument, Span};
use uuid::Uuid;

use super::message::{self, correlation_id, Position, ProducerMessage, PublishOptions, CORRELATION_HEADER};
use super::pending::PendingTable;
use crate::config::{BrokerConfig, IngressMode};
use crate::error::{BrokerError, BrokerResult};
use crate::observability::spans;
use crate::report::{PublishOutcome, Reporter};

/// Transport reported the message as stored
#[derive(Debug, Clone)]
pub struct Delivered {
    pub message: ProducerMessage,
    pub position: Position,
}

/// Transport gave up on the message
#[derive(Debug)]
pub struct DeliveryFailure {
    pub message: ProducerMessage,
    pub error: BrokerError,
}

/// Fire-and-forget hand-off to the broker client. Outcomes come back on the
/// channels of the owning [`TransportLink`].
#[async_trait]
pub trait DeliveryTransport: Send {
    async fn dispatch(&mut self, message: ProducerMessage) -> BrokerResult<()>;

    async fn close(&mut self) -> BrokerResult<()>;
}

pub struct TransportLink<T> {
    pub transport: T,
    pub successes: mpsc::Receiver<Delivered>,
    pub failures: mpsc::Receiver<DeliveryFailure>,
}

struct Enqueued {
    message: ProducerMessage,
    correlation_id: String,
}

struct PublishContext {
    span: Span,
    topic: String,
}

/// Cloneable enqueue handle
#[derive(Clone)]
pub struct AsyncProducer {
    queue: mpsc::Sender<Enqueued>,
    mode: IngressMode,
    client_id: Arc<str>,
    disable_payload_logging: bool,
}

impl AsyncProducer {
    /// Creates the enqueue handle and the listener that must be driven with
    /// [`AsyncProducerListener::listen`].
    pub fn new<T: DeliveryTransport>(
        config: &BrokerConfig,
        link: TransportLink<T>,
        reporter: Arc<dyn Reporter>,
    ) -> BrokerResult<(Self, AsyncProducerListener<T>)> {
        config.validate()?;
        let settings = &config.producer;
        let client_id: Arc<str> = config.client_id().into();

        info!(client_id = %client_id, "AsyncProducer initializing");

        let (tx, rx) = mpsc::channel(settings.ingress_capacity);
        let producer = Self {
            queue: tx,
            mode: settings.ingress_mode,
            client_id: client_id.clone(),
            disable_payload_logging: settings.disable_payload_logging,
        };
        let listener = AsyncProducerListener {
            queue: rx,
            link,
            pending: PendingTable::new(),
            pending_ttl: settings.pending_ttl(),
            reporter,
            client_id,
        };

        info!(
            ingress_mode = ?settings.ingress_mode,
            pending_ttl = ?settings.pending_ttl(),
            "AsyncProducer initialized"
        );

        Ok((producer, listener))
    }

    /// Enqueue a message and return its correlation ID.
    ///
    /// A caller-supplied `x-correlation-id` header is kept; otherwise a UUID is
    /// stamped. Returns once the message is in the ingress queue, not when it is
    /// delivered. A message still queued when the listener shuts down is dropped
    /// without a publish outcome.
    pub async fn publish(
        &self,
        topic: &str,
        payload: impl Into<Bytes>,
        options: PublishOptions,
    ) -> BrokerResult<String> {
        let mut message = message::prepare(topic, payload, &options)?;
        let correlation_id = match correlation_id(&message) {
            Some(id) => id.to_string(),
            None => Uuid::new_v4().to_string(),
        };
        message
            .headers
            .insert(CORRELATION_HEADER.to_string(), correlation_id.clone());

        let span = spans::enqueue_span(&self.client_id, &message.topic, &message.key);
        let disable_payload_logging = options.disable_payload_logging || self.disable_payload_logging;

        async move {
            if disable_payload_logging {
                info!(topic = %message.topic, "[async_producer] Enqueue message");
            } else {
                info!(
                    topic = %message.topic,
                    payload = %message.payload_str(),
                    "[async_producer] Enqueue message"
                );
            }

            let item = Enqueued {
                message,
                correlation_id: correlation_id.clone(),
            };
            match self.mode {
                IngressMode::Block => self
                    .queue
                    .send(item)
                    .await
                    .map_err(|_| BrokerError::ProducerClosed)?,
                IngressMode::FailFast => self.queue.try_send(item).map_err(|e| match e {
                    mpsc::error::TrySendError::Full(_) => BrokerError::QueueFull,
                    mpsc::error::TrySendError::Closed(_) => BrokerError::ProducerClosed,
                })?,
            }

            Ok(correlation_id)
        }
        .instrument(span)
        .await
    }
}

/// Owns the pending table; run exactly once.
pub struct AsyncProducerListener<T> {
    queue: mpsc::Receiver<Enqueued>,
    link: TransportLink<T>,
    pending: PendingTable<PublishContext>,
    pending_ttl: Option<Duration>,
    reporter: Arc<dyn Reporter>,
    client_id: Arc<str>,
}

impl<T: DeliveryTransport> AsyncProducerListener<T> {
    /// Drive publishes and outcomes until `cancel` fires.
    ///
    /// Pending publishes are not drained on shutdown, and messages still in the
    /// ingress queue are dropped. A closed outcome channel or a failed dispatch
    /// ends the loop with an error. The transport is closed on every exit.
    pub async fn listen(mut self, cancel: CancellationToken) -> BrokerResult<()> {
        let result = self.run(&cancel).await;

        info!("[async_producer] Closing listener....");
        self.queue.close();
        let mut dropped = 0usize;
        while let Ok(item) = self.queue.try_recv() {
            debug!(
                correlation_id = %item.correlation_id,
                "[async_producer] Dropping enqueued message at shutdown"
            );
            dropped += 1;
        }
        if dropped > 0 || !self.pending.is_empty() {
            warn!(
                pending = self.pending.len(),
                dropped,
                "[async_producer] Closing with publishes still awaiting an outcome"
            );
        }

        let closed = self.link.transport.close().await;
        match (result, closed) {
            (Ok(()), closed) => {
                closed?;
                info!("[async_producer] Listener closed");
                Ok(())
            }
            (Err(err), closed) => {
                if let Err(close_err) = closed {
                    error!(error = %close_err, "[async_producer] Closing transport failed");
                }
                Err(err)
            }
        }
    }

    async fn run(&mut self, cancel: &CancellationToken) -> BrokerResult<()> {
        let mut ttl_tick = self.pending_ttl.map(|ttl| {
            let mut interval = tokio::time::interval(ttl / 2);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });
        let mut accepting = true;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                delivered = self.link.successes.recv() => {
                    let delivered = delivered.ok_or_else(|| {
                        BrokerError::TransportClosed("success channel closed".to_string())
                    })?;
                    self.on_outcome(&delivered.message, Ok(delivered.position));
                }
                failure = self.link.failures.recv() => {
                    let failure = failure.ok_or_else(|| {
                        BrokerError::TransportClosed("failure channel closed".to_string())
                    })?;
                    self.on_outcome(&failure.message, Err(&failure.error));
                }
                queued = self.queue.recv(), if accepting => match queued {
                    Some(item) => self.on_enqueued(item).await?,
                    None => {
                        debug!("[async_producer] All producer handles dropped");
                        accepting = false;
                    }
                },
                _ = next_tick(&mut ttl_tick) => self.evict_expired(),
            }
        }
    }

    async fn on_enqueued(&mut self, item: Enqueued) -> BrokerResult<()> {
        let Enqueued {
            message,
            correlation_id,
        } = item;

        let span = spans::produce_span(&self.client_id, &message.topic, &message.key, &correlation_id);
        let context = PublishContext {
            span: span.clone(),
            topic: message.topic.clone(),
        };
        if let Err(err) = self.pending.insert(&correlation_id, Instant::now(), context) {
            self.reporter
                .published(&correlation_id, PublishOutcome::Rejected(&err));
            return Ok(());
        }

        info!(parent: &span, "[async_producer] Publish message");
        if let Err(err) = self.link.transport.dispatch(message).await {
            self.pending.resolve(&correlation_id);
            spans::record_error(&span, &err);
            self.reporter
                .published(&correlation_id, PublishOutcome::Failed(&err));
            return Err(err);
        }

        self.reporter.pending(self.pending.len());
        Ok(())
    }

    fn on_outcome(&mut self, message: &ProducerMessage, result: Result<Position, &BrokerError>) {
        let Some(id) = correlation_id(message) else {
            debug!(topic = %message.topic, "[async_producer] Outcome without correlation ID, skipping");
            return;
        };

        let Some(entry) = self.pending.resolve(id) else {
            self.reporter.published(id, PublishOutcome::Unmatched);
            return;
        };

        let span = &entry.context.span;
        let _guard = span.enter();
        match result {
            Ok(position) => {
                spans::record_delivery(span, position.partition, position.offset);
                self.reporter.published(
                    id,
                    PublishOutcome::Delivered {
                        partition: position.partition,
                        offset: position.offset,
                    },
                );
            }
            Err(err) => {
                spans::record_error(span, err);
                self.reporter.published(id, PublishOutcome::Failed(err));
            }
        }
        self.reporter.pending(self.pending.len());
    }

    fn evict_expired(&mut self) {
        let Some(ttl) = self.pending_ttl else {
            return;
        };
        let now = Instant::now();
        let expired = self.pending.evict_expired(now, ttl);
        if expired.is_empty() {
            return;
        }

        for entry in &expired {
            let age = now.saturating_duration_since(entry.enqueued_at);
            spans::record_error(&entry.context.span, &"expired without outcome");
            debug!(topic = %entry.context.topic, "[async_producer] Evicting pending publish");
            self.reporter
                .published(&entry.correlation_id, PublishOutcome::Expired { age });
        }
        self.reporter.pending(self.pending.len());
    }
}

async fn next_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => future::pending::<()>().await,
    }
}

//! Redis Pub/Sub publishing and subscription

use anyhow::anyhow;
use async_trait::async_trait;
use futures::{FutureExt, StreamExt};
use redis::AsyncCommands;
use serde::Serialize;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{ConfigError, RedisSettings};
use crate::consumer::pipeline::panic_message;
use crate::error::{BrokerError, BrokerResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubSubMessage {
    pub channel: String,
    /// Matching pattern for pattern subscriptions
    pub pattern: Option<String>,
    pub payload: String,
}

impl PubSubMessage {
    fn from_redis(msg: &redis::Msg) -> BrokerResult<Self> {
        Ok(Self {
            channel: msg.get_channel_name().to_string(),
            pattern: msg.get_pattern::<Option<String>>().unwrap_or(None),
            payload: msg.get_payload::<String>()?,
        })
    }
}

#[async_trait]
pub trait PubSubHandler: Send + Sync {
    async fn handle(&self, message: &PubSubMessage) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> PubSubHandler for F
where
    F: Fn(PubSubMessage) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, message: &PubSubMessage) -> anyhow::Result<()> {
        (self)(message.clone()).await
    }
}

/// Publisher and subscriber factory over one Redis client
#[derive(Clone)]
pub struct RedisPubSub {
    client: redis::Client,
}

impl RedisPubSub {
    pub fn new(client: redis::Client) -> Self {
        Self { client }
    }

    pub fn from_url(url: &str) -> BrokerResult<Self> {
        let client = redis::Client::open(url)?;
        Ok(Self { client })
    }

    pub fn from_settings(settings: &RedisSettings) -> BrokerResult<Self> {
        Self::from_url(&settings.url)
    }

    pub async fn publish(&self, channel: &str, payload: &[u8]) -> BrokerResult<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        conn.publish::<_, _, ()>(channel, payload).await?;

        info!(channel, "[redis_publisher] Published message");
        Ok(())
    }

    pub async fn publish_json<T: Serialize + Sync>(&self, channel: &str, value: &T) -> BrokerResult<()> {
        let payload = serde_json::to_vec(value)?;
        self.publish(channel, &payload).await
    }

    pub fn subscriber(
        &self,
        channels: Vec<String>,
        handler: Arc<dyn PubSubHandler>,
    ) -> BrokerResult<RedisSubscriber> {
        if channels.is_empty() {
            return Err(ConfigError::MissingField("redis.channels".to_string()).into());
        }
        info!(channels = ?channels, "Redis subscriber initializing");

        Ok(RedisSubscriber {
            client: self.client.clone(),
            channels,
            handler,
        })
    }
}

pub struct RedisSubscriber {
    client: redis::Client,
    channels: Vec<String>,
    handler: Arc<dyn PubSubHandler>,
}

impl RedisSubscriber {
    pub fn channels(&self) -> &[String] {
        &self.channels
    }

    /// Subscribe and hand each message to the handler until `cancel` fires.
    ///
    /// Handler failures are logged and not retried. The stream ending on the
    /// server side is returned as an error.
    pub async fn run(&self, cancel: CancellationToken) -> BrokerResult<()> {
        let mut pubsub = self.client.get_async_connection().await?.into_pubsub();
        for channel in &self.channels {
            pubsub.subscribe(channel.as_str()).await?;
        }
        info!(channels = ?self.channels, "[redis_subscriber] subscribed");

        let mut stream = pubsub.on_message();
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!(channels = ?self.channels, "[redis_subscriber] cancelled, closing");
                    break;
                }
                msg = stream.next() => {
                    let Some(msg) = msg else {
                        warn!(channels = ?self.channels, "[redis_subscriber] message stream was closed by the server");
                        return Err(BrokerError::TransportClosed(
                            "pub/sub stream closed by server".to_string(),
                        ));
                    };
                    match PubSubMessage::from_redis(&msg) {
                        Ok(message) => {
                            dispatch(self.handler.as_ref(), &message).await;
                        }
                        Err(e) => error!(error = %e, "[redis_subscriber] Failed to decode message payload"),
                    }
                }
            }
        }

        info!("[redis_subscriber] closed");
        Ok(())
    }
}

/// Run the handler once, containing panics. Returns whether it succeeded.
pub(crate) async fn dispatch(handler: &dyn PubSubHandler, message: &PubSubMessage) -> bool {
    info!(
        channel = %message.channel,
        payload = %message.payload,
        "[redis_subscriber] Received message"
    );

    let result = match AssertUnwindSafe(handler.handle(message)).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => {
            let reason = panic_message(panic.as_ref());
            error!(panic = %reason, "[redis_subscriber] Caught panic in handler");
            Err(anyhow!("panic: {}", reason))
        }
    };

    match result {
        Ok(()) => true,
        Err(e) => {
            error!(error = %e, channel = %message.channel, "[redis_subscriber] Handle message failed");
            false
        }
    }
}

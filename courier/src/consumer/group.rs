use async_trait::async_trait;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::pipeline::{MessageHandler, RetryPipeline};
use crate::backoff::BackoffPolicy;
use crate::commit::{CommitTracker, OffsetCommitter};
use crate::config::BrokerConfig;
use crate::envelope::Envelope;
use crate::error::{BrokerError, BrokerResult};
use crate::report::{Disposition, Reporter};

/// Ordered stream of messages for one claimed partition
#[async_trait]
pub trait MessageSource: Send {
    fn topic(&self) -> &str;

    fn partition(&self) -> i32;

    /// Next message, or `None` once the claim has ended (revoked or closed).
    async fn receive(&mut self) -> BrokerResult<Option<Envelope>>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionSummary {
    pub topic: String,
    pub partition: i32,
    pub processed: u64,
    pub succeeded: u64,
    pub gave_up: u64,
    pub abandoned: u64,
    pub last_committed: Option<i64>,
}

/// Drives one partition: each message is processed and committed before the next is read.
pub struct PartitionConsumer<S> {
    source: S,
    pipeline: Arc<RetryPipeline>,
    handler: Arc<dyn MessageHandler>,
}

impl<S: MessageSource> PartitionConsumer<S> {
    pub fn new(source: S, pipeline: Arc<RetryPipeline>, handler: Arc<dyn MessageHandler>) -> Self {
        Self {
            source,
            pipeline,
            handler,
        }
    }

    pub async fn run(mut self, cancel: CancellationToken) -> BrokerResult<PartitionSummary> {
        let mut summary = PartitionSummary {
            topic: self.source.topic().to_string(),
            partition: self.source.partition(),
            ..Default::default()
        };

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = self.source.receive() => next?,
            };
            let Some(envelope) = next else {
                info!(
                    topic = %summary.topic,
                    partition = summary.partition,
                    "[consumer] Claim ended"
                );
                break;
            };

            let outcome = self
                .pipeline
                .process(&envelope, self.handler.as_ref(), &cancel)
                .await?;

            summary.processed += 1;
            match outcome.disposition {
                Disposition::Succeeded => summary.succeeded += 1,
                Disposition::GaveUp => summary.gave_up += 1,
                Disposition::Abandoned => {
                    summary.abandoned += 1;
                    break;
                }
            }
            summary.last_committed = outcome.committed_offset.or(summary.last_committed);
        }

        Ok(summary)
    }
}

/// Consumer group member: one task per claimed partition, sharing a handler
/// and a retry pipeline.
pub struct ConsumerGroup {
    group_id: String,
    client_id: String,
    pipeline: Arc<RetryPipeline>,
    handler: Arc<dyn MessageHandler>,
}

impl ConsumerGroup {
    pub fn new(
        config: &BrokerConfig,
        committer: Arc<dyn OffsetCommitter>,
        reporter: Arc<dyn Reporter>,
        handler: Arc<dyn MessageHandler>,
    ) -> BrokerResult<Self> {
        config.validate()?;
        let policy = BackoffPolicy::new(&config.consumer.backoff)?;
        let client_id = config.client_id();

        let pipeline = RetryPipeline::new(policy, CommitTracker::new(committer), reporter)
            .with_client_id(client_id.clone())
            .with_payload_logging(!config.consumer.disable_payload_logging);

        info!(
            client_id = %client_id,
            group_id = %config.group_id(),
            max_attempts = config.consumer.backoff.max_attempts,
            "Consumer initialized"
        );

        Ok(Self {
            group_id: config.group_id().to_string(),
            client_id,
            pipeline: Arc::new(pipeline),
            handler,
        })
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    pub fn commits(&self) -> &CommitTracker {
        self.pipeline.commits()
    }

    /// Consume the given claims until they end or `cancel` fires.
    ///
    /// A fatal error on any partition stops the others and is returned once
    /// every partition task has finished.
    pub async fn consume<S>(
        &self,
        claims: Vec<S>,
        cancel: CancellationToken,
    ) -> BrokerResult<Vec<PartitionSummary>>
    where
        S: MessageSource + 'static,
    {
        let claimed: Vec<String> = claims
            .iter()
            .map(|c| format!("{}[{}]", c.topic(), c.partition()))
            .collect();
        info!(
            group_id = %self.group_id,
            client_id = %self.client_id,
            claims = ?claimed,
            "[consumer] ConsumerGroup ready"
        );

        let group_cancel = cancel.child_token();
        let mut tasks = JoinSet::new();
        for source in claims {
            let worker = PartitionConsumer::new(source, self.pipeline.clone(), self.handler.clone());
            tasks.spawn(worker.run(group_cancel.clone()));
        }

        let mut summaries = Vec::new();
        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            let result = joined.unwrap_or_else(|e| {
                Err(BrokerError::Transport(format!("partition task failed: {}", e)))
            });
            match result {
                Ok(summary) => summaries.push(summary),
                Err(e) => {
                    error!(error = %e, "[consumer] Partition consumer failed, stopping group");
                    group_cancel.cancel();
                    if first_error.is_none() {
                        first_error = Some(e);
                    } else {
                        warn!(error = %e, "[consumer] Additional partition failure");
                    }
                }
            }
        }

        info!(group_id = %self.group_id, "[consumer] Cleaning up");

        match first_error {
            Some(e) => Err(e),
            None => Ok(summaries),
        }
    }
}

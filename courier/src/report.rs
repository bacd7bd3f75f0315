//! Reporting hook for consume attempts and publish outcomes.
//!
//! Pipelines and producers call into a [`Reporter`] for every attempt and every
//! final result; logging and metrics are plugged in here instead of being
//! pulled out of ambient state.

use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::envelope::MessageId;
use crate::error::BrokerError;
use crate::observability::metrics::{metric_names, MetricsCollector};

/// Result of a single handler invocation
#[derive(Debug, Clone, Copy)]
pub enum AttemptOutcome<'a> {
    Succeeded,
    Failed(&'a anyhow::Error),
}

/// How the pipeline finished with a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Handler succeeded; offset committed
    Succeeded,
    /// Retries exhausted; offset committed anyway
    GaveUp,
    /// Cancelled during a backoff wait; nothing committed, message will be redelivered
    Abandoned,
}

#[derive(Debug)]
pub struct ProcessOutcome {
    pub attempts: u32,
    /// Last handler error, `None` when the final attempt succeeded
    pub error: Option<anyhow::Error>,
    pub disposition: Disposition,
    pub committed_offset: Option<i64>,
}

impl ProcessOutcome {
    pub fn is_success(&self) -> bool {
        self.disposition == Disposition::Succeeded
    }
}

/// Resolution of an asynchronous publish
#[derive(Debug, Clone, Copy)]
pub enum PublishOutcome<'a> {
    Delivered { partition: i32, offset: i64 },
    Failed(&'a BrokerError),
    /// No outcome arrived within the configured pending TTL
    Expired { age: Duration },
    /// Outcome for a correlation ID that is not pending
    Unmatched,
    /// Enqueued message rejected before reaching the transport
    Rejected(&'a BrokerError),
}

pub trait Reporter: Send + Sync {
    fn attempt(&self, id: &MessageId, attempt: u32, outcome: AttemptOutcome<'_>);

    fn completed(&self, id: &MessageId, outcome: &ProcessOutcome);

    fn published(&self, _correlation_id: &str, _outcome: PublishOutcome<'_>) {}

    /// Number of publishes awaiting an outcome
    fn pending(&self, _count: usize) {}
}

/// Logs every event through `tracing`
#[derive(Debug, Clone, Copy, Default)]
pub struct LogReporter;

impl Reporter for LogReporter {
    fn attempt(&self, id: &MessageId, attempt: u32, outcome: AttemptOutcome<'_>) {
        match outcome {
            AttemptOutcome::Succeeded => {
                info!(message = %id, attempt, "[consumer] Consuming attempt succeeded")
            }
            AttemptOutcome::Failed(err) => {
                error!(message = %id, attempt, error = %err, "[consumer] Consume message failed")
            }
        }
    }

    fn completed(&self, id: &MessageId, outcome: &ProcessOutcome) {
        match outcome.disposition {
            Disposition::Succeeded => info!(
                message = %id,
                attempts = outcome.attempts,
                "[consumer] Consumed"
            ),
            Disposition::GaveUp => warn!(
                message = %id,
                attempts = outcome.attempts,
                error = ?outcome.error,
                "[consumer] Giving up on processing; committing and moving on"
            ),
            Disposition::Abandoned => warn!(
                message = %id,
                attempts = outcome.attempts,
                "[consumer] Abandoned during shutdown; offset not committed"
            ),
        }
    }

    fn published(&self, correlation_id: &str, outcome: PublishOutcome<'_>) {
        match outcome {
            PublishOutcome::Delivered { partition, offset } => info!(
                correlation_id,
                partition, offset, "[async_producer] Send success"
            ),
            PublishOutcome::Failed(err) => {
                error!(correlation_id, error = %err, "[async_producer] Send error")
            }
            PublishOutcome::Expired { age } => warn!(
                correlation_id,
                age_ms = age.as_millis() as u64,
                "[async_producer] Pending publish expired without an outcome"
            ),
            PublishOutcome::Unmatched => warn!(
                correlation_id,
                "[async_producer] Outcome for unknown correlation ID, skipping"
            ),
            PublishOutcome::Rejected(err) => {
                error!(correlation_id, error = %err, "[async_producer] Publish rejected")
            }
        }
    }
}

/// Counts events into a [`MetricsCollector`], optionally forwarding to another reporter
#[derive(Clone)]
pub struct MetricsReporter {
    metrics: MetricsCollector,
    inner: Option<Arc<dyn Reporter>>,
}

impl MetricsReporter {
    pub fn new(metrics: MetricsCollector) -> Self {
        Self {
            metrics,
            inner: None,
        }
    }

    pub fn with_inner(mut self, inner: Arc<dyn Reporter>) -> Self {
        self.inner = Some(inner);
        self
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }
}

impl Reporter for MetricsReporter {
    fn attempt(&self, id: &MessageId, attempt: u32, outcome: AttemptOutcome<'_>) {
        self.metrics
            .increment_counter(metric_names::CONSUME_ATTEMPTS_TOTAL, 1);
        if let AttemptOutcome::Failed(_) = outcome {
            self.metrics
                .increment_counter(metric_names::CONSUME_ATTEMPT_FAILURES, 1);
        }
        if let Some(inner) = &self.inner {
            inner.attempt(id, attempt, outcome);
        }
    }

    fn completed(&self, id: &MessageId, outcome: &ProcessOutcome) {
        let name = match outcome.disposition {
            Disposition::Succeeded => metric_names::CONSUME_SUCCEEDED,
            Disposition::GaveUp => metric_names::CONSUME_GAVE_UP,
            Disposition::Abandoned => metric_names::CONSUME_ABANDONED,
        };
        self.metrics.increment_counter(name, 1);
        if let Some(inner) = &self.inner {
            inner.completed(id, outcome);
        }
    }

    fn published(&self, correlation_id: &str, outcome: PublishOutcome<'_>) {
        let name = match outcome {
            PublishOutcome::Delivered { .. } => metric_names::PUBLISH_DELIVERED,
            PublishOutcome::Failed(_) | PublishOutcome::Rejected(_) => {
                metric_names::PUBLISH_FAILED
            }
            PublishOutcome::Expired { .. } => metric_names::PUBLISH_EXPIRED,
            PublishOutcome::Unmatched => metric_names::PUBLISH_UNMATCHED,
        };
        self.metrics.increment_counter(name, 1);
        if let Some(inner) = &self.inner {
            inner.published(correlation_id, outcome);
        }
    }

    fn pending(&self, count: usize) {
        self.metrics
            .set_gauge(metric_names::PUBLISH_PENDING, count as u64);
        if let Some(inner) = &self.inner {
            inner.pending(count);
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn message_id() -> MessageId {
        MessageId {
            topic: "orders".to_string(),
            partition: 0,
            offset: 5,
            key: String::new(),
        }
    }

    #[test]
    fn test_metrics_reporter_counts() {
        let reporter = MetricsReporter::new(MetricsCollector::new());
        let err = anyhow::anyhow!("boom");

        reporter.attempt(&message_id(), 1, AttemptOutcome::Failed(&err));
        reporter.attempt(&message_id(), 2, AttemptOutcome::Succeeded);
        reporter.completed(
            &message_id(),
            &ProcessOutcome {
                attempts: 2,
                error: None,
                disposition: Disposition::Succeeded,
                committed_offset: Some(6),
            },
        );
        reporter.published("abc", PublishOutcome::Unmatched);
        reporter.pending(3);

        let metrics = reporter.metrics();
        assert_eq!(metrics.get_counter(metric_names::CONSUME_ATTEMPTS_TOTAL), Some(2));
        assert_eq!(metrics.get_counter(metric_names::CONSUME_ATTEMPT_FAILURES), Some(1));
        assert_eq!(metrics.get_counter(metric_names::CONSUME_SUCCEEDED), Some(1));
        assert_eq!(metrics.get_counter(metric_names::PUBLISH_UNMATCHED), Some(1));
        assert_eq!(metrics.get_gauge(metric_names::PUBLISH_PENDING), Some(3));
    }

    #[test]
    fn test_metrics_reporter_forwards() {
        let inner = Arc::new(testing::RecordingReporter::default());
        let reporter = MetricsReporter::new(MetricsCollector::new()).with_inner(inner.clone());

        reporter.attempt(&message_id(), 1, AttemptOutcome::Succeeded);
        reporter.published("abc", PublishOutcome::Delivered { partition: 1, offset: 2 });

        assert_eq!(
            inner.events(),
            vec![
                testing::Event::Attempt { offset: 5, attempt: 1, ok: true },
                testing::Event::Published {
                    correlation_id: "abc".to_string(),
                    kind: "delivered",
                },
            ]
        );
    }
}

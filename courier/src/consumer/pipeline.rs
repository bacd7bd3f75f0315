//! Retrying consumption: handler call, backoff, commit.

use anyhow::anyhow;
use async_trait::async_trait;
use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Instrument};

use crate::backoff::BackoffPolicy;
use crate::commit::CommitTracker;
use crate::envelope::Envelope;
use crate::error::BrokerResult;
use crate::observability::spans;
use crate::report::{AttemptOutcome, Disposition, ProcessOutcome, Reporter};

/// User code invoked once per delivery attempt
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, envelope: &Envelope) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> MessageHandler for F
where
    F: Fn(Envelope) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, envelope: &Envelope) -> anyhow::Result<()> {
        (self)(envelope.clone()).await
    }
}

pub struct RetryPipeline {
    policy: BackoffPolicy,
    commits: CommitTracker,
    reporter: Arc<dyn Reporter>,
    client_id: String,
    disable_payload_logging: bool,
}

impl RetryPipeline {
    pub fn new(policy: BackoffPolicy, commits: CommitTracker, reporter: Arc<dyn Reporter>) -> Self {
        Self {
            policy,
            commits,
            reporter,
            client_id: String::new(),
            disable_payload_logging: false,
        }
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    pub fn with_payload_logging(mut self, enabled: bool) -> Self {
        self.disable_payload_logging = !enabled;
        self
    }

    pub fn commits(&self) -> &CommitTracker {
        &self.commits
    }

    /// Run `handler` against `envelope` until it succeeds or the backoff policy
    /// is exhausted, then commit the next offset.
    ///
    /// Handler errors and panics never escape; they end up in the returned
    /// outcome. Only a failed commit is returned as an error. If `cancel` fires
    /// during a backoff wait the message is abandoned without a commit.
    pub async fn process(
        &self,
        envelope: &Envelope,
        handler: &dyn MessageHandler,
        cancel: &CancellationToken,
    ) -> BrokerResult<ProcessOutcome> {
        let span = spans::consume_span(&self.client_id, &envelope.id);
        self.run(envelope, handler, cancel).instrument(span).await
    }

    async fn run(
        &self,
        envelope: &Envelope,
        handler: &dyn MessageHandler,
        cancel: &CancellationToken,
    ) -> BrokerResult<ProcessOutcome> {
        let id = &envelope.id;

        if self.disable_payload_logging {
            info!(
                partition = id.partition,
                offset = id.offset,
                "[consumer] Consuming"
            );
        } else {
            info!(
                partition = id.partition,
                offset = id.offset,
                payload = %envelope.payload_str(),
                "[consumer] Consuming"
            );
        }

        let mut attempts = 0u32;
        let mut last_error: Option<anyhow::Error>;

        let disposition = loop {
            attempts += 1;
            info!(attempt = attempts, "[consumer] Consuming attempt");

            match invoke(handler, envelope).await {
                Ok(()) => {
                    self.reporter
                        .attempt(id, attempts, AttemptOutcome::Succeeded);
                    last_error = None;
                    break Disposition::Succeeded;
                }
                Err(err) => {
                    self.reporter
                        .attempt(id, attempts, AttemptOutcome::Failed(&err));
                    last_error = Some(err);

                    let Some(delay) = self.policy.next_delay(attempts) else {
                        break Disposition::GaveUp;
                    };
                    let delay = self.policy.jitter(delay);

                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break Disposition::Abandoned,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        };

        let committed_offset = match disposition {
            Disposition::Abandoned => None,
            Disposition::Succeeded | Disposition::GaveUp => {
                Some(self.commits.commit_position(id).await?)
            }
        };

        let outcome = ProcessOutcome {
            attempts,
            error: last_error,
            disposition,
            committed_offset,
        };
        self.reporter.completed(id, &outcome);

        Ok(outcome)
    }
}

async fn invoke(handler: &dyn MessageHandler, envelope: &Envelope) -> anyhow::Result<()> {
    match AssertUnwindSafe(handler.handle(envelope)).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            error!(panic = %message, "[consumer] Caught panic in handler");
            Err(anyhow!("panic: {}", message))
        }
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commit::{CommitRecord, OffsetCommitter};
    use crate::config::BackoffConfig;
    use crate::envelope::MessageId;
    use crate::report::testing::{Event, RecordingReporter};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingCommitter {
        records: Mutex<Vec<CommitRecord>>,
    }

    #[async_trait]
    impl OffsetCommitter for RecordingCommitter {
        async fn commit(&self, record: &CommitRecord) -> BrokerResult<()> {
            self.records.lock().push(record.clone());
            Ok(())
        }
    }

    /// Fails the first `failures` calls, panicking instead when `panic` is set.
    struct FlakyHandler {
        calls: AtomicU32,
        failures: u32,
        panic: bool,
    }

    impl FlakyHandler {
        fn new(failures: u32) -> Self {
            Self {
                calls: AtomicU32::new(0),
                failures,
                panic: false,
            }
        }

        fn panicking(failures: u32) -> Self {
            Self {
                panic: true,
                ..Self::new(failures)
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl MessageHandler for FlakyHandler {
        async fn handle(&self, _envelope: &Envelope) -> anyhow::Result<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.failures {
                if self.panic {
                    panic!("handler blew up on call {}", call);
                }
                return Err(anyhow!("failure #{}", call));
            }
            Ok(())
        }
    }

    struct Fixture {
        pipeline: RetryPipeline,
        committer: Arc<RecordingCommitter>,
        reporter: Arc<RecordingReporter>,
    }

    fn fixture(max_attempts: u32) -> Fixture {
        let policy = BackoffPolicy::new(&BackoffConfig {
            max_attempts,
            ..Default::default()
        })
        .unwrap();
        let committer = Arc::new(RecordingCommitter::default());
        let reporter = Arc::new(RecordingReporter::default());
        let pipeline = RetryPipeline::new(
            policy,
            CommitTracker::new(committer.clone()),
            reporter.clone(),
        )
        .with_client_id("courier.test");

        Fixture {
            pipeline,
            committer,
            reporter,
        }
    }

    fn envelope(offset: i64) -> Envelope {
        Envelope::new(
            MessageId {
                topic: "orders".to_string(),
                partition: 0,
                offset,
                key: "k1".to_string(),
            },
            "payload",
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_attempt_success() {
        let fx = fixture(5);
        let handler = FlakyHandler::new(0);

        let outcome = fx
            .pipeline
            .process(&envelope(10), &handler, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.attempts, 1);
        assert!(outcome.error.is_none());
        assert_eq!(outcome.disposition, Disposition::Succeeded);
        assert_eq!(outcome.committed_offset, Some(11));
        assert_eq!(fx.committer.records.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_eventual_success_commits_once() {
        let fx = fixture(5);
        let handler = FlakyHandler::new(3);

        let outcome = fx
            .pipeline
            .process(&envelope(41), &handler, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.attempts, 4);
        assert!(outcome.error.is_none());
        assert!(outcome.is_success());

        let records = fx.committer.records.lock();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].next_offset, 42);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_still_commits() {
        let fx = fixture(2);
        let handler = FlakyHandler::new(u32::MAX);

        let outcome = fx
            .pipeline
            .process(&envelope(7), &handler, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.attempts, 2);
        assert_eq!(handler.calls(), 2);
        assert_eq!(outcome.disposition, Disposition::GaveUp);
        assert_eq!(outcome.error.unwrap().to_string(), "failure #2");
        assert_eq!(outcome.committed_offset, Some(8));
        assert_eq!(fx.committer.records.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_cap_never_exceeded() {
        for max_attempts in 1..=6 {
            let fx = fixture(max_attempts);
            let handler = FlakyHandler::new(u32::MAX);

            let outcome = fx
                .pipeline
                .process(&envelope(0), &handler, &CancellationToken::new())
                .await
                .unwrap();

            assert_eq!(outcome.attempts, max_attempts);
            assert_eq!(handler.calls(), max_attempts);
            assert_eq!(fx.committer.records.lock().len(), 1);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_elapsed_bound_limits_attempts() {
        // 10s then 12.5s fit in 30s; the third wait would not.
        let policy = BackoffPolicy::new(&BackoffConfig {
            initial_interval_ms: 10_000,
            max_elapsed_seconds: 30,
            max_attempts: 100,
            ..Default::default()
        })
        .unwrap();
        let committer = Arc::new(RecordingCommitter::default());
        let pipeline = RetryPipeline::new(
            policy,
            CommitTracker::new(committer.clone()),
            Arc::new(RecordingReporter::default()),
        );
        let handler = FlakyHandler::new(u32::MAX);

        let outcome = pipeline
            .process(&envelope(0), &handler, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.disposition, Disposition::GaveUp);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_follow_schedule() {
        let fx = fixture(3);
        let handler = FlakyHandler::new(u32::MAX);
        let start = tokio::time::Instant::now();

        fx.pipeline
            .process(&envelope(0), &handler, &CancellationToken::new())
            .await
            .unwrap();

        // 5s + 6.25s between the three attempts
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(11_250));
        assert!(elapsed < Duration::from_millis(11_300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_panic_is_contained() {
        let fx = fixture(5);
        let handler = FlakyHandler::panicking(1);

        let outcome = fx
            .pipeline
            .process(&envelope(3), &handler, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.attempts, 2);
        assert!(outcome.error.is_none());
        assert_eq!(outcome.disposition, Disposition::Succeeded);
        assert_eq!(outcome.committed_offset, Some(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_panic_counts_toward_cap() {
        let fx = fixture(3);
        let handler = FlakyHandler::panicking(u32::MAX);

        let outcome = fx
            .pipeline
            .process(&envelope(3), &handler, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.disposition, Disposition::GaveUp);
        assert!(outcome
            .error
            .unwrap()
            .to_string()
            .starts_with("panic: handler blew up"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff_abandons() {
        let fx = fixture(10);
        let handler = Arc::new(FlakyHandler::new(u32::MAX));
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(7)).await;
            trigger.cancel();
        });

        let outcome = fx
            .pipeline
            .process(&envelope(5), handler.as_ref(), &cancel)
            .await
            .unwrap();

        // Attempt 1 at t=0, attempt 2 at t=5s, cancelled during the 6.25s wait.
        assert_eq!(outcome.attempts, 2);
        assert_eq!(outcome.disposition, Disposition::Abandoned);
        assert_eq!(outcome.committed_offset, None);
        assert!(fx.committer.records.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reporter_sees_every_attempt() {
        let fx = fixture(5);
        let handler = FlakyHandler::new(2);

        fx.pipeline
            .process(&envelope(9), &handler, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            fx.reporter.events(),
            vec![
                Event::Attempt { offset: 9, attempt: 1, ok: false },
                Event::Attempt { offset: 9, attempt: 2, ok: false },
                Event::Attempt { offset: 9, attempt: 3, ok: true },
                Event::Completed {
                    offset: 9,
                    attempts: 3,
                    disposition: Disposition::Succeeded,
                },
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_closure_handler() {
        let fx = fixture(2);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = seen.clone();
        let handler = move |envelope: Envelope| {
            let sink = sink.clone();
            async move {
                sink.lock().push(envelope.id.key.clone());
                Ok::<(), anyhow::Error>(())
            }
        };

        fx.pipeline
            .process(&envelope(1), &handler, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(*seen.lock(), vec!["k1".to_string()]);
    }
}

//! Offset commits after a message has been processed or given up on

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn, Instrument};

use crate::envelope::MessageId;
use crate::error::BrokerResult;
use crate::observability::spans;

/// Offset to persist for a processed message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitRecord {
    pub id: MessageId,
    pub next_offset: i64,
}

impl CommitRecord {
    /// Always the position after the processed message, so a restart resumes past it.
    pub fn for_message(id: &MessageId) -> Self {
        Self {
            id: id.clone(),
            next_offset: id.offset + 1,
        }
    }
}

/// Durable offset storage provided by the broker client
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait OffsetCommitter: Send + Sync {
    async fn commit(&self, record: &CommitRecord) -> BrokerResult<()>;
}

/// Computes and issues exactly one commit per processed message.
///
/// Callers drive one partition from one task, so commits for a partition are
/// never issued concurrently.
#[derive(Clone)]
pub struct CommitTracker {
    committer: Arc<dyn OffsetCommitter>,
    positions: Arc<Mutex<HashMap<(String, i32), i64>>>,
}

impl CommitTracker {
    pub fn new(committer: Arc<dyn OffsetCommitter>) -> Self {
        Self {
            committer,
            positions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn commit_position(&self, id: &MessageId) -> BrokerResult<i64> {
        let record = CommitRecord::for_message(id);

        async {
            info!(offset = record.next_offset, "[consumer] Committing offset");
            self.committer.commit(&record).await?;
            info!(offset = record.next_offset, "[consumer] Committing offset complete");
            Ok::<_, crate::error::BrokerError>(())
        }
        .instrument(spans::commit_span(id))
        .await?;

        let previous = self
            .positions
            .lock()
            .insert((id.topic.clone(), id.partition), record.next_offset);
        if let Some(previous) = previous {
            if previous > record.next_offset {
                warn!(
                    topic = %id.topic,
                    partition = id.partition,
                    previous,
                    committed = record.next_offset,
                    "[consumer] Committed offset moved backwards"
                );
            }
        }

        Ok(record.next_offset)
    }

    /// Last offset committed through this tracker for a partition
    pub fn committed(&self, topic: &str, partition: i32) -> Option<i64> {
        self.positions
            .lock()
            .get(&(topic.to_string(), partition))
            .copied()
    }
}

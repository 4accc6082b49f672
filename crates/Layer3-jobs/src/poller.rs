//! Incremental reader over a task's metadata and log segments

use crate::metadata::{MetadataStore, TaskMetadata};
use relay_foundation::{Result, TaskId};
use relay_task::{HighWaterMark, LogRecord};
use tracing::warn;

/// One poll result
#[derive(Debug)]
pub struct PollBatch {
    pub metadata: TaskMetadata,

    /// New records, in offset order
    pub records: Vec<LogRecord>,

    /// Every segment listed in `metadata` has been read
    pub caught_up: bool,
}

impl PollBatch {
    /// Terminal and nothing left to read
    pub fn is_final(&self) -> bool {
        self.caught_up && self.metadata.is_terminal()
    }
}

/// Remembers the next unread segment and the offset high-water-mark, so
/// repeated polls never return a record twice
pub struct LogPoller {
    store: MetadataStore,
    task_id: TaskId,
    next_segment: u64,
    mark: HighWaterMark,
}

impl LogPoller {
    pub fn new(store: MetadataStore, task_id: TaskId) -> Self {
        Self {
            store,
            task_id,
            next_segment: 0,
            mark: HighWaterMark::new(),
        }
    }

    pub fn next_segment(&self) -> u64 {
        self.next_segment
    }

    pub fn high_water_mark(&self) -> u64 {
        self.mark.offset()
    }

    pub async fn poll(&mut self) -> Result<PollBatch> {
        let metadata = self.store.load(&self.task_id).await?;
        let mut records = Vec::new();
        let mut caught_up = true;

        while self.next_segment < metadata.log_segments {
            match self.store.read_segment(&self.task_id, self.next_segment).await {
                Ok(segment) => {
                    records.extend(self.mark.filter(segment));
                    self.next_segment += 1;
                }
                Err(e) => {
                    // retried on the next poll
                    warn!(task_id = %self.task_id, seq = self.next_segment, error = %e, "Log segment unreadable");
                    caught_up = false;
                    break;
                }
            }
        }

        Ok(PollBatch {
            metadata,
            records,
            caught_up,
        })
    }
}

//! Remote side of an offloaded task
//!
//! The worker is the single writer of a task's `metadata.json` and logs.
//! Records are batched into segments; each flush writes the segment and then
//! bumps `logSegments`. An outcome the orchestrator settled in the meantime
//! still wins when the worker reports back.

use crate::crypto::EnvelopeCipher;
use crate::inline::InlineExecutor;
use crate::metadata::{MetadataStore, TaskMetadata};
use async_trait::async_trait;
use relay_foundation::{Error, JobsConfig, Payload, Result, TaskId};
use relay_task::{EventSink, LogRecord, StreamEvent, TaskOutcome};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

/// Batching and polling knobs
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub segment_max_records: usize,
    pub flush_interval: Duration,
    pub cancel_poll_interval: Duration,
}

impl WorkerSettings {
    pub fn from_config(config: &JobsConfig) -> Self {
        Self {
            segment_max_records: config.segment_max_records.max(1),
            flush_interval: Duration::from_millis(config.segment_flush_ms),
            cancel_poll_interval: Duration::from_millis(config.poll_interval_ms),
        }
    }
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self::from_config(&JobsConfig::default())
    }
}

pub struct JobWorker {
    store: MetadataStore,
    cipher: EnvelopeCipher,
    executor: InlineExecutor,
    settings: WorkerSettings,
}

impl JobWorker {
    pub fn new(
        store: MetadataStore,
        cipher: EnvelopeCipher,
        executor: InlineExecutor,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            store,
            cipher,
            executor,
            settings,
        }
    }

    /// Run one task to a terminal state
    ///
    /// `stop` flips to true when the hosting process is asked to shut down;
    /// it is treated like a cancel request.
    pub async fn run(
        &self,
        task_id: &TaskId,
        payload_path: &str,
        mut stop: watch::Receiver<bool>,
    ) -> Result<TaskOutcome> {
        let metadata = self.store.load(task_id).await?;
        if let Some(outcome) = metadata.outcome() {
            info!(task_id = %task_id, status = %metadata.status, "Task already terminal, not running");
            return Ok(outcome);
        }
        if self.store.cancel_requested(task_id).await? || *stop.borrow() {
            return self.finish(task_id, TaskOutcome::cancelled(task_id.clone())).await;
        }

        self.store
            .update(task_id, |m| m.start(format!("pid:{}", std::process::id())))
            .await?;
        info!(task_id = %task_id, "Worker running task");

        let payload = match self.open_payload(task_id, payload_path).await {
            Ok(payload) => payload,
            Err(e) => {
                error!(task_id = %task_id, error = %e, "Cannot open payload");
                let outcome =
                    TaskOutcome::failed(task_id.clone(), None, e.to_string()).with_kind(e.kind());
                self.finish(task_id, outcome).await?;
                return Err(e);
            }
        };

        let sink = Arc::new(SegmentSink::new(
            self.store.clone(),
            task_id.clone(),
            self.settings.segment_max_records,
        ));

        let flusher = {
            let sink = Arc::clone(&sink);
            let every = self.settings.flush_interval;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(every);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    if let Err(e) = sink.flush().await {
                        warn!(error = %e, "Periodic log flush failed");
                    }
                }
            })
        };

        let watcher = {
            let store = self.store.clone();
            let registry = Arc::clone(self.executor.registry());
            let id = task_id.clone();
            let every = self.settings.cancel_poll_interval;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(every);
                let mut stop_open = true;
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            match store.cancel_requested(&id).await {
                                Ok(true) => break,
                                Ok(false) => {}
                                Err(e) => debug!(task_id = %id, error = %e, "Cancel marker check failed"),
                            }
                        }
                        changed = stop.changed(), if stop_open => match changed {
                            Ok(()) if *stop.borrow() => break,
                            Ok(()) => {}
                            Err(_) => stop_open = false,
                        },
                    }
                }
                // the agent may not be registered yet
                loop {
                    match registry.cancel_task(&id).await {
                        Ok(outcome) if outcome.is_success() => break,
                        Ok(_) => tokio::time::sleep(Duration::from_millis(50)).await,
                        Err(e) => {
                            warn!(task_id = %id, error = %e, "Local cancel failed");
                            tokio::time::sleep(Duration::from_millis(50)).await;
                        }
                    }
                }
                info!(task_id = %id, "Cancel request applied");
            })
        };

        let dyn_sink: Arc<dyn EventSink> = sink.clone();
        let result = self.executor.run(&payload, dyn_sink).await;

        watcher.abort();
        flusher.abort();
        if let Err(e) = sink.flush().await {
            warn!(task_id = %task_id, error = %e, "Final log flush failed");
        }

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(task_id = %task_id, error = %e, "Inline run failed to start");
                TaskOutcome::failed(task_id.clone(), None, e.to_string()).with_kind(e.kind())
            }
        };
        self.finish(task_id, outcome).await
    }

    async fn open_payload(&self, task_id: &TaskId, path: &str) -> Result<Payload> {
        let envelope = self.store.get_payload(path).await?;
        self.cipher.decrypt(task_id, &envelope).await
    }

    /// Write the terminal state unless one is already recorded
    ///
    /// Returns the outcome in force, which is the settled one if the
    /// orchestrator gave up on the task first.
    async fn finish(&self, task_id: &TaskId, outcome: TaskOutcome) -> Result<TaskOutcome> {
        let saved: TaskMetadata = self
            .store
            .update(task_id, |m| {
                if !m.is_terminal() {
                    m.finish(&outcome)?;
                }
                Ok(())
            })
            .await?;
        let view = self.store.load(task_id).await?;
        if view.status != saved.status {
            warn!(task_id = %task_id, ran = %saved.status, settled = %view.status, "Outcome already settled");
        }
        info!(task_id = %task_id, status = %view.status, segments = view.log_segments, "Task finished");
        view.outcome()
            .ok_or_else(|| Error::Internal(format!("task {} did not reach a terminal state", task_id)))
    }
}

// ============================================================================
// Segment sink
// ============================================================================

struct SegmentState {
    pending: Vec<LogRecord>,
    next_seq: u64,
}

/// Buffers records and writes them as numbered segments
pub struct SegmentSink {
    store: MetadataStore,
    task_id: TaskId,
    max_records: usize,
    state: Mutex<SegmentState>,
}

impl SegmentSink {
    pub fn new(store: MetadataStore, task_id: TaskId, max_records: usize) -> Self {
        Self {
            store,
            task_id,
            max_records: max_records.max(1),
            state: Mutex::new(SegmentState {
                pending: Vec::new(),
                next_seq: 0,
            }),
        }
    }

    /// Write buffered records as the next segment
    pub async fn flush(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        self.flush_locked(&mut state).await
    }

    async fn flush_locked(&self, state: &mut SegmentState) -> Result<()> {
        if state.pending.is_empty() {
            return Ok(());
        }
        let seq = state.next_seq;
        self.store
            .write_segment(&self.task_id, seq, &state.pending)
            .await?;
        self.store
            .update(&self.task_id, |m| {
                m.log_segments = seq + 1;
                Ok(())
            })
            .await?;
        state.next_seq += 1;
        state.pending.clear();
        Ok(())
    }
}

#[async_trait]
impl EventSink for SegmentSink {
    async fn send(&self, event: StreamEvent) -> Result<()> {
        let record = match event {
            StreamEvent::Log(record) => record,
            // surfaced through the terminal metadata instead
            StreamEvent::Error { kind, message } => {
                warn!(task_id = %self.task_id, kind = %kind, message = %message, "Run reported an error");
                return Ok(());
            }
            // the terminal state goes to metadata
            StreamEvent::Complete(_) => return Ok(()),
        };

        let mut state = self.state.lock().await;
        state.pending.push(record);
        if state.pending.len() >= self.max_records {
            self.flush_locked(&mut state).await?;
        }
        Ok(())
    }
}

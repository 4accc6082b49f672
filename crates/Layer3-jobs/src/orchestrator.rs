//! Async job orchestrator
//!
//! Offloads a payload to a remote worker and reports its progress:
//!
//! 1. `encrypt` - seal the payload into an envelope
//! 2. `store_payload` - `payload.enc` plus `metadata.json` (pending)
//! 3. `trigger` - start the remote job with only the id and the path
//! 4. `poll_and_stream` - forward new log records, stop on a terminal state,
//!    poll timeout, cancellation or a vanished consumer
//!
//! Every stop path unregisters the task once, emits one `Complete` and, for
//! asynchronous delivery, fires the callback once.

use crate::callback::CallbackNotifier;
use crate::crypto::{EncryptedPayload, EnvelopeCipher, KeyManager};
use crate::metadata::{paths, MetadataStore, TaskMetadata};
use crate::poller::LogPoller;
use crate::store::BlobStore;
use crate::trigger::{JobTrigger, RemoteStop};
use async_trait::async_trait;
use relay_foundation::{Error, ExecutionMode, JobsConfig, Payload, Result, TaskId};
use relay_task::{
    CancelOutcome, EventSink, ExecutionHandle, LogRecord, StreamEvent, TaskOutcome, TaskRegistry,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use url::Url;

/// Poll budget
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub poll_interval: Duration,
    pub poll_timeout: Duration,
}

impl OrchestratorSettings {
    pub fn from_config(config: &JobsConfig) -> Self {
        Self {
            poll_interval: Duration::from_millis(config.poll_interval_ms.max(1)),
            poll_timeout: Duration::from_secs(config.poll_timeout_secs),
        }
    }
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self::from_config(&JobsConfig::default())
    }
}

/// Immediate answer to an asynchronous submission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub task_id: TaskId,
    /// Always `accepted`
    pub status: String,
    /// Prefix of the task's log segments
    pub log_path: String,
}

enum Stop {
    Terminal(TaskMetadata),
    TimedOut,
    Cancelled,
    Disconnected,
}

pub struct JobOrchestrator {
    registry: Arc<TaskRegistry>,
    store: MetadataStore,
    cipher: EnvelopeCipher,
    trigger: Arc<dyn JobTrigger>,
    callback: Arc<dyn CallbackNotifier>,
    settings: OrchestratorSettings,
    background: Mutex<HashMap<TaskId, JoinHandle<TaskOutcome>>>,
}

impl JobOrchestrator {
    pub fn new(
        registry: Arc<TaskRegistry>,
        blobs: Arc<dyn BlobStore>,
        keys: Arc<dyn KeyManager>,
        trigger: Arc<dyn JobTrigger>,
        callback: Arc<dyn CallbackNotifier>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            registry,
            store: MetadataStore::new(blobs),
            cipher: EnvelopeCipher::new(keys),
            trigger,
            callback,
            settings,
            background: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &MetadataStore {
        &self.store
    }

    // ========================================================================
    // Steps
    // ========================================================================

    pub async fn encrypt(&self, payload: &Payload) -> Result<EncryptedPayload> {
        self.cipher.encrypt(payload).await
    }

    /// Persist the envelope and pending metadata. Task ids are unique in storage.
    pub async fn store_payload(
        &self,
        payload: &Payload,
        envelope: &EncryptedPayload,
    ) -> Result<TaskMetadata> {
        let task_id = &payload.task_id;
        if self.store.exists(task_id).await? {
            return Err(Error::AlreadyExists(format!("task {} already has stored state", task_id)));
        }

        let path = self.store.put_payload(task_id, envelope).await?;
        let mut metadata = TaskMetadata::new(task_id.clone(), payload.callback_url());
        metadata.encrypted_payload_path = path;
        self.store.save(&metadata).await?;
        debug!(task_id = %task_id, "Stored sealed payload");
        Ok(metadata)
    }

    /// Start the remote job and register it
    ///
    /// On failure the task stays unregistered and its metadata is marked
    /// failed with `trigger_failed`.
    pub async fn trigger(&self, metadata: &TaskMetadata) -> Result<String> {
        let task_id = &metadata.task_id;
        let handle = match self
            .trigger
            .submit(task_id, &metadata.encrypted_payload_path)
            .await
        {
            Ok(handle) => handle,
            Err(e) => {
                let e = match e {
                    Error::Trigger(_) => e,
                    other => Error::Trigger(other.to_string()),
                };
                error!(task_id = %task_id, error = %e, "Trigger failed");
                self.mark_trigger_failed(task_id, &e).await;
                return Err(e);
            }
        };

        // the handle lives in the registry; metadata belongs to the worker
        let stopper = RemoteStop::new(
            task_id.clone(),
            handle.clone(),
            Arc::clone(&self.trigger),
            self.store.clone(),
        );
        if let Err(e) = self
            .registry
            .register(
                task_id.clone(),
                ExecutionHandle::new(handle.clone(), Arc::new(stopper)),
                ExecutionMode::Offloaded,
            )
            .await
        {
            warn!(task_id = %task_id, error = %e, "Registration failed, cancelling remote job");
            if let Err(cancel) = self.trigger.cancel(&handle).await {
                warn!(task_id = %task_id, error = %cancel, "Remote cancel failed");
            }
            return Err(e);
        }

        info!(task_id = %task_id, handle = %handle, "Remote job triggered");
        Ok(handle)
    }

    async fn mark_trigger_failed(&self, task_id: &TaskId, err: &Error) {
        let outcome =
            TaskOutcome::failed(task_id.clone(), None, err.to_string()).with_kind(err.kind());
        if let Err(e) = self.store.settle(task_id, outcome).await {
            warn!(task_id = %task_id, error = %e, "Could not mark trigger failure");
        }
    }

    async fn prepare(&self, payload: &Payload) -> Result<()> {
        if payload.mode() != ExecutionMode::Offloaded {
            return Err(Error::validation("inline payloads are not offloaded"));
        }
        if self.registry.contains(&payload.task_id).await {
            return Err(Error::AlreadyExists(format!(
                "task {} is already running",
                payload.task_id
            )));
        }

        // nothing is stored or triggered if sealing fails
        let envelope = self.encrypt(payload).await?;
        let metadata = self.store_payload(payload, &envelope).await?;
        self.trigger(&metadata).await?;
        Ok(())
    }

    // ========================================================================
    // Delivery modes
    // ========================================================================

    /// Offload and stream until the task ends
    ///
    /// If the sink disconnects the remote task is cancelled.
    pub async fn submit_sync(
        &self,
        payload: &Payload,
        sink: Arc<dyn EventSink>,
    ) -> Result<TaskOutcome> {
        self.prepare(payload).await?;
        Ok(self.poll_and_stream(&payload.task_id, sink, None).await)
    }

    /// Offload and return at once; the outcome is POSTed to the callback URL
    pub async fn submit_async(self: &Arc<Self>, payload: &Payload) -> Result<Ack> {
        let callback = payload
            .callback_url()
            .cloned()
            .ok_or_else(|| Error::validation("callback_url is required for asynchronous offload"))?;
        self.prepare(payload).await?;

        let task_id = payload.task_id.clone();
        let this = Arc::clone(self);
        let id = task_id.clone();
        // held across the spawn so the loop cannot reap its entry before it exists
        let mut background = self.background.lock().await;
        let handle = tokio::spawn(async move {
            let outcome = this
                .poll_and_stream(&id, Arc::new(DiscardSink), Some(callback))
                .await;
            this.background.lock().await.remove(&id);
            outcome
        });
        background.insert(task_id.clone(), handle);
        drop(background);

        Ok(Ack {
            log_path: paths::log_dir(&task_id),
            task_id,
            status: "accepted".to_string(),
        })
    }

    /// Wait for a background poll loop
    ///
    /// A loop that already ended has removed itself; its outcome is then
    /// read back from storage. `None` if the task is unknown or not terminal.
    pub async fn join(&self, task_id: &TaskId) -> Option<TaskOutcome> {
        let handle = self.background.lock().await.remove(task_id);
        if let Some(handle) = handle {
            match handle.await {
                Ok(outcome) => return Some(outcome),
                Err(e) => error!(task_id = %task_id, error = %e, "Background poll loop failed"),
            }
        }
        match self.store.load(task_id).await {
            Ok(metadata) => metadata.outcome(),
            Err(e) => {
                debug!(task_id = %task_id, error = %e, "No stored outcome");
                None
            }
        }
    }

    /// Background poll loops still running
    pub async fn background_tasks(&self) -> usize {
        self.background.lock().await.len()
    }

    // ========================================================================
    // Poll loop
    // ========================================================================

    /// Forward new records until the task stops, then finalize it
    pub async fn poll_and_stream(
        &self,
        task_id: &TaskId,
        sink: Arc<dyn EventSink>,
        callback: Option<Url>,
    ) -> TaskOutcome {
        let started = Instant::now();
        let mut poller = LogPoller::new(self.store.clone(), task_id.clone());
        let mut ticker = tokio::time::interval(self.settings.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let stop = loop {
            ticker.tick().await;

            match poller.poll().await {
                Ok(batch) => {
                    let done = batch.is_final();
                    if !forward(sink.as_ref(), task_id, batch.records).await {
                        break Stop::Disconnected;
                    }
                    if done {
                        break Stop::Terminal(batch.metadata);
                    }
                }
                Err(e) => debug!(task_id = %task_id, error = %e, "Poll failed, retrying"),
            }

            if self.registry.is_cancelling(task_id).await {
                break Stop::Cancelled;
            }
            if sink.is_closed() {
                break Stop::Disconnected;
            }
            if started.elapsed() >= self.settings.poll_timeout {
                break Stop::TimedOut;
            }
        };

        let outcome = match stop {
            Stop::Terminal(metadata) => match metadata.outcome() {
                Some(outcome) => outcome,
                None => {
                    let err = Error::Internal("terminal state without outcome".into());
                    TaskOutcome::failed(task_id.clone(), None, err.to_string()).with_kind(err.kind())
                }
            },
            Stop::TimedOut => {
                let err = Error::Timeout(format!(
                    "no terminal state within {}s",
                    self.settings.poll_timeout.as_secs()
                ));
                warn!(task_id = %task_id, "Poll timeout");
                let _ = sink.send(StreamEvent::error(&err)).await;
                self.stop_remote(task_id).await;
                self.persist(
                    task_id,
                    TaskOutcome::failed(task_id.clone(), None, err.to_string()).with_kind(err.kind()),
                )
                .await
            }
            Stop::Cancelled => {
                info!(task_id = %task_id, "Task cancelled, finalizing");
                self.persist(task_id, TaskOutcome::cancelled(task_id.clone()))
                    .await
            }
            Stop::Disconnected => {
                warn!(task_id = %task_id, "Consumer gone, cancelling task");
                self.stop_remote(task_id).await;
                self.persist(task_id, TaskOutcome::cancelled(task_id.clone()))
                    .await
            }
        };

        self.registry.unregister(task_id).await;
        if let Err(e) = sink.send(StreamEvent::Complete(outcome.clone())).await {
            debug!(task_id = %task_id, error = %e, "Completion not delivered");
        }

        if let Some(url) = callback {
            if let Err(e) = self.callback.notify(&url, &outcome).await {
                error!(task_id = %task_id, error = %e, "Callback failed");
            }
        }

        info!(task_id = %task_id, status = %outcome.status, "Offloaded task finalized");
        outcome
    }

    async fn stop_remote(&self, task_id: &TaskId) {
        if let Err(e) = self.registry.cancel_task(task_id).await {
            warn!(task_id = %task_id, error = %e, "Remote stop failed");
        }
    }

    /// Record a synthesized terminal state unless the worker already did
    async fn persist(&self, task_id: &TaskId, outcome: TaskOutcome) -> TaskOutcome {
        match self.store.settle(task_id, outcome.clone()).await {
            Ok(settled) => settled,
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "Could not persist final state");
                outcome
            }
        }
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Cancel a task
    ///
    /// Tasks owned by another process are cancelled through the stored
    /// cancel marker.
    pub async fn cancel(&self, task_id: &TaskId) -> Result<CancelOutcome> {
        match self.registry.cancel_task(task_id).await? {
            CancelOutcome::NotFound => self.store.cancel_detached(task_id).await,
            other => Ok(other),
        }
    }

    pub async fn status(&self, task_id: &TaskId) -> Result<TaskMetadata> {
        self.store.load(task_id).await
    }
}

async fn forward(
    sink: &dyn EventSink,
    task_id: &TaskId,
    records: Vec<LogRecord>,
) -> bool {
    for record in records {
        if let Err(e) = sink.send(StreamEvent::Log(record)).await {
            warn!(task_id = %task_id, error = %e, "Stopped forwarding");
            return false;
        }
    }
    true
}

/// Sink for background loops; events go nowhere
struct DiscardSink;

#[async_trait]
impl EventSink for DiscardSink {
    async fn send(&self, _event: StreamEvent) -> Result<()> {
        Ok(())
    }
}

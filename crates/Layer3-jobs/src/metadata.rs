//! Persisted task metadata and log segments
//!
//! Layout under the blob store:
//!
//! ```text
//! tasks/<id>/payload.enc           sealed payload
//! tasks/<id>/metadata.json         TaskMetadata, written by the worker
//! tasks/<id>/final.json            outcome settled by the orchestrator
//! tasks/<id>/cancel                cancel marker
//! tasks/<id>/logs/<seq:08>.ndjson  log records, one JSON object per line
//! ```
//!
//! Once a task is triggered only the worker writes `metadata.json`. The
//! orchestrator never rewrites it: a settled outcome goes to `final.json`,
//! which overrides the recorded status on every [`MetadataStore::load`]. A
//! late worker save therefore cannot move a task out of a terminal state.
//!
//! The worker writes a segment first and then bumps `logSegments`, so every
//! segment below `logSegments` is readable.

use crate::crypto::EncryptedPayload;
use crate::store::BlobStore;
use chrono::{DateTime, Utc};
use relay_foundation::{Error, Result, TaskId};
use relay_task::{CancelOutcome, LogRecord, TaskOutcome, TaskStatus};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};
use url::Url;

pub mod paths {
    use relay_foundation::TaskId;

    pub fn payload(id: &TaskId) -> String {
        format!("tasks/{}/payload.enc", id)
    }

    pub fn metadata(id: &TaskId) -> String {
        format!("tasks/{}/metadata.json", id)
    }

    pub fn final_outcome(id: &TaskId) -> String {
        format!("tasks/{}/final.json", id)
    }

    pub fn cancel_marker(id: &TaskId) -> String {
        format!("tasks/{}/cancel", id)
    }

    pub fn log_dir(id: &TaskId) -> String {
        format!("tasks/{}/logs/", id)
    }

    pub fn segment(id: &TaskId, seq: u64) -> String {
        format!("tasks/{}/logs/{:08}.ndjson", id, seq)
    }
}

/// Authoritative state of an offloaded task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskMetadata {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,

    /// Never the ciphertext itself
    pub encrypted_payload_path: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_url: Option<String>,

    /// Trigger handle, then the worker's own handle once running
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_handle: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    #[serde(default)]
    pub timed_out: bool,

    /// Number of complete log segments
    #[serde(default)]
    pub log_segments: u64,

    #[serde(default)]
    pub cancel_requested: bool,
}

impl TaskMetadata {
    pub fn new(task_id: TaskId, callback_url: Option<&Url>) -> Self {
        let now = Utc::now();
        Self {
            encrypted_payload_path: paths::payload(&task_id),
            task_id,
            status: TaskStatus::Pending,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
            callback_url: callback_url.map(|u| u.to_string()),
            execution_handle: None,
            exit_code: None,
            error: None,
            error_kind: None,
            timed_out: false,
            log_segments: 0,
            cancel_requested: false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    fn transition(&mut self, next: TaskStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(Error::Internal(format!(
                "task {} cannot move from {} to {}",
                self.task_id, self.status, next
            )));
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// `pending → running`
    pub fn start(&mut self, handle: impl Into<String>) -> Result<()> {
        self.transition(TaskStatus::Running)?;
        self.started_at = Some(self.updated_at);
        self.execution_handle = Some(handle.into());
        Ok(())
    }

    /// Move to the outcome's terminal status
    pub fn finish(&mut self, outcome: &TaskOutcome) -> Result<()> {
        self.transition(outcome.status)?;
        self.finished_at = Some(outcome.finished_at);
        self.exit_code = outcome.exit_code;
        self.error = outcome.error.clone();
        self.error_kind = outcome.error_kind.clone();
        self.timed_out = outcome.timed_out;
        Ok(())
    }

    /// Take a settled outcome regardless of the recorded status
    fn settle(&mut self, outcome: &TaskOutcome) {
        self.status = outcome.status;
        self.finished_at = Some(outcome.finished_at);
        self.updated_at = outcome.finished_at;
        self.exit_code = outcome.exit_code;
        self.error = outcome.error.clone();
        self.error_kind = outcome.error_kind.clone();
        self.timed_out = outcome.timed_out;
    }

    /// The recorded outcome, once terminal
    pub fn outcome(&self) -> Option<TaskOutcome> {
        if !self.is_terminal() {
            return None;
        }
        Some(TaskOutcome {
            task_id: self.task_id.clone(),
            status: self.status,
            exit_code: self.exit_code,
            error: self.error.clone(),
            error_kind: self.error_kind.clone(),
            timed_out: self.timed_out,
            finished_at: self.finished_at.unwrap_or(self.updated_at),
        })
    }
}

/// Typed access to one task's blobs
#[derive(Clone)]
pub struct MetadataStore {
    blobs: Arc<dyn BlobStore>,
}

impl MetadataStore {
    pub fn new(blobs: Arc<dyn BlobStore>) -> Self {
        Self { blobs }
    }

    pub fn blobs(&self) -> &Arc<dyn BlobStore> {
        &self.blobs
    }

    pub async fn exists(&self, id: &TaskId) -> Result<bool> {
        self.blobs.exists(&paths::metadata(id)).await
    }

    /// Current view of a task
    ///
    /// The worker's record, overridden by a settled outcome and flagged if
    /// the cancel marker exists.
    pub async fn load(&self, id: &TaskId) -> Result<TaskMetadata> {
        let mut metadata = self.load_record(id).await?;
        if let Some(outcome) = self.settled(id).await? {
            metadata.settle(&outcome);
        }
        if !metadata.is_terminal() && self.cancel_requested(id).await? {
            metadata.cancel_requested = true;
        }
        Ok(metadata)
    }

    async fn load_record(&self, id: &TaskId) -> Result<TaskMetadata> {
        let raw = self.blobs.get(&paths::metadata(id)).await?;
        serde_json::from_slice(&raw)
            .map_err(|e| Error::Storage(format!("metadata for {} is malformed: {}", id, e)))
    }

    pub async fn save(&self, metadata: &TaskMetadata) -> Result<()> {
        let raw = serde_json::to_vec_pretty(metadata)?;
        self.blobs.put(&paths::metadata(&metadata.task_id), raw).await
    }

    /// Load, modify, save the worker's record
    ///
    /// Not atomic. After the trigger only the worker may call this; the
    /// orchestrator goes through [`settle`](Self::settle).
    pub async fn update<F>(&self, id: &TaskId, apply: F) -> Result<TaskMetadata>
    where
        F: FnOnce(&mut TaskMetadata) -> Result<()> + Send,
    {
        let mut metadata = self.load_record(id).await?;
        apply(&mut metadata)?;
        metadata.updated_at = Utc::now();
        self.save(&metadata).await?;
        Ok(metadata)
    }

    /// Outcome settled by the orchestrator, if any
    pub async fn settled(&self, id: &TaskId) -> Result<Option<TaskOutcome>> {
        match self.blobs.get(&paths::final_outcome(id)).await {
            Ok(raw) => serde_json::from_slice(&raw).map(Some).map_err(|e| {
                Error::Storage(format!("final outcome for {} is malformed: {}", id, e))
            }),
            Err(Error::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Fix the task's outcome unless it already has one
    ///
    /// Returns the outcome now in force: the worker's if it finished first,
    /// otherwise `outcome`.
    pub async fn settle(&self, id: &TaskId, outcome: TaskOutcome) -> Result<TaskOutcome> {
        if let Some(recorded) = self.load(id).await?.outcome() {
            return Ok(recorded);
        }
        self.blobs
            .put(&paths::final_outcome(id), serde_json::to_vec_pretty(&outcome)?)
            .await?;
        debug!(task_id = %id, status = %outcome.status, "Settled final outcome");
        Ok(outcome)
    }

    pub async fn put_payload(&self, id: &TaskId, envelope: &EncryptedPayload) -> Result<String> {
        let path = paths::payload(id);
        self.blobs.put(&path, envelope.to_bytes()?).await?;
        Ok(path)
    }

    pub async fn get_payload(&self, path: &str) -> Result<EncryptedPayload> {
        let raw = self.blobs.get(path).await?;
        EncryptedPayload::from_bytes(&raw)
    }

    pub async fn write_segment(&self, id: &TaskId, seq: u64, records: &[LogRecord]) -> Result<()> {
        let mut out = Vec::new();
        for record in records {
            serde_json::to_writer(&mut out, record)?;
            out.push(b'\n');
        }
        self.blobs.put(&paths::segment(id, seq), out).await?;
        debug!(task_id = %id, seq, records = records.len(), "Wrote log segment");
        Ok(())
    }

    /// Records of one segment; malformed lines are skipped
    pub async fn read_segment(&self, id: &TaskId, seq: u64) -> Result<Vec<LogRecord>> {
        let raw = self.blobs.get(&paths::segment(id, seq)).await?;
        let text = String::from_utf8_lossy(&raw);
        let mut records = Vec::new();
        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            match serde_json::from_str::<LogRecord>(line) {
                Ok(record) => records.push(record),
                Err(e) => warn!(task_id = %id, seq, error = %e, "Skipping malformed log line"),
            }
        }
        Ok(records)
    }

    /// Write the cancel marker; the worker polls it
    pub async fn request_cancel(&self, id: &TaskId) -> Result<()> {
        self.blobs
            .put(&paths::cancel_marker(id), Utc::now().to_rfc3339().into_bytes())
            .await
    }

    pub async fn cancel_requested(&self, id: &TaskId) -> Result<bool> {
        self.blobs.exists(&paths::cancel_marker(id)).await
    }

    /// Cancel a task owned by another process
    pub async fn cancel_detached(&self, id: &TaskId) -> Result<CancelOutcome> {
        let metadata = match self.load(id).await {
            Ok(metadata) => metadata,
            Err(Error::NotFound(_)) => return Ok(CancelOutcome::NotFound),
            Err(e) => return Err(e),
        };
        if metadata.is_terminal() {
            return Ok(CancelOutcome::NotFound);
        }
        if metadata.cancel_requested {
            return Ok(CancelOutcome::AlreadyCancelling);
        }
        self.request_cancel(id).await?;
        Ok(CancelOutcome::Signalled)
    }
}

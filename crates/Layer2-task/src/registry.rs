//! Task Registry - in-flight tasks and cooperative cancellation
//!
//! Features:
//! - At most one live registration per task id
//! - Cancellation through the task's [`StopSignal`], delivered once
//! - Per-task FIFO ordering; different ids never contend beyond the table lock
//!
//! The registry is injected (`Arc<TaskRegistry>`), never global.

use crate::task::{ExecutionHandle, TaskInfo};
use chrono::{DateTime, Utc};
use relay_foundation::{Error, ExecutionMode, Result, TaskId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// Result of [`TaskRegistry::cancel_task`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// Stop signal issued by this call
    Signalled,
    /// An earlier cancel already holds the task
    AlreadyCancelling,
    NotFound,
}

impl CancelOutcome {
    /// Both signalled and already-cancelling count as success
    pub fn is_success(&self) -> bool {
        !matches!(self, CancelOutcome::NotFound)
    }
}

/// Registry statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryStats {
    pub total: usize,
    pub inline: usize,
    pub offloaded: usize,
    pub cancelling: usize,
}

struct Entry {
    id: TaskId,
    handle: ExecutionHandle,
    mode: ExecutionMode,
    created_at: DateTime<Utc>,
    cancelling: AtomicBool,
    /// Serializes cancel/unregister on this id; tokio's Mutex is FIFO
    turn: Mutex<()>,
}

impl Entry {
    fn info(&self) -> TaskInfo {
        TaskInfo {
            id: self.id.clone(),
            handle_id: self.handle.id.clone(),
            mode: self.mode,
            cancelling: self.cancelling.load(Ordering::Acquire),
            created_at: self.created_at,
        }
    }
}

/// Process-wide map of active task id → execution handle
#[derive(Default)]
pub struct TaskRegistry {
    tasks: RwLock<HashMap<TaskId, Arc<Entry>>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task. Fails with `AlreadyExists` if `id` is live.
    pub async fn register(
        &self,
        id: TaskId,
        handle: ExecutionHandle,
        mode: ExecutionMode,
    ) -> Result<()> {
        let mut tasks = self.tasks.write().await;
        if tasks.contains_key(&id) {
            return Err(Error::AlreadyExists(format!("task {} is already registered", id)));
        }

        debug!(task_id = %id, handle = %handle.id, mode = %mode, "Registering task");
        tasks.insert(
            id.clone(),
            Arc::new(Entry {
                id,
                handle,
                mode,
                created_at: Utc::now(),
                cancelling: AtomicBool::new(false),
                turn: Mutex::new(()),
            }),
        );
        Ok(())
    }

    /// Snapshot of a live task
    pub async fn get_task(&self, id: &TaskId) -> Option<TaskInfo> {
        self.entry(id).await.map(|e| e.info())
    }

    /// Cancel a live task
    ///
    /// The first caller marks the task cancelling and issues its stop signal;
    /// later callers queue behind it and report `AlreadyCancelling`. If the
    /// stop signal fails the flag is reset and the error returned.
    pub async fn cancel_task(&self, id: &TaskId) -> Result<CancelOutcome> {
        let Some(entry) = self.entry(id).await else {
            return Ok(CancelOutcome::NotFound);
        };

        let _turn = entry.turn.lock().await;

        if !self.is_current(&entry).await {
            // unregistered while we waited
            return Ok(CancelOutcome::NotFound);
        }
        if entry.cancelling.load(Ordering::Acquire) {
            return Ok(CancelOutcome::AlreadyCancelling);
        }

        entry.cancelling.store(true, Ordering::Release);
        match entry.handle.stopper.stop().await {
            Ok(delivered) => {
                info!(task_id = %id, handle = %entry.handle.id, delivered, "Cancelled task");
                Ok(CancelOutcome::Signalled)
            }
            Err(e) => {
                warn!(task_id = %id, error = %e, "Stop signal failed");
                entry.cancelling.store(false, Ordering::Release);
                Err(e)
            }
        }
    }

    /// Remove a task; false if it was not registered
    pub async fn unregister(&self, id: &TaskId) -> bool {
        let Some(entry) = self.entry(id).await else {
            return false;
        };

        let _turn = entry.turn.lock().await;
        let mut tasks = self.tasks.write().await;
        match tasks.get(id) {
            Some(current) if Arc::ptr_eq(current, &entry) => {
                tasks.remove(id);
                debug!(task_id = %id, "Unregistered task");
                true
            }
            _ => false,
        }
    }

    pub async fn is_cancelling(&self, id: &TaskId) -> bool {
        self.entry(id)
            .await
            .map(|e| e.cancelling.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    pub async fn contains(&self, id: &TaskId) -> bool {
        self.tasks.read().await.contains_key(id)
    }

    pub async fn active_ids(&self) -> Vec<TaskId> {
        let mut ids: Vec<_> = self.tasks.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn stats(&self) -> RegistryStats {
        let tasks = self.tasks.read().await;
        let mut stats = RegistryStats {
            total: tasks.len(),
            ..Default::default()
        };
        for entry in tasks.values() {
            match entry.mode {
                ExecutionMode::Inline => stats.inline += 1,
                ExecutionMode::Offloaded => stats.offloaded += 1,
            }
            if entry.cancelling.load(Ordering::Acquire) {
                stats.cancelling += 1;
            }
        }
        stats
    }

    async fn entry(&self, id: &TaskId) -> Option<Arc<Entry>> {
        self.tasks.read().await.get(id).cloned()
    }

    async fn is_current(&self, entry: &Arc<Entry>) -> bool {
        self.tasks
            .read()
            .await
            .get(&entry.id)
            .map(|current| Arc::ptr_eq(current, entry))
            .unwrap_or(false)
    }
}

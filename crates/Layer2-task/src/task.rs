//! Task definition and types

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use relay_foundation::{ExecutionMode, Result, TaskId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Delivers the mode-appropriate stop signal for one execution
///
/// Local executions kill the agent process; offloaded ones cancel the remote
/// job. Implementations must be idempotent.
#[async_trait]
pub trait StopSignal: Send + Sync {
    /// Returns `Ok(true)` if a signal was delivered, `Ok(false)` if the target was already gone
    async fn stop(&self) -> Result<bool>;
}

/// Names and stops one execution
#[derive(Clone)]
pub struct ExecutionHandle {
    /// `pid:<n>` for a local process or the remote job handle
    pub id: String,

    pub stopper: Arc<dyn StopSignal>,
}

impl ExecutionHandle {
    pub fn new(id: impl Into<String>, stopper: Arc<dyn StopSignal>) -> Self {
        Self {
            id: id.into(),
            stopper,
        }
    }
}

impl fmt::Debug for ExecutionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionHandle")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

/// Registry view of an in-flight task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskInfo {
    pub id: TaskId,

    /// [`ExecutionHandle::id`]
    pub handle_id: String,

    pub mode: ExecutionMode,

    pub cancelling: bool,

    pub created_at: DateTime<Utc>,
}

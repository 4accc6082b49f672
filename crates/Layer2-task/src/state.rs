//! Task state machine
//!
//! `pending → running → {completed, failed, cancelled}`. Terminal states never
//! transition, and a task may fail or be cancelled before it starts.

use chrono::{DateTime, Utc};
use relay_foundation::{Error, TaskId};
use serde::{Deserialize, Serialize};

/// Possible states of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Stored, not yet picked up
    Pending,

    /// Agent process is running
    Running,

    /// Agent exited 0
    Completed,

    /// Non-zero exit, signal, deadline, or a failure around the run
    Failed,

    /// Stopped on request
    Cancelled,
}

impl TaskStatus {
    /// Check if this is a terminal state (cannot transition further)
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    pub fn is_running(&self) -> bool {
        matches!(self, TaskStatus::Running)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, TaskStatus::Completed)
    }

    /// Whether `self → next` is a legal move
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        match (self, next) {
            (TaskStatus::Pending, TaskStatus::Running) => true,
            (TaskStatus::Pending, TaskStatus::Failed | TaskStatus::Cancelled) => true,
            (TaskStatus::Running, next) => next.is_terminal(),
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    /// Get display name for the state
    pub fn display_name(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "Pending",
            TaskStatus::Running => "Running",
            TaskStatus::Completed => "Completed",
            TaskStatus::Failed => "Failed",
            TaskStatus::Cancelled => "Cancelled",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// Outcome
// ============================================================================

/// Final report of a task: the terminal stream event and the callback body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub task_id: TaskId,

    /// Always terminal
    pub status: TaskStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Stable error code (`subprocess_failed`, `poll_timeout`, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,

    /// Stopped by the runner deadline (not the poll timeout)
    #[serde(default)]
    pub timed_out: bool,

    pub finished_at: DateTime<Utc>,
}

impl TaskOutcome {
    pub fn completed(task_id: TaskId, exit_code: i32) -> Self {
        Self {
            task_id,
            status: TaskStatus::Completed,
            exit_code: Some(exit_code),
            error: None,
            error_kind: None,
            timed_out: false,
            finished_at: Utc::now(),
        }
    }

    pub fn failed(task_id: TaskId, exit_code: Option<i32>, error: impl Into<String>) -> Self {
        Self {
            task_id,
            status: TaskStatus::Failed,
            exit_code,
            error: Some(error.into()),
            error_kind: None,
            timed_out: false,
            finished_at: Utc::now(),
        }
    }

    pub fn timed_out(task_id: TaskId, error: impl Into<String>) -> Self {
        Self {
            timed_out: true,
            ..Self::failed(task_id, None, error)
        }
    }

    pub fn cancelled(task_id: TaskId) -> Self {
        Self {
            task_id,
            status: TaskStatus::Cancelled,
            exit_code: None,
            error: Some(Error::Cancelled.kind().to_string()),
            error_kind: Some(Error::Cancelled.kind().to_string()),
            timed_out: false,
            finished_at: Utc::now(),
        }
    }

    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.error_kind = Some(kind.into());
        self
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

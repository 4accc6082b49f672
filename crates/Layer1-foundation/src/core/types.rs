//! Shared identifier types

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Longest accepted task id
pub const MAX_TASK_ID_LEN: usize = 128;

/// Unique identifier for a task
///
/// Opaque and URL-safe: 1..=128 characters of `[A-Za-z0-9_-]`. Either supplied
/// by the caller or generated.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TaskId(String);

impl TaskId {
    /// Generate a new random TaskId
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    /// Validate a caller-supplied id
    pub fn parse(raw: impl Into<String>) -> Result<Self> {
        let raw = raw.into();
        if raw.is_empty() || raw.len() > MAX_TASK_ID_LEN {
            return Err(Error::validation(format!(
                "task id must be 1-{} characters",
                MAX_TASK_ID_LEN
            )));
        }
        if !raw
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
        {
            return Err(Error::validation(format!(
                "task id '{}' is not URL-safe",
                raw
            )));
        }
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for TaskId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(value)
    }
}

impl From<TaskId> for String {
    fn from(id: TaskId) -> Self {
        id.0
    }
}

impl AsRef<str> for TaskId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Where a task executes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Same process, live stream
    Inline,
    /// Delegated to a separately-triggered job
    Offloaded,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionMode::Inline => "inline",
            ExecutionMode::Offloaded => "offloaded",
        }
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ids_are_url_safe() {
        let id = TaskId::generate();
        assert_eq!(id.as_str().len(), 32);
        assert!(TaskId::parse(id.as_str()).is_ok());
        assert_ne!(TaskId::generate(), id);
    }

    #[test]
    fn test_rejects_unsafe_ids() {
        assert!(TaskId::parse("").is_err());
        assert!(TaskId::parse("a/b").is_err());
        assert!(TaskId::parse("with space").is_err());
        assert!(TaskId::parse("x".repeat(MAX_TASK_ID_LEN + 1)).is_err());
        assert!(TaskId::parse("job_2024-01").is_ok());
    }

    #[test]
    fn test_serde_validates() {
        let ok: TaskId = serde_json::from_str("\"abc-1\"").unwrap();
        assert_eq!(ok.as_str(), "abc-1");
        assert!(serde_json::from_str::<TaskId>("\"../etc\"").is_err());
    }
}

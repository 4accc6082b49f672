//! Core identifiers and types
//!
//! - `types.rs`: TaskId, ExecutionMode

mod types;

pub use types::{ExecutionMode, TaskId, MAX_TASK_ID_LEN};

//! # relay-task
//!
//! Task tracking and agent execution for Relay.
//!
//! ## Features
//!
//! - **Task registry** with cooperative, idempotent cancellation
//! - **Agent runner**: prompt delivery (stdin or named pipe), streaming,
//!   deadline with SIGTERM -> SIGKILL escalation
//! - Ordered log records with a per-task high-water-mark
//! - Event sinks (bounded channel, in-memory)

#[cfg(not(unix))]
compile_error!("relay-task requires a unix platform (signals and FIFOs)");

pub mod executor;
pub mod log;
pub mod registry;
pub mod sink;
pub mod state;
pub mod task;

// Execution
pub use executor::{
    AgentRunner, ExitReason, KillHandle, PromptPipe, RunOutcome, RunPhase, RunSpec, RunningAgent,
    PROMPT_PATH_PLACEHOLDER,
};

// Registry
pub use registry::{CancelOutcome, RegistryStats, TaskRegistry};
pub use state::{TaskOutcome, TaskStatus};
pub use task::{ExecutionHandle, StopSignal, TaskInfo};

// Log system
pub use log::{HighWaterMark, LogLine, LogRecord, LogSequencer, LogStream};
pub use sink::{ChannelSink, CollectingSink, EventSink, StreamEvent};

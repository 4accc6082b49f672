//! Agent execution
//!
//! - `runner` - spawns the agent, streams output, enforces the deadline
//! - `pipe` - named-pipe prompt delivery

pub mod pipe;
pub mod runner;

pub use pipe::{PromptPipe, PROMPT_PATH_PLACEHOLDER};
pub use runner::{
    AgentRunner, ExitReason, KillHandle, RunOutcome, RunPhase, RunSpec, RunningAgent,
};

//! # relay-foundation
//!
//! Foundation layer for Relay:
//! - Error: the shared `Error` and `Result`
//! - Core: TaskId, ExecutionMode
//! - Payload: request variants validated into a `Payload`
//! - Scrub: secret redaction for agent output
//! - Config: RelayConfig (TOML layers plus env overrides)
//! - Storage: atomic file store

pub mod config;
pub mod core;
pub mod error;
pub mod payload;
pub mod scrub;
pub mod storage;

pub use config::{
    JobsConfig, KmsConfig, PromptDelivery, ProxyConfig, RelayConfig, RunnerConfig,
};
pub use core::{ExecutionMode, TaskId, MAX_TASK_ID_LEN};
pub use error::{Error, Result};
pub use payload::{
    CredentialsInput, Delivery, InlineRequest, OffloadRequest, Payload, RunOptions, RunRequest,
    UpstreamCredential,
};
pub use scrub::{SecretScrubber, REDACTED};
pub use storage::FileStore;

// Re-exported so downstream crates share one secrecy version
pub use secrecy;

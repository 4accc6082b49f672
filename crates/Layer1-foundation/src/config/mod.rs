//! Configuration
//!
//! - `relay.rs` - RelayConfig (runner, proxy, jobs, kms)

mod relay;

pub use relay::{
    JobsConfig, KmsConfig, PromptDelivery, ProxyConfig, RelayConfig, RunnerConfig,
    CONFIG_FILE, DEFAULT_AGENT_COMMAND, MIN_MASTER_KEY_BYTES,
};

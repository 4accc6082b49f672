//! Relay configuration
//!
//! Layers are merged as TOML tables before deserializing, so a layer only
//! overrides the keys it actually sets:
//! defaults → `~/.config/relay/relay.toml` → `.relay/relay.toml` →
//! explicit file → `RELAY_*` environment variables.

use crate::{Error, Result};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Config file name in every layer
pub const CONFIG_FILE: &str = "relay.toml";

/// Claude CLI in headless streaming mode, prompt on stdin
pub const DEFAULT_AGENT_COMMAND: &str = "claude -p --output-format stream-json --verbose";

/// Minimum master key length for the local key manager
pub const MIN_MASTER_KEY_BYTES: usize = 32;

// ============================================================================
// Relay Config
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub runner: RunnerConfig,
    pub proxy: ProxyConfig,
    pub jobs: JobsConfig,
    pub kms: KmsConfig,
}

impl RelayConfig {
    // ========================================================================
    // Load
    // ========================================================================

    /// Merge global, project and explicit files, then apply env overrides
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let mut layers = Vec::new();
        if let Some(dir) = dirs::config_dir() {
            layers.push(dir.join("relay").join(CONFIG_FILE));
        }
        if let Ok(cwd) = std::env::current_dir() {
            layers.push(cwd.join(".relay").join(CONFIG_FILE));
        }

        let mut config = Self::load_layers(&layers, explicit)?;
        config.apply_env(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Merge optional `layers` (missing files skipped) and a required `explicit` file
    pub fn load_layers(layers: &[PathBuf], explicit: Option<&Path>) -> Result<Self> {
        let mut merged = toml::Value::Table(toml::map::Map::new());

        for path in layers {
            if path.exists() {
                debug!(path = %path.display(), "Loading config layer");
                merge_value(&mut merged, read_toml(path)?);
            }
        }

        if let Some(path) = explicit {
            if !path.exists() {
                return Err(Error::Config(format!(
                    "config file {} does not exist",
                    path.display()
                )));
            }
            merge_value(&mut merged, read_toml(path)?);
        }

        merged
            .try_into()
            .map_err(|e: toml::de::Error| Error::Config(e.to_string()))
    }

    /// Parse a single TOML document over the defaults
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    // ========================================================================
    // Environment overrides
    // ========================================================================

    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("RELAY_AGENT_COMMAND") {
            self.runner.agent_command = v;
        }
        if let Some(v) = lookup("RELAY_UPSTREAM_URL") {
            self.proxy.upstream_url = v;
        }
        if let Some(v) = lookup("RELAY_STORAGE_DIR") {
            self.jobs.storage_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("RELAY_POLL_INTERVAL_MS") {
            self.jobs.poll_interval_ms = parse_env("RELAY_POLL_INTERVAL_MS", &v)?;
        }
        if let Some(v) = lookup("RELAY_POLL_TIMEOUT_SECS") {
            self.jobs.poll_timeout_secs = parse_env("RELAY_POLL_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = lookup("RELAY_TIMEOUT_SECS") {
            self.runner.timeout_secs = parse_env("RELAY_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = lookup("RELAY_GRACE_SECS") {
            self.runner.grace_secs = parse_env("RELAY_GRACE_SECS", &v)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.runner.agent_argv()?;
        self.proxy.upstream()?;
        if self.runner.timeout_secs == 0 {
            return Err(Error::Config("runner.timeout_secs must be positive".into()));
        }
        if self.jobs.poll_interval_ms == 0 {
            return Err(Error::Config("jobs.poll_interval_ms must be positive".into()));
        }
        if self.jobs.segment_max_records == 0 {
            return Err(Error::Config("jobs.segment_max_records must be positive".into()));
        }
        Ok(())
    }
}

// ============================================================================
// Runner
// ============================================================================

/// Prompt delivery strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptDelivery {
    /// Direct below the size limit, named pipe above it
    #[default]
    Auto,
    Direct,
    NamedPipe,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Agent command line; `{prompt_path}` is replaced with the FIFO path
    pub agent_command: String,

    pub prompt_delivery: PromptDelivery,

    pub max_direct_prompt_bytes: usize,

    /// Deadline from spawn
    pub timeout_secs: u64,

    /// SIGTERM → SIGKILL window
    pub grace_secs: u64,

    /// Bytes of stderr kept for the outcome
    pub stderr_tail_bytes: usize,

    /// Parent env vars passed through to the agent
    pub env_allowlist: Vec<String>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            agent_command: DEFAULT_AGENT_COMMAND.to_string(),
            prompt_delivery: PromptDelivery::Auto,
            max_direct_prompt_bytes: 64 * 1024,
            timeout_secs: 30 * 60,
            grace_secs: 5,
            stderr_tail_bytes: 64 * 1024,
            env_allowlist: ["PATH", "HOME", "LANG", "TERM", "TMPDIR", "USER"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl RunnerConfig {
    /// Split the command line into program + args
    pub fn agent_argv(&self) -> Result<Vec<String>> {
        let argv = shlex::split(&self.agent_command).ok_or_else(|| {
            Error::Config(format!(
                "runner.agent_command is not a valid command line: {}",
                self.agent_command
            ))
        })?;
        if argv.is_empty() {
            return Err(Error::Config("runner.agent_command is empty".into()));
        }
        Ok(argv)
    }
}

// ============================================================================
// Proxy
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// The single upstream the proxy forwards to
    pub upstream_url: String,

    pub connect_timeout_secs: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            upstream_url: "https://api.anthropic.com".to_string(),
            connect_timeout_secs: 10,
        }
    }
}

impl ProxyConfig {
    pub fn upstream(&self) -> Result<url::Url> {
        let url = url::Url::parse(&self.upstream_url).map_err(|e| {
            Error::Config(format!("proxy.upstream_url '{}': {}", self.upstream_url, e))
        })?;
        if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
            return Err(Error::Config(format!(
                "proxy.upstream_url '{}' must be an http(s) URL with a host",
                self.upstream_url
            )));
        }
        Ok(url)
    }
}

// ============================================================================
// Jobs
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobsConfig {
    /// Blob store root; defaults to the user data dir
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_dir: Option<PathBuf>,

    pub poll_interval_ms: u64,

    pub poll_timeout_secs: u64,

    /// Bounded sink channel capacity
    pub sink_capacity: usize,

    pub sink_send_timeout_ms: u64,

    /// Worker flushes a log segment after this many records
    pub segment_max_records: usize,

    /// ...or after this long, whichever comes first
    pub segment_flush_ms: u64,

    pub callback_timeout_secs: u64,

    /// Worker binary for the process trigger; defaults to the current executable
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_command: Option<PathBuf>,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            storage_dir: None,
            poll_interval_ms: 1000,
            poll_timeout_secs: 60 * 60,
            sink_capacity: 256,
            sink_send_timeout_ms: 5000,
            segment_max_records: 64,
            segment_flush_ms: 500,
            callback_timeout_secs: 10,
            worker_command: None,
        }
    }
}

impl JobsConfig {
    pub fn storage_root(&self) -> Result<PathBuf> {
        match &self.storage_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(dirs::data_dir()
                .ok_or_else(|| Error::Config("Cannot find data directory".to_string()))?
                .join("relay")),
        }
    }
}

// ============================================================================
// KMS
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KmsConfig {
    /// Env var holding the master key
    pub master_key_env: String,

    /// Recorded in every envelope
    pub key_id: String,
}

impl Default for KmsConfig {
    fn default() -> Self {
        Self {
            master_key_env: "RELAY_MASTER_KEY".to_string(),
            key_id: "local-v1".to_string(),
        }
    }
}

impl KmsConfig {
    pub fn master_key(&self) -> Result<SecretString> {
        let raw = std::env::var(&self.master_key_env).map_err(|_| {
            Error::Config(format!("master key env {} is not set", self.master_key_env))
        })?;
        if raw.len() < MIN_MASTER_KEY_BYTES {
            return Err(Error::Config(format!(
                "master key in {} must be at least {} bytes",
                self.master_key_env, MIN_MASTER_KEY_BYTES
            )));
        }
        Ok(SecretString::from(raw))
    }
}

// ============================================================================
// helpers
// ============================================================================

fn read_toml(path: &Path) -> Result<toml::Value> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("Failed to read {}: {}", path.display(), e)))?;
    toml::from_str(&content)
        .map_err(|e| Error::Config(format!("Failed to parse {}: {}", path.display(), e)))
}

/// Keys in `other` win
fn merge_value(base: &mut toml::Value, other: toml::Value) {
    match (base, other) {
        (toml::Value::Table(base), toml::Value::Table(other)) => {
            for (key, value) in other {
                match base.get_mut(&key) {
                    Some(existing) => merge_value(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, other) => *base = other,
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| Error::Config(format!("{}='{}' is not a valid number", name, raw)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = RelayConfig::default();
        assert_eq!(config.runner.grace_secs, 5);
        assert_eq!(config.runner.max_direct_prompt_bytes, 65536);
        assert_eq!(config.runner.prompt_delivery, PromptDelivery::Auto);
        assert_eq!(config.kms.master_key_env, "RELAY_MASTER_KEY");
        assert!(config.validate().is_ok());
        assert_eq!(config.runner.agent_argv().unwrap()[0], "claude");
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = RelayConfig::from_toml_str(
            r#"
            [runner]
            grace_secs = 2
            prompt_delivery = "named_pipe"
            "#,
        )
        .unwrap();
        assert_eq!(config.runner.grace_secs, 2);
        assert_eq!(config.runner.prompt_delivery, PromptDelivery::NamedPipe);
        assert_eq!(config.runner.timeout_secs, 1800);
        assert_eq!(config.proxy.upstream_url, "https://api.anthropic.com");
    }

    #[test]
    fn test_layers_merge_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let global = dir.path().join("global.toml");
        let project = dir.path().join("project.toml");
        let explicit = dir.path().join("explicit.toml");
        std::fs::write(&global, "[runner]\ngrace_secs = 1\ntimeout_secs = 10\n").unwrap();
        std::fs::write(&project, "[runner]\ngrace_secs = 2\n").unwrap();
        std::fs::write(&explicit, "[jobs]\npoll_interval_ms = 50\n").unwrap();

        let config = RelayConfig::load_layers(
            &[global, project, dir.path().join("missing.toml")],
            Some(&explicit),
        )
        .unwrap();
        assert_eq!(config.runner.grace_secs, 2);
        assert_eq!(config.runner.timeout_secs, 10);
        assert_eq!(config.jobs.poll_interval_ms, 50);
    }

    #[test]
    fn test_missing_explicit_file_is_error() {
        let err = RelayConfig::load_layers(&[], Some(Path::new("/nonexistent/relay.toml")))
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("RELAY_AGENT_COMMAND", "sh -s"),
            ("RELAY_GRACE_SECS", "1"),
            ("RELAY_STORAGE_DIR", "/tmp/relay-jobs"),
        ]
        .into_iter()
        .collect();
        let mut config = RelayConfig::default();
        config
            .apply_env(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.runner.agent_argv().unwrap(), vec!["sh", "-s"]);
        assert_eq!(config.runner.grace_secs, 1);
        assert_eq!(
            config.jobs.storage_root().unwrap(),
            PathBuf::from("/tmp/relay-jobs")
        );
    }

    #[test]
    fn test_bad_env_number() {
        let mut config = RelayConfig::default();
        let err = config
            .apply_env(|k| (k == "RELAY_TIMEOUT_SECS").then(|| "soon".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("RELAY_TIMEOUT_SECS"));
    }

    #[test]
    fn test_invalid_upstream() {
        let mut config = RelayConfig::default();
        config.proxy.upstream_url = "ftp://example.com".into();
        assert!(config.validate().is_err());
    }
}

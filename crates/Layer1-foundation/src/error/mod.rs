//! Error types for Relay
//!
//! Every library crate returns this one `Error`.

use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Relay error
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Configuration / input validation
    // ========================================================================
    #[error("Configuration error: {0}")]
    Config(String),

    /// Missing or malformed request fields, rejected before a task exists
    #[error("Validation error: {0}")]
    Validation(String),

    // ========================================================================
    // Confidentiality and credentials
    // ========================================================================
    /// Encryption or key-management failure. Fatal: no job is triggered.
    #[error("Confidentiality failure: {0}")]
    Confidentiality(String),

    /// Unrecognized credential scheme on a proxied request
    #[error("Proxy auth error: {0}")]
    ProxyAuth(String),

    /// Upstream API unreachable from the credential proxy
    #[error("Upstream error: {0}")]
    Upstream(String),

    // ========================================================================
    // Execution
    // ========================================================================
    /// Remote execution substrate rejected the submission
    #[error("Trigger failure: {0}")]
    Trigger(String),

    /// Spawn failure, non-zero exit, signal or deadline of the agent process
    #[error("Subprocess failure: {0}")]
    Subprocess(String),

    /// No terminal state within the poll budget
    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Cancelled")]
    Cancelled,

    /// Event consumer went away or stopped draining
    #[error("Sink disconnected: {0}")]
    Disconnected(String),

    // ========================================================================
    // Registry / storage
    // ========================================================================
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Callback error: {0}")]
    Callback(String),

    // ========================================================================
    // Conversions
    // ========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(String),

    // ========================================================================
    // Other
    // ========================================================================
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Stable snake_case code, used in error events and responses
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Config(_) => "config_error",
            Error::Validation(_) => "validation_error",
            Error::Confidentiality(_) => "confidentiality_failure",
            Error::ProxyAuth(_) => "proxy_auth_error",
            Error::Upstream(_) => "upstream_unreachable",
            Error::Trigger(_) => "trigger_failed",
            Error::Subprocess(_) => "subprocess_failed",
            Error::Timeout(_) => "poll_timeout",
            Error::Cancelled => "cancelled",
            Error::Disconnected(_) => "sink_disconnected",
            Error::NotFound(_) => "not_found",
            Error::AlreadyExists(_) => "already_exists",
            Error::Storage(_) => "storage_error",
            Error::Callback(_) => "callback_failed",
            Error::Io(_) => "io_error",
            Error::Json(_) => "json_error",
            Error::Http(_) => "http_error",
            Error::Internal(_) => "internal_error",
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Error::Validation(message.into())
    }
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::Config(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_codes_are_stable() {
        assert_eq!(Error::Timeout("x".into()).kind(), "poll_timeout");
        assert_eq!(Error::Subprocess("x".into()).kind(), "subprocess_failed");
        assert_eq!(Error::Cancelled.kind(), "cancelled");
    }

    #[test]
    fn test_poll_timeout_is_distinct_from_subprocess_failure() {
        let timeout = Error::Timeout("no terminal state".into());
        let failed = Error::Subprocess("exit code 1".into());
        assert_ne!(timeout.kind(), failed.kind());
    }

    #[test]
    fn test_config_parse_error_converts() {
        let err: Error = toml::from_str::<toml::Table>("= broken").unwrap_err().into();
        assert_eq!(err.kind(), "config_error");
    }
}

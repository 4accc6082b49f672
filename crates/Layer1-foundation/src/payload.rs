//! Request variants and the validated payload
//!
//! The boundary accepts a closed set of tagged request variants
//! ([`RunRequest`]) and turns them into a strongly-typed [`Payload`] before
//! anything reaches the core. Secrets are held as [`SecretString`]; they are
//! serialized only when the whole payload is sealed into an envelope.

use crate::core::{ExecutionMode, TaskId};
use crate::{Error, Result};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use url::Url;

/// Env names the runner reserves for the credential proxy
pub const RESERVED_ENV: &[&str] = &["ANTHROPIC_BASE_URL", "ANTHROPIC_API_KEY", "ANTHROPIC_AUTH_TOKEN"];

// ============================================================================
// Request variants (boundary)
// ============================================================================

/// Fields shared by every request variant; on its own, an inline request
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InlineRequest {
    /// Optional caller-chosen id
    #[serde(default)]
    pub task_id: Option<String>,

    #[serde(default)]
    pub prompt: String,

    #[serde(default)]
    pub credentials: CredentialsInput,

    #[serde(default)]
    pub options: RunOptions,
}

/// Offloaded request
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OffloadRequest {
    #[serde(flatten)]
    pub body: InlineRequest,

    /// Required unless `wait` is set
    #[serde(default)]
    pub callback_url: Option<String>,

    /// Hold the connection open and stream instead of calling back
    #[serde(default)]
    pub wait: bool,
}

/// Tagged request variants
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum RunRequest {
    /// Run in this process and stream live
    Inline(InlineRequest),
    /// Hand off to a remote job
    Offloaded(OffloadRequest),
}

/// Credentials as the caller sent them
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CredentialsInput {
    #[serde(default, deserialize_with = "secret_serde::deserialize_opt")]
    pub api_key: Option<SecretString>,

    #[serde(default, deserialize_with = "secret_serde::deserialize_opt")]
    pub oauth_token: Option<SecretString>,
}

impl CredentialsInput {
    /// Pick the single scheme for this task.
    ///
    /// When both are present the API key wins and the token is ignored.
    pub fn resolve(self) -> Result<UpstreamCredential> {
        match (self.api_key, self.oauth_token) {
            (Some(key), _) if !key.expose_secret().trim().is_empty() => {
                Ok(UpstreamCredential::ApiKey(key))
            }
            (_, Some(token)) if !token.expose_secret().trim().is_empty() => {
                Ok(UpstreamCredential::Bearer(token))
            }
            _ => Err(Error::validation(
                "credentials: one of api_key or oauth_token is required",
            )),
        }
    }
}

/// Per-run options
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_turns: Option<u32>,

    /// Overrides the runner deadline
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,

    /// Secrets injected into the agent environment by name
    #[serde(default, with = "secret_serde::map")]
    pub secrets: BTreeMap<String, SecretString>,
}

// ============================================================================
// Validated payload (core)
// ============================================================================

/// The one credential a proxy session substitutes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "scheme", content = "value", rename_all = "snake_case")]
pub enum UpstreamCredential {
    /// `x-api-key` header
    #[serde(with = "secret_serde")]
    ApiKey(SecretString),
    /// `authorization: Bearer` header
    #[serde(with = "secret_serde")]
    Bearer(SecretString),
}

impl UpstreamCredential {
    pub fn scheme(&self) -> &'static str {
        match self {
            UpstreamCredential::ApiKey(_) => "api_key",
            UpstreamCredential::Bearer(_) => "bearer",
        }
    }

    pub fn secret(&self) -> &SecretString {
        match self {
            UpstreamCredential::ApiKey(s) | UpstreamCredential::Bearer(s) => s,
        }
    }
}

/// How progress reaches the caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Delivery {
    /// Inline run, live stream
    Inline,
    /// Offloaded, caller holds the stream open
    Stream,
    /// Offloaded, outcome POSTed to `url`
    Callback { url: Url },
}

/// Validated, strongly-typed request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payload {
    pub task_id: TaskId,
    pub prompt: String,
    pub credential: UpstreamCredential,
    #[serde(default)]
    pub options: RunOptions,
    pub delivery: Delivery,
}

impl Payload {
    pub fn mode(&self) -> ExecutionMode {
        match self.delivery {
            Delivery::Inline => ExecutionMode::Inline,
            Delivery::Stream | Delivery::Callback { .. } => ExecutionMode::Offloaded,
        }
    }

    pub fn callback_url(&self) -> Option<&Url> {
        match &self.delivery {
            Delivery::Callback { url } => Some(url),
            _ => None,
        }
    }

    /// Every secret value carried by this payload
    pub fn secret_values(&self) -> Vec<&str> {
        let mut values = vec![self.credential.secret().expose_secret()];
        values.extend(self.options.secrets.values().map(|s| s.expose_secret()));
        values
    }
}

impl RunRequest {
    /// Parse a JSON request body
    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| Error::validation(format!("malformed request: {}", e)))
    }

    /// Validate into a [`Payload`]
    pub fn validate(self) -> Result<Payload> {
        let (body, delivery) = match self {
            RunRequest::Inline(body) => (body, Delivery::Inline),
            RunRequest::Offloaded(OffloadRequest {
                body,
                callback_url,
                wait,
            }) => {
                let delivery = match (callback_url, wait) {
                    (_, true) => Delivery::Stream,
                    (Some(raw), false) => Delivery::Callback {
                        url: parse_callback_url(&raw)?,
                    },
                    (None, false) => {
                        return Err(Error::validation(
                            "callback_url is required for asynchronous offload",
                        ))
                    }
                };
                (body, delivery)
            }
        };

        if body.prompt.trim().is_empty() {
            return Err(Error::validation("prompt is required"));
        }

        let task_id = match body.task_id {
            Some(raw) => TaskId::parse(raw)?,
            None => TaskId::generate(),
        };

        for name in body.options.secrets.keys() {
            validate_env_name(name)?;
        }

        if body.options.timeout_secs == Some(0) {
            return Err(Error::validation("options.timeout_secs must be positive"));
        }

        Ok(Payload {
            task_id,
            prompt: body.prompt,
            credential: body.credentials.resolve()?,
            options: body.options,
            delivery,
        })
    }
}

fn parse_callback_url(raw: &str) -> Result<Url> {
    let url = Url::parse(raw)
        .map_err(|e| Error::validation(format!("callback_url '{}' is invalid: {}", raw, e)))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(Error::validation(format!(
            "callback_url scheme '{}' is not http(s)",
            other
        ))),
    }
}

fn validate_env_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .map(|c| c.is_ascii_uppercase() || c == '_')
        .unwrap_or(false);
    if !valid_start || !chars.all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_') {
        return Err(Error::validation(format!(
            "secret name '{}' is not a valid environment variable",
            name
        )));
    }
    if RESERVED_ENV.contains(&name) {
        return Err(Error::validation(format!(
            "secret name '{}' is reserved for the credential proxy",
            name
        )));
    }
    Ok(())
}

/// serde helpers for [`SecretString`] fields
pub(crate) mod secret_serde {
    use secrecy::{ExposeSecret, SecretString};
    use serde::{Deserialize, Deserializer, Serializer};
    use std::collections::BTreeMap;

    pub fn serialize<S: Serializer>(secret: &SecretString, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(secret.expose_secret())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<SecretString, D::Error> {
        String::deserialize(de).map(SecretString::from)
    }

    pub fn deserialize_opt<'de, D: Deserializer<'de>>(
        de: D,
    ) -> Result<Option<SecretString>, D::Error> {
        Option::<String>::deserialize(de).map(|v| v.map(SecretString::from))
    }

    pub mod map {
        use super::*;
        use serde::ser::SerializeMap;

        pub fn serialize<S: Serializer>(
            map: &BTreeMap<String, SecretString>,
            ser: S,
        ) -> Result<S::Ok, S::Error> {
            let mut out = ser.serialize_map(Some(map.len()))?;
            for (k, v) in map {
                out.serialize_entry(k, v.expose_secret())?;
            }
            out.end()
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            de: D,
        ) -> Result<BTreeMap<String, SecretString>, D::Error> {
            let raw = BTreeMap::<String, String>::deserialize(de)?;
            Ok(raw
                .into_iter()
                .map(|(k, v)| (k, SecretString::from(v)))
                .collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inline_json(extra: &str) -> String {
        format!(
            r#"{{"mode":"inline","prompt":"echo hi","credentials":{{"api_key":"sk-real"}}{}}}"#,
            extra
        )
    }

    #[test]
    fn test_inline_request_validates() {
        let payload = RunRequest::from_json(&inline_json(r#","task_id":"t-1""#))
            .unwrap()
            .validate()
            .unwrap();
        assert_eq!(payload.task_id.as_str(), "t-1");
        assert_eq!(payload.mode(), ExecutionMode::Inline);
        assert_eq!(payload.credential.scheme(), "api_key");
    }

    #[test]
    fn test_missing_prompt_rejected() {
        let raw = r#"{"mode":"inline","credentials":{"api_key":"k"}}"#;
        let err = RunRequest::from_json(raw).unwrap().validate().unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_missing_credentials_rejected() {
        let raw = r#"{"mode":"inline","prompt":"hi"}"#;
        let err = RunRequest::from_json(raw).unwrap().validate().unwrap_err();
        assert!(err.to_string().contains("credentials"));
    }

    #[test]
    fn test_api_key_wins_over_token() {
        let raw = r#"{"mode":"inline","prompt":"hi","credentials":{"api_key":"k","oauth_token":"t"}}"#;
        let payload = RunRequest::from_json(raw).unwrap().validate().unwrap();
        match payload.credential {
            UpstreamCredential::ApiKey(k) => assert_eq!(k.expose_secret(), "k"),
            other => panic!("expected api key, got {}", other.scheme()),
        }
    }

    #[test]
    fn test_async_offload_requires_callback() {
        let raw = r#"{"mode":"offloaded","prompt":"hi","credentials":{"oauth_token":"t"}}"#;
        assert!(RunRequest::from_json(raw).unwrap().validate().is_err());

        let raw = r#"{"mode":"offloaded","prompt":"hi","credentials":{"oauth_token":"t"},"callback_url":"https://example.com/done"}"#;
        let payload = RunRequest::from_json(raw).unwrap().validate().unwrap();
        assert_eq!(payload.mode(), ExecutionMode::Offloaded);
        assert_eq!(payload.callback_url().unwrap().host_str(), Some("example.com"));
        assert_eq!(payload.credential.scheme(), "bearer");
    }

    #[test]
    fn test_callback_scheme_checked() {
        let raw = r#"{"mode":"offloaded","prompt":"hi","credentials":{"api_key":"k"},"callback_url":"ftp://x/y"}"#;
        assert!(RunRequest::from_json(raw).unwrap().validate().is_err());
    }

    #[test]
    fn test_sync_offload_without_callback() {
        let raw = r#"{"mode":"offloaded","prompt":"hi","credentials":{"api_key":"k"},"wait":true}"#;
        let payload = RunRequest::from_json(raw).unwrap().validate().unwrap();
        assert_eq!(payload.delivery, Delivery::Stream);
    }

    #[test]
    fn test_reserved_secret_names_rejected() {
        let raw = inline_json(r#","options":{"secrets":{"ANTHROPIC_API_KEY":"x"}}"#);
        assert!(RunRequest::from_json(&raw).unwrap().validate().is_err());

        let raw = inline_json(r#","options":{"secrets":{"lower":"x"}}"#);
        assert!(RunRequest::from_json(&raw).unwrap().validate().is_err());

        let raw = inline_json(r#","options":{"secrets":{"GITHUB_TOKEN":"x"}}"#);
        assert!(RunRequest::from_json(&raw).unwrap().validate().is_ok());
    }

    #[test]
    fn test_unknown_mode_rejected() {
        assert!(RunRequest::from_json(r#"{"mode":"batch","prompt":"x"}"#).is_err());
    }

    #[test]
    fn test_payload_serde_keeps_secrets_for_envelope() {
        let raw = inline_json(r#","options":{"secrets":{"GITHUB_TOKEN":"ghp"}}"#);
        let payload = RunRequest::from_json(&raw).unwrap().validate().unwrap();
        let json = serde_json::to_string(&payload).unwrap();
        let back: Payload = serde_json::from_str(&json).unwrap();
        assert_eq!(back.credential.secret().expose_secret(), "sk-real");
        assert_eq!(back.options.secrets["GITHUB_TOKEN"].expose_secret(), "ghp");
        assert_eq!(back.secret_values().len(), 2);
    }

    #[test]
    fn test_debug_redacts() {
        let payload = RunRequest::from_json(&inline_json("")).unwrap().validate().unwrap();
        assert!(!format!("{:?}", payload).contains("sk-real"));
    }
}

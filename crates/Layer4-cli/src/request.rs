//! Request flags -> validated payload

use relay_foundation::secrecy::SecretString;
use relay_foundation::{
    CredentialsInput, Error, InlineRequest, OffloadRequest, Payload, Result, RunOptions, RunRequest,
};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tokio::io::AsyncReadExt;

/// Flags shared by `run` and `submit`
#[derive(clap::Args, Debug, Clone)]
pub struct RequestArgs {
    /// Prompt text
    #[arg(short, long, conflicts_with = "prompt_file")]
    pub prompt: Option<String>,

    /// Read the prompt from a file (`-` for stdin)
    #[arg(long)]
    pub prompt_file: Option<PathBuf>,

    /// Caller-chosen task id (generated if absent)
    #[arg(long)]
    pub task_id: Option<String>,

    /// Env var holding the upstream API key
    #[arg(long, default_value = "ANTHROPIC_API_KEY")]
    pub api_key_env: String,

    /// Env var holding an OAuth token (used when no API key is set)
    #[arg(long, default_value = "CLAUDE_CODE_OAUTH_TOKEN")]
    pub oauth_token_env: String,

    #[arg(long)]
    pub model: Option<String>,

    #[arg(long)]
    pub max_turns: Option<u32>,

    /// Deadline for the agent in seconds
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Agent working directory
    #[arg(long)]
    pub working_dir: Option<PathBuf>,

    /// Pass this env var into the agent as a secret (repeatable)
    #[arg(long = "secret", value_name = "NAME")]
    pub secrets: Vec<String>,
}

impl RequestArgs {
    pub async fn inline(&self) -> Result<Payload> {
        RunRequest::Inline(self.body().await?).validate()
    }

    pub async fn offloaded(&self, wait: bool, callback_url: Option<String>) -> Result<Payload> {
        RunRequest::Offloaded(OffloadRequest {
            body: self.body().await?,
            callback_url,
            wait,
        })
        .validate()
    }

    async fn body(&self) -> Result<InlineRequest> {
        let mut secrets = BTreeMap::new();
        for name in &self.secrets {
            let value = std::env::var(name).map_err(|_| {
                Error::validation(format!("secret {} is not set in the environment", name))
            })?;
            secrets.insert(name.clone(), SecretString::from(value));
        }

        Ok(InlineRequest {
            task_id: self.task_id.clone(),
            prompt: self.read_prompt().await?,
            credentials: CredentialsInput {
                api_key: env_secret(&self.api_key_env),
                oauth_token: env_secret(&self.oauth_token_env),
            },
            options: RunOptions {
                model: self.model.clone(),
                max_turns: self.max_turns,
                timeout_secs: self.timeout,
                working_dir: self.working_dir.clone(),
                secrets,
            },
        })
    }

    async fn read_prompt(&self) -> Result<String> {
        if let Some(prompt) = &self.prompt {
            return Ok(prompt.clone());
        }
        match &self.prompt_file {
            Some(path) if path.as_os_str() == "-" => {
                let mut prompt = String::new();
                tokio::io::stdin().read_to_string(&mut prompt).await?;
                Ok(prompt)
            }
            Some(path) => tokio::fs::read_to_string(path).await.map_err(|e| {
                Error::validation(format!("cannot read prompt file {}: {}", path.display(), e))
            }),
            // rejected by validation
            None => Ok(String::new()),
        }
    }
}

fn env_secret(name: &str) -> Option<SecretString> {
    std::env::var(name)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(SecretString::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use relay_foundation::{Delivery, ExecutionMode};

    #[derive(Parser)]
    struct Harness {
        #[command(flatten)]
        request: RequestArgs,
    }

    fn parse(args: &[&str]) -> RequestArgs {
        let mut argv = vec!["relay"];
        argv.extend_from_slice(args);
        Harness::parse_from(argv).request
    }

    #[tokio::test]
    async fn test_inline_from_flags() {
        let args = parse(&[
            "--prompt",
            "hello",
            "--task-id",
            "cli-1",
            "--api-key-env",
            "RELAY_TEST_CLI_KEY_1",
            "--max-turns",
            "3",
        ]);
        std::env::set_var("RELAY_TEST_CLI_KEY_1", "sk-test");

        let payload = args.inline().await.unwrap();
        assert_eq!(payload.task_id.as_str(), "cli-1");
        assert_eq!(payload.mode(), ExecutionMode::Inline);
        assert_eq!(payload.options.max_turns, Some(3));
        assert_eq!(payload.credential.scheme(), "api_key");
    }

    #[tokio::test]
    async fn test_missing_credential_is_validation_error() {
        let args = parse(&[
            "--prompt",
            "hello",
            "--api-key-env",
            "RELAY_TEST_CLI_UNSET_KEY",
            "--oauth-token-env",
            "RELAY_TEST_CLI_UNSET_TOKEN",
        ]);
        let err = args.inline().await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn test_offloaded_delivery() {
        std::env::set_var("RELAY_TEST_CLI_TOKEN_2", "oauth-test");
        let args = parse(&["--prompt", "x", "--oauth-token-env", "RELAY_TEST_CLI_TOKEN_2"]);

        let stream = args.offloaded(true, None).await.unwrap();
        assert!(matches!(stream.delivery, Delivery::Stream));

        let callback = args
            .offloaded(false, Some("https://example.com/done".into()))
            .await
            .unwrap();
        assert_eq!(callback.callback_url().unwrap().as_str(), "https://example.com/done");

        assert!(args.offloaded(false, None).await.is_err());
    }

    #[tokio::test]
    async fn test_unset_secret_rejected() {
        std::env::set_var("RELAY_TEST_CLI_KEY_3", "sk-test");
        let args = parse(&[
            "--prompt",
            "x",
            "--api-key-env",
            "RELAY_TEST_CLI_KEY_3",
            "--secret",
            "RELAY_TEST_CLI_MISSING_SECRET",
        ]);
        assert!(matches!(args.inline().await.unwrap_err(), Error::Validation(_)));
    }
}

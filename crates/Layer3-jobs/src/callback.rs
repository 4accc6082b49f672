//! Outcome callbacks for asynchronous delivery
//!
//! Each task has one poll loop (duplicate ids are rejected before the
//! trigger) and the loop notifies once, so a notifier keeps no per-task state.

use async_trait::async_trait;
use relay_foundation::{Error, Result};
use relay_task::TaskOutcome;
use std::time::Duration;
use tracing::info;
use url::Url;

#[async_trait]
pub trait CallbackNotifier: Send + Sync {
    async fn notify(&self, url: &Url, outcome: &TaskOutcome) -> Result<()>;
}

/// JSON POST of the outcome; one attempt, no retries
pub struct HttpCallback {
    client: reqwest::Client,
}

impl HttpCallback {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Http(format!("failed to build callback client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl CallbackNotifier for HttpCallback {
    async fn notify(&self, url: &Url, outcome: &TaskOutcome) -> Result<()> {
        let response = self
            .client
            .post(url.clone())
            .json(outcome)
            .send()
            .await
            .map_err(|e| Error::Callback(format!("POST {} failed: {}", url, e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Callback(format!(
                "POST {} returned {}",
                url,
                status.as_u16()
            )));
        }

        info!(task_id = %outcome.task_id, status = %outcome.status, "Callback delivered");
        Ok(())
    }
}

//! Inline execution: one proxy session, one agent run, one terminal event

use relay_foundation::secrecy::ExposeSecret;
use relay_foundation::{Error, ExecutionMode, Payload, Result, SecretScrubber, TaskId};
use relay_proxy::{CredentialProxy, ProxySettings};
use relay_task::{
    AgentRunner, EventSink, ExecutionHandle, ExitReason, RunOutcome, RunSpec, StreamEvent,
    TaskOutcome, TaskRegistry,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Runs a payload in this process and streams it to a sink
#[derive(Clone)]
pub struct InlineExecutor {
    runner: AgentRunner,
    proxy: ProxySettings,
    registry: Arc<TaskRegistry>,
}

impl InlineExecutor {
    pub fn new(runner: AgentRunner, proxy: ProxySettings, registry: Arc<TaskRegistry>) -> Self {
        Self {
            runner,
            proxy,
            registry,
        }
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    /// Run to completion
    ///
    /// Errors before the agent starts are returned and nothing is sent to
    /// the sink. Once it starts, the sink receives the agent's records and
    /// exactly one `Complete`, and the task is unregistered.
    pub async fn run(&self, payload: &Payload, sink: Arc<dyn EventSink>) -> Result<TaskOutcome> {
        let task_id = payload.task_id.clone();
        if self.registry.contains(&task_id).await {
            return Err(Error::AlreadyExists(format!("task {} is already running", task_id)));
        }
        self.runner.delivery_for(payload.prompt.len())?;

        let proxy = CredentialProxy::start(self.proxy.clone(), payload.credential.clone()).await?;
        let spec = self.spec_for(payload, &proxy);

        let agent = match self.runner.spawn(spec, Arc::clone(&sink)).await {
            Ok(agent) => agent,
            Err(e) => {
                proxy.stop().await;
                return Err(e);
            }
        };

        let handle = ExecutionHandle::new(agent.handle_id(), Arc::new(agent.kill_handle()));
        if let Err(e) = self
            .registry
            .register(task_id.clone(), handle, ExecutionMode::Inline)
            .await
        {
            agent.kill().await;
            let _ = agent.wait().await;
            proxy.stop().await;
            return Err(e);
        }
        info!(task_id = %task_id, handle = %agent.handle_id(), "Inline task started");

        let result = agent.wait().await;
        proxy.stop().await;
        self.registry.unregister(&task_id).await;

        let outcome = match result {
            Ok(run) => outcome_for(&task_id, run, self.effective_timeout(payload)),
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "Agent supervision failed");
                if let Err(send) = sink.send(StreamEvent::error(&e)).await {
                    warn!(task_id = %task_id, error = %send, "Sink closed before error event");
                }
                TaskOutcome::failed(task_id.clone(), None, e.to_string()).with_kind(e.kind())
            }
        };

        if let Err(e) = sink.send(StreamEvent::Complete(outcome.clone())).await {
            warn!(task_id = %task_id, error = %e, "Sink closed before completion event");
        }
        info!(task_id = %task_id, status = %outcome.status, "Inline task finished");
        Ok(outcome)
    }

    fn spec_for(&self, payload: &Payload, proxy: &CredentialProxy) -> RunSpec {
        let mut spec = RunSpec::new(payload.task_id.clone(), payload.prompt.clone())
            .with_scrubber(SecretScrubber::new(payload.secret_values()));

        spec.env.extend(proxy.child_env());
        for (name, value) in &payload.options.secrets {
            spec.env.push((name.clone(), value.expose_secret().to_string()));
        }

        if let Some(model) = &payload.options.model {
            spec.extra_args.extend(["--model".to_string(), model.clone()]);
        }
        if let Some(turns) = payload.options.max_turns {
            spec.extra_args.extend(["--max-turns".to_string(), turns.to_string()]);
        }
        spec.working_dir = payload.options.working_dir.clone();
        spec.timeout = payload.options.timeout_secs.map(Duration::from_secs);
        spec
    }

    fn effective_timeout(&self, payload: &Payload) -> u64 {
        payload
            .options
            .timeout_secs
            .unwrap_or(self.runner.config().timeout_secs)
    }
}

fn outcome_for(task_id: &TaskId, run: RunOutcome, timeout_secs: u64) -> TaskOutcome {
    let id = task_id.clone();
    match run.reason {
        ExitReason::Exited(0) => TaskOutcome::completed(id, 0),
        ExitReason::Exited(code) => {
            TaskOutcome::failed(id, Some(code), failure_message(&run.reason, &run.stderr))
                .with_kind("subprocess_failed")
        }
        ExitReason::Signaled(_) => {
            TaskOutcome::failed(id, None, failure_message(&run.reason, &run.stderr))
                .with_kind("subprocess_failed")
        }
        ExitReason::TimedOut => {
            TaskOutcome::timed_out(id, format!("deadline of {}s exceeded", timeout_secs))
                .with_kind("subprocess_failed")
        }
        ExitReason::Killed => TaskOutcome::cancelled(id),
    }
}

fn failure_message(reason: &ExitReason, stderr: &str) -> String {
    let stderr = stderr.trim_end();
    if stderr.is_empty() {
        reason.to_string()
    } else {
        format!("{}\n{}", reason, stderr)
    }
}

//! Subcommand implementations

use crate::output::{print_json, stdout_sink};
use crate::request::RequestArgs;
use anyhow::Context as _;
use relay_foundation::{RelayConfig, TaskId};
use relay_jobs::{
    BlobStore, EnvelopeCipher, FsBlobStore, HttpCallback, InlineExecutor, JobOrchestrator,
    JobWorker, KeyManager, LocalKeyManager, MetadataStore, OrchestratorSettings, ProcessTrigger,
    WorkerSettings,
};
use relay_proxy::ProxySettings;
use relay_task::{AgentRunner, CancelOutcome, TaskOutcome, TaskRegistry};
use std::future::Future;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

/// Loaded configuration plus the explicit config path, which is handed on
/// to spawned workers
pub struct Context {
    config: RelayConfig,
    config_path: Option<PathBuf>,
}

impl Context {
    pub fn load(config_path: Option<PathBuf>) -> anyhow::Result<Self> {
        let config = RelayConfig::load(config_path.as_deref())?;
        Ok(Self {
            config,
            config_path,
        })
    }

    fn executor(&self, registry: Arc<TaskRegistry>) -> anyhow::Result<InlineExecutor> {
        Ok(InlineExecutor::new(
            AgentRunner::new(self.config.runner.clone()),
            ProxySettings::from_config(&self.config.proxy)?,
            registry,
        ))
    }

    fn blobs(&self) -> anyhow::Result<Arc<dyn BlobStore>> {
        let root = self.config.jobs.storage_root()?;
        Ok(Arc::new(FsBlobStore::new(root)))
    }

    fn keys(&self) -> anyhow::Result<Arc<dyn KeyManager>> {
        Ok(Arc::new(LocalKeyManager::from_config(&self.config.kms)?))
    }

    fn trigger(&self) -> anyhow::Result<ProcessTrigger> {
        let trigger = match &self.config.jobs.worker_command {
            Some(program) => ProcessTrigger::new(program),
            None => ProcessTrigger::current_exe()?,
        };
        Ok(match &self.config_path {
            Some(path) => trigger.with_args(["--config".to_string(), path.display().to_string()]),
            None => trigger,
        })
    }

    fn orchestrator(&self, registry: Arc<TaskRegistry>) -> anyhow::Result<Arc<JobOrchestrator>> {
        let jobs = &self.config.jobs;
        let callback = HttpCallback::new(Duration::from_secs(jobs.callback_timeout_secs))?;
        Ok(Arc::new(JobOrchestrator::new(
            registry,
            self.blobs()?,
            self.keys()?,
            Arc::new(self.trigger()?),
            Arc::new(callback),
            OrchestratorSettings::from_config(jobs),
        )))
    }
}

fn exit_code(outcome: &TaskOutcome) -> ExitCode {
    if outcome.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    }
}

/// Await `work`; on Ctrl-C run `interrupt` once and keep waiting
async fn until_done<W, I, IF>(work: W, interrupt: I) -> W::Output
where
    W: Future,
    I: FnOnce() -> IF,
    IF: Future<Output = ()>,
{
    tokio::pin!(work);
    tokio::select! {
        output = &mut work => output,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, cancelling task");
            interrupt().await;
            work.await
        }
    }
}

// ============================================================================
// run
// ============================================================================

pub async fn run(ctx: &Context, request: &RequestArgs) -> anyhow::Result<ExitCode> {
    let payload = request.inline().await?;
    let registry = Arc::new(TaskRegistry::new());
    let executor = ctx.executor(Arc::clone(&registry))?;
    let task_id = &payload.task_id;
    let registry = &registry;

    let (sink, writer) = stdout_sink(&ctx.config.jobs);
    let outcome = until_done(executor.run(&payload, sink), move || async move {
        if let Err(e) = registry.cancel_task(task_id).await {
            warn!(task_id = %task_id, error = %e, "Cancel failed");
        }
    })
    .await;
    writer.finish().await;

    Ok(exit_code(&outcome?))
}

// ============================================================================
// submit
// ============================================================================

pub async fn submit(
    ctx: &Context,
    request: &RequestArgs,
    wait: bool,
    callback_url: Option<String>,
) -> anyhow::Result<ExitCode> {
    let payload = request.offloaded(wait, callback_url).await?;
    let orchestrator = ctx.orchestrator(Arc::new(TaskRegistry::new()))?;
    let task_id = &payload.task_id;
    let orchestrator = &orchestrator;
    let cancel = move || async move {
        if let Err(e) = orchestrator.cancel(task_id).await {
            warn!(task_id = %task_id, error = %e, "Cancel failed");
        }
    };

    let outcome = if wait {
        let (sink, writer) = stdout_sink(&ctx.config.jobs);
        let outcome = until_done(orchestrator.submit_sync(&payload, sink), cancel).await;
        writer.finish().await;
        outcome?
    } else {
        let ack = orchestrator.submit_async(&payload).await?;
        print_json(&ack)?;
        // the callback fires from the background loop
        until_done(orchestrator.join(task_id), cancel)
            .await
            .context("background poll loop ended without an outcome")?
    };

    info!(task_id = %task_id, status = %outcome.status, "Submission finished");
    Ok(exit_code(&outcome))
}

// ============================================================================
// worker
// ============================================================================

pub async fn worker(ctx: &Context, task_id: &str, payload_path: &str) -> anyhow::Result<ExitCode> {
    let task_id = TaskId::parse(task_id)?;
    let blobs = ctx.blobs()?;
    let worker = JobWorker::new(
        MetadataStore::new(blobs),
        EnvelopeCipher::new(ctx.keys()?),
        // own registry: the submitting process tracks the job separately
        ctx.executor(Arc::new(TaskRegistry::new()))?,
        WorkerSettings::from_config(&ctx.config.jobs),
    );

    let (stop_tx, stop_rx) = watch::channel(false);
    let signals = tokio::spawn(async move {
        if let Err(e) = shutdown_signal().await {
            warn!(error = %e, "Cannot listen for shutdown signals");
            return;
        }
        info!("Shutdown requested");
        let _ = stop_tx.send(true);
    });

    let outcome = worker.run(&task_id, payload_path, stop_rx).await;
    signals.abort();
    Ok(exit_code(&outcome?))
}

/// SIGTERM (remote cancel) or SIGINT
async fn shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = term.recv() => {}
        res = tokio::signal::ctrl_c() => res?,
    }
    Ok(())
}

// ============================================================================
// status / cancel
// ============================================================================

pub async fn status(ctx: &Context, task_id: &str) -> anyhow::Result<ExitCode> {
    let task_id = TaskId::parse(task_id)?;
    let store = MetadataStore::new(ctx.blobs()?);
    let metadata = store.load(&task_id).await?;
    print_json(&metadata)?;
    Ok(ExitCode::SUCCESS)
}

pub async fn cancel(ctx: &Context, task_id: &str) -> anyhow::Result<ExitCode> {
    let task_id = TaskId::parse(task_id)?;
    let store = MetadataStore::new(ctx.blobs()?);
    let outcome = store.cancel_detached(&task_id).await?;

    let result = match outcome {
        CancelOutcome::Signalled => "signalled",
        CancelOutcome::AlreadyCancelling => "already_cancelling",
        CancelOutcome::NotFound => "not_found",
    };
    print_json(&serde_json::json!({ "task_id": task_id, "result": result }))?;

    Ok(if outcome.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    })
}

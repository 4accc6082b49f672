//! Remote execution triggers
//!
//! A trigger only ever receives the task id and the payload path. The worker
//! on the other side fetches and decrypts the payload itself.

use crate::metadata::MetadataStore;
use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use relay_foundation::{Error, Result, TaskId};
use relay_task::StopSignal;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[async_trait]
pub trait JobTrigger: Send + Sync {
    /// Start a job; returns its handle
    async fn submit(&self, task_id: &TaskId, payload_path: &str) -> Result<String>;

    /// Stop a job; false if unknown or already finished
    async fn cancel(&self, handle: &str) -> Result<bool>;
}

// ============================================================================
// Local process trigger
// ============================================================================

/// Runs `<program> [args..] worker --task-id <id> --payload-path <path>` as a
/// detached child. Handles are `proc:<pid>`.
pub struct ProcessTrigger {
    program: PathBuf,
    args: Vec<String>,
    children: Mutex<HashMap<String, Child>>,
}

impl ProcessTrigger {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            children: Mutex::new(HashMap::new()),
        }
    }

    /// Use the running binary as the worker
    pub fn current_exe() -> Result<Self> {
        Ok(Self::new(std::env::current_exe()?))
    }

    /// Args placed before the `worker` subcommand (e.g. `--config <file>`)
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Drop finished children
    fn reap(children: &mut HashMap<String, Child>) {
        children.retain(|handle, child| match child.try_wait() {
            Ok(Some(status)) => {
                debug!(handle = %handle, status = %status, "Worker exited");
                false
            }
            Ok(None) => true,
            Err(_) => false,
        });
    }
}

#[async_trait]
impl JobTrigger for ProcessTrigger {
    async fn submit(&self, task_id: &TaskId, payload_path: &str) -> Result<String> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg("worker")
            .arg("--task-id")
            .arg(task_id.as_str())
            .arg("--payload-path")
            .arg(payload_path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .process_group(0);

        let child = cmd.spawn().map_err(|e| {
            Error::Trigger(format!(
                "failed to start worker {}: {}",
                self.program.display(),
                e
            ))
        })?;
        let pid = child
            .id()
            .ok_or_else(|| Error::Trigger("worker exited before it could be tracked".into()))?;
        let handle = format!("proc:{}", pid);

        let mut children = self.children.lock().await;
        Self::reap(&mut children);
        children.insert(handle.clone(), child);

        info!(task_id = %task_id, handle = %handle, "Worker started");
        Ok(handle)
    }

    async fn cancel(&self, handle: &str) -> Result<bool> {
        let mut children = self.children.lock().await;
        Self::reap(&mut children);

        let Some(child) = children.get(handle) else {
            debug!(handle = %handle, "Cancel for unknown or finished worker");
            return Ok(false);
        };
        let Some(pid) = child.id() else {
            return Ok(false);
        };

        // SIGTERM lets the worker stop its agent and record the cancellation
        match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            Ok(()) => {
                info!(handle = %handle, "Sent SIGTERM to worker");
                Ok(true)
            }
            Err(Errno::ESRCH) => Ok(false),
            Err(e) => Err(Error::Trigger(format!("failed to signal {}: {}", handle, e))),
        }
    }
}

// ============================================================================
// Remote stop signal
// ============================================================================

/// Registry stopper for an offloaded task: cancel marker plus remote cancel
pub struct RemoteStop {
    task_id: TaskId,
    handle: String,
    trigger: Arc<dyn JobTrigger>,
    store: MetadataStore,
}

impl RemoteStop {
    pub fn new(
        task_id: TaskId,
        handle: impl Into<String>,
        trigger: Arc<dyn JobTrigger>,
        store: MetadataStore,
    ) -> Self {
        Self {
            task_id,
            handle: handle.into(),
            trigger,
            store,
        }
    }
}

#[async_trait]
impl StopSignal for RemoteStop {
    async fn stop(&self) -> Result<bool> {
        let marked = self.store.request_cancel(&self.task_id).await;
        if let Err(e) = &marked {
            warn!(task_id = %self.task_id, error = %e, "Failed to record cancel request");
        }

        match self.trigger.cancel(&self.handle).await {
            Ok(delivered) => Ok(delivered),
            // the worker still sees the marker
            Err(e) if marked.is_ok() => {
                warn!(task_id = %self.task_id, handle = %self.handle, error = %e, "Remote cancel failed");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::TaskMetadata;
    use crate::store::MemoryBlobStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_process_trigger_submit_and_cancel() {
        // trailing `worker --task-id ..` become $0 and positional args
        let trigger = ProcessTrigger::new("sh").with_args(["-c", "sleep 30"]);
        let id = TaskId::parse("proc-1").unwrap();

        let handle = trigger.submit(&id, "tasks/proc-1/payload.enc").await.unwrap();
        assert!(handle.starts_with("proc:"));

        assert!(trigger.cancel(&handle).await.unwrap());
        assert!(!trigger.cancel("proc:0").await.unwrap());
    }

    #[tokio::test]
    async fn test_missing_program_is_trigger_error() {
        let trigger = ProcessTrigger::new("/nonexistent/relay-worker");
        let id = TaskId::parse("proc-2").unwrap();
        let err = trigger.submit(&id, "p").await.unwrap_err();
        assert!(matches!(err, Error::Trigger(_)));
    }

    struct FlakyTrigger {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl JobTrigger for FlakyTrigger {
        async fn submit(&self, _: &TaskId, _: &str) -> Result<String> {
            Ok("fake:1".into())
        }

        async fn cancel(&self, _: &str) -> Result<bool> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::Trigger("substrate unavailable".into()))
        }
    }

    #[tokio::test]
    async fn test_remote_stop_marks_even_if_cancel_fails() {
        let store = MetadataStore::new(Arc::new(MemoryBlobStore::new()));
        let id = TaskId::parse("r-1").unwrap();
        store.save(&TaskMetadata::new(id.clone(), None)).await.unwrap();

        let trigger = Arc::new(FlakyTrigger {
            calls: AtomicUsize::new(0),
        });
        let stop = RemoteStop::new(id.clone(), "fake:1", trigger.clone(), store.clone());

        assert!(!stop.stop().await.unwrap());
        assert_eq!(trigger.calls.load(Ordering::SeqCst), 1);
        assert!(store.cancel_requested(&id).await.unwrap());
    }
}

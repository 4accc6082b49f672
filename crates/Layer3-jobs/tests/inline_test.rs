//! Inline executor tests
//!
//! `cargo test -p relay-jobs --test inline_test`

use relay_foundation::{
    Error, ExecutionMode, Payload, RunRequest, RunnerConfig, TaskId, REDACTED,
};
use relay_jobs::InlineExecutor;
use relay_proxy::ProxySettings;
use relay_task::{
    AgentRunner, CancelOutcome, CollectingSink, ExecutionHandle, StopSignal, StreamEvent,
    TaskRegistry, TaskStatus,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use url::Url;

fn executor(registry: Arc<TaskRegistry>) -> InlineExecutor {
    let runner = AgentRunner::new(RunnerConfig {
        agent_command: "sh -s".to_string(),
        grace_secs: 1,
        ..Default::default()
    });
    InlineExecutor::new(
        runner,
        ProxySettings::new(Url::parse("http://127.0.0.1:9").unwrap()),
        registry,
    )
}

fn inline(task_id: &str, prompt: &str, extra: serde_json::Value) -> Payload {
    let mut raw = serde_json::json!({
        "mode": "inline",
        "task_id": task_id,
        "prompt": prompt,
        "credentials": { "api_key": "sk-ant-real" },
    });
    if let (Some(raw), Some(extra)) = (raw.as_object_mut(), extra.as_object()) {
        raw.extend(extra.clone());
    }
    RunRequest::from_json(&raw.to_string()).unwrap().validate().unwrap()
}

fn texts(events: &[StreamEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::Log(r) => Some(r.line.to_text()),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_agent_sees_placeholder_not_credential() {
    let registry = Arc::new(TaskRegistry::new());
    let payload = inline(
        "in-1",
        "echo \"$ANTHROPIC_API_KEY\"; echo \"$ANTHROPIC_BASE_URL\"; echo \"$REPO_TOKEN\"",
        serde_json::json!({ "options": { "secrets": { "REPO_TOKEN": "ghp_secret" } } }),
    );

    let sink = CollectingSink::new();
    let outcome = executor(Arc::clone(&registry))
        .run(&payload, sink.clone())
        .await
        .unwrap();
    assert_eq!(outcome.status, TaskStatus::Completed);

    let events = sink.events().await;
    let lines = texts(&events);
    assert_eq!(lines.len(), 3);
    assert!(lines[0].starts_with("relay-placeholder-"));
    assert!(lines[1].starts_with("http://127.0.0.1:"));
    assert_eq!(lines[2], REDACTED);
    for line in &lines {
        assert!(!line.contains("sk-ant-real"));
        assert!(!line.contains("ghp_secret"));
    }

    assert_eq!(sink.outcomes().await.len(), 1);
    assert!(events.last().unwrap().is_complete());
    assert!(registry.active_ids().await.is_empty());
}

#[tokio::test]
async fn test_nonzero_exit_fails_with_one_completion() {
    let registry = Arc::new(TaskRegistry::new());
    let sink = CollectingSink::new();
    let outcome = executor(Arc::clone(&registry))
        .run(&inline("in-2", "echo broken >&2; exit 3", serde_json::json!({})), sink.clone())
        .await
        .unwrap();

    assert_eq!(outcome.status, TaskStatus::Failed);
    assert_eq!(outcome.exit_code, Some(3));
    assert!(outcome.error.unwrap().contains("broken"));
    assert_eq!(sink.outcomes().await.len(), 1);
    assert!(!registry.contains(&TaskId::parse("in-2").unwrap()).await);
}

#[tokio::test]
async fn test_registry_cancel_kills_inline_run() {
    let registry = Arc::new(TaskRegistry::new());
    let exec = executor(Arc::clone(&registry));
    let payload = inline("in-3", "echo up; sleep 30", serde_json::json!({}));
    let id = payload.task_id.clone();

    let sink = CollectingSink::new();
    let run = {
        let sink = sink.clone();
        tokio::spawn(async move { exec.run(&payload, sink).await })
    };

    let start = Instant::now();
    while !registry.contains(&id).await {
        assert!(start.elapsed() < Duration::from_secs(5), "never registered");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(registry.cancel_task(&id).await.unwrap(), CancelOutcome::Signalled);

    let outcome = run.await.unwrap().unwrap();
    assert_eq!(outcome.status, TaskStatus::Cancelled);
    assert!(start.elapsed() < Duration::from_secs(10));
    assert_eq!(sink.outcomes().await.len(), 1);
    assert!(registry.active_ids().await.is_empty());
}

#[tokio::test]
async fn test_run_deadline_is_reported_as_timeout() {
    let registry = Arc::new(TaskRegistry::new());
    let payload = inline(
        "in-4",
        "sleep 30",
        serde_json::json!({ "options": { "timeout_secs": 1 } }),
    );
    let outcome = executor(registry)
        .run(&payload, CollectingSink::new())
        .await
        .unwrap();

    assert_eq!(outcome.status, TaskStatus::Failed);
    assert!(outcome.timed_out);
    assert_eq!(outcome.error.as_deref(), Some("deadline of 1s exceeded"));
}

struct Noop;

#[async_trait::async_trait]
impl StopSignal for Noop {
    async fn stop(&self) -> relay_foundation::Result<bool> {
        Ok(true)
    }
}

#[tokio::test]
async fn test_duplicate_id_rejected_before_start() {
    let registry = Arc::new(TaskRegistry::new());
    let id = TaskId::parse("in-5").unwrap();
    registry
        .register(
            id.clone(),
            ExecutionHandle::new("other", Arc::new(Noop)),
            ExecutionMode::Inline,
        )
        .await
        .unwrap();

    let sink = CollectingSink::new();
    let err = executor(Arc::clone(&registry))
        .run(&inline("in-5", "echo hi", serde_json::json!({})), sink.clone())
        .await
        .unwrap_err();

    assert!(matches!(err, Error::AlreadyExists(_)));
    assert!(sink.events().await.is_empty());
    assert!(registry.contains(&id).await);
}

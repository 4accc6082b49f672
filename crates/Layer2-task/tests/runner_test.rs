//! Agent runner integration tests, using POSIX `sh` as the agent
//!
//! `cargo test -p relay-task --test runner_test`

use relay_foundation::{PromptDelivery, RunnerConfig, SecretScrubber, TaskId};
use relay_task::{
    AgentRunner, CancelOutcome, CollectingSink, ExecutionHandle, ExitReason, LogLine, LogStream,
    RunPhase, RunSpec, TaskRegistry,
};
use relay_foundation::{Error, ExecutionMode};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn runner(command: &str) -> AgentRunner {
    AgentRunner::new(RunnerConfig {
        agent_command: command.to_string(),
        grace_secs: 1,
        ..Default::default()
    })
}

fn spec(prompt: &str) -> RunSpec {
    RunSpec::new(TaskId::generate(), prompt)
}

fn texts(records: &[relay_task::LogRecord], stream: LogStream) -> Vec<String> {
    records
        .iter()
        .filter(|r| r.stream == stream)
        .map(|r| r.line.to_text())
        .collect()
}

async fn wait_for_records(sink: &CollectingSink, count: usize) {
    let start = Instant::now();
    while sink.records().await.len() < count {
        assert!(start.elapsed() < Duration::from_secs(5), "no output from agent");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn test_echo_hi() {
    let sink = CollectingSink::new();
    let agent = runner("sh -s").spawn(spec("echo hi"), sink.clone()).await.unwrap();
    assert!(agent.handle_id().starts_with("pid:"));

    let outcome = agent.wait().await.unwrap();
    assert_eq!(outcome.reason, ExitReason::Exited(0));
    assert!(outcome.is_success());

    let records = sink.records().await;
    assert_eq!(texts(&records, LogStream::Stdout), vec!["hi"]);
    assert_eq!(records[0].offset, 1);
    assert_eq!(outcome.lines, records.len() as u64);
}

#[tokio::test]
async fn test_json_lines_are_structured() {
    let sink = CollectingSink::new();
    let prompt = r#"echo '{"type":"result","ok":true}'; echo plain"#;
    let outcome = runner("sh -s")
        .spawn(spec(prompt), sink.clone())
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert!(outcome.is_success());

    let records = sink.records().await;
    match &records[0].line {
        LogLine::Json(v) => assert_eq!(v["type"], "result"),
        other => panic!("expected json, got {:?}", other),
    }
    assert_eq!(records[1].line, LogLine::Text("plain".into()));
    assert!(records.windows(2).all(|w| w[0].offset < w[1].offset));
}

#[tokio::test]
async fn test_nonzero_exit_is_reported_with_stderr() {
    let sink = CollectingSink::new();
    let outcome = runner("sh -s")
        .spawn(spec("echo oops >&2; exit 3"), sink.clone())
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(outcome.reason, ExitReason::Exited(3));
    assert_eq!(outcome.exit_code(), Some(3));
    assert!(outcome.stderr.contains("oops"));
    assert_eq!(texts(&sink.records().await, LogStream::Stderr), vec!["oops"]);
}

#[tokio::test]
async fn test_large_prompt_goes_through_named_pipe() {
    let prompt = "x".repeat(200 * 1024);
    let sink = CollectingSink::new();
    let runner = runner("wc -c");
    assert_eq!(
        runner.delivery_for(prompt.len()).unwrap(),
        PromptDelivery::NamedPipe
    );

    let agent = runner.spawn(spec(&prompt), sink.clone()).await.unwrap();
    assert!(agent.phase() >= RunPhase::WritingPrompt);
    let outcome = agent.wait().await.unwrap();
    assert!(outcome.is_success(), "{:?}", outcome);

    let out = texts(&sink.records().await, LogStream::Stdout);
    assert_eq!(out[0].trim(), (200 * 1024).to_string());
}

#[tokio::test]
async fn test_prompt_path_argument_is_substituted() {
    let runner = AgentRunner::new(RunnerConfig {
        agent_command: r#"sh -c 'cat "$1"' sh {prompt_path}"#.to_string(),
        prompt_delivery: PromptDelivery::NamedPipe,
        ..Default::default()
    });
    let sink = CollectingSink::new();
    let outcome = runner
        .spawn(spec("from the fifo\n"), sink.clone())
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert!(outcome.is_success(), "{:?}", outcome);
    assert_eq!(
        texts(&sink.records().await, LogStream::Stdout),
        vec!["from the fifo"]
    );
}

#[tokio::test]
async fn test_direct_rejects_oversized_prompt() {
    let runner = AgentRunner::new(RunnerConfig {
        agent_command: "cat".into(),
        prompt_delivery: PromptDelivery::Direct,
        max_direct_prompt_bytes: 16,
        ..Default::default()
    });
    let err = runner
        .spawn(spec(&"y".repeat(17)), CollectingSink::new())
        .await
        .err()
        .unwrap();
    assert!(matches!(err, Error::Validation(_)));
}

#[tokio::test]
async fn test_deadline_escalates_to_sigkill() {
    let sink = CollectingSink::new();
    let started = Instant::now();
    let agent = runner(r#"sh -c 'trap "" TERM; echo ready; sleep 30'"#)
        .spawn(
            spec("").with_timeout(Duration::from_millis(300)),
            sink.clone(),
        )
        .await
        .unwrap();
    let outcome = agent.wait().await.unwrap();
    let elapsed = started.elapsed();

    assert_eq!(outcome.reason, ExitReason::TimedOut);
    assert!(elapsed >= Duration::from_millis(1300), "grace not honoured: {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(10));

    let system = texts(&sink.records().await, LogStream::System);
    assert!(system.iter().any(|s| s.contains("deadline exceeded")));
}

#[tokio::test]
async fn test_sigterm_respected_within_grace() {
    let outcome = runner("sleep 30")
        .spawn(
            spec("").with_timeout(Duration::from_millis(200)),
            CollectingSink::new(),
        )
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(outcome.reason, ExitReason::TimedOut);
    assert_eq!(outcome.exit_code(), None);
}

#[tokio::test]
async fn test_kill_is_idempotent_and_stops_emission() {
    let sink = CollectingSink::new();
    let agent = runner(r#"sh -c 'echo started; while true; do echo tick; sleep 0.05; done'"#)
        .spawn(spec(""), sink.clone())
        .await
        .unwrap();

    wait_for_records(&sink, 1).await;
    let handle = agent.kill_handle();
    assert!(handle.kill().await);
    let seen = sink.records().await.len();
    assert!(!agent.kill().await);

    let outcome = agent.wait().await.unwrap();
    assert_eq!(outcome.reason, ExitReason::Killed);
    assert_eq!(sink.records().await.len(), seen);
    assert!(!handle.kill().await, "kill after exit must be a no-op");
}

#[tokio::test]
async fn test_secrets_are_scrubbed() {
    let sink = CollectingSink::new();
    let run = spec("echo token=$GITHUB_TOKEN; echo $GITHUB_TOKEN >&2")
        .env("GITHUB_TOKEN", "ghp_secretvalue")
        .with_scrubber(SecretScrubber::new(["ghp_secretvalue"]));
    let outcome = runner("sh -s")
        .spawn(run, sink.clone())
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();

    let records = sink.records().await;
    assert_eq!(texts(&records, LogStream::Stdout), vec!["token=[REDACTED]"]);
    assert!(!outcome.stderr.contains("ghp_secretvalue"));
    assert!(records
        .iter()
        .all(|r| !r.line.to_text().contains("ghp_secretvalue")));
}

#[tokio::test]
async fn test_parent_env_is_not_inherited() {
    std::env::set_var("RELAY_TEST_PARENT_ONLY", "leaked");
    let sink = CollectingSink::new();
    runner("sh -s")
        .spawn(
            spec(r#"echo "value=${RELAY_TEST_PARENT_ONLY:-none}""#),
            sink.clone(),
        )
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(
        texts(&sink.records().await, LogStream::Stdout),
        vec!["value=none"]
    );
}

#[tokio::test]
async fn test_spawn_failure() {
    let err = runner("/nonexistent/relay-agent")
        .spawn(spec("hi"), CollectingSink::new())
        .await
        .err()
        .unwrap();
    assert!(matches!(err, Error::Subprocess(_)));
}

#[tokio::test]
async fn test_closed_sink_does_not_stall_run() {
    let (sink, rx) = relay_task::ChannelSink::channel(1, Duration::from_millis(50));
    drop(rx);
    let outcome = runner("sh -s")
        .spawn(spec("echo a; echo b; echo c"), sink)
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert!(outcome.is_success());
    assert_eq!(outcome.lines, 0);
}

#[tokio::test]
async fn test_registry_double_cancel_kills_once() {
    let registry = Arc::new(TaskRegistry::new());
    let sink = CollectingSink::new();
    let task_id = TaskId::generate();
    let agent = runner("sleep 30")
        .spawn(RunSpec::new(task_id.clone(), ""), sink)
        .await
        .unwrap();

    registry
        .register(
            task_id.clone(),
            ExecutionHandle::new(agent.handle_id(), Arc::new(agent.kill_handle())),
            ExecutionMode::Inline,
        )
        .await
        .unwrap();

    let (a, b) = tokio::join!(registry.cancel_task(&task_id), registry.cancel_task(&task_id));
    let mut outcomes = vec![a.unwrap(), b.unwrap()];
    outcomes.sort_by_key(|o| *o as u8);
    assert_eq!(
        outcomes,
        vec![CancelOutcome::Signalled, CancelOutcome::AlreadyCancelling]
    );

    let outcome = agent.wait().await.unwrap();
    assert_eq!(outcome.reason, ExitReason::Killed);
    assert!(registry.unregister(&task_id).await);
    assert_eq!(registry.stats().await.total, 0);
}

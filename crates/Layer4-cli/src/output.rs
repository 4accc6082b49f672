//! NDJSON event output on stdout

use relay_foundation::{JobsConfig, Result};
use relay_task::{ChannelSink, StreamEvent};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// How long to wait for buffered events after the run ends
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Bounded sink drained to stdout, one JSON object per line
///
/// A slow or closed stdout surfaces as a disconnected sink.
pub fn stdout_sink(config: &JobsConfig) -> (Arc<ChannelSink>, StdoutWriter) {
    let (sink, rx) = ChannelSink::channel(
        config.sink_capacity,
        Duration::from_millis(config.sink_send_timeout_ms),
    );
    (sink, StdoutWriter(tokio::spawn(drain(rx))))
}

async fn drain(mut rx: mpsc::Receiver<StreamEvent>) {
    let mut out = tokio::io::stdout();
    while let Some(event) = rx.recv().await {
        let mut line = match serde_json::to_vec(&event) {
            Ok(line) => line,
            Err(e) => {
                debug!(error = %e, "Unserializable event dropped");
                continue;
            }
        };
        line.push(b'\n');
        if let Err(e) = out.write_all(&line).await {
            // dropping rx closes the sink
            debug!(error = %e, "stdout closed");
            return;
        }
        let _ = out.flush().await;
    }
}

pub struct StdoutWriter(JoinHandle<()>);

impl StdoutWriter {
    /// Wait until every sent event is written
    pub async fn finish(self) {
        if tokio::time::timeout(DRAIN_TIMEOUT, self.0).await.is_err() {
            debug!("stdout writer still busy, exiting anyway");
        }
    }
}

/// Print a value as pretty JSON
pub fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

//! Event sinks
//!
//! Everything a task reports flows through an [`EventSink`]: log records as
//! they arrive, mid-stream errors, and exactly one terminal `Complete`.

use crate::log::LogRecord;
use crate::state::TaskOutcome;
use async_trait::async_trait;
use relay_foundation::{Error, Result};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::SendTimeoutError};
use tokio::sync::Mutex;

/// One event on a task's stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Log(LogRecord),
    /// Mid-stream failure; the stream still ends with `Complete`
    Error { kind: String, message: String },
    Complete(TaskOutcome),
}

impl StreamEvent {
    pub fn error(err: &Error) -> Self {
        StreamEvent::Error {
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self, StreamEvent::Complete(_))
    }
}

/// Consumer of stream events
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Deliver one event. `Error::Disconnected` means the consumer is gone.
    async fn send(&self, event: StreamEvent) -> Result<()>;

    fn is_closed(&self) -> bool {
        false
    }
}

// ============================================================================
// Channel sink
// ============================================================================

/// Bounded channel with a send timeout; a slow consumer counts as gone
pub struct ChannelSink {
    tx: mpsc::Sender<StreamEvent>,
    send_timeout: Duration,
    closed: AtomicBool,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<StreamEvent>, send_timeout: Duration) -> Self {
        Self {
            tx,
            send_timeout,
            closed: AtomicBool::new(false),
        }
    }

    /// Create a sink and its receiver
    pub fn channel(
        capacity: usize,
        send_timeout: Duration,
    ) -> (Arc<Self>, mpsc::Receiver<StreamEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Arc::new(Self::new(tx, send_timeout)), rx)
    }
}

#[async_trait]
impl EventSink for ChannelSink {
    async fn send(&self, event: StreamEvent) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Disconnected("sink already closed".into()));
        }
        match self.tx.send_timeout(event, self.send_timeout).await {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(_)) => {
                self.closed.store(true, Ordering::Release);
                Err(Error::Disconnected(format!(
                    "consumer did not drain within {:?}",
                    self.send_timeout
                )))
            }
            Err(SendTimeoutError::Closed(_)) => {
                self.closed.store(true, Ordering::Release);
                Err(Error::Disconnected("receiver dropped".into()))
            }
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.tx.is_closed()
    }
}

// ============================================================================
// Collecting sink
// ============================================================================

/// Keeps every event in memory
#[derive(Default)]
pub struct CollectingSink {
    events: Mutex<Vec<StreamEvent>>,
}

impl CollectingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn events(&self) -> Vec<StreamEvent> {
        self.events.lock().await.clone()
    }

    pub async fn records(&self) -> Vec<LogRecord> {
        self.events
            .lock()
            .await
            .iter()
            .filter_map(|e| match e {
                StreamEvent::Log(r) => Some(r.clone()),
                _ => None,
            })
            .collect()
    }

    pub async fn outcomes(&self) -> Vec<TaskOutcome> {
        self.events
            .lock()
            .await
            .iter()
            .filter_map(|e| match e {
                StreamEvent::Complete(o) => Some(o.clone()),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl EventSink for CollectingSink {
    async fn send(&self, event: StreamEvent) -> Result<()> {
        self.events.lock().await.push(event);
        Ok(())
    }
}
